//! Aster Compiler Library
//!
//! Lowers already-parsed, already-rewritten program trees (textual
//! s-expressions) to 32-bit x86 assembly and, optionally, links the result
//! against the Aster C runtime.
//!
//! # Example
//!
//! ```rust
//! use asterc::compile_to_asm;
//!
//! let asm = compile_to_asm("(assign Answer 42)").unwrap();
//! assert!(asm.contains(".comm Answer, 4, 4"));
//! ```

pub mod ast;
pub mod codegen;
pub mod config;
pub mod function;
pub mod reader;
pub mod runtime;
pub mod scope;
pub mod value;

pub use ast::{Expr, Node, Pos};
pub use codegen::{CodeGen, CodeGenError};
pub use config::CompilerConfig;
pub use reader::Reader;

use std::fs;
use std::path::Path;
use std::process::Command;

/// Result of lowering one program: the assembly text plus any warnings the
/// code generator collected along the way.
pub struct CompileOutput {
    pub asm: String,
    pub warnings: Vec<String>,
}

/// Compile a source string (textual tree form) to assembly.
pub fn compile_source(
    file_name: &str,
    source: &str,
    config: &CompilerConfig,
) -> Result<CompileOutput, String> {
    let tree = reader::read_str(file_name, source)?;
    compile_tree(&tree, config)
}

/// Compile an already-read tree to assembly.
pub fn compile_tree(tree: &Expr, config: &CompilerConfig) -> Result<CompileOutput, String> {
    let mut codegen = CodeGen::new(config.clone());
    let asm = codegen.compile_program(tree).map_err(|e| e.to_string())?;
    Ok(CompileOutput {
        asm,
        warnings: codegen.take_warnings(),
    })
}

/// Compile a source string with the default configuration, dropping
/// warnings.  Convenience for tests and doc examples.
pub fn compile_to_asm(source: &str) -> Result<String, String> {
    compile_source("<input>", source, &CompilerConfig::default()).map(|out| out.asm)
}

/// Compile a tree file to an assembly file.
pub fn compile_file(
    input: &Path,
    output: &Path,
    config: &CompilerConfig,
) -> Result<Vec<String>, String> {
    let source =
        fs::read_to_string(input).map_err(|e| format!("Failed to read source file: {}", e))?;
    let out = compile_source(&input.display().to_string(), &source, config)?;
    fs::write(output, out.asm).map_err(|e| format!("Failed to write assembly file: {}", e))?;
    Ok(out.warnings)
}

/// Compile a tree file and link it into an executable with the system
/// toolchain.  The runtime objects come from the configuration.
pub fn build_file(
    input: &Path,
    output: &Path,
    keep_asm: bool,
    config: &CompilerConfig,
) -> Result<Vec<String>, String> {
    let asm_path = output.with_extension("s");
    let warnings = compile_file(input, &asm_path, config)?;

    let mut gcc = Command::new("gcc");
    gcc.arg("-m32").arg(&asm_path).arg("-o").arg(output);
    for object in &config.runtime_objects {
        gcc.arg(object);
    }
    for lib_path in &config.library_paths {
        gcc.arg("-L").arg(lib_path);
    }
    for lib in &config.libraries {
        gcc.arg("-l").arg(lib);
    }

    let result = gcc
        .output()
        .map_err(|e| format!("Failed to run gcc: {}", e))?;

    if !keep_asm {
        fs::remove_file(&asm_path).ok();
    }

    if !result.status.success() {
        let stderr = String::from_utf8_lossy(&result.stderr);
        return Err(format!("Linking failed:\n{}", stderr));
    }
    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_to_asm_end_to_end() {
        let asm = compile_to_asm("(do (class A Object (defm go () (return 1))) (assign K 7))")
            .unwrap();
        assert!(asm.contains("\t.globl main"));
        assert!(asm.contains("__method_A_go:"));
        assert!(asm.contains("\t.comm K, 4, 4"));
    }

    #[test]
    fn test_compile_source_surfaces_warnings() {
        let out = compile_source("w.ast", "(assign x 1.5)", &CompilerConfig::default()).unwrap();
        assert!(out.warnings.iter().any(|w| w.contains("truncated")));
    }

    #[test]
    fn test_reader_errors_propagate() {
        let err = compile_to_asm("(do 1").unwrap_err();
        assert!(err.contains("Unclosed list"));
    }

    #[test]
    fn test_codegen_errors_propagate() {
        let err = compile_to_asm("(hash 3)").unwrap_err();
        assert!(err.contains("malformed hash literal"));
    }

    #[test]
    fn test_compile_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("prog.ast");
        let output = dir.path().join("prog.s");
        fs::write(&input, "(assign Out 3)").unwrap();
        let warnings = compile_file(&input, &output, &CompilerConfig::default()).unwrap();
        assert!(warnings.is_empty());
        let asm = fs::read_to_string(&output).unwrap();
        assert!(asm.contains("\t.comm Out, 4, 4"));
    }
}
