//! CodeGen state and shared helpers.
//!
//! The `CodeGen` struct owns everything that accumulates monotonically over a
//! compilation: the text emitter, the class/global registries, the vtable
//! offset map, the string pool, the symbol cells, the function queue, and the
//! warning sink.  All of it is append-only within a run and discarded after.

use super::emitter::Emitter;
use crate::ast::{Expr, Pos};
use crate::config::CompilerConfig;
use crate::function::Function;
use crate::scope::{GlobalEnv, ScopeChain, VTABLE_HEADER_SLOTS};
use std::collections::HashMap;
use std::fmt::Write as _;

/// Why lowering stopped.
///
/// Lowering interleaves tree-shape checks with text emission, so both kinds
/// of failure travel through `?`: a program that cannot be lowered, and a
/// rejected write into one of the output buffers.  Program errors are built
/// through [`CodeGen::err`], which folds the source position, the current
/// scope, and the offending expression into the message; there is no
/// recovery from either kind.
#[derive(Debug)]
pub enum CodeGenError {
    /// The input tree cannot be lowered.
    Program(String),
    /// An output buffer refused a write.
    Emit(std::fmt::Error),
}

impl std::fmt::Display for CodeGenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodeGenError::Program(msg) => write!(f, "{}", msg),
            CodeGenError::Emit(e) => write!(f, "could not write assembly text: {}", e),
        }
    }
}

impl std::error::Error for CodeGenError {}

impl From<std::fmt::Error> for CodeGenError {
    fn from(e: std::fmt::Error) -> Self {
        CodeGenError::Emit(e)
    }
}

pub struct CodeGen {
    pub(crate) em: Emitter,
    pub(crate) env: GlobalEnv,
    pub(crate) config: CompilerConfig,

    // Vtable offsets: globally unique per method name, assigned by the
    // pre-pass in first-encounter order.
    voff_map: HashMap<String, usize>,
    voff_order: Vec<String>,

    // String pool: literal bytes -> private rodata label.
    string_labels: HashMap<String, String>,
    string_counter: usize,
    pub(crate) rodata: String,

    // Symbol cells: raw symbol name -> BSS cell label, filled lazily at
    // runtime via __get_symbol.
    symbol_cells: HashMap<String, String>,
    pub(crate) symbol_cell_order: Vec<String>,

    // Read-only data emitted outside the string pool (the base vtable).
    pub(crate) data: String,

    /// Queued function definitions; lambdas queued during the drain are
    /// picked up on later iterations.
    pub(crate) functions: Vec<Function>,

    pub(crate) warnings: Vec<String>,
    lambda_counter: usize,
    /// Raw name of the method currently being emitted, for `super`.
    pub(crate) current_method: Option<String>,
    pub(crate) last_pos: Option<Pos>,
}

impl CodeGen {
    pub fn new(config: CompilerConfig) -> Self {
        CodeGen {
            em: Emitter::new(config.debug_info),
            env: GlobalEnv::new(),
            config,
            voff_map: HashMap::new(),
            voff_order: Vec::new(),
            string_labels: HashMap::new(),
            string_counter: 0,
            rodata: String::new(),
            symbol_cells: HashMap::new(),
            symbol_cell_order: Vec::new(),
            data: String::new(),
            functions: Vec::new(),
            warnings: Vec::new(),
            lambda_counter: 0,
            current_method: None,
            last_pos: None,
        }
    }

    // -- diagnostics ----------------------------------------------------------

    pub(crate) fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// A fatal error naming the position, the current scope, and the
    /// offending expression.
    pub(crate) fn err(&self, scope: &ScopeChain, expr: &Expr, msg: &str) -> CodeGenError {
        let pos = self
            .last_pos
            .as_ref()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "<unknown position>".to_string());
        CodeGenError::Program(format!(
            "{}: {} (scope: {}; expr: {})",
            pos,
            msg,
            scope.describe(),
            expr.summary()
        ))
    }

    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    // -- label cleaning -------------------------------------------------------

    /// Rewrite an identifier so it is safe as an assembler label.  Well-known
    /// operator names get readable translations; any other non-alphanumeric
    /// byte is hex-escaped.
    pub fn clean_label(name: &str) -> String {
        match name {
            "==" => return "__eq".to_string(),
            "!=" => return "__ne".to_string(),
            "<" => return "__lt".to_string(),
            "<=" => return "__le".to_string(),
            ">" => return "__gt".to_string(),
            ">=" => return "__ge".to_string(),
            "===" => return "__eqq".to_string(),
            "+" => return "__plus".to_string(),
            "-" => return "__minus".to_string(),
            "*" => return "__mul".to_string(),
            "/" => return "__div".to_string(),
            "%" => return "__mod".to_string(),
            "<<" => return "__shiftleft".to_string(),
            ">>" => return "__shiftright".to_string(),
            "[]" => return "__NDX".to_string(),
            "[]=" => return "__NDXassign".to_string(),
            "!" => return "__not".to_string(),
            _ => {}
        }
        let mut result = String::new();
        for c in name.chars() {
            match c {
                '?' => result.push_str("__Q"),
                c if c.is_alphanumeric() || c == '_' => result.push(c),
                c => {
                    let _ = write!(&mut result, "__{:02X}", c as u32);
                }
            }
        }
        result
    }

    // -- vtable offsets -------------------------------------------------------

    /// The slot for a method name, if the pre-pass saw it.
    pub(crate) fn method_offset(&self, name: &str) -> Option<usize> {
        self.voff_map.get(name).copied()
    }

    /// The slot for a method name, allocating on first encounter.
    pub(crate) fn ensure_method_offset(&mut self, name: &str) -> usize {
        if let Some(slot) = self.voff_map.get(name) {
            return *slot;
        }
        let slot = VTABLE_HEADER_SLOTS + self.voff_order.len();
        self.voff_map.insert(name.to_string(), slot);
        self.voff_order.push(name.to_string());
        slot
    }

    /// Method names in offset order.
    pub(crate) fn method_names(&self) -> &[String] {
        &self.voff_order
    }

    /// Size in slots of every class object: the header plus one slot per
    /// known method.
    pub(crate) fn vtable_size(&self) -> usize {
        VTABLE_HEADER_SLOTS + self.voff_order.len()
    }

    // -- string pool ----------------------------------------------------------

    /// Get or create the rodata label for a byte-string literal.
    pub(crate) fn intern_string(&mut self, s: &str) -> String {
        if let Some(label) = self.string_labels.get(s) {
            return label.clone();
        }
        let label = format!(".Lstr{}", self.string_counter);
        self.string_counter += 1;
        let _ = writeln!(
            &mut self.rodata,
            "{}:\n\t.string \"{}\"",
            label,
            escape_asm_string(s)
        );
        self.string_labels.insert(s.to_string(), label.clone());
        label
    }

    // -- symbol cells ---------------------------------------------------------

    /// Get or create the BSS cell for a `:symbol`, interning its name bytes.
    /// Returns (cell label, string label).
    pub(crate) fn symbol_cell(&mut self, name: &str) -> (String, String) {
        let string_label = self.intern_string(name);
        if let Some(cell) = self.symbol_cells.get(name) {
            return (cell.clone(), string_label);
        }
        let cell = format!("__sym_{}", Self::clean_label(name));
        self.symbol_cells.insert(name.to_string(), cell.clone());
        self.symbol_cell_order.push(cell.clone());
        (cell, string_label)
    }

    // -- misc -----------------------------------------------------------------

    pub(crate) fn fresh_lambda_label(&mut self) -> String {
        let label = format!("__lambda_{}", self.lambda_counter);
        self.lambda_counter += 1;
        label
    }
}

/// Escape a string for a gas `.string` directive.
pub(crate) fn escape_asm_string(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'"' => result.push_str("\\\""),
            b'\\' => result.push_str("\\\\"),
            b'\n' => result.push_str("\\n"),
            b'\t' => result.push_str("\\t"),
            b'\r' => result.push_str("\\r"),
            0x20..=0x7e => result.push(byte as char),
            other => {
                let _ = write!(&mut result, "\\{:03o}", other);
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codegen() -> CodeGen {
        CodeGen::new(CompilerConfig::default())
    }

    #[test]
    fn test_clean_label_operators() {
        assert_eq!(CodeGen::clean_label("=="), "__eq");
        assert_eq!(CodeGen::clean_label("<<"), "__shiftleft");
        assert_eq!(CodeGen::clean_label("[]"), "__NDX");
        assert_eq!(CodeGen::clean_label("empty?"), "empty__Q");
        assert_eq!(CodeGen::clean_label("plain_name"), "plain_name");
    }

    #[test]
    fn test_clean_label_hex_fallback() {
        assert_eq!(CodeGen::clean_label("a&b"), "a__26b");
        assert_eq!(CodeGen::clean_label("size="), "size__3D");
    }

    #[test]
    fn test_method_offsets_first_encounter_order() {
        let mut cg = codegen();
        let a = cg.ensure_method_offset("foo");
        let b = cg.ensure_method_offset("bar");
        assert_eq!(a, VTABLE_HEADER_SLOTS);
        assert_eq!(b, VTABLE_HEADER_SLOTS + 1);
        assert_eq!(cg.ensure_method_offset("foo"), a);
        assert_eq!(cg.vtable_size(), VTABLE_HEADER_SLOTS + 2);
    }

    #[test]
    fn test_string_interning_shares_labels() {
        let mut cg = codegen();
        let a = cg.intern_string("hello");
        let b = cg.intern_string("hello");
        let c = cg.intern_string("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(cg.rodata.matches(".string \"hello\"").count(), 1);
    }

    #[test]
    fn test_symbol_cells_deduplicate() {
        let mut cg = codegen();
        let (cell_a, _) = cg.symbol_cell("length");
        let (cell_b, _) = cg.symbol_cell("length");
        assert_eq!(cell_a, "__sym_length");
        assert_eq!(cell_a, cell_b);
        assert_eq!(cg.symbol_cell_order.len(), 1);
    }

    #[test]
    fn test_escape_asm_string() {
        assert_eq!(escape_asm_string("plain"), "plain");
        assert_eq!(escape_asm_string("a\"b\\c"), "a\\\"b\\\\c");
        assert_eq!(escape_asm_string("line\n"), "line\\n");
        assert_eq!(escape_asm_string("\x01"), "\\001");
    }
}
