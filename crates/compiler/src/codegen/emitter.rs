//! The assembly sink.
//!
//! Lowering routines talk to the emitter and never format instructions
//! themselves.  The emitter owns the text section buffer, the fresh-label
//! counter, the register cache, and the frame discipline:
//!
//! ```txt
//!   High memory addresses
//!
//!   +--------------------+
//!   | argument k         |  (8 + 4k)(%ebp)
//!   | ...                |
//!   | argument 0         |  8(%ebp)
//!   | return address     |
//!   | saved %ebp         |  <- %ebp
//!   | saved %ebx         |  -4(%ebp)
//!   | saved %edi         |  -8(%ebp)
//!   | local 0            |  -12(%ebp)
//!   | ...                |  <- %esp after `let` windows
//!   +--------------------+
//!
//!   Low memory addresses
//! ```
//!
//! `%eax` is the result register, `%esi` holds `self` across a method body,
//! and `%ebx` carries the raw argument count at every call.  Generated
//! functions save and restore `%ebx`/`%edi` so both survive calls; `%esi` is
//! deliberately not preserved (callers reload `self` after a send).

use super::regcache::RegCache;
use crate::ast::Pos;
use crate::value::{Operand, Reg};
use std::fmt::Write as _;
use std::path::PathBuf;

/// Bytes between `%ebp` and the first local slot (saved `%ebx` and `%edi`).
pub(crate) const RESERVED_FRAME_BYTES: i64 = 8;

/// Format an operand for a 32-bit instruction.
pub(crate) fn operand_str(op: &Operand) -> String {
    match op {
        Operand::Int(n) => format!("${}", n),
        Operand::Addr(label) => format!("${}", label),
        Operand::Reg(r) => r.to_string(),
        Operand::LocalVar(k) => format!("{}(%ebp)", -(RESERVED_FRAME_BYTES + 4 * (*k as i64 + 1))),
        Operand::Arg(k) => format!("{}(%ebp)", 8 + 4 * (*k as i64)),
        Operand::InstanceVar(k) => format!("{}(%esi)", 4 * (*k as i64)),
        Operand::Global(name) => name.clone(),
        Operand::Indirect(r) | Operand::Indirect8(r) => format!("({})", r),
        Operand::SubExpr => Reg::Eax.to_string(),
        Operand::PossibleSend(name) => {
            unreachable!("unresolved identifier '{}' reached the emitter", name)
        }
    }
}

fn low8(reg: Reg) -> &'static str {
    match reg {
        Reg::Eax => "%al",
        Reg::Ebx => "%bl",
        Reg::Ecx => "%cl",
        Reg::Edx => "%dl",
        other => unreachable!("no byte form for {}", other),
    }
}

pub struct Emitter {
    pub(crate) out: String,
    label_counter: usize,
    cache: RegCache,
    debug_info: bool,
    last_annotated: Option<(PathBuf, usize)>,
}

impl Emitter {
    pub fn new(debug_info: bool) -> Self {
        Emitter {
            out: String::new(),
            label_counter: 0,
            cache: RegCache::new(),
            debug_info,
            last_annotated: None,
        }
    }

    // -- labels and directives ------------------------------------------------

    pub fn fresh_label(&mut self, prefix: &str) -> String {
        let label = format!(".L{}_{}", prefix, self.label_counter);
        self.label_counter += 1;
        label
    }

    pub fn label(&mut self, name: &str) -> Result<(), std::fmt::Error> {
        writeln!(&mut self.out, "{}:", name)
    }

    pub fn export(&mut self, name: &str) -> Result<(), std::fmt::Error> {
        writeln!(&mut self.out, "\t.globl {}", name)
    }

    pub fn comment(&mut self, text: &str) -> Result<(), std::fmt::Error> {
        writeln!(&mut self.out, "\t# {}", text)
    }

    /// Source-position annotation; suppressed when the position has not
    /// advanced since the last note.
    pub fn lineno(&mut self, pos: &Pos) -> Result<(), std::fmt::Error> {
        if !self.debug_info {
            return Ok(());
        }
        let key = (pos.file.clone(), pos.line);
        if self.last_annotated.as_ref() == Some(&key) {
            return Ok(());
        }
        writeln!(&mut self.out, "\t# {}:{}", pos.file.display(), pos.line + 1)?;
        self.last_annotated = Some(key);
        Ok(())
    }

    // -- moves, arithmetic, stack ---------------------------------------------

    /// Load an operand into a register; 8-bit memory is zero-extended.
    pub fn load(&mut self, op: &Operand, reg: Reg) -> Result<(), std::fmt::Error> {
        match op {
            Operand::Indirect8(_) => {
                writeln!(&mut self.out, "\tmovzbl {}, {}", operand_str(op), reg)
            }
            _ => writeln!(&mut self.out, "\tmovl {}, {}", operand_str(op), reg),
        }
    }

    /// Store a register into an operand; 8-bit memory takes the low byte.
    pub fn store(&mut self, reg: Reg, op: &Operand) -> Result<(), std::fmt::Error> {
        match op {
            Operand::Indirect8(_) => {
                writeln!(&mut self.out, "\tmovb {}, {}", low8(reg), operand_str(op))
            }
            _ => writeln!(&mut self.out, "\tmovl {}, {}", reg, operand_str(op)),
        }
    }

    pub fn push_op(&mut self, op: &Operand) -> Result<(), std::fmt::Error> {
        writeln!(&mut self.out, "\tpushl {}", operand_str(op))
    }

    pub fn pop(&mut self, reg: Reg) -> Result<(), std::fmt::Error> {
        writeln!(&mut self.out, "\tpopl {}", reg)
    }

    /// Two-operand instruction, source then destination.
    pub fn op2(&mut self, mnemonic: &str, src: &str, dst: &str) -> Result<(), std::fmt::Error> {
        writeln!(&mut self.out, "\t{} {}, {}", mnemonic, src, dst)
    }

    /// One-operand or zero-operand instruction.
    pub fn op1(&mut self, mnemonic: &str, operand: &str) -> Result<(), std::fmt::Error> {
        if operand.is_empty() {
            writeln!(&mut self.out, "\t{}", mnemonic)
        } else {
            writeln!(&mut self.out, "\t{} {}", mnemonic, operand)
        }
    }

    pub fn sub_esp(&mut self, bytes: usize) -> Result<(), std::fmt::Error> {
        if bytes > 0 {
            writeln!(&mut self.out, "\tsubl ${}, %esp", bytes)?;
        }
        Ok(())
    }

    pub fn add_esp(&mut self, bytes: usize) -> Result<(), std::fmt::Error> {
        if bytes > 0 {
            writeln!(&mut self.out, "\taddl ${}, %esp", bytes)?;
        }
        Ok(())
    }

    // -- control transfer -----------------------------------------------------

    pub fn jmp(&mut self, target: &str) -> Result<(), std::fmt::Error> {
        writeln!(&mut self.out, "\tjmp {}", target)
    }

    pub fn jcc(&mut self, cc: &str, target: &str) -> Result<(), std::fmt::Error> {
        writeln!(&mut self.out, "\tj{} {}", cc, target)
    }

    pub fn call(&mut self, target: &str) -> Result<(), std::fmt::Error> {
        writeln!(&mut self.out, "\tcall {}", target)
    }

    pub fn call_reg(&mut self, reg: Reg) -> Result<(), std::fmt::Error> {
        writeln!(&mut self.out, "\tcall *{}", reg)
    }

    /// Indirect call through a vtable slot: `call *__voff__name(%reg)`.
    pub fn call_vtable(&mut self, voff: &str, reg: Reg) -> Result<(), std::fmt::Error> {
        writeln!(&mut self.out, "\tcall *{}({})", voff, reg)
    }

    // -- function frames ------------------------------------------------------

    /// Function prologue: establish the frame and save the registers the
    /// calling convention keeps live across calls.
    pub fn func_begin(&mut self, label: &str, export: bool) -> Result<(), std::fmt::Error> {
        writeln!(&mut self.out)?;
        if export {
            self.export(label)?;
        }
        self.label(label)?;
        writeln!(&mut self.out, "\tpushl %ebp")?;
        writeln!(&mut self.out, "\tmovl %esp, %ebp")?;
        writeln!(&mut self.out, "\tpushl %ebx")?;
        writeln!(&mut self.out, "\tpushl %edi")?;
        self.last_annotated = None;
        Ok(())
    }

    /// Function epilogue, also used by `preturn` after the frame pointer has
    /// been rewound to the target frame.
    pub fn epilogue(&mut self) -> Result<(), std::fmt::Error> {
        writeln!(&mut self.out, "\tmovl -4(%ebp), %ebx")?;
        writeln!(&mut self.out, "\tmovl -8(%ebp), %edi")?;
        writeln!(&mut self.out, "\tleave")?;
        writeln!(&mut self.out, "\tret")
    }

    // -- register cache facade ------------------------------------------------

    pub fn cache_reg(
        &mut self,
        var: &str,
        home: &Operand,
        for_write: bool,
    ) -> Result<Option<Reg>, std::fmt::Error> {
        self.cache.acquire(&mut self.out, var, home, for_write)
    }

    pub fn evict_all(&mut self) -> Result<(), std::fmt::Error> {
        self.cache.evict_all(&mut self.out)
    }

    pub fn evict_regs_for(&mut self, names: &[String]) -> Result<(), std::fmt::Error> {
        self.cache.evict_regs_for(&mut self.out, names)
    }

    /// Spill everything the cache may have claimed ahead of a call.
    pub fn caller_save(&mut self) -> Result<(), std::fmt::Error> {
        self.cache.evict_all(&mut self.out)
    }

    pub fn take_register(&mut self) -> Result<Reg, std::fmt::Error> {
        self.cache.take_register(&mut self.out)
    }

    pub fn take_specific(&mut self, reg: Reg) -> Result<(), std::fmt::Error> {
        self.cache.take_specific(&mut self.out, reg)
    }

    pub fn release_register(&mut self, reg: Reg) {
        self.cache.release(reg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operand_formatting() {
        assert_eq!(operand_str(&Operand::Int(42)), "$42");
        assert_eq!(operand_str(&Operand::Addr(".Lstr0".into())), "$.Lstr0");
        assert_eq!(operand_str(&Operand::LocalVar(0)), "-12(%ebp)");
        assert_eq!(operand_str(&Operand::LocalVar(2)), "-20(%ebp)");
        assert_eq!(operand_str(&Operand::Arg(1)), "12(%ebp)");
        assert_eq!(operand_str(&Operand::InstanceVar(3)), "12(%esi)");
        assert_eq!(operand_str(&Operand::Global("true".into())), "true");
        assert_eq!(operand_str(&Operand::Indirect(Reg::Edx)), "(%edx)");
        assert_eq!(operand_str(&Operand::SubExpr), "%eax");
    }

    #[test]
    fn test_prologue_and_epilogue_pair() {
        let mut em = Emitter::new(false);
        em.func_begin("__method_A_foo", false).unwrap();
        em.epilogue().unwrap();
        assert!(em.out.contains("__method_A_foo:"));
        assert!(em.out.contains("\tpushl %ebp"));
        assert!(em.out.contains("\tmovl %esp, %ebp"));
        assert!(em.out.contains("\tmovl -4(%ebp), %ebx"));
        assert!(em.out.contains("\tleave"));
        assert!(!em.out.contains(".globl"));
    }

    #[test]
    fn test_main_is_exported() {
        let mut em = Emitter::new(false);
        em.func_begin("main", true).unwrap();
        assert!(em.out.contains("\t.globl main"));
    }

    #[test]
    fn test_byte_memory_uses_byte_forms() {
        let mut em = Emitter::new(false);
        em.load(&Operand::Indirect8(Reg::Edx), Reg::Eax).unwrap();
        em.store(Reg::Eax, &Operand::Indirect8(Reg::Edx)).unwrap();
        assert!(em.out.contains("\tmovzbl (%edx), %eax"));
        assert!(em.out.contains("\tmovb %al, (%edx)"));
    }

    #[test]
    fn test_lineno_deduplicates() {
        let mut em = Emitter::new(true);
        let pos = Pos::new("a.ast", 3, 0);
        em.lineno(&pos).unwrap();
        em.lineno(&pos).unwrap();
        assert_eq!(em.out.matches("# a.ast:4").count(), 1);
    }

    #[test]
    fn test_lineno_disabled_without_debug_info() {
        let mut em = Emitter::new(false);
        em.lineno(&Pos::new("a.ast", 3, 0)).unwrap();
        assert!(em.out.is_empty());
    }

    #[test]
    fn test_fresh_labels_are_unique() {
        let mut em = Emitter::new(false);
        let a = em.fresh_label("if_else");
        let b = em.fresh_label("if_else");
        assert_ne!(a, b);
        assert!(a.starts_with(".Lif_else_"));
    }
}
