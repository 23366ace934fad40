//! Vtable layout: the offset pre-pass, missing-method thunks, and the base
//! vtable.
//!
//! Offsets are assigned before any class is emitted so every call site and
//! every class initialiser agrees on slot positions.  A slot a class never
//! fills points at a per-method thunk that splices the method's symbol in
//! front of the argument window and jumps to `__method_missing`.

use super::{CodeGen, CodeGenError};
use crate::ast::Expr;
use crate::scope::VTABLE_HEADER_SLOTS;
use crate::value::{Operand, Reg};
use std::fmt::Write as _;

impl CodeGen {
    /// Depth-first walk assigning a globally unique slot to each distinct
    /// method name, in first-encounter order.
    pub(crate) fn vtable_prepass(&mut self, expr: &Expr) {
        let Expr::List(node) = expr else { return };
        if node.head_sym() == Some("defm")
            && let Some(name) = node.args().first().and_then(Expr::as_sym)
        {
            self.ensure_method_offset(name);
        }
        for item in &node.items {
            self.vtable_prepass(item);
        }
    }

    /// Emit the `.equ __voff__<name>` constants, one per method name.
    pub(crate) fn emit_voff_constants(&self, out: &mut String) -> Result<(), CodeGenError> {
        for name in self.method_names() {
            let Some(slot) = self.method_offset(name) else {
                continue;
            };
            writeln!(
                out,
                "\t.equ __voff__{}, {}",
                Self::clean_label(name),
                slot * 4
            )?;
        }
        Ok(())
    }

    /// Emit one thunk per method name.  The thunk fills the method's symbol
    /// cell if needed, splices the symbol in front of the arguments (below
    /// the return address), bumps the count, and tail-jumps into
    /// `__method_missing`.
    pub(crate) fn emit_missing_thunks(&mut self) -> Result<(), CodeGenError> {
        let names: Vec<String> = self.method_names().to_vec();
        for name in names {
            let clean = Self::clean_label(&name);
            let (cell, string_label) = self.symbol_cell(&name);
            let have = self.em.fresh_label("thunk_sym_have");

            self.em.label(&format!("__vtable_missing_thunk_{}", clean))?;
            self.em.load(&Operand::Global(cell.clone()), Reg::Eax)?;
            self.em.op2("testl", "%eax", "%eax")?;
            self.em.jcc("ne", &have)?;
            self.em.push_op(&Operand::Addr(string_label))?;
            self.em.call("__get_string")?;
            self.em.op2("movl", "%eax", "(%esp)")?;
            self.em.call("__get_symbol")?;
            self.em.add_esp(4)?;
            self.em.store(Reg::Eax, &Operand::Global(cell))?;
            self.em.label(&have)?;

            self.em.pop(Reg::Ecx)?;
            self.em.op1("pushl", "%eax")?;
            self.em.op1("pushl", "%ecx")?;
            self.em.op1("incl", "%ebx")?;
            self.em.jmp("__method_missing")?;
        }
        Ok(())
    }

    /// The padded table every fresh class object starts from: header slots,
    /// then one thunk pointer per method slot.
    pub(crate) fn emit_base_vtable(&mut self) -> Result<(), CodeGenError> {
        writeln!(&mut self.data, "__base_vtable:")?;
        for _ in 0..VTABLE_HEADER_SLOTS {
            writeln!(&mut self.data, "\t.long 0")?;
        }
        let names: Vec<String> = self.method_names().to_vec();
        for name in names {
            writeln!(
                &mut self.data,
                "\t.long __vtable_missing_thunk_{}",
                Self::clean_label(&name)
            )?;
        }
        Ok(())
    }
}
