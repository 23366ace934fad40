//! The top-level driver.
//!
//! Compilation is a two-phase outer loop: the vtable pre-pass walks the tree
//! assigning method offsets, then the main pass emits the entry point,
//! drains the function queue (definitions queued during the drain re-enter
//! it), emits the vtable-missing thunks and base vtable, and finally flushes
//! the read-only string pool and the BSS globals.

use super::{CodeGen, CodeGenError};
use crate::ast::Expr;
use crate::runtime;
use crate::scope::ScopeChain;
use std::fmt::Write as _;

impl CodeGen {
    /// Lower a whole program tree to assembly text.
    pub fn compile_program(&mut self, tree: &Expr) -> Result<String, CodeGenError> {
        self.vtable_prepass(tree);

        let entry = self.config.entry.clone();
        self.em.func_begin(&entry, true)?;
        let scope = ScopeChain::global();
        let v = self.compile_exp(&scope, tree)?;
        let v = self.touch(&scope, v)?;
        self.discard_value(&v);
        self.em.evict_all()?;
        self.em.op2("xorl", "%eax", "%eax")?;
        self.em.epilogue()?;

        // Drain the queue by index: closures and lambdas defined while a
        // function is being emitted append to it and are picked up on later
        // iterations.
        let mut i = 0;
        while i < self.functions.len() {
            let f = self.functions[i].clone();
            self.emit_function(&f)?;
            i += 1;
        }

        self.emit_missing_thunks()?;
        self.emit_base_vtable()?;
        self.assemble()
    }

    /// Stitch the accumulated buffers into the final file in deterministic
    /// order: externs, vtable constants, text, rodata, data, BSS.
    fn assemble(&self) -> Result<String, CodeGenError> {
        let mut out = String::new();
        runtime::emit_extern_decls(&mut out)?;

        if !self.method_names().is_empty() {
            writeln!(out, "# VTable slot offsets")?;
            self.emit_voff_constants(&mut out)?;
            writeln!(out)?;
        }

        writeln!(out, "\t.text")?;
        out.push_str(&self.em.out);

        if !self.rodata.is_empty() {
            writeln!(out)?;
            writeln!(out, "\t.section .rodata")?;
            out.push_str(&self.rodata);
        }

        if !self.data.is_empty() {
            writeln!(out)?;
            writeln!(out, "\t.data")?;
            out.push_str(&self.data);
        }

        if !self.env.globals().is_empty() || !self.symbol_cell_order.is_empty() {
            writeln!(out)?;
            writeln!(out, "# Globals")?;
            for global in self.env.globals() {
                writeln!(out, "\t.comm {}, 4, 4", global)?;
            }
            for cell in &self.symbol_cell_order {
                writeln!(out, "\t.comm {}, 4, 4", cell)?;
            }
        }

        Ok(out)
    }
}
