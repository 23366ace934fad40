//! Expression lowering.
//!
//! `compile_exp` dispatches over the keyword heading each list node and walks
//! the tree depth-first, emitting instructions as it goes.  Every routine
//! returns a [`Value`] describing where the result lives; `SubExpr` means the
//! result register holds it.

use super::{CodeGen, CodeGenError};
use crate::ast::{Expr, Node};
use crate::function::FunctionKind;
use crate::scope::{Frame, Resolution, ScopeChain};
use crate::value::{Operand, Reg, TypeHint, Value};

/// How a leaf is being used; a bare identifier resolves differently as a
/// store target than as a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    Read,
    Write,
}

impl CodeGen {
    /// Lower one expression, returning where its result lives.
    pub(crate) fn compile_exp(
        &mut self,
        scope: &ScopeChain,
        expr: &Expr,
    ) -> Result<Value, CodeGenError> {
        let node = match expr {
            Expr::List(node) => node,
            atom => return self.get_arg(scope, atom, Access::Read),
        };
        if let Some(pos) = &node.pos {
            self.last_pos = Some(pos.clone());
            self.em.lineno(pos)?;
        }
        if node.items.is_empty() {
            return Err(self.err(scope, expr, "cannot compile an empty expression"));
        }
        let Some(head) = node.head_sym() else {
            // Computed callee: the head is itself an expression.
            return self.compile_call(scope, &node.items[0], node.args());
        };
        let args = node.args();
        match head {
            "do" => self.compile_do_list(scope, args),
            "class" | "module" => self.compile_class(scope, node),
            "defun" => self.compile_defun(scope, node),
            "defm" => self.compile_defm(scope, node),
            "if" => {
                if args.len() < 2 {
                    return Err(self.err(scope, expr, "if needs a condition and a then-arm"));
                }
                self.compile_if(scope, &args[0], &args[1], args.get(2))
            }
            "lambda" => self.compile_lambda_like(scope, node, FunctionKind::Lambda),
            "proc" | "block" => self.compile_lambda_like(scope, node, FunctionKind::Proc),
            "assign" => {
                if args.len() != 2 {
                    return Err(self.err(scope, expr, "assign needs a target and a value"));
                }
                self.compile_assign(scope, &args[0], &args[1])
            }
            "while" => {
                if args.is_empty() {
                    return Err(self.err(scope, expr, "while needs a condition"));
                }
                self.compile_while(scope, args)
            }
            "index" => self.compile_index_common(scope, expr, node, false),
            "bindex" => self.compile_index_common(scope, expr, node, true),
            "let" => self.compile_let(scope, expr, node),
            "case" => self.compile_case(scope, expr, node),
            "ternif" => self.compile_ternif(scope, expr, node),
            "hash" => self.compile_hash(scope, expr, node),
            "return" => self.compile_return(scope, args),
            "sexp" => {
                let inner = scope.child(Frame::Sexp);
                self.compile_do_list(&inner, args)
            }
            "rescue" => self.compile_rescue(scope, args),
            "incr" => self.compile_incr(scope, expr, args),
            "required" => self.compile_do_list(scope, args),
            "add" | "sub" | "mul" | "div" => {
                if args.len() != 2 {
                    return Err(self.err(scope, expr, "arithmetic needs two operands"));
                }
                self.compile_arith(scope, head, &args[0], &args[1])
            }
            "eq" | "ne" | "lt" | "le" | "gt" | "ge" => {
                if args.len() != 2 {
                    return Err(self.err(scope, expr, "comparison needs two operands"));
                }
                self.compile_compare(scope, head, &args[0], &args[1])
            }
            "and" => {
                // (a && b) is if a then b.
                if args.len() != 2 {
                    return Err(self.err(scope, expr, "and needs two operands"));
                }
                self.compile_if(scope, &args[0], &args[1], None)
            }
            "or" => {
                if args.len() != 2 {
                    return Err(self.err(scope, expr, "or needs two operands"));
                }
                self.compile_or(scope, &args[0], &args[1])
            }
            "saveregs" => {
                self.em.caller_save()?;
                Ok(Value::new(Operand::Int(0)))
            }
            "preturn" => self.compile_preturn(scope, expr, args),
            "stackframe" => {
                self.em.op2("movl", "%ebp", "%eax")?;
                Ok(Value::subexpr(TypeHint::Unknown))
            }
            "deref" => self.compile_deref(scope, expr, node),
            "call" => {
                if args.is_empty() {
                    return Err(self.err(scope, expr, "call needs a callee"));
                }
                self.compile_call(scope, &args[0], &args[1..])
            }
            "callm" => self.compile_callm_form(scope, expr, node, false),
            "super" => self.compile_super(scope, expr, node),
            "yield" => self.compile_yield(scope, expr, node),
            // Operator methods share the method namespace; `<<` lowers as a
            // send with the operator symbol as the method name.
            "<<" => {
                if args.len() != 2 {
                    return Err(self.err(scope, expr, "<< needs two operands"));
                }
                self.compile_callm(scope, &args[0], "<<", &args[1..], None, false)
            }
            // Any other head is an implicit call with the head as callee.
            _ => self.compile_call(scope, &node.items[0], args),
        }
    }

    /// Lower a sequence, returning the last value.
    pub(crate) fn compile_do_list(
        &mut self,
        scope: &ScopeChain,
        exprs: &[Expr],
    ) -> Result<Value, CodeGenError> {
        let mut last = Value::new(Operand::Int(0));
        let n = exprs.len();
        for (i, e) in exprs.iter().enumerate() {
            let v = self.compile_exp(scope, e)?;
            let v = self.touch(scope, v)?;
            if i + 1 == n {
                last = v;
            } else {
                self.discard_value(&v);
            }
        }
        Ok(last)
    }

    // -- leaf resolution ------------------------------------------------------

    /// Map a raw AST leaf to a Value.  Lists recurse into `compile_exp`.
    pub(crate) fn get_arg(
        &mut self,
        scope: &ScopeChain,
        expr: &Expr,
        access: Access,
    ) -> Result<Value, CodeGenError> {
        match expr {
            Expr::Int(n) => Ok(Value::new(Operand::Int(*n))),
            Expr::Float(f) => {
                self.warn(format!("float literal {} truncated to integer", f));
                Ok(Value::new(Operand::Int(*f as i64)))
            }
            Expr::Str(s) => {
                let label = self.intern_string(s);
                Ok(Value::new(Operand::Addr(label)))
            }
            Expr::List(_) => self.compile_exp(scope, expr),
            Expr::Sym(name) => self.resolve_sym(scope, expr, name, access),
        }
    }

    fn resolve_sym(
        &mut self,
        scope: &ScopeChain,
        expr: &Expr,
        name: &str,
        access: Access,
    ) -> Result<Value, CodeGenError> {
        if name == "self" {
            if access == Access::Write {
                return Err(self.err(scope, expr, "cannot assign to self"));
            }
            if scope.in_method() {
                return Ok(Value::object(Operand::Reg(Reg::Esi)));
            }
            self.env.add_global("self");
            return Ok(Value::object(Operand::Global("self".to_string())));
        }
        if matches!(name, "true" | "false" | "nil") {
            if access == Access::Write {
                return Err(self.err(scope, expr, "missing assignment target"));
            }
            self.env.add_global(name);
            return Ok(Value::object(Operand::Global(name.to_string())));
        }
        if let Some(sym) = name.strip_prefix(':')
            && !sym.is_empty()
        {
            if access == Access::Write {
                return Err(self.err(scope, expr, "missing assignment target"));
            }
            return self.compile_symbol_literal(sym);
        }
        if let Some(ivar) = name.strip_prefix('@') {
            return match scope.resolve_ivar(ivar, &self.env) {
                Some(slot) => Ok(Value::object(Operand::InstanceVar(slot))),
                None => Err(self.err(scope, expr, "instance variable outside of a class")),
            };
        }
        let for_write = access == Access::Write;
        match scope.resolve(name, &self.env) {
            Resolution::Arg(i) => {
                let home = Operand::Arg(i);
                match self.em.cache_reg(name, &home, for_write)? {
                    Some(r) => Ok(Value::object(Operand::Reg(r))),
                    None => Ok(Value::object(home)),
                }
            }
            Resolution::Local(i) => {
                let home = Operand::LocalVar(i);
                match self.em.cache_reg(name, &home, for_write)? {
                    Some(r) => Ok(Value::object(Operand::Reg(r))),
                    None => Ok(Value::object(home)),
                }
            }
            Resolution::Ivar(slot) => Ok(Value::object(Operand::InstanceVar(slot))),
            Resolution::Global(g) => Ok(Value::object(Operand::Global(g))),
            Resolution::Class(c) => Ok(Value::object(Operand::Global(c))),
            Resolution::Function(label) => Ok(Value::new(Operand::Addr(label))),
            Resolution::RawAddr(raw) => {
                // Inside a sexp scope a bare name is assembler-level.
                if for_write {
                    Ok(Value::new(Operand::Global(raw)))
                } else {
                    Ok(Value::new(Operand::Addr(raw)))
                }
            }
            Resolution::Unresolved => {
                if for_write {
                    // Promote to a fresh global constant.
                    self.env.add_global(name);
                    Ok(Value::object(Operand::Global(name.to_string())))
                } else {
                    Ok(Value::new(Operand::PossibleSend(name.to_string())))
                }
            }
        }
    }

    /// Allocate (and cache) a runtime Symbol for `:name`.  The cell is filled
    /// once: `__get_symbol(__get_string(bytes))` on first use.
    fn compile_symbol_literal(&mut self, name: &str) -> Result<Value, CodeGenError> {
        let (cell, string_label) = self.symbol_cell(name);
        self.em.caller_save()?;
        let have = self.em.fresh_label("sym_have");
        self.em.load(&Operand::Global(cell.clone()), Reg::Eax)?;
        self.em.op2("testl", "%eax", "%eax")?;
        self.em.jcc("ne", &have)?;
        self.em.push_op(&Operand::Addr(string_label))?;
        self.em.call("__get_string")?;
        self.em.op2("movl", "%eax", "(%esp)")?;
        self.em.call("__get_symbol")?;
        self.em.add_esp(4)?;
        self.em.store(Reg::Eax, &Operand::Global(cell.clone()))?;
        self.em.label(&have)?;
        Ok(Value::object(Operand::Global(cell)))
    }

    // -- value plumbing -------------------------------------------------------

    /// Materialize a `PossibleSend` as an implicit self-send; everything else
    /// passes through.
    pub(crate) fn touch(
        &mut self,
        scope: &ScopeChain,
        value: Value,
    ) -> Result<Value, CodeGenError> {
        if let Operand::PossibleSend(name) = &value.op {
            let name = name.clone();
            return self.compile_callm(scope, &Expr::sym("self"), &name, &[], None, false);
        }
        Ok(value)
    }

    /// Release any scratch register a value holds.
    pub(crate) fn discard_value(&mut self, value: &Value) {
        if let Operand::Indirect(r) | Operand::Indirect8(r) = value.op {
            self.em.release_register(r);
        }
    }

    /// Bring a value into the result register, materializing implicit sends
    /// and releasing address registers.
    pub(crate) fn load_eax(
        &mut self,
        scope: &ScopeChain,
        value: Value,
    ) -> Result<Value, CodeGenError> {
        let value = self.touch(scope, value)?;
        match value.op {
            Operand::SubExpr => {}
            Operand::Indirect(r) | Operand::Indirect8(r) => {
                self.em.load(&value.op, Reg::Eax)?;
                self.em.release_register(r);
            }
            ref op => self.em.load(op, Reg::Eax)?,
        }
        Ok(Value::subexpr(value.hint))
    }

    /// Reload `self` into its register by re-resolving it.
    pub(crate) fn reload_self(&mut self, scope: &ScopeChain) -> Result<(), CodeGenError> {
        if scope.in_method() {
            self.em.load(&Operand::Arg(0), Reg::Esi)?;
        } else {
            self.env.add_global("self");
            self.em.load(&Operand::Global("self".to_string()), Reg::Esi)?;
        }
        Ok(())
    }

    /// Branch to `target` when the value in the result register is falsy.
    /// Object-typed values compare against both `nil` and `false`; anything
    /// else is a plain zero test.
    pub(crate) fn jump_false(&mut self, hint: TypeHint, target: &str) -> Result<(), CodeGenError> {
        match hint {
            TypeHint::Object => {
                self.env.add_global("nil");
                self.env.add_global("false");
                self.em.op2("cmpl", "nil", "%eax")?;
                self.em.jcc("e", target)?;
                self.em.op2("cmpl", "false", "%eax")?;
                self.em.jcc("e", target)?;
            }
            TypeHint::Unknown => {
                self.em.op2("testl", "%eax", "%eax")?;
                self.em.jcc("e", target)?;
            }
        }
        Ok(())
    }

    // -- control flow ---------------------------------------------------------

    fn compile_if(
        &mut self,
        scope: &ScopeChain,
        cond: &Expr,
        then_arm: &Expr,
        else_arm: Option<&Expr>,
    ) -> Result<Value, CodeGenError> {
        let cond_v = self.compile_exp(scope, cond)?;
        let cond_v = self.load_eax(scope, cond_v)?;
        self.em.evict_all()?;

        let else_label = self.em.fresh_label("if_else");
        let end_label = self.em.fresh_label("if_end");
        self.jump_false(cond_v.hint, &else_label)?;

        let then_v = self.compile_exp(scope, then_arm)?;
        let then_v = self.load_eax(scope, then_v)?;
        self.em.evict_all()?;
        self.em.jmp(&end_label)?;

        self.em.label(&else_label)?;
        let else_v = match else_arm {
            Some(arm) => {
                let v = self.compile_exp(scope, arm)?;
                let v = self.load_eax(scope, v)?;
                self.em.evict_all()?;
                v
            }
            None => {
                self.env.add_global("nil");
                self.em.load(&Operand::Global("nil".to_string()), Reg::Eax)?;
                Value::subexpr(TypeHint::Object)
            }
        };
        self.em.label(&end_label)?;

        // The result type is the common type of both arms if equal.
        let hint = if then_v.hint == else_v.hint {
            then_v.hint
        } else {
            TypeHint::Unknown
        };
        Ok(Value::subexpr(hint))
    }

    fn compile_while(&mut self, scope: &ScopeChain, args: &[Expr]) -> Result<Value, CodeGenError> {
        let start = self.em.fresh_label("while");
        let done = self.em.fresh_label("while_end");
        self.em.evict_all()?;
        self.em.label(&start)?;
        let cond = self.compile_exp(scope, &args[0])?;
        let cond = self.load_eax(scope, cond)?;
        self.em.evict_all()?;
        self.jump_false(cond.hint, &done)?;
        for e in &args[1..] {
            let v = self.compile_exp(scope, e)?;
            let v = self.touch(scope, v)?;
            self.discard_value(&v);
        }
        self.em.evict_all()?;
        self.em.jmp(&start)?;
        self.em.label(&done)?;
        Ok(Value::new(Operand::Int(0)))
    }

    /// `(a || b)` parks the left value in `__left` and returns it when
    /// truthy, otherwise evaluates the right operand.
    fn compile_or(&mut self, scope: &ScopeChain, a: &Expr, b: &Expr) -> Result<Value, CodeGenError> {
        self.env.add_global("__left");
        let left = Operand::Global("__left".to_string());

        let av = self.compile_exp(scope, a)?;
        let av = self.load_eax(scope, av)?;
        self.em.store(Reg::Eax, &left)?;
        self.em.evict_all()?;

        let else_label = self.em.fresh_label("or_else");
        let end_label = self.em.fresh_label("or_end");
        self.jump_false(av.hint, &else_label)?;
        self.em.load(&left, Reg::Eax)?;
        self.em.jmp(&end_label)?;

        self.em.label(&else_label)?;
        let bv = self.compile_exp(scope, b)?;
        let bv = self.load_eax(scope, bv)?;
        self.em.evict_all()?;
        self.em.label(&end_label)?;

        let hint = if av.hint == bv.hint { av.hint } else { TypeHint::Unknown };
        Ok(Value::subexpr(hint))
    }

    // -- let ------------------------------------------------------------------

    fn compile_let(
        &mut self,
        scope: &ScopeChain,
        expr: &Expr,
        node: &Node,
    ) -> Result<Value, CodeGenError> {
        let args = node.args();
        let Some(name_list) = args.first().and_then(Expr::as_list) else {
            return Err(self.err(scope, expr, "let needs a binding list"));
        };
        let mut names = Vec::new();
        for entry in &name_list.items {
            match entry.as_sym() {
                Some(s) => names.push(s.to_string()),
                None => return Err(self.err(scope, expr, "let bindings must be names")),
            }
        }

        // Registers cached for outer variables of the same names are stale
        // inside the block.
        self.em.evict_regs_for(&names)?;
        let base = scope.local_base();
        let inner = scope.child(Frame::Local {
            names: names.clone(),
            base,
        });
        self.em.sub_esp(4 * names.len())?;

        let body = &args[1..];
        let mut last = Value::new(Operand::Int(0));
        let n = body.len();
        for (i, e) in body.iter().enumerate() {
            let v = self.compile_exp(&inner, e)?;
            if i + 1 == n {
                // Bring the result out before the slots die.
                last = self.load_eax(&inner, v)?;
            } else {
                let v = self.touch(&inner, v)?;
                self.discard_value(&v);
            }
        }

        self.em.evict_regs_for(&names)?;
        self.em.evict_all()?;
        self.em.add_esp(4 * names.len())?;
        Ok(last)
    }

    // -- assignment -----------------------------------------------------------

    fn compile_assign(
        &mut self,
        scope: &ScopeChain,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<Value, CodeGenError> {
        // foo.bar = v  is rewritten inline to  foo.bar=(v)
        if let Some(node) = lhs.as_list() {
            match node.head_sym() {
                Some("callm") => {
                    let Some(recv) = node.args().first() else {
                        return Err(self.err(scope, lhs, "missing assignment target"));
                    };
                    let Some(meth) = node.args().get(1).and_then(Expr::as_sym) else {
                        return Err(self.err(scope, lhs, "missing assignment target"));
                    };
                    let setter = format!("{}=", meth);
                    return self.compile_callm(
                        scope,
                        recv,
                        &setter,
                        std::slice::from_ref(rhs),
                        None,
                        false,
                    );
                }
                Some("index") | Some("bindex") => {
                    let byte = node.head_sym() == Some("bindex");
                    let rv = self.compile_exp(scope, rhs)?;
                    let rv = self.load_eax(scope, rv)?;
                    self.em.push_op(&Operand::SubExpr)?;
                    let target = self.compile_index_common(scope, lhs, node, byte)?;
                    self.em.pop(Reg::Eax)?;
                    self.em.store(Reg::Eax, &target.op)?;
                    self.discard_value(&target);
                    return Ok(Value::subexpr(rv.hint));
                }
                _ => return Err(self.err(scope, lhs, "missing assignment target")),
            }
        }

        let Some(name) = lhs.as_sym() else {
            return Err(self.err(scope, lhs, "missing assignment target"));
        };

        // @ivar = v stores into the instance slot of self, preserving the
        // source across the self reload.
        if let Some(ivar) = name.strip_prefix('@') {
            let Some(slot) = scope.resolve_ivar(ivar, &self.env) else {
                return Err(self.err(scope, lhs, "instance variable outside of a class"));
            };
            let rv = self.compile_exp(scope, rhs)?;
            let rv = self.load_eax(scope, rv)?;
            self.em.push_op(&Operand::SubExpr)?;
            self.reload_self(scope)?;
            self.em.pop(Reg::Eax)?;
            self.em.store(Reg::Eax, &Operand::InstanceVar(slot))?;
            return Ok(Value::subexpr(rv.hint));
        }

        let rv = self.compile_exp(scope, rhs)?;
        let rv = self.load_eax(scope, rv)?;
        let target = self.get_arg(scope, lhs, Access::Write)?;
        match &target.op {
            Operand::Reg(_)
            | Operand::Global(_)
            | Operand::LocalVar(_)
            | Operand::Arg(_)
            | Operand::InstanceVar(_) => {
                self.em.store(Reg::Eax, &target.op)?;
            }
            _ => return Err(self.err(scope, lhs, "missing assignment target")),
        }
        Ok(Value::subexpr(rv.hint))
    }

    // -- indexing -------------------------------------------------------------

    /// `index a i` addresses the 32-bit slot `[a + i*4]`; `bindex` the byte
    /// `[a + i]`.  The result is indirect so it works as both a read and an
    /// assignment target.
    fn compile_index_common(
        &mut self,
        scope: &ScopeChain,
        expr: &Expr,
        node: &Node,
        byte: bool,
    ) -> Result<Value, CodeGenError> {
        let args = node.args();
        if args.len() != 2 {
            return Err(self.err(scope, expr, "index needs a base and an index"));
        }
        let base = &args[0];
        let idx = &args[1];
        let hint = self.lookup_slot_type(base, idx);

        let bv = self.get_arg(scope, base, Access::Read)?;
        self.load_eax(scope, bv)?;

        let make = |r: Reg| {
            if byte {
                Operand::Indirect8(r)
            } else {
                Operand::Indirect(r)
            }
        };

        if let Expr::Int(n) = idx {
            let r = self.em.take_register()?;
            self.em.op2("movl", "%eax", &r.to_string())?;
            let off = if byte { *n } else { *n * 4 };
            if off != 0 {
                self.em.op2("addl", &format!("${}", off), &r.to_string())?;
            }
            return Ok(Value::with_hint(make(r), hint));
        }

        self.em.push_op(&Operand::SubExpr)?;
        let iv = self.get_arg(scope, idx, Access::Read)?;
        self.load_eax(scope, iv)?;
        let r = self.em.take_register()?;
        self.em.pop(r)?;
        if byte {
            self.em.op2("leal", &format!("({},%eax)", r), &r.to_string())?;
        } else {
            self.em.op2("leal", &format!("({},%eax,4)", r), &r.to_string())?;
        }
        Ok(Value::with_hint(make(r), hint))
    }

    /// Slot 0 of a block environment is the saved frame pointer and is the
    /// only slot that is not an object.
    fn lookup_slot_type(&self, base: &Expr, idx: &Expr) -> TypeHint {
        if base.is_sym("__env__") && matches!(idx, Expr::Int(0)) {
            TypeHint::Unknown
        } else {
            TypeHint::Object
        }
    }

    // -- arithmetic and comparison --------------------------------------------

    fn compile_arith(
        &mut self,
        scope: &ScopeChain,
        op: &str,
        a: &Expr,
        b: &Expr,
    ) -> Result<Value, CodeGenError> {
        let av = self.get_arg(scope, a, Access::Read)?;
        self.load_eax(scope, av)?;
        self.em.push_op(&Operand::SubExpr)?;
        let bv = self.get_arg(scope, b, Access::Read)?;
        self.load_eax(scope, bv)?;

        if op == "div" {
            // idivl sign-extends through %edx, so both fixed registers are
            // claimed for the duration.
            self.em.take_specific(Reg::Ecx)?;
            self.em.take_specific(Reg::Edx)?;
            self.em.op2("movl", "%eax", "%ecx")?;
            self.em.pop(Reg::Eax)?;
            self.em.op1("cltd", "")?;
            self.em.op1("idivl", "%ecx")?;
            self.em.release_register(Reg::Ecx);
            self.em.release_register(Reg::Edx);
            return Ok(Value::subexpr(TypeHint::Unknown));
        }

        let r = self.em.take_register()?;
        self.em.op2("movl", "%eax", &r.to_string())?;
        self.em.pop(Reg::Eax)?;
        let mnemonic = match op {
            "add" => "addl",
            "sub" => "subl",
            "mul" => "imull",
            _ => unreachable!("not an arithmetic head: {}", op),
        };
        self.em.op2(mnemonic, &r.to_string(), "%eax")?;
        self.em.release_register(r);
        Ok(Value::subexpr(TypeHint::Unknown))
    }

    fn compile_compare(
        &mut self,
        scope: &ScopeChain,
        op: &str,
        a: &Expr,
        b: &Expr,
    ) -> Result<Value, CodeGenError> {
        let av = self.get_arg(scope, a, Access::Read)?;
        self.load_eax(scope, av)?;
        self.em.push_op(&Operand::SubExpr)?;
        let bv = self.get_arg(scope, b, Access::Read)?;
        self.load_eax(scope, bv)?;

        let r = self.em.take_register()?;
        self.em.op2("movl", "%eax", &r.to_string())?;
        self.em.pop(Reg::Eax)?;
        self.em.op2("cmpl", &r.to_string(), "%eax")?;
        let cc = match op {
            "eq" => "e",
            "ne" => "ne",
            "lt" => "l",
            "le" => "le",
            "gt" => "g",
            "ge" => "ge",
            _ => unreachable!("not a comparison head: {}", op),
        };
        self.em.op1(&format!("set{}", cc), "%al")?;
        self.em.op2("movzbl", "%al", "%eax")?;
        self.em.release_register(r);
        Ok(Value::subexpr(TypeHint::Unknown))
    }

    // -- rewritten forms ------------------------------------------------------

    /// `case` rewrites each `when v` into `if (subject === v) then body`.
    fn compile_case(
        &mut self,
        scope: &ScopeChain,
        expr: &Expr,
        node: &Node,
    ) -> Result<Value, CodeGenError> {
        let args = node.args();
        if args.is_empty() {
            return Err(self.err(scope, expr, "case needs a subject"));
        }
        let subject = &args[0];
        let mut chain: Option<Expr> = None;
        for clause in args[1..].iter().rev() {
            let Some(cl) = clause.as_list() else {
                return Err(self.err(scope, expr, "case clauses must be when/else lists"));
            };
            match cl.head_sym() {
                Some("else") => {
                    let mut body = vec![Expr::sym("do")];
                    body.extend_from_slice(cl.args());
                    chain = Some(Expr::list(body));
                }
                Some("when") => {
                    let when_args = cl.args();
                    if when_args.is_empty() {
                        return Err(self.err(scope, expr, "when needs a value"));
                    }
                    let cond = Expr::list(vec![
                        Expr::sym("callm"),
                        subject.clone(),
                        Expr::sym("==="),
                        Expr::list(vec![when_args[0].clone()]),
                    ]);
                    let mut body = vec![Expr::sym("do")];
                    body.extend_from_slice(&when_args[1..]);
                    let mut if_items = vec![Expr::sym("if"), cond, Expr::list(body)];
                    if let Some(alt) = chain.take() {
                        if_items.push(alt);
                    }
                    chain = Some(Expr::list(if_items));
                }
                _ => return Err(self.err(scope, expr, "case clauses must be when/else lists")),
            }
        }
        match chain {
            Some(tree) => self.compile_exp(scope, &tree),
            None => self.compile_exp(scope, subject),
        }
    }

    /// `ternif` rewrites to `if`; the else arm rides in a `ternalt` sibling.
    fn compile_ternif(
        &mut self,
        scope: &ScopeChain,
        expr: &Expr,
        node: &Node,
    ) -> Result<Value, CodeGenError> {
        let args = node.args();
        if args.len() < 2 {
            return Err(self.err(scope, expr, "ternif needs a condition and an arm"));
        }
        if let Some(alt) = args[1].as_list()
            && alt.head_sym() == Some("ternalt")
        {
            if alt.args().len() != 2 {
                return Err(self.err(scope, expr, "ternalt needs two arms"));
            }
            return self.compile_if(scope, &args[0], &alt.args()[0], Some(&alt.args()[1]));
        }
        self.compile_if(scope, &args[0], &args[1], args.get(2))
    }

    /// A hash literal builds a Hash and sends `[]=` per pair.
    fn compile_hash(
        &mut self,
        scope: &ScopeChain,
        expr: &Expr,
        node: &Node,
    ) -> Result<Value, CodeGenError> {
        self.env.add_global("Hash");
        let mut body = vec![
            Expr::sym("let"),
            Expr::list(vec![Expr::sym("__hash")]),
            Expr::list(vec![
                Expr::sym("assign"),
                Expr::sym("__hash"),
                Expr::list(vec![
                    Expr::sym("callm"),
                    Expr::sym("Hash"),
                    Expr::sym("new"),
                    Expr::list(vec![]),
                ]),
            ]),
        ];
        for entry in node.args() {
            let pair = entry.as_list().filter(|n| n.head_sym() == Some("pair"));
            let Some(pair) = pair else {
                return Err(self.err(scope, expr, "malformed hash literal entry"));
            };
            if pair.args().len() != 2 {
                return Err(self.err(scope, expr, "malformed hash literal entry"));
            }
            body.push(Expr::list(vec![
                Expr::sym("callm"),
                Expr::sym("__hash"),
                Expr::sym("[]="),
                Expr::list(pair.args().to_vec()),
            ]));
        }
        body.push(Expr::sym("__hash"));
        self.compile_exp(scope, &Expr::list(body))
    }

    fn compile_incr(
        &mut self,
        scope: &ScopeChain,
        expr: &Expr,
        args: &[Expr],
    ) -> Result<Value, CodeGenError> {
        if args.is_empty() {
            return Err(self.err(scope, expr, "incr needs a target"));
        }
        let amount = args.get(1).cloned().unwrap_or(Expr::Int(1));
        let tree = Expr::list(vec![
            Expr::sym("assign"),
            args[0].clone(),
            Expr::list(vec![Expr::sym("add"), args[0].clone(), amount]),
        ]);
        self.compile_exp(scope, &tree)
    }

    // -- returns --------------------------------------------------------------

    fn compile_return(&mut self, scope: &ScopeChain, args: &[Expr]) -> Result<Value, CodeGenError> {
        let hint = match args.first() {
            Some(e) => {
                let v = self.compile_exp(scope, e)?;
                self.load_eax(scope, v)?.hint
            }
            None => {
                self.em.load(&Operand::Int(0), Reg::Eax)?;
                TypeHint::Unknown
            }
        };
        self.em.evict_all()?;
        self.em.epilogue()?;
        Ok(Value::subexpr(hint))
    }

    /// Non-local return out of a block: restore the frame pointer saved in
    /// slot 0 of the environment, then run the normal epilogue.
    fn compile_preturn(
        &mut self,
        scope: &ScopeChain,
        expr: &Expr,
        args: &[Expr],
    ) -> Result<Value, CodeGenError> {
        match args.first() {
            Some(e) => {
                let v = self.compile_exp(scope, e)?;
                self.load_eax(scope, v)?;
            }
            None => self.em.load(&Operand::Int(0), Reg::Eax)?,
        }
        self.em.push_op(&Operand::SubExpr)?;
        let env = self.get_arg(scope, &Expr::sym("__env__"), Access::Read)?;
        if matches!(env.op, Operand::PossibleSend(_)) {
            return Err(self.err(scope, expr, "preturn outside of a block"));
        }
        let r = self.em.take_register()?;
        self.em.load(&env.op, r)?;
        self.em.op2("movl", &format!("({})", r), "%ebp")?;
        self.em.release_register(r);
        self.em.pop(Reg::Eax)?;
        self.em.epilogue()?;
        Ok(Value::subexpr(TypeHint::Unknown))
    }

    fn compile_rescue(&mut self, scope: &ScopeChain, args: &[Expr]) -> Result<Value, CodeGenError> {
        self.warn("rescue is not implemented; handlers are ignored");
        match args.first() {
            Some(body) => self.compile_exp(scope, body),
            None => Ok(Value::new(Operand::Int(0))),
        }
    }

    /// `A::B` resolves a constant in class scope.
    fn compile_deref(
        &mut self,
        scope: &ScopeChain,
        expr: &Expr,
        node: &Node,
    ) -> Result<Value, CodeGenError> {
        let args = node.args();
        let (Some(class), Some(name)) = (
            args.first().and_then(Expr::as_sym),
            args.get(1).and_then(Expr::as_sym),
        ) else {
            return Err(self.err(scope, expr, "unresolvable static dereference"));
        };
        match scope.resolve(class, &self.env) {
            Resolution::Class(c) => {
                let global = format!("{}__{}", c, name);
                self.env.add_global(&global);
                Ok(Value::object(Operand::Global(global)))
            }
            _ => Err(self.err(scope, expr, "unresolvable static dereference")),
        }
    }
}
