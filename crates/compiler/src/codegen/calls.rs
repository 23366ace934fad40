//! Call lowering: plain calls, method dispatch, `super`, and `yield`.
//!
//! All four shapes share one argument-window builder: arguments are pushed
//! right-to-left, a trailing splat copies its elements through a runtime
//! loop, and the raw argument count rides in `%ebx` into the callee.  Every
//! window is wrapped in `caller_save`, and `self` is reloaded afterwards
//! whenever the target was not `self`.

use super::expr::Access;
use super::{CodeGen, CodeGenError};
use crate::ast::{Expr, Node};
use crate::scope::{Resolution, ScopeChain};
use crate::value::{Operand, Reg, TypeHint, Value};

/// State of an argument window under construction.
struct Window {
    /// Slots pushed with a compile-time count.
    fixed: usize,
    /// A trailing splat made the size runtime-known; the running count lives
    /// in `%edi` until the call, and `%ebx` (preserved by the callee) pays
    /// for the cleanup.
    splat: bool,
}

fn is_splat(expr: &Expr) -> bool {
    expr.as_list().is_some_and(|n| n.head_sym() == Some("splat"))
}

impl CodeGen {
    // -- argument windows -----------------------------------------------------

    /// Push one argument from wherever it lives.
    fn push_one(&mut self, scope: &ScopeChain, arg: &Expr) -> Result<(), CodeGenError> {
        let v = self.get_arg(scope, arg, Access::Read)?;
        let v = self.touch(scope, v)?;
        if matches!(v.op, Operand::Indirect8(_)) {
            // Byte memory cannot be pushed whole; widen it first.
            let v = self.load_eax(scope, v)?;
            self.em.push_op(&v.op)?;
            return Ok(());
        }
        self.em.push_op(&v.op)?;
        if let Operand::Indirect(r) = v.op {
            self.em.release_register(r);
        }
        Ok(())
    }

    /// Push a call's arguments right-to-left.  A splat is only legal in
    /// trailing position.
    fn push_args(&mut self, scope: &ScopeChain, args: &[Expr]) -> Result<Window, CodeGenError> {
        for (i, a) in args.iter().enumerate() {
            if is_splat(a) && i + 1 != args.len() {
                return Err(self.err(scope, a, "splat argument must be trailing"));
            }
        }
        let splat = args.last().is_some_and(is_splat);
        let mut window = Window { fixed: 0, splat };

        let mut rest = args;
        if let Some(last) = args.last()
            && splat
        {
            let vec_expr = last
                .as_list()
                .and_then(|n| n.args().first())
                .ok_or_else(|| self.err(scope, last, "splat needs an operand"))?;
            self.push_splat(scope, vec_expr)?;
            rest = &args[..args.len() - 1];
        }
        for a in rest.iter().rev() {
            self.push_one(scope, a)?;
            window.fixed += 1;
            if splat {
                self.em.op1("incl", "%edi")?;
            }
        }
        Ok(window)
    }

    /// Copy a runtime argument vector into the window: slot 1 holds the
    /// length, slot 2 the element base.  Elements are pushed highest-index
    /// first so the vector stays in order; the running count accumulates in
    /// `%edi`.
    fn push_splat(&mut self, scope: &ScopeChain, vec_expr: &Expr) -> Result<(), CodeGenError> {
        let v = self.compile_exp(scope, vec_expr)?;
        self.load_eax(scope, v)?;
        self.em.take_specific(Reg::Ecx)?;
        self.em.take_specific(Reg::Edx)?;
        self.em.take_specific(Reg::Edi)?;
        self.em.op2("movl", "4(%eax)", "%ecx")?;
        self.em.op2("movl", "8(%eax)", "%edx")?;
        self.em.op2("movl", "%ecx", "%edi")?;
        let copy = self.em.fresh_label("splat");
        let done = self.em.fresh_label("splat_done");
        self.em.label(&copy)?;
        self.em.op2("testl", "%ecx", "%ecx")?;
        self.em.jcc("e", &done)?;
        self.em.op1("decl", "%ecx")?;
        self.em.op1("pushl", "(%edx,%ecx,4)")?;
        self.em.jmp(&copy)?;
        self.em.label(&done)?;
        self.em.release_register(Reg::Ecx);
        self.em.release_register(Reg::Edx);
        Ok(())
    }

    /// Load the final count into `%ebx` just before the call.
    fn set_arg_count(&mut self, window: &Window) -> Result<(), CodeGenError> {
        if window.splat {
            self.em.op2("movl", "%edi", "%ebx")?;
            self.em.release_register(Reg::Edi);
        } else {
            self.em.load(&Operand::Int(window.fixed as i64), Reg::Ebx)?;
        }
        Ok(())
    }

    /// Free the window after the call returns.
    fn drop_window(&mut self, window: &Window) -> Result<(), CodeGenError> {
        if window.splat {
            // The callee preserved the count register.
            self.em.op2("leal", "(%esp,%ebx,4)", "%esp")?;
        } else {
            self.em.add_esp(4 * window.fixed)?;
        }
        Ok(())
    }

    // -- plain calls ----------------------------------------------------------

    /// A direct call: the callee is a global function, a raw runtime symbol,
    /// or a computed function address.
    pub(crate) fn compile_call(
        &mut self,
        scope: &ScopeChain,
        callee: &Expr,
        args: &[Expr],
    ) -> Result<Value, CodeGenError> {
        self.em.caller_save()?;
        let window = self.push_args(scope, args)?;
        self.set_arg_count(&window)?;

        match callee {
            Expr::Sym(name) => match scope.resolve(name, &self.env) {
                Resolution::Function(label) => self.em.call(&label)?,
                Resolution::RawAddr(raw) => self.em.call(&raw)?,
                Resolution::Arg(i) => {
                    self.em.load(&Operand::Arg(i), Reg::Eax)?;
                    self.em.call_reg(Reg::Eax)?;
                }
                Resolution::Local(i) => {
                    self.em.load(&Operand::LocalVar(i), Reg::Eax)?;
                    self.em.call_reg(Reg::Eax)?;
                }
                Resolution::Ivar(slot) => {
                    self.em.load(&Operand::InstanceVar(slot), Reg::Eax)?;
                    self.em.call_reg(Reg::Eax)?;
                }
                Resolution::Global(g) | Resolution::Class(g) => {
                    self.em.load(&Operand::Global(g), Reg::Eax)?;
                    self.em.call_reg(Reg::Eax)?;
                }
                Resolution::Unresolved => {
                    self.warn(format!(
                        "call to '{}' does not resolve to a known function",
                        name
                    ));
                    self.em.call(name)?;
                }
            },
            computed => {
                let v = self.compile_exp(scope, computed)?;
                self.load_eax(scope, v)?;
                self.em.call_reg(Reg::Eax)?;
            }
        }

        self.drop_window(&window)?;
        // The callee may have been through any number of sends; its self is
        // not ours.
        self.reload_self(scope)?;
        Ok(Value::subexpr(TypeHint::Unknown))
    }

    // -- method dispatch ------------------------------------------------------

    /// Parse a `(callm obj m (args) block?)` form.
    pub(crate) fn compile_callm_form(
        &mut self,
        scope: &ScopeChain,
        expr: &Expr,
        node: &Node,
        load_super: bool,
    ) -> Result<Value, CodeGenError> {
        let args = node.args();
        if args.len() < 2 {
            return Err(self.err(scope, expr, "callm needs a receiver and a method name"));
        }
        let Some(method) = args[1].as_sym() else {
            return Err(self.err(scope, expr, "callm needs a method name"));
        };
        let call_args: &[Expr] = match args.get(2) {
            Some(Expr::List(n)) => &n.items,
            Some(single) => std::slice::from_ref(single),
            None => &[],
        };
        let block = args.get(3);
        self.compile_callm(scope, &args[0], method, call_args, block, load_super)
    }

    /// Dispatch a method through the receiver's vtable.
    pub(crate) fn compile_callm(
        &mut self,
        scope: &ScopeChain,
        receiver: &Expr,
        method: &str,
        args: &[Expr],
        block: Option<&Expr>,
        load_super: bool,
    ) -> Result<Value, CodeGenError> {
        let is_self = receiver.is_sym("self");

        // An unknown method name cannot be dispatched by offset; route the
        // call through __send__ with the method symbol prepended.
        let mut method = method.to_string();
        let mut send_args: Vec<Expr>;
        let args: &[Expr] = if self.method_offset(&method).is_none() {
            self.warn(format!(
                "method '{}' is not defined anywhere; rewriting the call to __send__",
                method
            ));
            send_args = Vec::with_capacity(args.len() + 1);
            send_args.push(Expr::sym(format!(":{}", method)));
            send_args.extend_from_slice(args);
            method = "__send__".to_string();
            self.ensure_method_offset(&method);
            &send_args
        } else {
            args
        };
        let voff = format!("__voff__{}", Self::clean_label(&method));

        self.em.caller_save()?;
        let mut window = self.push_args(scope, args)?;

        // Implicit __closure__ argument: the block, or 0.
        match block {
            Some(b) => self.push_one(scope, b)?,
            None => self.em.push_op(&Operand::Int(0))?,
        }
        if window.splat {
            self.em.op1("incl", "%edi")?;
        }
        // The receiver lands at the bottom of the window.
        self.push_one(scope, receiver)?;
        if window.splat {
            self.em.op1("incl", "%edi")?;
        }
        window.fixed += 2;
        self.set_arg_count(&window)?;

        // Receiver into the self register, then through its class's vtable.
        self.em.op2("movl", "(%esp)", "%esi")?;
        self.em.op2("movl", "(%esi)", "%eax")?;
        if load_super {
            // Chase the superclass pointer in the class-object header.
            self.em.op2("movl", "12(%eax)", "%eax")?;
        }
        self.em.call_vtable(&voff, Reg::Eax)?;
        self.drop_window(&window)?;

        if !is_self {
            self.reload_self(scope)?;
        }
        Ok(Value::subexpr(TypeHint::Object))
    }

    /// `super` re-invokes the current method on `self` through the
    /// superclass's vtable.
    pub(crate) fn compile_super(
        &mut self,
        scope: &ScopeChain,
        expr: &Expr,
        node: &Node,
    ) -> Result<Value, CodeGenError> {
        let Some(method) = self.current_method.clone() else {
            return Err(self.err(scope, expr, "super outside of a method body"));
        };
        let (args, block) = split_call_tail(node);
        self.compile_callm(scope, &Expr::sym("self"), &method, args, block, true)
    }

    /// `yield` sends `call` to the implicit `__closure__` argument.
    pub(crate) fn compile_yield(
        &mut self,
        scope: &ScopeChain,
        expr: &Expr,
        node: &Node,
    ) -> Result<Value, CodeGenError> {
        if !scope.in_method() {
            return Err(self.err(scope, expr, "yield outside of a method body"));
        }
        let (args, block) = split_call_tail(node);
        self.compile_callm(scope, &Expr::sym("__closure__"), "call", args, block, false)
    }
}

/// Split `(super (args...) block?)` / `(yield (args...) block?)` tails.
fn split_call_tail(node: &Node) -> (&[Expr], Option<&Expr>) {
    let args: &[Expr] = match node.args().first() {
        Some(Expr::List(n)) => &n.items,
        Some(single) => std::slice::from_ref(single),
        None => &[],
    };
    (args, node.args().get(1))
}
