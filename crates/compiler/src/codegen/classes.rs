//! Class bodies and function definition.
//!
//! `class` emits the class-object allocation and vtable population inline
//! (class setup runs inside the entry point); `defun`/`defm`/`lambda`/`proc`
//! only queue function records, which the driver drains after `main`.

use super::{CodeGen, CodeGenError};
use crate::ast::{Expr, Node};
use crate::function::{Function, FunctionKind, Param};
use crate::scope::{
    CLASS_SLOT_INSTANCE_SIZE, CLASS_SLOT_NAME, ClassInfo, Frame, OBJECT_IVAR_BASE, Resolution,
    ScopeChain,
};
use crate::value::{Operand, Reg, Value};

impl CodeGen {
    // -- class definition -----------------------------------------------------

    /// `(class Name Super body...)`: allocate the class object, write its
    /// instance size and raw name, then lower the body in class scope.
    /// `module` is aliased here as well.
    pub(crate) fn compile_class(
        &mut self,
        scope: &ScopeChain,
        node: &Node,
    ) -> Result<Value, CodeGenError> {
        let args = node.args();
        let Some(name) = args.first().and_then(Expr::as_sym) else {
            return Err(self.err(scope, &Expr::List(node.clone()), "class needs a name"));
        };
        let name = name.to_string();
        let superclass = args
            .get(1)
            .and_then(Expr::as_sym)
            .filter(|s| *s != "nil")
            .map(str::to_string);
        let body = &args[2..];

        // Bootstrapping: Class and Kernel are laid out before any superclass
        // object exists, so their inherited size cannot be looked up.
        let ivar_base = if name == "Class" || name == "Kernel" {
            OBJECT_IVAR_BASE
        } else if let Some(sup) = &superclass {
            // A superclass compiled later (or provided by the runtime)
            // contributes no inherited slots at this point.
            self.env
                .classes
                .get(sup)
                .map(ClassInfo::instance_size)
                .unwrap_or(OBJECT_IVAR_BASE)
        } else {
            OBJECT_IVAR_BASE
        };

        if !self.env.classes.contains_key(&name) {
            self.env.classes.insert(
                name.clone(),
                ClassInfo::new(name.clone(), superclass.clone(), ivar_base),
            );
        }

        // Register every instance variable the body will touch (method
        // bodies included) so slots are final before any code is emitted.
        let mut ivars = Vec::new();
        for e in body {
            scan_ivars(e, &mut ivars);
        }
        if let Some(info) = self.env.classes.get_mut(&name) {
            for iv in &ivars {
                info.add_ivar(iv);
            }
        }

        self.env.add_global(&name);
        let klass_size = self.vtable_size();
        let inherited = match self.env.classes.get(&name) {
            Some(info) => info.ivar_base,
            None => OBJECT_IVAR_BASE,
        };

        // Name = __new_class_object(klass_size, Super, ssize)
        self.em.caller_save()?;
        self.em.push_op(&Operand::Int(inherited as i64))?;
        match &superclass {
            Some(sup) => {
                self.env.add_global(sup);
                self.em.push_op(&Operand::Global(sup.clone()))?;
            }
            None => self.em.push_op(&Operand::Int(0))?,
        }
        self.em.push_op(&Operand::Int(klass_size as i64))?;
        self.em.load(&Operand::Int(3), Reg::Ebx)?;
        self.em.call("__new_class_object")?;
        self.em.add_esp(12)?;
        self.em.store(Reg::Eax, &Operand::Global(name.clone()))?;

        // Instance size and raw name into the header.  The name is raw bytes
        // because String may not be initialised this early.
        let own_size = self
            .env
            .classes
            .get(&name)
            .map(ClassInfo::instance_size)
            .unwrap_or(OBJECT_IVAR_BASE);
        self.em.op2(
            "movl",
            &format!("${}", own_size),
            &format!("{}(%eax)", CLASS_SLOT_INSTANCE_SIZE * 4),
        )?;
        let name_label = self.intern_string(&name);
        self.em.op2(
            "movl",
            &format!("${}", name_label),
            &format!("{}(%eax)", CLASS_SLOT_NAME * 4),
        )?;

        let inner = scope.child(Frame::Class { name: name.clone() });
        for e in body {
            let v = self.compile_exp(&inner, e)?;
            let v = self.touch(&inner, v)?;
            self.discard_value(&v);
        }
        Ok(Value::object(Operand::Global(name)))
    }

    // -- function definition --------------------------------------------------

    /// `(defun name (params) body...)`: queue a global function.
    pub(crate) fn compile_defun(
        &mut self,
        scope: &ScopeChain,
        node: &Node,
    ) -> Result<Value, CodeGenError> {
        let args = node.args();
        let Some(name) = args.first().and_then(Expr::as_sym) else {
            return Err(self.err(scope, &Expr::List(node.clone()), "defun needs a name"));
        };
        let label = Self::clean_label(name);
        let params = self.parse_params(scope, node, args.get(1))?;
        self.env.functions.insert(name.to_string(), label.clone());
        self.functions.push(Function {
            label: label.clone(),
            name: name.to_string(),
            kind: FunctionKind::Function,
            params,
            body: args[2..].to_vec(),
            scope: scope.clone(),
        });
        Ok(Value::new(Operand::Addr(label)))
    }

    /// `(defm name (params) body...)`: queue a method and write its vtable
    /// slot on the class object being defined.
    pub(crate) fn compile_defm(
        &mut self,
        scope: &ScopeChain,
        node: &Node,
    ) -> Result<Value, CodeGenError> {
        let args = node.args();
        let Some(name) = args.first().and_then(Expr::as_sym) else {
            return Err(self.err(scope, &Expr::List(node.clone()), "defm needs a name"));
        };
        let Some(class) = scope.enclosing_class().map(str::to_string) else {
            return Err(self.err(
                scope,
                &Expr::List(node.clone()),
                "defm outside of a class body",
            ));
        };
        let clean = Self::clean_label(name);
        let label = format!("__method_{}_{}", class, clean);

        // The receiver is pushed last, so `self` is the slot at the bottom
        // of the window and `__closure__` sits just above it.
        let mut params = vec![Param::required("self"), Param::required("__closure__")];
        params.extend(self.parse_params(scope, node, args.get(1))?);
        self.functions.push(Function {
            label: label.clone(),
            name: name.to_string(),
            kind: FunctionKind::Method,
            params,
            body: args[2..].to_vec(),
            scope: scope.clone(),
        });
        if let Some(info) = self.env.classes.get_mut(&class) {
            info.vtable.push((name.to_string(), label.clone()));
        }
        self.ensure_method_offset(name);

        // __set_vtable(Class, offset, label) at class-definition time.
        let voff = format!("__voff__{}", clean);
        self.em.caller_save()?;
        self.em.push_op(&Operand::Addr(label.clone()))?;
        self.em.push_op(&Operand::Addr(voff))?;
        self.em.push_op(&Operand::Global(class))?;
        self.em.load(&Operand::Int(3), Reg::Ebx)?;
        self.em.call("__set_vtable")?;
        self.em.add_esp(12)?;

        Ok(Value::new(Operand::Addr(label)))
    }

    /// `lambda` and `proc` are function definitions with a generated label
    /// and the implicit `self`/`__closure__` formals; the body is wrapped in
    /// an empty `let` to establish a scope.
    pub(crate) fn compile_lambda_like(
        &mut self,
        scope: &ScopeChain,
        node: &Node,
        kind: FunctionKind,
    ) -> Result<Value, CodeGenError> {
        let args = node.args();
        let label = self.fresh_lambda_label();

        let mut params = vec![Param::required("self"), Param::required("__closure__")];
        params.extend(self.parse_params(scope, node, args.first())?);

        let mut let_form = vec![Expr::sym("let"), Expr::list(vec![])];
        if !args.is_empty() {
            let_form.extend_from_slice(&args[1..]);
        }
        self.functions.push(Function {
            label: label.clone(),
            name: label.clone(),
            kind,
            params,
            body: vec![Expr::list(let_form)],
            scope: scope.clone(),
        });

        // A proc can return through the frame that created it; save that
        // frame pointer into slot 0 of the environment now.
        if kind == FunctionKind::Proc
            && scope.resolve("__env__", &self.env) != Resolution::Unresolved
        {
            let save = Expr::list(vec![
                Expr::sym("assign"),
                Expr::list(vec![Expr::sym("index"), Expr::sym("__env__"), Expr::Int(0)]),
                Expr::list(vec![Expr::sym("stackframe")]),
            ]);
            let v = self.compile_exp(scope, &save)?;
            self.discard_value(&v);
        }

        Ok(Value::new(Operand::Addr(label)))
    }

    /// Parse a formal-parameter list: a bare name, `(name default)`, or
    /// `(name rest)`.
    fn parse_params(
        &self,
        scope: &ScopeChain,
        node: &Node,
        entries: Option<&Expr>,
    ) -> Result<Vec<Param>, CodeGenError> {
        let Some(entries) = entries else {
            return Ok(Vec::new());
        };
        let Some(list) = entries.as_list() else {
            return Err(self.err(scope, &Expr::List(node.clone()), "malformed parameter list"));
        };
        let mut params = Vec::new();
        for entry in &list.items {
            match entry {
                Expr::Sym(name) => params.push(Param::required(name.clone())),
                Expr::List(detail) => {
                    let Some(name) = detail.items.first().and_then(Expr::as_sym) else {
                        return Err(self.err(scope, entry, "malformed parameter list"));
                    };
                    if detail.items.len() == 2 && detail.items[1].is_sym("rest") {
                        params.push(Param {
                            name: name.to_string(),
                            default: None,
                            rest: true,
                        });
                    } else if detail.items.len() == 2 {
                        params.push(Param {
                            name: name.to_string(),
                            default: Some(detail.items[1].clone()),
                            rest: false,
                        });
                    } else {
                        return Err(self.err(scope, entry, "malformed parameter list"));
                    }
                }
                other => return Err(self.err(scope, other, "malformed parameter list")),
            }
        }
        Ok(params)
    }

    // -- deferred emission ----------------------------------------------------

    /// Emit one queued function: arity guards, default fill-in, body.
    pub(crate) fn emit_function(&mut self, f: &Function) -> Result<(), CodeGenError> {
        self.current_method = match f.kind {
            FunctionKind::Method => Some(f.name.clone()),
            _ => None,
        };
        self.em.func_begin(&f.label, false)?;

        // Runtime arity checks against the count register.
        let min = f.minargs();
        let ok_min = self.em.fresh_label("arity_min_ok");
        self.em.op2("cmpl", &format!("${}", min), "%ebx")?;
        self.em.jcc("ge", &ok_min)?;
        self.emit_arity_abort(&f.name, "a minimum", min)?;
        self.em.label(&ok_min)?;
        if !f.has_rest() {
            let max = f.maxargs();
            let ok_max = self.em.fresh_label("arity_max_ok");
            self.em.op2("cmpl", &format!("${}", max), "%ebx")?;
            self.em.jcc("le", &ok_max)?;
            self.emit_arity_abort(&f.name, "a maximum", max)?;
            self.em.label(&ok_max)?;
        }

        let fscope = f.scope.child(Frame::Func {
            params: f.param_names(),
            is_method: f.kind != FunctionKind::Function,
        });

        // Fill in defaults the caller did not supply.
        for (i, p) in f.params.iter().enumerate() {
            let Some(default) = &p.default else { continue };
            let skip = self.em.fresh_label("default_done");
            self.em.op2("cmpl", &format!("${}", i), "%ebx")?;
            self.em.jcc("g", &skip)?;
            let v = self.compile_exp(&fscope, default)?;
            self.load_eax(&fscope, v)?;
            self.em.store(Reg::Eax, &Operand::Arg(i))?;
            self.em.evict_all()?;
            self.em.label(&skip)?;
        }

        let v = self.compile_do_list(&fscope, &f.body)?;
        self.load_eax(&fscope, v)?;
        self.em.evict_all()?;
        self.em.epilogue()?;
        self.current_method = None;
        Ok(())
    }

    /// Print an ArgumentError and abort with a deliberate divide by zero.
    fn emit_arity_abort(&mut self, name: &str, bound: &str, n: usize) -> Result<(), CodeGenError> {
        let fmt = format!(
            "ArgumentError: In {}: expected {} of {} arguments, got %d\n",
            name, bound, n
        );
        let label = self.intern_string(&fmt);
        self.em.op1("pushl", "%ebx")?;
        self.em.push_op(&Operand::Addr(label))?;
        self.em.call("printf")?;
        self.em.add_esp(8)?;
        self.em.op2("xorl", "%ecx", "%ecx")?;
        self.em.op1("idivl", "%ecx")?;
        Ok(())
    }
}

/// Collect every `@ivar` referenced below an expression, in encounter order.
fn scan_ivars(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Sym(s) => {
            if let Some(iv) = s.strip_prefix('@')
                && !iv.is_empty()
                && !iv.starts_with('@')
                && !out.iter().any(|known| known == iv)
            {
                out.push(iv.to_string());
            }
        }
        Expr::List(node) => {
            for item in &node.items {
                scan_ivars(item, out);
            }
        }
        _ => {}
    }
}
