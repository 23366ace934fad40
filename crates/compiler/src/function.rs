//! Function records.
//!
//! Definitions are queued at the point they are encountered and emitted after
//! `main`; a record carries everything the drain pass needs: the formals
//! (with defaults and the rest flag), the body, and the defining scope chain.

use crate::ast::Expr;
use crate::scope::ScopeChain;

/// A formal parameter.
#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    /// Default-value expression, applied when the runtime count is short.
    pub default: Option<Expr>,
    /// Trailing variable-size argument; disables the maximum-arity check.
    pub rest: bool,
}

impl Param {
    pub fn required(name: impl Into<String>) -> Self {
        Param {
            name: name.into(),
            default: None,
            rest: false,
        }
    }
}

/// What kind of callable this record describes; only procs may return
/// through the frame of the method that created them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Function,
    Method,
    Lambda,
    Proc,
}

/// A queued function definition awaiting emission.
#[derive(Debug, Clone)]
pub struct Function {
    /// The emitted label.
    pub label: String,
    /// Source-level name, for diagnostics and arity errors.
    pub name: String,
    pub kind: FunctionKind,
    pub params: Vec<Param>,
    pub body: Vec<Expr>,
    /// The scope chain in effect at the definition site.
    pub scope: ScopeChain,
}

impl Function {
    /// Minimum runtime argument count: every formal without a default,
    /// excluding the rest parameter.
    pub fn minargs(&self) -> usize {
        self.params
            .iter()
            .filter(|p| p.default.is_none() && !p.rest)
            .count()
    }

    /// Maximum runtime argument count, meaningless when a rest parameter is
    /// present.
    pub fn maxargs(&self) -> usize {
        self.params.len()
    }

    pub fn has_rest(&self) -> bool {
        self.params.iter().any(|p| p.rest)
    }

    pub fn param_names(&self) -> Vec<String> {
        self.params.iter().map(|p| p.name.clone()).collect()
    }
}
