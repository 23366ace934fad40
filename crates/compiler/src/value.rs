//! Lowered operand descriptors.
//!
//! Every lowering function returns a [`Value`]: where the computed result
//! currently lives, plus an optional semantic type hint.  A value either
//! names a concrete residence (immediate, register, frame slot, global) or is
//! `SubExpr`, meaning the conventional result register holds it now.

use std::fmt;

/// 32-bit x86 registers the generated code uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    Eax,
    Ebx,
    Ecx,
    Edx,
    Esi,
    Edi,
    Ebp,
    Esp,
}

impl Reg {
    pub fn name(self) -> &'static str {
        match self {
            Reg::Eax => "eax",
            Reg::Ebx => "ebx",
            Reg::Ecx => "ecx",
            Reg::Edx => "edx",
            Reg::Esi => "esi",
            Reg::Edi => "edi",
            Reg::Ebp => "ebp",
            Reg::Esp => "esp",
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.name())
    }
}

/// Where a lowered value lives.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Immediate integer literal.
    Int(i64),
    /// Absolute address of a label (function, string constant).
    Addr(String),
    /// Value currently held in a machine register.
    Reg(Reg),
    /// Local slot `k` of the current frame.
    LocalVar(usize),
    /// Argument slot `k` of the current frame.
    Arg(usize),
    /// Instance slot `k` of `self`.
    InstanceVar(usize),
    /// A named BSS long, accessed directly.
    Global(String),
    /// 32-bit memory through a register.
    Indirect(Reg),
    /// 8-bit memory through a register.
    Indirect8(Reg),
    /// A resolution-ambiguous bare identifier: an implicit self-send on read,
    /// a new global constant on write.
    PossibleSend(String),
    /// The result register holds it now.
    SubExpr,
}

/// Semantic type hint carried alongside an operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeHint {
    /// A runtime object pointer; truthiness must test both `nil` and `false`.
    Object,
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    pub op: Operand,
    pub hint: TypeHint,
}

impl Value {
    pub fn new(op: Operand) -> Self {
        Value {
            op,
            hint: TypeHint::Unknown,
        }
    }

    pub fn object(op: Operand) -> Self {
        Value {
            op,
            hint: TypeHint::Object,
        }
    }

    pub fn with_hint(op: Operand, hint: TypeHint) -> Self {
        Value { op, hint }
    }

    /// A result sitting in the result register.
    pub fn subexpr(hint: TypeHint) -> Self {
        Value {
            op: Operand::SubExpr,
            hint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reg_display() {
        assert_eq!(Reg::Eax.to_string(), "%eax");
        assert_eq!(Reg::Esi.to_string(), "%esi");
    }

    #[test]
    fn test_value_hints() {
        assert_eq!(Value::new(Operand::Int(3)).hint, TypeHint::Unknown);
        assert_eq!(Value::object(Operand::Reg(Reg::Esi)).hint, TypeHint::Object);
    }
}
