//! The C-runtime symbols the generated assembly links against.
//!
//! Everything the code generator can reference from the runtime is listed in
//! one data-driven table; the driver emits an `.extern` block from it so the
//! generated file documents its link-time surface in a single place.

use std::fmt::Write as _;
use std::sync::LazyLock;

/// An external runtime symbol referenced by generated code.
pub struct RuntimeSym {
    pub name: &'static str,
    /// Optional category comment emitted ahead of the declaration.
    pub category: Option<&'static str>,
}

/// All required runtime symbols, in emission order.
pub static RUNTIME_SYMBOLS: LazyLock<Vec<RuntimeSym>> = LazyLock::new(|| {
    vec![
        RuntimeSym {
            name: "__get_string",
            category: Some("# Runtime symbols"),
        },
        RuntimeSym {
            name: "__get_symbol",
            category: None,
        },
        RuntimeSym {
            name: "__new_class_object",
            category: None,
        },
        RuntimeSym {
            name: "__set_vtable",
            category: None,
        },
        RuntimeSym {
            name: "__method_missing",
            category: None,
        },
        RuntimeSym {
            name: "printf",
            category: None,
        },
    ]
});

/// Emit the `.extern` block for every runtime symbol.
pub fn emit_extern_decls(out: &mut String) -> Result<(), std::fmt::Error> {
    for sym in RUNTIME_SYMBOLS.iter() {
        if let Some(category) = sym.category {
            writeln!(out, "{}", category)?;
        }
        writeln!(out, "\t.extern {}", sym.name)?;
    }
    writeln!(out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_required_symbol_is_listed() {
        let names: Vec<&str> = RUNTIME_SYMBOLS.iter().map(|s| s.name).collect();
        for required in [
            "__get_symbol",
            "__get_string",
            "__new_class_object",
            "__set_vtable",
            "__method_missing",
            "printf",
        ] {
            assert!(names.contains(&required), "missing {}", required);
        }
    }

    #[test]
    fn test_extern_block_shape() {
        let mut out = String::new();
        emit_extern_decls(&mut out).unwrap();
        assert!(out.starts_with("# Runtime symbols"));
        assert!(out.contains("\t.extern __method_missing\n"));
    }
}
