//! Lexical scopes and the whole-program environment.
//!
//! Name lookup walks a chain of frames innermost-to-outermost; the first
//! frame that owns a name wins.  Class scopes live in an arena keyed by class
//! name with every cross-reference expressed as a name or a slot index, so no
//! class owns a pointer to another.

use std::collections::{HashMap, HashSet};

/// Object header: slot 0 of every object is its class pointer, so instance
/// variables start at slot 1.
pub const OBJECT_IVAR_BASE: usize = 1;

/// Class objects carry a fixed header ahead of the method slots:
/// class pointer, instance size, raw name, superclass.
pub const CLASS_SLOT_INSTANCE_SIZE: usize = 1;
pub const CLASS_SLOT_NAME: usize = 2;
pub const CLASS_SLOT_SUPER: usize = 3;
pub const VTABLE_HEADER_SLOTS: usize = 4;

/// Per-class compilation state.
#[derive(Debug, Clone)]
pub struct ClassInfo {
    pub name: String,
    pub superclass: Option<String>,
    /// First free instance slot: the inherited instance size in slots.
    pub ivar_base: usize,
    /// Own instance variables, offsets assigned in first-reference order.
    pub ivars: Vec<String>,
    /// Methods defined on this class: (method name, emitted label).
    pub vtable: Vec<(String, String)>,
}

impl ClassInfo {
    pub fn new(name: impl Into<String>, superclass: Option<String>, ivar_base: usize) -> Self {
        ClassInfo {
            name: name.into(),
            superclass,
            ivar_base,
            ivars: Vec::new(),
            vtable: Vec::new(),
        }
    }

    /// Total instance size in slots, including the header and inherited vars.
    pub fn instance_size(&self) -> usize {
        self.ivar_base + self.ivars.len()
    }

    /// Absolute slot of an instance variable, if registered.
    pub fn ivar_slot(&self, name: &str) -> Option<usize> {
        self.ivars
            .iter()
            .position(|iv| iv == name)
            .map(|i| self.ivar_base + i)
    }

    /// Register an instance variable, returning its absolute slot.
    pub fn add_ivar(&mut self, name: &str) -> usize {
        if let Some(slot) = self.ivar_slot(name) {
            return slot;
        }
        self.ivars.push(name.to_string());
        self.ivar_base + self.ivars.len() - 1
    }
}

/// Whole-program registries: classes, global constants, global functions.
#[derive(Debug, Default)]
pub struct GlobalEnv {
    pub classes: HashMap<String, ClassInfo>,
    /// BSS globals in registration order (emission order must be stable).
    globals: Vec<String>,
    global_set: HashSet<String>,
    /// Global function name -> emitted label.
    pub functions: HashMap<String, String>,
}

impl GlobalEnv {
    pub fn new() -> Self {
        GlobalEnv::default()
    }

    /// Register a global constant; returns false if it already existed.
    pub fn add_global(&mut self, name: &str) -> bool {
        if self.global_set.contains(name) {
            return false;
        }
        self.global_set.insert(name.to_string());
        self.globals.push(name.to_string());
        true
    }

    pub fn has_global(&self, name: &str) -> bool {
        self.global_set.contains(name)
    }

    pub fn globals(&self) -> &[String] {
        &self.globals
    }
}

/// One frame of the lexical chain.
#[derive(Debug, Clone)]
pub enum Frame {
    /// A class body; the class itself lives in [`GlobalEnv::classes`].
    Class { name: String },
    /// A function or method body owning the formal argument positions.
    Func {
        params: Vec<String>,
        is_method: bool,
    },
    /// A flat block of let-bound locals with consecutive indices.
    Local { names: Vec<String>, base: usize },
    /// Transparent pass-through that suppresses identifier rewrites.
    Sexp,
}

/// What a name resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Arg(usize),
    Local(usize),
    /// Absolute instance slot of `self`.
    Ivar(usize),
    Global(String),
    Class(String),
    Function(String),
    /// Inside a `sexp` scope: a raw assembler-level address.
    RawAddr(String),
    Unresolved,
}

/// The lexical chain for the expression currently being lowered.  Cheap to
/// clone: function records capture their defining chain for deferred
/// emission.
#[derive(Debug, Clone, Default)]
pub struct ScopeChain {
    frames: Vec<Frame>,
}

impl ScopeChain {
    /// The outermost (top-level) scope.
    pub fn global() -> Self {
        ScopeChain { frames: Vec::new() }
    }

    /// A child chain extended with one more frame.
    pub fn child(&self, frame: Frame) -> Self {
        let mut frames = self.frames.clone();
        frames.push(frame);
        ScopeChain { frames }
    }

    /// Resolve a plain name through the chain, then the global registries.
    pub fn resolve(&self, name: &str, env: &GlobalEnv) -> Resolution {
        for frame in self.frames.iter().rev() {
            match frame {
                Frame::Local { names, base } => {
                    if let Some(i) = names.iter().position(|n| n == name) {
                        return Resolution::Local(base + i);
                    }
                }
                Frame::Func { params, .. } => {
                    if let Some(i) = params.iter().position(|p| p == name) {
                        return Resolution::Arg(i);
                    }
                }
                Frame::Class { .. } | Frame::Sexp => {}
            }
        }
        if let Some(label) = env.functions.get(name) {
            return Resolution::Function(label.clone());
        }
        if env.classes.contains_key(name) {
            return Resolution::Class(name.to_string());
        }
        if env.has_global(name) {
            return Resolution::Global(name.to_string());
        }
        if self.in_sexp() {
            return Resolution::RawAddr(name.to_string());
        }
        Resolution::Unresolved
    }

    /// Resolve `@name` against the enclosing class scope.
    pub fn resolve_ivar(&self, name: &str, env: &GlobalEnv) -> Option<usize> {
        let class = self.enclosing_class()?;
        env.classes.get(class)?.ivar_slot(name)
    }

    /// Name of the innermost class frame, if any.
    pub fn enclosing_class(&self) -> Option<&str> {
        self.frames.iter().rev().find_map(|f| match f {
            Frame::Class { name } => Some(name.as_str()),
            _ => None,
        })
    }

    /// True when the innermost function frame is a method body.
    pub fn in_method(&self) -> bool {
        self.frames
            .iter()
            .rev()
            .find_map(|f| match f {
                Frame::Func { is_method, .. } => Some(*is_method),
                _ => None,
            })
            .unwrap_or(false)
    }

    pub fn in_sexp(&self) -> bool {
        self.frames.iter().any(|f| matches!(f, Frame::Sexp))
    }

    /// Number of let-bound locals already allocated below this chain; the
    /// base index for the next local frame.
    pub fn local_base(&self) -> usize {
        self.frames
            .iter()
            .map(|f| match f {
                Frame::Local { names, .. } => names.len(),
                _ => 0,
            })
            .sum()
    }

    /// Human-readable description for diagnostics.
    pub fn describe(&self) -> String {
        if self.frames.is_empty() {
            return "top level".to_string();
        }
        let parts: Vec<String> = self
            .frames
            .iter()
            .map(|f| match f {
                Frame::Class { name } => format!("class {}", name),
                Frame::Func { is_method: true, .. } => "method body".to_string(),
                Frame::Func { is_method: false, .. } => "function body".to_string(),
                Frame::Local { names, .. } => format!("let ({})", names.join(" ")),
                Frame::Sexp => "sexp".to_string(),
            })
            .collect();
        parts.join(" > ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_innermost_frame_wins() {
        let env = GlobalEnv::new();
        let chain = ScopeChain::global()
            .child(Frame::Func {
                params: vec!["x".into()],
                is_method: false,
            })
            .child(Frame::Local {
                names: vec!["x".into()],
                base: 0,
            });
        assert_eq!(chain.resolve("x", &env), Resolution::Local(0));
    }

    #[test]
    fn test_let_indices_stack_up() {
        let env = GlobalEnv::new();
        let outer = ScopeChain::global().child(Frame::Local {
            names: vec!["a".into(), "b".into()],
            base: 0,
        });
        let inner = outer.child(Frame::Local {
            names: vec!["c".into()],
            base: outer.local_base(),
        });
        assert_eq!(inner.resolve("c", &env), Resolution::Local(2));
        assert_eq!(inner.resolve("a", &env), Resolution::Local(0));
    }

    #[test]
    fn test_unresolved_vs_sexp_raw_addr() {
        let env = GlobalEnv::new();
        let chain = ScopeChain::global();
        assert_eq!(chain.resolve("mystery", &env), Resolution::Unresolved);
        let raw = chain.child(Frame::Sexp);
        assert_eq!(
            raw.resolve("__get_string", &env),
            Resolution::RawAddr("__get_string".to_string())
        );
    }

    #[test]
    fn test_globals_resolve_after_frames() {
        let mut env = GlobalEnv::new();
        env.add_global("Answer");
        let chain = ScopeChain::global();
        assert_eq!(
            chain.resolve("Answer", &env),
            Resolution::Global("Answer".to_string())
        );
    }

    #[test]
    fn test_ivar_slots_inherit_base() {
        let mut env = GlobalEnv::new();
        let mut info = ClassInfo::new("Point", Some("Object".into()), 3);
        info.add_ivar("x");
        info.add_ivar("y");
        assert_eq!(info.instance_size(), 5);
        env.classes.insert("Point".to_string(), info);

        let chain = ScopeChain::global().child(Frame::Class {
            name: "Point".to_string(),
        });
        assert_eq!(chain.resolve_ivar("y", &env), Some(4));
    }

    #[test]
    fn test_add_global_deduplicates() {
        let mut env = GlobalEnv::new();
        assert!(env.add_global("C"));
        assert!(!env.add_global("C"));
        assert_eq!(env.globals(), &["C".to_string()]);
    }
}
