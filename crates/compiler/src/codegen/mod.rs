//! x86 (32-bit) code generation.
//!
//! This module lowers a fully-rewritten s-expression tree into AT&T-syntax
//! assembly for linking against the C runtime.  Generation is a single
//! recursive walk with a two-phase outer loop: a pre-pass assigns every
//! method name its global vtable slot, then the main pass emits the entry
//! point, drains the queued function definitions, and flushes the constant
//! tables.
//!
//! # Key concepts
//!
//! ## Values
//!
//! Every lowering routine returns a [`crate::value::Value`]: a descriptor of
//! where the result lives (immediate, register, frame slot, global, indirect
//! memory) or `SubExpr` for "the result register holds it".  The optional
//! `object` hint drives truthiness tests: object-typed conditions compare
//! against both `nil` and `false`.
//!
//! ## Method dispatch
//!
//! Method names map to globally unique vtable slots shared by all classes,
//! published as `.equ __voff__<name>` constants.  A send loads the receiver
//! into `%esi`, loads its class pointer, and calls through the slot.  Slots a
//! class never defines point at per-method thunks that splice the method
//! symbol in front of the arguments and jump to `__method_missing`.
//!
//! ## Register discipline
//!
//! The emitter caches frame-resident variables in scratch registers with at
//! most one dirty register at a time.  Every call site spills the cache
//! (`caller_save`); every `if`/`while`/`let` boundary invalidates it
//! wholesale.
//!
//! # Module structure
//!
//! - `state.rs`: the `CodeGen` struct and its error type, label cleaning,
//!   interning, counters
//! - `emitter.rs`: the assembly sink and frame helpers
//! - `regcache.rs`: the register cache state machine
//! - `expr.rs`: `compile_exp` dispatch, leaf resolution, operators,
//!   control flow, `let`, assignment, indexing
//! - `calls.rs`: argument windows, `call`/`callm`/`super`/`yield`, splat
//! - `classes.rs`: class bodies, `defun`/`defm`/`lambda`/`proc`, arity guards
//! - `vtable.rs`: the offset pre-pass, missing-method thunks, base vtable
//! - `program.rs`: the driver and final assembly

mod calls;
mod classes;
mod emitter;
mod expr;
mod program;
mod regcache;
mod state;
mod vtable;

pub use state::{CodeGen, CodeGenError};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;
    use crate::reader::read_str;

    fn compile(source: &str) -> (String, Vec<String>) {
        let tree = read_str("test.ast", source).expect("tree should read");
        let mut codegen = CodeGen::new(CompilerConfig::default());
        let asm = codegen.compile_program(&tree).expect("program should compile");
        (asm, codegen.take_warnings())
    }

    fn compile_err(source: &str) -> String {
        let tree = read_str("test.ast", source).expect("tree should read");
        let mut codegen = CodeGen::new(CompilerConfig::default());
        codegen
            .compile_program(&tree)
            .expect_err("program should fail")
            .to_string()
    }

    #[test]
    fn test_method_definition_emits_label_and_vtable_store() {
        let (asm, _) = compile("(class C Object (defm foo () (return 42)))");
        assert!(asm.contains("__method_C_foo:"));
        assert!(asm.contains("\tpushl $__method_C_foo"));
        assert!(asm.contains("\tpushl $__voff__foo"));
        assert!(asm.contains("\tcall __set_vtable"));
        assert!(asm.contains("\tmovl $42, %eax"));
    }

    #[test]
    fn test_vtable_offsets_follow_first_encounter_order() {
        let (asm, _) = compile(
            "(do (class A Object (defm x () (return 1)))
                 (class B A (defm y () (return 2)) (defm x () (return 3))))",
        );
        // Slots start past the 4-slot class header; x is seen before y.
        assert!(asm.contains("\t.equ __voff__x, 16"));
        assert!(asm.contains("\t.equ __voff__y, 20"));
        assert_eq!(asm.matches(".equ __voff__x,").count(), 1);
    }

    #[test]
    fn test_voff_constants_are_stable_across_runs() {
        let src = "(do (class A Object (defm m () (return 1)) (defm n () (return 2))))";
        let (a, _) = compile(src);
        let (b, _) = compile(src);
        assert_eq!(a, b);
    }

    #[test]
    fn test_callm_on_self_builds_the_expected_window() {
        let (asm, warnings) = compile(
            "(class C Object
               (defm bar (a b) (return 0))
               (defm go () (callm self bar (1 2))))",
        );
        assert!(warnings.is_empty(), "unexpected warnings: {:?}", warnings);
        assert!(asm.contains("\tpushl $2"));
        assert!(asm.contains("\tpushl $1"));
        assert!(asm.contains("\tpushl $0"));
        assert!(asm.contains("\tpushl %esi"));
        assert!(asm.contains("\tmovl (%esp), %esi"));
        assert!(asm.contains("\tmovl (%esi), %eax"));
        assert!(asm.contains("\tcall *__voff__bar(%eax)"));
    }

    #[test]
    fn test_super_chases_the_superclass_pointer() {
        let (asm, _) = compile(
            "(do (class A Object (defm x () (return 1)))
                 (class B A (defm x () (super))))",
        );
        assert!(asm.contains("\tmovl 12(%eax), %eax"));
        assert!(asm.contains("\tcall *__voff__x(%eax)"));
    }

    #[test]
    fn test_string_interning_shares_one_label() {
        let (asm, _) = compile(
            r#"(do (assign s "shared") (assign t "shared") (assign u "other"))"#,
        );
        assert_eq!(asm.matches(".string \"shared\"").count(), 1);
        assert_eq!(asm.matches(".string \"other\"").count(), 1);
    }

    #[test]
    fn test_top_level_assignment_promotes_to_bss() {
        let (asm, _) = compile("(assign NewConst 5)");
        assert_eq!(asm.matches("\t.comm NewConst, 4, 4").count(), 1);
        assert!(asm.contains("\tmovl %eax, NewConst"));
    }

    #[test]
    fn test_class_names_land_in_bss_once() {
        let (asm, _) = compile("(do (class A Object) (assign x A))");
        assert_eq!(asm.matches("\t.comm A, 4, 4").count(), 1);
    }

    #[test]
    fn test_class_allocation_writes_size_and_name() {
        let (asm, _) = compile("(class Point Object (defm x () (return @x)))");
        assert!(asm.contains("\tcall __new_class_object"));
        assert!(asm.contains("\tmovl %eax, Point"));
        // Own instance size: class-pointer slot plus the one ivar.
        assert!(asm.contains("\tmovl $2, 4(%eax)"));
        // Raw name bytes written into header slot 2.
        assert!(asm.contains("\tmovl $.Lstr"));
        assert!(asm.contains(".string \"Point\""));
    }

    #[test]
    fn test_free_identifier_read_is_an_implicit_self_send() {
        let (asm, warnings) = compile("(do zork 0)");
        // Unknown everywhere: the implicit send is rewritten to __send__
        // with the method symbol prepended.
        assert!(warnings.iter().any(|w| w.contains("zork")));
        assert!(asm.contains("\tcall *__voff____send__(%eax)"));
        assert!(asm.contains("\tpushl __sym_zork"));
    }

    #[test]
    fn test_free_identifier_write_promotes_without_a_call() {
        let (asm, warnings) = compile("(assign Zork 1)");
        assert!(warnings.is_empty(), "unexpected warnings: {:?}", warnings);
        assert!(asm.contains("\t.comm Zork, 4, 4"));
        assert!(!asm.contains("__send__"));
    }

    #[test]
    fn test_unknown_method_warns_and_routes_through_send() {
        let (asm, warnings) = compile("(let (obj) (callm obj nonexistent ()))");
        assert!(
            warnings
                .iter()
                .any(|w| w.contains("nonexistent") && w.contains("__send__"))
        );
        assert!(asm.contains("\tcall *__voff____send__(%eax)"));
        assert!(asm.contains("\tpushl __sym_nonexistent"));
    }

    #[test]
    fn test_and_short_circuits_the_right_operand() {
        let (asm, _) = compile("(let (p q) (and p q))");
        let branch = asm.find("je .Lif_else").expect("truthiness branch");
        let right = asm.find("-16(%ebp)").expect("right operand slot");
        assert!(
            right > branch,
            "right operand must be evaluated only on the taken path"
        );
    }

    #[test]
    fn test_or_parks_the_left_value() {
        let (asm, _) = compile("(let (a b) (or a b))");
        assert!(asm.contains("\tmovl %eax, __left"));
        assert!(asm.contains("\t.comm __left, 4, 4"));
    }

    #[test]
    fn test_object_condition_tests_nil_and_false() {
        let (asm, _) = compile(
            "(class C Object
               (defm u () (return 1))
               (defm t () (if (callm self u ()) 1 2)))",
        );
        assert!(asm.contains("\tcmpl nil, %eax"));
        assert!(asm.contains("\tcmpl false, %eax"));
        assert!(asm.contains("\t.comm nil, 4, 4"));
        assert!(asm.contains("\t.comm false, 4, 4"));
    }

    #[test]
    fn test_integer_condition_uses_a_zero_test() {
        let (asm, _) = compile("(if 1 2 3)");
        assert!(asm.contains("\ttestl %eax, %eax"));
    }

    #[test]
    fn test_arity_guards_check_both_bounds() {
        let (asm, _) = compile("(defun g (a b c (d 1) (e 2)) (return 0))");
        assert!(asm.contains("\tcmpl $3, %ebx"));
        assert!(asm.contains("\tcmpl $5, %ebx"));
        assert!(asm.contains("ArgumentError: In g"));
        assert!(asm.contains("\txorl %ecx, %ecx"));
        assert!(asm.contains("\tidivl %ecx"));
    }

    #[test]
    fn test_rest_parameter_drops_the_maximum_check() {
        let (asm, _) = compile("(defun v (a (rest_args rest)) (return 0))");
        assert!(asm.contains("\tcmpl $1, %ebx"));
        assert!(!asm.contains("\tcmpl $2, %ebx"));
    }

    #[test]
    fn test_default_values_fill_missing_arguments() {
        let (asm, _) = compile("(defun f (a b (c 9)) (return a))");
        // Slot 2 is filled only when fewer than three arguments arrived.
        assert!(asm.contains("\tcmpl $2, %ebx"));
        assert!(asm.contains("\tjg .Ldefault_done"));
        assert!(asm.contains("\tmovl $9, %eax"));
        assert!(asm.contains("\tmovl %eax, 16(%ebp)"));
    }

    #[test]
    fn test_splat_copies_through_a_runtime_loop() {
        let (asm, _) = compile("(defun f ((xs rest)) (return 0)) (call f 1 (splat xs2))");
        assert!(asm.contains("\tmovl 4(%eax), %ecx"));
        assert!(asm.contains("\tmovl 8(%eax), %edx"));
        assert!(asm.contains("\tpushl (%edx,%ecx,4)"));
        // Runtime-sized windows clean up through the preserved count.
        assert!(asm.contains("\tleal (%esp,%ebx,4), %esp"));
    }

    #[test]
    fn test_lambda_is_queued_and_drained_after_main() {
        let (asm, _) = compile("(assign f (lambda () 42))");
        let main_pos = asm.find("main:").expect("entry point");
        let lambda_pos = asm.find("__lambda_0:").expect("lambda body");
        assert!(lambda_pos > main_pos);
        assert!(asm.contains("\tmovl %eax, f"));
    }

    #[test]
    fn test_proc_saves_the_frame_pointer_and_preturn_restores_it() {
        let (asm, _) = compile(
            "(class C Object
               (defm each () (return 0))
               (defm m ()
                 (let (__env__)
                   (callm self each () (proc (__env__) (preturn 7))))))",
        );
        // Frame pointer saved into env slot 0 at block creation.
        assert!(asm.contains("\tmovl %ebp, %eax"));
        // preturn rewinds %ebp from env slot 0 and leaves through the
        // ordinary epilogue.
        assert!(asm.contains("), %ebp"));
        assert!(asm.contains("\tleave"));
    }

    #[test]
    fn test_missing_thunks_and_base_vtable() {
        let (asm, _) = compile("(class C Object (defm foo () (return 1)))");
        assert!(asm.contains("__vtable_missing_thunk_foo:"));
        assert!(asm.contains("\tjmp __method_missing"));
        assert!(asm.contains("\tincl %ebx"));
        assert!(asm.contains("__base_vtable:"));
        assert!(asm.contains("\t.long __vtable_missing_thunk_foo"));
        // Four header slots ahead of the method slots.
        let table = &asm[asm.find("__base_vtable:").unwrap()..];
        assert!(table.contains("\t.long 0\n\t.long 0\n\t.long 0\n\t.long 0\n"));
    }

    #[test]
    fn test_symbol_literals_share_one_cell() {
        let (asm, _) = compile("(do (assign a :size) (assign b :size))");
        assert_eq!(asm.matches("\t.comm __sym_size, 4, 4").count(), 1);
        assert!(asm.contains("\tcall __get_string"));
        assert!(asm.contains("\tcall __get_symbol"));
    }

    #[test]
    fn test_index_works_as_an_assignment_target() {
        let (asm, _) = compile("(let (a) (assign (index a 2) 5))");
        assert!(asm.contains("\taddl $8, %ecx"));
        assert!(asm.contains("\tmovl %eax, (%ecx)"));
    }

    #[test]
    fn test_bindex_uses_byte_memory() {
        let (asm, _) = compile("(let (a) (assign (bindex a 1) 65))");
        assert!(asm.contains("\tmovb %al, (%ecx)"));
    }

    #[test]
    fn test_while_emits_a_backward_branch() {
        let (asm, _) = compile("(let (n) (while n (assign n 0)))");
        let loop_label = asm.find(".Lwhile_").expect("loop label");
        let back_jump = asm.rfind("\tjmp .Lwhile_").expect("backward jump");
        assert!(back_jump > loop_label);
    }

    #[test]
    fn test_operator_send_uses_the_cleaned_label() {
        let (asm, warnings) = compile(
            "(class C Object (defm << (x) (return x)) (defm go (v) (<< self v)))",
        );
        assert!(warnings.is_empty(), "unexpected warnings: {:?}", warnings);
        assert!(asm.contains("\t.equ __voff____shiftleft, 16"));
        assert!(asm.contains("\tcall *__voff____shiftleft(%eax)"));
        assert!(asm.contains("__method_C___shiftleft:"));
    }

    #[test]
    fn test_case_rewrites_to_threeway_sends() {
        let (asm, warnings) = compile(
            "(class C Object
               (defm === (o) (return 1))
               (defm pick (v)
                 (case v
                   (when 1 (return 10))
                   (else (return 20)))))",
        );
        assert!(warnings.is_empty(), "unexpected warnings: {:?}", warnings);
        assert!(asm.contains("\tcall *__voff____eqq(%eax)"));
    }

    #[test]
    fn test_hash_literal_builds_and_fills() {
        let (asm, warnings) = compile(
            "(class Hash Object
               (defm new () (return self))
               (defm []= (k v) (return v)))
             (hash (pair 1 2))",
        );
        assert!(warnings.is_empty(), "unexpected warnings: {:?}", warnings);
        assert!(asm.contains("\tcall *__voff__new(%eax)"));
        assert!(asm.contains("\tcall *__voff____NDXassign(%eax)"));
    }

    #[test]
    fn test_malformed_hash_entry_is_fatal() {
        let err = compile_err("(hash 5)");
        assert!(err.contains("malformed hash literal"));
        assert!(err.contains("test.ast"));
    }

    #[test]
    fn test_unresolvable_deref_is_fatal() {
        let err = compile_err("(deref NotAClass thing)");
        assert!(err.contains("unresolvable static dereference"));
    }

    #[test]
    fn test_deref_resolves_class_constants() {
        let (asm, _) = compile("(do (class A Object) (assign x (deref A WIDTH)))");
        assert!(asm.contains("\t.comm A__WIDTH, 4, 4"));
    }

    #[test]
    fn test_float_literals_truncate_with_a_warning() {
        let (asm, warnings) = compile("(assign x 3.7)");
        assert!(warnings.iter().any(|w| w.contains("truncated")));
        assert!(asm.contains("\tmovl $3, %eax"));
    }

    #[test]
    fn test_rescue_warns_and_compiles_the_body() {
        let (asm, warnings) = compile("(rescue (assign x 1))");
        assert!(warnings.iter().any(|w| w.contains("rescue")));
        assert!(asm.contains("\tmovl %eax, x"));
    }

    #[test]
    fn test_sexp_scope_resolves_raw_names() {
        let (asm, warnings) = compile(r#"(sexp (call __runtime_probe 1))"#);
        assert!(warnings.is_empty(), "unexpected warnings: {:?}", warnings);
        assert!(asm.contains("\tcall __runtime_probe"));
    }

    #[test]
    fn test_every_required_runtime_symbol_is_declared() {
        let (asm, _) = compile("(class C Object (defm m () (return :tag)))");
        for sym in [
            "__get_symbol",
            "__get_string",
            "__new_class_object",
            "__set_vtable",
            "__method_missing",
            "printf",
        ] {
            assert!(
                asm.contains(&format!("\t.extern {}", sym)),
                "missing extern for {}",
                sym
            );
        }
    }

    #[test]
    fn test_identical_trees_produce_identical_assembly() {
        let src = r#"
            (do (class A Object (defm run () (callm self step (1 "x"))))
                (class B A (defm step (n s) (return n)))
                (assign Main 0))
        "#;
        let (a, _) = compile(src);
        let (b, _) = compile(src);
        assert_eq!(a, b);
    }

    #[test]
    fn test_debug_info_annotates_source_positions() {
        let tree = read_str("demo.ast", "(do\n  (assign x 5))").unwrap();
        let mut codegen = CodeGen::new(CompilerConfig::new().with_debug_info(true));
        let asm = codegen.compile_program(&tree).unwrap();
        assert!(asm.contains("# demo.ast:2"));
    }
}
