//! Backend B: lowering the AST to C against the fixed runtime ABI.
//!
//! The pipeline is closure analysis ([`closure`]), then a single code
//! generation pass ([`codegen`]) that consults the type/unboxing tables
//! from [`crate::analyze`]. Errors accumulate with source-line context; a
//! unit that recorded any error produces no C at all.

mod abi;
mod closure;
mod codegen;
mod mangle;

use std::fmt;

use crate::{analyze::Analysis, parser::Program};

/// One compiler error with source-line context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub message: String,
    pub line: u32,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

/// All errors recorded while compiling one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileErrors(pub Vec<CompileError>);

impl CompileErrors {
    #[must_use]
    pub fn count(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "error: {err}")?;
        }
        Ok(())
    }
}

/// Compiles a parsed (and usually optimized) program to a C translation
/// unit. Returns the accumulated errors instead when any were recorded;
/// a C file known to be malformed is never produced.
pub fn compile_to_c(program: &Program, analysis: &Analysis) -> Result<String, CompileErrors> {
    let closures = closure::analyze_closures(program);
    let mut generator = codegen::CodeGen::new(program, analysis, &closures);
    let output = generator.emit_program();
    if generator.errors.is_empty() {
        Ok(output)
    } else {
        Err(CompileErrors(generator.errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{analyze::analyze_program, optimize::optimize_program, parser::parse};

    fn compile(source: &str) -> Result<String, CompileErrors> {
        let result = parse(source, "test.hml");
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        let mut program = result.program;
        optimize_program(&mut program);
        let analysis = analyze_program(&program);
        compile_to_c(&program, &analysis)
    }

    fn compile_ok(source: &str) -> String {
        compile(source).expect("expected successful compile")
    }

    #[test]
    fn emits_runtime_include_and_main() {
        let c = compile_ok("print(40 + 2);");
        assert!(c.starts_with("#include \"hemlock_runtime.h\""));
        assert!(c.contains("int main(void)"));
        assert!(c.contains("hml_rt_init();"));
        assert!(c.contains("hml_builtin_call(HML_BUILTIN_PRINT"));
    }

    #[test]
    fn every_call_is_followed_by_an_exception_check() {
        let c = compile_ok("fn f() { return 1; } f();");
        let calls = c.matches("hml_call(").count();
        assert!(calls >= 1);
        // At least one pending-check per call site.
        assert!(c.matches("if (hml_exc_pending()) goto").count() >= calls);
    }

    #[test]
    fn tail_recursive_function_lowers_to_a_loop() {
        let c = compile_ok(
            "fn fact(n, acc) { if (n <= 1) { return acc; } return fact(n - 1, acc * n); } print(fact(10, 1));",
        );
        assert!(c.contains("hml_tail_entry:;"), "entry label missing");
        assert!(c.contains("goto hml_tail_entry;"), "tail jump missing");
        // The recursive tail call must not go through hml_call inside fact:
        // take everything after the definition header (the prototype is the
        // first occurrence) up to main.
        let fact_fn = c
            .split("static HmlValue hml_fn_1_fact")
            .nth(2)
            .expect("fact definition present");
        let fact_body = fact_fn.split("int main").next().expect("body");
        assert!(
            !fact_body.contains("hml_call("),
            "tail call was not rewritten:\n{fact_body}"
        );
    }

    #[test]
    fn defers_emit_in_lifo_order_before_return_paths() {
        let c = compile_ok(r#"fn f() { defer print("d1"); defer print("d2"); print("body"); } f();"#);
        let done = c.find("hml_done:;").expect("epilogue present");
        let epilogue = &c[done..];
        let d2 = epilogue.find("d2").expect("second defer in epilogue");
        let d1 = epilogue.find("d1").expect("first defer in epilogue");
        assert!(d2 < d1, "defers must replay most-recent-first");
    }

    #[test]
    fn closures_share_an_environment_with_stable_slots() {
        let c = compile_ok(
            "fn make() { let i = 0; return fn() { i = i + 1; return i; }; } let c = make(); print(c());",
        );
        assert!(c.contains("hml_env_new(hml_env_in, 1)"), "one-slot env:\n{c}");
        assert!(c.contains("hml_closure_new("));
        assert!(c.contains("hml_env_set("));
        assert!(c.contains("hml_env_get("));
    }

    #[test]
    fn unboxed_counter_declares_native_type() {
        let c = compile_ok("for (let i = 0; i < 10; i = i + 1) { let x = i * 2; }");
        assert!(
            c.contains("int32_t v_i_"),
            "loop counter should be a native local:\n{c}"
        );
    }

    #[test]
    fn integer_switch_lowers_to_c_switch() {
        let c = compile_ok(
            "switch (x) { case 1: print(1); break; case 2: print(2); break; default: print(0); }",
        );
        assert!(c.contains("switch (hml_switch_key("));
        assert!(c.contains("case INT64_C(1):"));
        assert!(c.contains("default: {"));
    }

    #[test]
    fn string_switch_lowers_to_dispatch_chain() {
        let c = compile_ok(r#"switch (s) { case "a": print(1); default: print(0); }"#);
        assert!(!c.contains("switch (hml_switch_key("));
        assert!(c.contains("hml_values_equal("));
    }

    #[test]
    fn try_catch_finally_emit_handler_and_merge_labels() {
        let c = compile_ok(
            r#"try { throw "boom"; } catch (e) { print(e); } finally { print("f"); }"#,
        );
        assert!(c.contains("hml_exc_take()"));
        // finally resolution re-propagates pending state.
        assert!(c.contains("if (hml_exc_pending()) goto"));
        assert!(c.contains("if (hml_has_ret) goto"));
    }

    #[test]
    fn reserved_identifiers_are_mangled() {
        let c = compile_ok("let int = 3; print(int);");
        assert!(c.contains("u_int"), "C keyword must be prefixed:\n{c}");
    }

    #[test]
    fn imported_names_use_module_prefix() {
        let c = compile_ok(r#"import { add } from "lib/math"; print(add);"#);
        assert!(c.contains("extern HmlValue m_lib_math__add;"));
        assert!(c.contains("m_lib_math__add"));
    }

    #[test]
    fn const_assignment_is_a_compile_error_and_blocks_output() {
        let err = compile("const x = 1; x = 2;").expect_err("must fail");
        assert_eq!(err.count(), 1);
        assert!(err.0[0].message.contains("constant"));
    }

    #[test]
    fn duplicate_binding_in_same_scope_is_an_error() {
        let err = compile("let x = 1; let x = 2;").expect_err("must fail");
        assert!(err.0[0].message.contains("duplicate binding"));
    }

    #[test]
    fn for_in_lowers_to_counted_loop() {
        let c = compile_ok("for (k, v in xs) { print(k, v); }");
        assert!(c.contains("hml_iter_len("));
        assert!(c.contains("hml_iter_key("));
        assert!(c.contains("hml_iter_val("));
    }

    #[test]
    fn extern_fn_emits_native_prototype_and_direct_call() {
        let c = compile_ok(r#"import ffi "libm.so"; extern fn hypot3(f64, f64): f64; print(hypot3(3.0, 4.0));"#);
        assert!(c.contains("extern double hypot3(double, double);"));
        assert!(c.contains("hypot3("));
    }

    #[test]
    fn output_is_deterministic() {
        let src = "fn add(a, b) { return a + b; } print(add(1, 2));";
        assert_eq!(compile_ok(src), compile_ok(src));
    }
}
