//! End-to-end interpreter scenarios: exact stdout bytes, error surfacing,
//! and heap-leak checks after teardown.

use hemlock::{
    CollectStringPrint, Exception, HeapStats, Interpreter, NoopTracer, ResourceLimits,
    optimize_program, parse,
};
use pretty_assertions::assert_eq;

fn run_with_limits(source: &str, limits: ResourceLimits) -> (Result<(), Exception>, String, HeapStats) {
    let result = parse(source, "test.hml");
    assert!(
        result.diagnostics.is_empty(),
        "unexpected diagnostics: {:?}",
        result.diagnostics
    );
    let mut program = result.program;
    optimize_program(&mut program);
    let mut writer = CollectStringPrint::new();
    let (outcome, stats) = {
        let mut interp = Interpreter::new(&program, limits, &mut writer, NoopTracer);
        let outcome = interp.run();
        (outcome, interp.heap_stats())
    };
    (outcome, writer.into_output(), stats)
}

fn run(source: &str) -> (Result<(), Exception>, String, HeapStats) {
    run_with_limits(source, ResourceLimits::default())
}

/// Runs a program expected to succeed; asserts the heap is empty after the
/// root environment is released.
fn run_ok(source: &str) -> String {
    let (outcome, output, stats) = run(source);
    if let Err(exception) = outcome {
        panic!("unexpected exception: {exception}\noutput so far: {output}");
    }
    assert_eq!(stats.live_objects, 0, "heap leak: {stats:?}");
    output
}

#[test]
fn arithmetic_and_print() {
    assert_eq!(run_ok("let x = 40; let y = 2; print(x + y);"), "42\n");
}

#[test]
fn defers_run_lifo_on_function_exit() {
    let out = run_ok(r#"fn f() { defer print("d1"); defer print("d2"); print("body"); } f();"#);
    assert_eq!(out, "body\nd2\nd1\n");
}

#[test]
fn try_catch_finally_scenario() {
    let source = r#"
        let out = "";
        try { out = out + "t"; throw "boom"; } catch (e) { out = out + ":" + e; } finally { out = out + "/f"; }
        print(out);
    "#;
    assert_eq!(run_ok(source), "t:boom/f\n");
}

#[test]
fn buffered_channel_delivers_in_order_and_null_after_close() {
    let source = r#"
        let ch = channel(3);
        ch.send(1);
        ch.send(2);
        ch.send(3);
        ch.close();
        let v = ch.recv();
        while (v != null) { print(v); v = ch.recv(); }
    "#;
    assert_eq!(run_ok(source), "1\n2\n3\n");
}

#[test]
fn send_after_close_throws_catchably() {
    let source = r#"
        let ch = channel(1);
        ch.close();
        try { ch.send(1); } catch (e) { print(e); }
    "#;
    assert_eq!(run_ok(source), "send on closed channel\n");
}

#[test]
fn tail_recursive_factorial() {
    let source = r#"
        fn fact(n, acc) { if (n <= 1) { return acc; } return fact(n - 1, acc * n); }
        print(fact(10, 1));
    "#;
    assert_eq!(run_ok(source), "3628800\n");
}

#[test]
fn closure_counter_shares_captured_state() {
    let source = r#"
        fn make() { let i = 0; return fn() { i = i + 1; return i; }; }
        let c = make();
        print(c());
        print(c());
        print(c());
    "#;
    assert_eq!(run_ok(source), "1\n2\n3\n");
}

#[test]
fn two_closures_share_one_environment() {
    // `read` escapes to the root, so the whole closure web (bump included,
    // through the shared frame) stays reachable and the teardown traversal
    // collects it.
    let source = r#"
        fn make() {
            let n = 0;
            let bump = fn() { n = n + 1; return n; };
            let read = fn() { return n; };
            bump();
            bump();
            return read;
        }
        let r = make();
        print(r());
    "#;
    assert_eq!(run_ok(source), "2\n");
}

#[test]
fn string_interpolation_and_concat() {
    let source = r#"
        let name = "world";
        print(`hello ${name}, ${1 + 1} + ${1.5}`);
        print("n=" + 7);
    "#;
    assert_eq!(run_ok(source), "hello world, 2 + 1.5\nn=7\n");
}

#[test]
fn division_yields_float_and_modulo_stays_integer() {
    assert_eq!(run_ok("print(7 / 2); print(7 % 2);"), "3.5\n1\n");
}

#[test]
fn integer_division_by_zero_is_catchable() {
    let source = r#"try { print(1 / 0); } catch (e) { print("caught: " + e); }"#;
    assert_eq!(run_ok(source), "caught: division by zero\n");
}

#[test]
fn float_division_by_zero_follows_ieee() {
    assert_eq!(run_ok("print(1.0 / 0.0); print(-1.0 / 0.0);"), "inf\n-inf\n");
}

#[test]
fn const_reassignment_throws() {
    let source = r#"const k = 1; try { k = 2; } catch (e) { print(e); } print(k);"#;
    assert_eq!(
        run_ok(source),
        "cannot assign to constant 'k'\n1\n"
    );
}

#[test]
fn undefined_variable_throws_catchably() {
    let source = r#"try { print(missing); } catch (e) { print(e); }"#;
    assert_eq!(run_ok(source), "undefined variable 'missing'\n");
}

#[test]
fn truthiness_of_empty_string_zero_and_null() {
    let source = r#"
        if ("") { print("no"); } else { print("empty falsy"); }
        if (0) { print("no"); } else { print("zero falsy"); }
        if (null) { print("no"); } else { print("null falsy"); }
        if ("x") { print("string truthy"); }
    "#;
    assert_eq!(
        run_ok(source),
        "empty falsy\nzero falsy\nnull falsy\nstring truthy\n"
    );
}

#[test]
fn for_in_over_object_observes_insertion_order() {
    let source = r#"
        let o = { b: 1, a: 2, c: 3 };
        for (k, v in o) { print(k + "=" + v); }
    "#;
    assert_eq!(run_ok(source), "b=1\na=2\nc=3\n");
}

#[test]
fn for_in_over_array_and_string() {
    let source = r#"
        for (i, v in [10, 20]) { print(i + ":" + v); }
        for (c in "ab") { print(c); }
    "#;
    assert_eq!(run_ok(source), "0:10\n1:20\na\nb\n");
}

#[test]
fn switch_matches_falls_through_and_breaks() {
    let source = r#"
        fn pick(x) {
            switch (x) {
                case 1: print("one"); break;
                case 2: print("two");
                case 3: print("three"); break;
                default: print("other");
            }
            return 0;
        }
        pick(1); pick(2); pick(9);
    "#;
    assert_eq!(run_ok(source), "one\ntwo\nthree\nother\n");
}

#[test]
fn switch_on_strings() {
    let source = r#"
        let s = "b";
        switch (s) { case "a": print(1); break; case "b": print(2); break; default: print(3); }
    "#;
    assert_eq!(run_ok(source), "2\n");
}

#[test]
fn while_break_continue() {
    let source = r#"
        let i = 0;
        while (true) {
            i = i + 1;
            if (i == 2) { continue; }
            if (i > 4) { break; }
            print(i);
        }
    "#;
    assert_eq!(run_ok(source), "1\n3\n4\n");
}

#[test]
fn ternary_null_coalesce_optional_chain() {
    let source = r#"
        let a = null;
        print(a ?? "fallback");
        print(1 < 2 ? "yes" : "no");
        print(a?.field ?? "none");
        let o = { field: 5 };
        print(o?.field);
    "#;
    assert_eq!(run_ok(source), "fallback\nyes\nnone\n5\n");
}

#[test]
fn defer_runs_on_exception_path_and_supersedes() {
    let source = r#"
        fn f() {
            defer print("cleanup");
            throw "first";
        }
        try { f(); } catch (e) { print("caught " + e); }
    "#;
    assert_eq!(run_ok(source), "cleanup\ncaught first\n");
}

#[test]
fn throwing_defer_replaces_in_flight_exception() {
    let source = r#"
        fn boom() { throw "from defer"; }
        fn f() {
            defer boom();
            throw "original";
        }
        try { f(); } catch (e) { print(e); }
    "#;
    assert_eq!(run_ok(source), "from defer\n");
}

#[test]
fn finally_runs_through_returning_body() {
    let source = r#"
        fn f() {
            try { return "value"; } finally { print("finally"); }
        }
        print(f());
    "#;
    assert_eq!(run_ok(source), "finally\nvalue\n");
}

#[test]
fn nested_functions_and_default_params() {
    let source = r#"
        fn greet(name, greeting = "hi") { return greeting + " " + name; }
        print(greet("ada"));
        print(greet("ada", "hello"));
    "#;
    assert_eq!(run_ok(source), "hi ada\nhello ada\n");
}

#[test]
fn rest_parameter_collects_extra_arguments() {
    let source = r#"
        fn count(first, ...rest) { return rest.len(); }
        print(count(1, 2, 3, 4));
    "#;
    assert_eq!(run_ok(source), "3\n");
}

#[test]
fn ref_parameter_writes_back() {
    let source = r#"
        fn bump(ref x) { x = x + 1; return 0; }
        let n = 41;
        bump(n);
        print(n);
    "#;
    assert_eq!(run_ok(source), "42\n");
}

#[test]
fn enum_declaration_binds_constant_values() {
    let source = r#"
        enum Color { Red, Green = 5, Blue }
        print(Color.Red);
        print(Color.Green);
        print(Color.Blue);
    "#;
    assert_eq!(run_ok(source), "0\n5\n6\n");
}

#[test]
fn define_shape_validates_and_defaults() {
    let source = r#"
        define Point { x: i32, y: i32 = 0, label?: string }
        let p: Point = { x: 3 };
        print(p.x);
        print(p.y);
        print(p.label == null);
        try { p.z = 1; } catch (e) { print(e); }
    "#;
    assert_eq!(
        run_ok(source),
        "3\n0\ntrue\nunknown field 'z' for object type Point\n"
    );
}

#[test]
fn array_methods_and_index_assignment() {
    let source = r#"
        let xs = [1, 2];
        xs.push(3);
        xs[0] = 9;
        print(xs);
        print(xs.pop());
        print(len(xs));
        try { print(xs[5]); } catch (e) { print(e); }
    "#;
    assert_eq!(
        run_ok(source),
        "[9, 2, 3]\n3\n2\nindex 5 out of bounds for length 2\n"
    );
}

#[test]
fn integer_widths_wrap_and_promote() {
    let source = r#"
        let a: i8 = 127;
        print(a + 1);
        let b: u8 = 200;
        let c: i8 = 1;
        print(b + c);
        let d: i8 = 300;
        print(d);
    "#;
    // a + 1 widens to the literal's i64, so no wrap; u8 + i8 promotes to
    // i16; an out-of-range initializer wraps into the annotated width.
    let (outcome, output, _) = run(source);
    assert!(outcome.is_ok(), "{outcome:?}");
    assert_eq!(output, "128\n201\n44\n");
}

#[test]
fn uncaught_exception_reports_message_and_stack() {
    let source = "fn inner() { throw \"kaboom\"; }\nfn outer() { return inner(); }\nouter();";
    let (outcome, _, _) = run(source);
    let exception = outcome.expect_err("must fail");
    assert!(!exception.is_fatal());
    let text = exception.to_string();
    assert!(text.starts_with("error: test.hml:1: kaboom"), "{text}");
    assert!(text.contains("    at inner (test.hml:"), "{text}");
    assert!(text.contains("    at outer (test.hml:"), "{text}");
    assert!(text.contains("    at <main> (test.hml:"), "{text}");
}

#[test]
fn stack_overflow_is_fatal_not_catchable() {
    let source = r#"
        fn loop_forever(n) { return loop_forever(n + 1); }
        try { loop_forever(0); } catch (e) { print("caught"); }
    "#;
    let (outcome, output, _) = run_with_limits(source, ResourceLimits::with_stack_depth(64));
    let exception = outcome.expect_err("must be fatal");
    assert!(exception.is_fatal());
    assert!(exception.message().contains("stack overflow"), "{exception}");
    assert_eq!(output, "", "fatal errors bypass catch");
}

#[test]
fn postfix_and_prefix_inc_dec() {
    let source = r#"
        let i = 5;
        print(i++);
        print(i);
        print(++i);
        print(--i);
        print(i--);
        print(i);
    "#;
    assert_eq!(run_ok(source), "5\n6\n7\n6\n6\n5\n");
}

#[test]
fn equality_rules() {
    let source = r#"
        print(1 == 1.0);
        print(1 == "1");
        print(true == 1);
        print(null == null);
        print("a" == "a");
        print('a' == 97);
    "#;
    assert_eq!(run_ok(source), "true\nfalse\nfalse\ntrue\ntrue\nfalse\n");
}

#[test]
fn imports_raise_recoverable_errors_in_the_core() {
    let source = r#"try { import { x } from "lib/m"; } catch (e) { print(e); }"#;
    assert_eq!(run_ok(source), "cannot resolve module 'lib/m'\n");
}

#[test]
fn shadowing_in_nested_blocks() {
    let source = r#"
        let x = 1;
        { let x = 2; print(x); }
        print(x);
    "#;
    assert_eq!(run_ok(source), "2\n1\n");
}

#[test]
fn buffers_index_and_iterate_as_bytes() {
    let source = r#"
        let b = buffer(3);
        b[0] = 65;
        b[1] = 300;
        print(b[0]);
        print(b[1]);
        print(len(b));
        for (i, x in b) { print(i + ">" + x); }
    "#;
    // 300 wraps into the byte, as buffer elements are u8.
    assert_eq!(run_ok(source), "65\n44\n3\n0>65\n1>44\n2>0\n");
}

#[test]
fn builtins_len_str_typeof() {
    let source = r#"
        print(len("héllo"));
        print(len([1, 2, 3]));
        print(str(12) + str(true));
        print(typeof(1.5));
        print(typeof("s"));
    "#;
    assert_eq!(run_ok(source), "5\n3\n12true\nf64\nstring\n");
}
