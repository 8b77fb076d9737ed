// Integration tests for the NanoJS engine
//
// These tests run complete JavaScript programs through the full pipeline
// (lex -> parse -> compile -> execute) and check the results. Covered:
// - Variables, scoping, and closures (per-iteration let capture)
// - Control flow (if/else, loops, switch, labels)
// - Functions, arrows, default/rest parameters, spread
// - Classes (fields, private names, accessors, extends/super, statics)
// - Generators and async/await with microtask draining
// - Exception handling and TypeError diagnostics
// - Regex literals end to end

use nanojs::context::Context;
use nanojs::errors::{ErrorKind, JsError};
use nanojs::value::JsValue;

fn run(code: &str) -> JsValue {
    let mut ctx = Context::new();
    nanojs::eval(&mut ctx, code, false).expect("eval error")
}

fn run_module(code: &str) -> JsValue {
    let mut ctx = Context::new();
    nanojs::eval(&mut ctx, code, true).expect("eval error")
}

fn run_err(code: &str) -> JsError {
    let mut ctx = Context::new();
    nanojs::eval(&mut ctx, code, false).expect_err("expected an error")
}

fn as_number(value: &JsValue) -> f64 {
    match value {
        JsValue::Number(n) => *n,
        other => panic!("expected number, got {:?}", other),
    }
}

fn as_string(value: &JsValue) -> String {
    match value {
        JsValue::String(s) => s.to_string(),
        other => panic!("expected string, got {:?}", other),
    }
}

fn as_bool(value: &JsValue) -> bool {
    match value {
        JsValue::Bool(b) => *b,
        other => panic!("expected boolean, got {:?}", other),
    }
}

#[test]
fn test_arithmetic_and_precedence() {
    assert_eq!(as_number(&run("1 + 2 * 3")), 7.0);
    assert_eq!(as_number(&run("(1 + 2) * 3")), 9.0);
    assert_eq!(as_number(&run("2 ** 3 ** 2")), 512.0);
    assert_eq!(as_number(&run("7 % 4")), 3.0);
    assert_eq!(as_number(&run("-3 + +\"4\"")), 1.0);
    assert_eq!(as_number(&run("(5 | 2) ^ 1")), 6.0);
    assert_eq!(as_number(&run("-8 >>> 28")), 15.0);
}

#[test]
fn test_string_concatenation_coerces() {
    assert_eq!(as_string(&run("\"a\" + 1 + 2")), "a12");
    assert_eq!(as_number(&run("1 + 2 + \"3\" - 0 + 30")), 63.0);
}

#[test]
fn test_variables_and_block_scope() {
    assert_eq!(as_number(&run("var a = 1; { var a = 2; } a")), 2.0);
    assert_eq!(as_number(&run("let a = 1; { let a = 2; } a")), 1.0);
    assert_eq!(as_number(&run("const c = 10; c + 1")), 11.0);
}

#[test]
fn test_const_assignment_is_rejected_at_compile_time() {
    let err = run_err("const c = 1; c = 2;");
    assert_eq!(err.kind, ErrorKind::SyntaxError);
    assert!(err.message.contains("constant"));
}

#[test]
fn test_closures_share_state() {
    let code = r#"
        function counter() {
            let n = 0;
            return function() { n = n + 1; return n; };
        }
        let c = counter();
        c(); c();
        c()
    "#;
    assert_eq!(as_number(&run(code)), 3.0);
}

#[test]
fn test_per_iteration_let_binding_capture() {
    // Each loop turn closes its binding, so every closure sees its own i
    let code = r#"
        let fs = [];
        for (let i = 0; i < 3; i++) fs.push(() => i);
        fs.map(f => f()).join(",")
    "#;
    assert_eq!(as_string(&run(code)), "0,1,2");
}

#[test]
fn test_var_capture_shares_one_binding() {
    let code = r#"
        let fs = [];
        for (var i = 0; i < 3; i++) fs.push(() => i);
        fs.map(f => f()).join(",")
    "#;
    assert_eq!(as_string(&run(code)), "3,3,3");
}

#[test]
fn test_type_error_names_property_access_chain() {
    let err = run_err("let a = {}; a.b.c();");
    assert_eq!(err.kind, ErrorKind::TypeError);
    assert!(
        err.message.starts_with("a.b.c is not a function"),
        "unexpected message: {}",
        err.message
    );
}

#[test]
fn test_calling_undefined_global() {
    let err = run_err("missing();");
    assert_eq!(err.kind, ErrorKind::ReferenceError);
}

#[test]
fn test_tdz_read_is_a_reference_error() {
    let err = run_err("tooEarly; let tooEarly = 1;");
    assert_eq!(err.kind, ErrorKind::ReferenceError);
    assert!(err.message.contains("tooEarly"));
}

#[test]
fn test_if_else_and_loops() {
    assert_eq!(as_string(&run("let r = \"\"; if (1 < 2) r = \"yes\"; else r = \"no\"; r")), "yes");
    assert_eq!(as_number(&run("let s = 0; let i = 0; while (i < 5) { s += i; i++; } s")), 10.0);
    assert_eq!(as_number(&run("let n = 0; do { n++; } while (n < 3); n")), 3.0);
}

#[test]
fn test_break_continue_and_labels() {
    let code = r#"
        let s = 0;
        for (let i = 0; i < 10; i++) {
            if (i % 2 === 0) continue;
            if (i > 6) break;
            s += i;
        }
        s
    "#;
    assert_eq!(as_number(&run(code)), 9.0); // 1 + 3 + 5

    let code = r#"
        let hits = 0;
        outer: for (let i = 0; i < 3; i++) {
            for (let j = 0; j < 3; j++) {
                if (j === 1) continue outer;
                hits++;
            }
        }
        hits
    "#;
    assert_eq!(as_number(&run(code)), 3.0);
}

#[test]
fn test_switch_fallthrough_and_default() {
    let code = r#"
        function pick(x) {
            let out = "";
            switch (x) {
                case 1: out += "one ";
                case 2: out += "two"; break;
                default: out = "other";
            }
            return out;
        }
        pick(1) + "/" + pick(2) + "/" + pick(9)
    "#;
    assert_eq!(as_string(&run(code)), "one two/two/other");
}

#[test]
fn test_default_and_rest_parameters() {
    assert_eq!(as_number(&run("function f(a, b = a + 1) { return b; } f(1)")), 2.0);
    let code = r#"
        function sum(...xs) {
            let s = 0;
            for (const x of xs) s += x;
            return s;
        }
        sum(1, 2, 3, ...[4, 5])
    "#;
    assert_eq!(as_number(&run(code)), 15.0);
}

#[test]
fn test_object_and_array_literals() {
    assert_eq!(as_number(&run("let o = { a: 1, [\"b\" + \"\"]: 2 }; o.a + o.b")), 3.0);
    assert_eq!(as_number(&run("let o = { ...{ a: 1 }, b: 2 }; o.a + o.b")), 3.0);
    assert_eq!(as_number(&run("let xs = [1, 2, ...[3, 4]]; xs.length")), 4.0);
    assert_eq!(as_number(&run("let v = 9; let o = { v }; o.v")), 9.0);
    assert_eq!(
        as_number(&run("let o = { m() { return 5; }, get g() { return 2; } }; o.m() + o.g")),
        7.0
    );
}

#[test]
fn test_for_in_enumerates_insertion_order() {
    let code = r#"
        let o = { a: 1, b: 2, c: 3 };
        let keys = "";
        for (const k in o) keys += k;
        keys
    "#;
    assert_eq!(as_string(&run(code)), "abc");
}

#[test]
fn test_for_of_over_arrays_and_strings() {
    assert_eq!(as_number(&run("let s = 0; for (const x of [1, 2, 3]) s += x; s")), 6.0);
    assert_eq!(as_string(&run("let out = \"\"; for (const c of \"abc\") out = c + out; out")), "cba");
}

#[test]
fn test_try_catch_finally_ordering() {
    let code = r#"
        let log = "";
        try {
            log += "t";
            throw new Error("x");
        } catch (e) {
            log += "c";
        } finally {
            log += "f";
        }
        log
    "#;
    assert_eq!(as_string(&run(code)), "tcf");
}

#[test]
fn test_finally_runs_on_uncaught_path() {
    let code = r#"
        let log = "";
        function f() {
            try {
                throw new Error("boom");
            } finally {
                log += "f";
            }
        }
        try { f(); } catch (e) { log += "c:" + e.message; }
        log
    "#;
    assert_eq!(as_string(&run(code)), "fc:boom");
}

#[test]
fn test_finally_runs_before_return() {
    let code = r#"
        let log = "";
        function f() {
            try {
                return "r";
            } finally {
                log += "f";
            }
        }
        f() + log
    "#;
    assert_eq!(as_string(&run(code)), "rf");
}

#[test]
fn test_nested_catch_rethrow() {
    let code = r#"
        let out = "";
        try {
            try {
                throw new TypeError("inner");
            } catch (e) {
                out += "1";
                throw e;
            }
        } catch (e) {
            out += "2:" + e.message;
        }
        out
    "#;
    assert_eq!(as_string(&run(code)), "12:inner");
}

#[test]
fn test_throwing_a_non_error_value() {
    let err = run_err("throw 42;");
    assert_eq!(err.kind, ErrorKind::Uncaught);
    assert_eq!(err.message, "42");
}

#[test]
fn test_getter_exception_propagates_through_accessor() {
    let code = r#"
        let o = { get x() { throw new Error("ga"); } };
        let got = "";
        try { o.x; } catch (e) { got = e.message; }
        got
    "#;
    assert_eq!(as_string(&run(code)), "ga");
}

#[test]
fn test_generator_yields_and_completes() {
    let code = r#"
        function* g() { yield 1; yield 2; return 3; }
        let it = g();
        let a = it.next();
        let b = it.next();
        let c = it.next();
        let d = it.next();
        "" + a.value + a.done + b.value + c.value + c.done + d.value + d.done
    "#;
    assert_eq!(as_string(&run(code)), "1false23trueundefinedtrue");
}

#[test]
fn test_generator_preserves_locals_across_yields() {
    let code = r#"
        function* g() {
            let x = 0;
            while (x < 3) {
                x++;
                yield x;
            }
        }
        let it = g();
        "" + it.next().value + it.next().value + it.next().value + it.next().done
    "#;
    assert_eq!(as_string(&run(code)), "123true");
}

#[test]
fn test_generator_receives_sent_values() {
    let code = r#"
        function* g() {
            let got = yield 1;
            yield got * 10;
        }
        let it = g();
        it.next();
        it.next(4).value
    "#;
    assert_eq!(as_number(&run(code)), 40.0);
}

#[test]
fn test_generator_is_iterable() {
    let code = r#"
        function* g() { yield 1; yield 2; }
        let s = 0;
        for (const v of g()) s += v;
        s
    "#;
    assert_eq!(as_number(&run(code)), 3.0);
}

#[test]
fn test_yield_star_delegation() {
    let code = r#"
        function* inner() { yield 1; yield 2; }
        function* outer() { yield 0; yield* inner(); yield 3; }
        let out = "";
        for (const v of outer()) out += v;
        out
    "#;
    assert_eq!(as_string(&run(code)), "0123");
}

#[test]
fn test_generator_return_completes() {
    let code = r#"
        function* g() { yield 1; yield 2; }
        let it = g();
        it.next();
        let r = it.return(9);
        "" + r.value + r.done + it.next().done
    "#;
    assert_eq!(as_string(&run(code)), "9truetrue");
}

#[test]
fn test_async_function_returns_resolved_value() {
    let code = r#"
        async function f() { return 42; }
        await f()
    "#;
    assert_eq!(as_number(&run_module(code)), 42.0);
}

#[test]
fn test_await_non_promise_passes_through() {
    assert_eq!(as_number(&run_module("await 7")), 7.0);
}

#[test]
fn test_await_drains_microtasks_until_settled() {
    let code = r#"
        let p = new Promise((resolve) => {
            queueMicrotask(() => resolve(7));
        });
        await p
    "#;
    assert_eq!(as_number(&run_module(code)), 7.0);
}

#[test]
fn test_await_rejection_is_catchable() {
    let code = r#"
        let got = "";
        try {
            await Promise.reject(new Error("boom"));
        } catch (e) {
            got = e.message;
        }
        got
    "#;
    assert_eq!(as_string(&run_module(code)), "boom");
}

#[test]
fn test_async_rejection_propagates_from_throw() {
    let code = r#"
        async function f() { throw new Error("bad"); }
        let got = "";
        try { await f(); } catch (e) { got = e.message; }
        got
    "#;
    assert_eq!(as_string(&run_module(code)), "bad");
}

#[test]
fn test_await_deadlock_is_an_engine_error() {
    let mut ctx = Context::new();
    let err = nanojs::eval(&mut ctx, "await new Promise(() => {})", true)
        .expect_err("expected deadlock");
    assert_eq!(err.kind, ErrorKind::InternalError);
    assert!(err.message.contains("deadlock"));
}

#[test]
fn test_unhandled_rejection_without_callback() {
    let mut ctx = Context::new();
    ctx.promise_reject_callback = None;
    let err = nanojs::eval(&mut ctx, "await Promise.reject(\"nope\")", true)
        .expect_err("expected unhandled rejection");
    assert_eq!(err.kind, ErrorKind::UnhandledRejection);
}

#[test]
fn test_class_construction_and_methods() {
    let code = r#"
        class Point {
            constructor(x, y) { this.x = x; this.y = y; }
            sum() { return this.x + this.y; }
        }
        new Point(3, 4).sum()
    "#;
    assert_eq!(as_number(&run(code)), 7.0);
}

#[test]
fn test_class_fields_and_private_names() {
    let code = r#"
        class Counter {
            #n = 0;
            label = "c";
            inc() { this.#n++; return this.#n; }
        }
        let c = new Counter();
        c.inc();
        "" + c.inc() + c.label
    "#;
    assert_eq!(as_string(&run(code)), "2c");
}

#[test]
fn test_class_extends_and_super() {
    let code = r#"
        class Animal {
            constructor(name) { this.name = name; }
            speak() { return this.name + " makes a sound"; }
        }
        class Dog extends Animal {
            constructor(name) { super(name); }
            speak() { return super.speak() + "!"; }
        }
        new Dog("Rex").speak()
    "#;
    assert_eq!(as_string(&run(code)), "Rex makes a sound!");
}

#[test]
fn test_implicit_derived_constructor_forwards_args() {
    let code = r#"
        class Base { constructor(v) { this.v = v; } }
        class Sub extends Base {}
        new Sub(11).v
    "#;
    assert_eq!(as_number(&run(code)), 11.0);
}

#[test]
fn test_class_statics_and_static_block() {
    let code = r#"
        class Config {
            static version = 2;
            static { Config.ready = true; }
            static describe() { return Config.version + ":" + Config.ready; }
        }
        Config.describe()
    "#;
    assert_eq!(as_string(&run(code)), "2:true");
}

#[test]
fn test_class_accessors() {
    let code = r#"
        class Box {
            #v = 0;
            get value() { return this.#v; }
            set value(v) { this.#v = v * 2; }
        }
        let b = new Box();
        b.value = 21;
        b.value
    "#;
    assert_eq!(as_number(&run(code)), 42.0);
}

#[test]
fn test_instanceof_walks_prototype_chain() {
    let code = r#"
        class A {}
        class B extends A {}
        let b = new B();
        "" + (b instanceof B) + (b instanceof A) + ({} instanceof A)
    "#;
    assert_eq!(as_string(&run(code)), "truetruefalse");
}

#[test]
fn test_constructor_functions_and_prototype() {
    let code = r#"
        function F() {}
        F.prototype.greet = function() { return "hi"; };
        new F().greet()
    "#;
    assert_eq!(as_string(&run(code)), "hi");
}

#[test]
fn test_arrow_functions_capture_this() {
    let code = r#"
        let o = {
            v: 7,
            get() { return (() => this.v)(); }
        };
        o.get()
    "#;
    assert_eq!(as_number(&run(code)), 7.0);
}

#[test]
fn test_typeof_in_delete() {
    assert_eq!(as_string(&run("typeof 1")), "number");
    assert_eq!(as_string(&run("typeof \"s\"")), "string");
    assert_eq!(as_string(&run("typeof undefined")), "undefined");
    assert_eq!(as_string(&run("typeof (() => 0)")), "function");
    assert_eq!(as_string(&run("typeof notDeclaredAnywhere")), "undefined");
    assert!(as_bool(&run("\"a\" in { a: 1 }")));
    assert!(!as_bool(&run("let o = { a: 1 }; delete o.a; \"a\" in o")));
    assert_eq!(as_string(&run("typeof 1n")), "bigint");
}

#[test]
fn test_bigint_arithmetic() {
    let mut ctx = Context::new();
    let value = nanojs::eval(&mut ctx, "10n * 4n + 2n", false).unwrap();
    assert!(matches!(value, JsValue::BigInt(42)));
    let err = run_err("1n + 1;");
    assert_eq!(err.kind, ErrorKind::TypeError);
}

#[test]
fn test_nullish_and_logical_operators() {
    assert_eq!(as_number(&run("null ?? 5")), 5.0);
    assert_eq!(as_number(&run("0 ?? 7")), 0.0);
    assert_eq!(as_number(&run("0 || 7")), 7.0);
    assert_eq!(as_number(&run("let x = null; x ??= 3; x")), 3.0);
    assert_eq!(as_number(&run("let y = 2; y ||= 9; y")), 2.0);
    assert_eq!(as_number(&run("let z = 1; z &&= 4; z")), 4.0);
}

#[test]
fn test_optional_chaining() {
    assert!(run("let o = null; o?.x").is_undefined());
    assert!(run("let o = null; o?.f()").is_undefined());
    assert_eq!(as_number(&run("let o = { x: { y: 3 } }; o?.x?.y")), 3.0);
}

#[test]
fn test_template_literals_end_to_end() {
    assert_eq!(as_string(&run("let n = 3; `n is ${n + 1}!`")), "n is 4!");
    assert_eq!(as_string(&run("`a${`b${1}c`}d`")), "ab1cd");
    let code = r#"
        function tag(strings, x) {
            return strings[0] + strings.raw[1] + x;
        }
        tag`a\n${1}b\n`
    "#;
    assert_eq!(as_string(&run(code)), "a\nb\\n1");
}

#[test]
fn test_regex_literals_end_to_end() {
    assert!(as_bool(&run("/^a+$/.test(\"aaa\")")));
    assert!(!as_bool(&run("/^a+$/.test(\"ab\")")));
    assert_eq!(as_string(&run("/(\\d+)-(\\d+)/.exec(\"10-20\")[2]")), "20");
    assert_eq!(as_number(&run("/b/.exec(\"abc\").index")), 1.0);
    assert!(run("/x/.exec(\"abc\")").is_null());
}

#[test]
fn test_proxy_apply_trap() {
    let code = r#"
        let target = function() { return 1; };
        let p = new Proxy(target, {
            apply(t, thisArg, args) { return 40 + args.length; }
        });
        p(1, 2)
    "#;
    assert_eq!(as_number(&run(code)), 42.0);
}

#[test]
fn test_proxy_without_trap_forwards_to_target() {
    let code = r#"
        let p = new Proxy(function() { return 9; }, {});
        p()
    "#;
    assert_eq!(as_number(&run(code)), 9.0);
}

#[test]
fn test_proxy_construct_trap() {
    let code = r#"
        class T {}
        let p = new Proxy(T, {
            construct(target, args) { return { marked: args[0] }; }
        });
        new p(5).marked
    "#;
    assert_eq!(as_number(&run(code)), 5.0);
}

#[test]
fn test_strict_mode_undeclared_assignment() {
    let err = run_err("'use strict'; someUndeclared = 5;");
    assert_eq!(err.kind, ErrorKind::ReferenceError);
    assert_eq!(as_number(&run("looseGlobal = 6; looseGlobal")), 6.0);
}

#[test]
fn test_function_call_and_apply() {
    let code = r#"
        function f(a, b) { return this.base + a + b; }
        f.call({ base: 10 }, 1, 2) + f.apply({ base: 100 }, [1, 2])
    "#;
    assert_eq!(as_number(&run(code)), 116.0);
}

#[test]
fn test_sequence_conditional_comma() {
    assert_eq!(as_number(&run("let x = (1, 2, 3); x")), 3.0);
    assert_eq!(as_string(&run("true ? \"a\" : \"b\"")), "a");
    assert_eq!(as_number(&run("let i = 0; let j = (i++, i + 10); j")), 11.0);
}

#[test]
fn test_update_expressions() {
    assert_eq!(as_string(&run("let i = 5; \"\" + i++ + i")), "56");
    assert_eq!(as_string(&run("let i = 5; \"\" + ++i + i")), "66");
    assert_eq!(as_number(&run("let o = { n: 1 }; o.n++; ++o.n; o.n")), 3.0);
    assert_eq!(as_number(&run("let xs = [5]; xs[0]++; xs[0]")), 6.0);
}

#[test]
fn test_deep_recursion_restores_state() {
    let code = r#"
        function fib(n) { return n < 2 ? n : fib(n - 1) + fib(n - 2); }
        fib(15)
    "#;
    assert_eq!(as_number(&run(code)), 610.0);
}

#[test]
fn test_exceptions_across_native_frames() {
    // The callback throws inside Array.prototype.map, and the try around
    // the whole call still catches it
    let code = r#"
        let got = "";
        try {
            [1, 2, 3].map(x => { if (x === 2) throw new Error("mid"); return x; });
        } catch (e) {
            got = e.message;
        }
        got
    "#;
    assert_eq!(as_string(&run(code)), "mid");
}

#[test]
fn test_string_auto_boxing() {
    assert_eq!(as_number(&run("\"hello\".length")), 5.0);
    assert_eq!(as_string(&run("\"hello\".charAt(1)")), "e");
    assert_eq!(as_string(&run("\"a-b-c\".split(\"-\").join(\"+\")")), "a+b+c");
    assert_eq!(as_string(&run("\"abc\"[1]")), "b");
}

#[test]
fn test_completion_value_of_trailing_expression() {
    assert!(run("let a = 1;").is_undefined());
    assert_eq!(as_number(&run("let a = 1; a + 1")), 2.0);
}
