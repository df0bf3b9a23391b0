//! End-to-end scenarios through the public API: compile, serialize,
//! execute, and drive the host-facing surface the way an embedder would.

use lepus::bytecode::CompileOptions;
use lepus::value::{Table, Value};
use lepus::vm::{CallArgs, Context, RuntimeError};
use lepus::{binary, compile, CompiledScript};

fn options(closure_fix: bool) -> CompileOptions {
    CompileOptions {
        closure_fix,
        ..CompileOptions::default()
    }
}

fn build(src: &str, closure_fix: bool) -> CompiledScript {
    compile(src, &options(closure_fix)).unwrap()
}

fn eval(src: &str) -> Value {
    Context::new().execute(&build(src, true)).unwrap()
}

#[test]
fn closures_see_fresh_loop_bindings() {
    let src = "var fns = [];
               for (let i = 0; i < 3; i++) { fns[i] = function () { return i; }; }
               fns[0]() * 100 + fns[1]() * 10 + fns[2]();";
    assert_eq!(eval(src), Value::Int64(12));
}

#[test]
fn legacy_closures_share_the_loop_binding() {
    let src = "var fns = [];
               for (var i = 0; i < 3; i++) { fns[i] = function () { return i; }; }
               fns[0]() * 100 + fns[1]() * 10 + fns[2]();";
    let script = build(src, false);
    assert_eq!(Context::new().execute(&script).unwrap(), Value::Int64(333));
}

#[test]
fn switch_shapes_all_dispatch() {
    // dense ints, sparse ints, strings, and a non-constant arm
    let dense = "function f(n) { switch (n) { case 1: return 'a'; case 2: return 'b';
                 case 3: return 'c'; default: return 'd'; } } f(2) + f(9);";
    assert_eq!(eval(dense), Value::string("bd"));

    let sparse = "function f(n) { switch (n) { case 10: return 'x'; case 9000: return 'y';
                  default: return 'z'; } } f(9000) + f(11);";
    assert_eq!(eval(sparse), Value::string("yz"));

    let strings = "function f(s) { switch (s) { case 'red': return 1; case 'green': return 2;
                   default: return 0; } } f('green') * 10 + f('blue');";
    assert_eq!(eval(strings), Value::Int64(20));

    let mixed = "var k = 'b';
                 function f(s) { switch (s) { case k: return 1; default: return 0; } }
                 f('b');";
    assert_eq!(eval(mixed), Value::Int64(1));
}

#[test]
fn optional_chains_stop_at_the_first_hole() {
    assert_eq!(eval("var o = null; typeof o?.a.b;"), Value::string("undefined"));
    assert_eq!(eval("var o = { a: { b: 5 } }; o?.a.b;"), Value::Int64(5));
    assert_eq!(eval("var o = {}; typeof o.f?.();"), Value::string("undefined"));
}

#[test]
fn finally_overrides_and_rethrows() {
    assert_eq!(
        eval("function f() { try { return 1; } finally { return 2; } } f();"),
        Value::Int64(2)
    );
    let src = "var log = '';
               function f() { try { throw 'boom'; } finally { log = log + 'fin,'; } }
               try { f(); } catch (e) { log = log + e; }
               log;";
    assert_eq!(eval(src), Value::string("fin,boom"));
}

#[test]
fn nested_try_does_not_leak_handlers() {
    let src = "var out = '';
               try {
                 try { throw 'inner'; } catch (e) { out = out + 'i:' + e + ';'; }
                 throw 'outer';
               } catch (e) { out = out + 'o:' + e; }
               out;";
    assert_eq!(eval(src), Value::string("i:inner;o:outer"));
}

#[test]
fn binary_round_trip_executes_identically() {
    let src = "function area(w, h) { return w * h; }
               var sizes = [[2, 3], [4, 5]];
               var total = 0;
               for (let i = 0; i < 2; i++) { total = total + area(sizes[i][0], sizes[i][1]); }
               total;";
    let script = build(src, true);
    let direct = Context::new().execute(&script).unwrap();
    let decoded = binary::decode(&binary::encode(&script).unwrap()).unwrap();
    let replayed = Context::new().execute(&decoded).unwrap();
    assert_eq!(direct, Value::Int64(26));
    assert_eq!(replayed, direct);
}

#[test]
fn corrupted_chunks_are_rejected() {
    let bytes = binary::encode(&build("1 + 1;", true)).unwrap();
    assert!(binary::decode(&bytes[..bytes.len() - 1]).is_err());
    let mut flipped = bytes.clone();
    flipped[2] ^= 0x55;
    assert!(binary::decode(&flipped).is_err());
}

#[test]
fn native_functions_and_host_calls() {
    fn clamp(_ctx: &mut Context, args: &CallArgs) -> Result<Value, RuntimeError> {
        let n = args.param(0).number();
        Ok(Value::from_number(n.clamp(0.0, 100.0)))
    }
    let mut ctx = Context::new();
    ctx.register_native_function("clamp", clamp);
    ctx.execute(&build(
        "function scale(x) { return clamp(x * 10); } var last = scale(7);",
        true,
    ))
    .unwrap();
    assert_eq!(
        ctx.get_top_level_variable_by_name("last"),
        Some(Value::Int64(70))
    );
    // the host can call back into script functions after execute
    assert_eq!(
        ctx.call("scale", &[Value::Int64(50)]).unwrap(),
        Value::Int64(100)
    );
}

#[test]
fn top_level_variables_round_trip_with_the_host() {
    let mut ctx = Context::new();
    ctx.execute(&build(
        "var theme = { color: 'red', depth: { z: 1 } };
         var count = 3;
         function helper() { return 0; }",
        true,
    ))
    .unwrap();

    let vars = ctx.get_top_level_variables(true);
    let names: Vec<&str> = vars.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, ["count", "theme"]);

    let patch = Table::new();
    patch.set("color", Value::string("blue"));
    assert!(ctx.update_top_level_by_path("theme.color", &Value::string("blue")));
    // repeating the same update is a no-op, not an error
    assert!(ctx.update_top_level_by_path("theme.color", &Value::string("blue")));
    let theme = ctx.get_top_level_variable_by_name("theme").unwrap();
    assert_eq!(theme.get_property(&Value::string("color")), Value::string("blue"));
    drop(patch);

    let reset = Table::new();
    reset.set("count", Value::Int64(9));
    ctx.reset_top_level_variables(&Value::Table(reset));
    assert_eq!(
        ctx.get_top_level_variable_by_name("count"),
        Some(Value::Int64(9))
    );
}

#[test]
fn shadow_check_reports_script_side_mutation() {
    let mut ctx = Context::new();
    ctx.execute(&build("var state = { n: 1 }; function bump() { state.n = state.n + 1; }", true))
        .unwrap();
    assert!(ctx.check_top_level_shadow_updated().is_empty());
    ctx.call("bump", &[]).unwrap();
    assert_eq!(ctx.check_top_level_shadow_updated(), ["state"]);
    // the shadow refreshes, so a second check is clean
    assert!(ctx.check_top_level_shadow_updated().is_empty());

    // a pending update only counts as dirty when it changes something
    let same = Table::new();
    same.set("state", ctx.get_top_level_variable_by_name("state").unwrap());
    assert!(!ctx.check_table_shadow_updated(&Value::Table(same)));
    let differs = Table::new();
    differs.set("state", Value::Int64(0));
    assert!(ctx.check_table_shadow_updated(&Value::Table(differs)));
}

#[test]
fn thrown_values_carry_across_frames() {
    let src = "function deep(n) { if (n == 0) { throw 'bottom'; } return deep(n - 1); }
               var got = '';
               try { deep(4); } catch (e) { got = e; }
               got;";
    assert_eq!(eval(src), Value::string("bottom"));
}

#[test]
fn uncaught_errors_surface_a_back_trace() {
    let err = Context::new()
        .execute(&build("function inner() { throw 'nope'; } function outer() { inner(); } outer();", true))
        .unwrap_err();
    let trace = err.back_trace.as_deref().unwrap_or("");
    assert!(trace.contains("inner"), "missing frame in {trace:?}");
    assert!(trace.contains("outer"), "missing frame in {trace:?}");
}

#[test]
fn division_and_modulo_by_zero_throw() {
    assert_eq!(
        eval("var r = 'ok'; try { var x = 1 / 0; } catch (e) { r = 'caught'; } r;"),
        Value::string("caught")
    );
    assert_eq!(
        eval("var r = 'ok'; try { var x = 1 % 0; } catch (e) { r = 'caught'; } r;"),
        Value::string("caught")
    );
    // doubles divide through to infinity instead
    assert_eq!(eval("1.5 / 0.5;"), Value::Int64(3));
}

#[test]
fn string_and_numeric_semantics() {
    assert_eq!(eval("1 + '2';"), Value::string("12"));
    assert_eq!(eval("7 / 2;"), Value::Double(3.5));
    assert_eq!(eval("6 / 2;"), Value::Int64(3));
    assert_eq!(eval("5 | 3;"), Value::Int64(7));
    assert_eq!(eval("'a' < 'b';"), Value::Bool(true));
    assert_eq!(eval("1 < 'b';"), Value::Bool(false));
    assert_eq!(eval("1 === 1.0;"), Value::Bool(true));
    assert_eq!(eval("'1' === 1;"), Value::Bool(false));
    assert_eq!(eval("null ?? 'fallback';"), Value::string("fallback"));
}

#[test]
fn strict_mode_turns_quiet_failures_into_throws() {
    let src = "var o = null; var r = 'ok'; try { var x = o.missing; } catch (e) { r = 'threw'; } r;";
    let script = compile(
        src,
        &CompileOptions {
            strict: true,
            ..CompileOptions::default()
        },
    )
    .unwrap();
    let mut ctx = Context::new();
    ctx.enable_strict_check = true;
    assert_eq!(ctx.execute(&script).unwrap(), Value::string("threw"));
    // without the flag the read degrades to undefined
    assert_eq!(eval(src), Value::string("ok"));
}
