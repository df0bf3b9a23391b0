//! Built-in globals installed into every context. Builtins live in their
//! own table so host globals can shadow or extend them without touching
//! the defaults. String and array methods sit on prototype tables the VM
//! consults when a property read on those receivers misses.

mod array;
mod string;

use regex::{Regex, RegexBuilder};

use crate::value::{Table, Value};
use crate::vm::{CallArgs, Context, RuntimeError};

pub fn install(ctx: &mut Context) {
    ctx.register_builtin("print", Value::CFunction(print));
    ctx.register_builtin("String", Value::CFunction(to_string));
    ctx.register_builtin("Number", Value::CFunction(to_number));
    ctx.set_string_prototype(string::prototype());
    ctx.set_array_prototype(array::prototype());

    let array = Table::new();
    array.set("isArray", Value::CFunction(is_array));
    let array = Value::Table(array);
    array.mark_const();
    ctx.register_builtin("Array", array);

    let regexp = Table::new();
    regexp.set("test", Value::CFunction(regex_test));
    let regexp = Value::Table(regexp);
    regexp.mark_const();
    ctx.register_builtin("RegExp", regexp);

    ctx.register_builtin(
        "__lepus_version__",
        Value::string(env!("CARGO_PKG_VERSION")),
    );
}

fn print(_ctx: &mut Context, args: &CallArgs) -> Result<Value, RuntimeError> {
    let line = (0..args.params_size())
        .map(|i| args.param(i).to_string())
        .collect::<Vec<_>>()
        .join(" ");
    println!("{line}");
    Ok(Value::Undefined)
}

fn to_string(_ctx: &mut Context, args: &CallArgs) -> Result<Value, RuntimeError> {
    Ok(Value::string(args.param(0).to_string()))
}

fn to_number(_ctx: &mut Context, args: &CallArgs) -> Result<Value, RuntimeError> {
    let n = args.param(0).number();
    if n.is_nan() {
        Ok(Value::NaN(true))
    } else {
        Ok(Value::from_number(n))
    }
}

fn is_array(_ctx: &mut Context, args: &CallArgs) -> Result<Value, RuntimeError> {
    Ok(Value::Bool(args.param(0).is_array()))
}

/// `RegExp.test(re, subject)`. Flags `i`, `m`, `s` map onto the engine;
/// anything else is ignored.
fn regex_test(_ctx: &mut Context, args: &CallArgs) -> Result<Value, RuntimeError> {
    let Value::RegExp(re) = args.param(0) else {
        return Err(RuntimeError::throwable(
            "LEP-R006",
            "RegExp.test expects a regex as its first argument",
        ));
    };
    let subject = args.param(1).to_string();
    let compiled = build_regex(&re.pattern, &re.flags)?;
    Ok(Value::Bool(compiled.is_match(&subject)))
}

fn build_regex(pattern: &str, flags: &str) -> Result<Regex, RuntimeError> {
    RegexBuilder::new(pattern)
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .dot_matches_new_line(flags.contains('s'))
        .build()
        .map_err(|e| {
            RuntimeError::throwable("LEP-R006", format!("invalid regex /{pattern}/: {e}"))
        })
}

/// Member calls pass the receiver after the last argument; read it back
/// off the tail of the window.
fn receiver(args: &CallArgs) -> Value {
    match args.params_size() {
        0 => Value::Undefined,
        n => args.param(n - 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::CompileOptions;
    use crate::{codegen, parser, semantic};

    fn eval(src: &str) -> Value {
        let mut chunk = parser::parse(src, "t").unwrap();
        semantic::analyze(&mut chunk, true, false).unwrap();
        let script =
            codegen::compile_chunk(&chunk, src, &CompileOptions::default()).unwrap();
        Context::new().execute(&script).unwrap()
    }

    #[test]
    fn array_is_array() {
        assert_eq!(eval("Array.isArray([1, 2]);"), Value::Bool(true));
        assert_eq!(eval("Array.isArray({});"), Value::Bool(false));
    }

    #[test]
    fn number_and_string_coercion() {
        assert_eq!(eval("Number('42');"), Value::Int64(42));
        assert_eq!(eval("String(3.5);"), Value::string("3.5"));
        assert_eq!(eval("typeof Number('nope');"), Value::string("number"));
    }

    #[test]
    fn regex_test_honors_flags() {
        assert_eq!(eval("RegExp.test(/ab+c/i, 'xABBCy');"), Value::Bool(true));
        assert_eq!(eval("RegExp.test(/ab+c/, 'xABBCy');"), Value::Bool(false));
    }

    #[test]
    fn invalid_regex_is_a_catchable_error() {
        let src = "var out = 'no'; try { RegExp.test(/(/, 'x'); } catch (e) { out = 'err'; } out;";
        assert_eq!(eval(src), Value::string("err"));
    }

    #[test]
    fn builtin_tables_are_const() {
        // writes to builtin containers are ignored outside strict mode
        assert_eq!(eval("Array.isArray = 5; typeof Array.isArray;"), Value::string("function"));
    }

    #[test]
    fn string_index_and_slice_methods() {
        assert_eq!(eval("'hello world'.indexOf('world');"), Value::Int64(6));
        assert_eq!(eval("'hello'.indexOf('z');"), Value::Int64(-1));
        assert_eq!(eval("'  pad  '.trim();"), Value::string("pad"));
        assert_eq!(eval("'abc'.charAt(1);"), Value::string("b"));
        assert_eq!(eval("'abcdef'.substr(1, 3);"), Value::string("bcd"));
        assert_eq!(eval("'abcdef'.substr(-2);"), Value::string("ef"));
        assert_eq!(eval("'abcdef'.substring(4, 1);"), Value::string("bcd"));
        assert_eq!(eval("'abcdef'.slice(1, -1);"), Value::string("bcde"));
    }

    #[test]
    fn string_split() {
        assert_eq!(eval("'a,b,c'.split(',').join('-');"), Value::string("a-b-c"));
        assert_eq!(eval("'abc'.split('').length;"), Value::Int64(3));
        assert_eq!(eval("'x'.split(',')[0];"), Value::string("x"));
    }

    #[test]
    fn string_regex_methods() {
        assert_eq!(eval("'tic tac toe'.search(/t[ao]/);"), Value::Int64(4));
        assert_eq!(eval("'abc'.search(/z/);"), Value::Int64(-1));
        assert_eq!(eval("'a1b2'.replace(/[0-9]/g, '#');"), Value::string("a#b#"));
        assert_eq!(eval("'a-b'.replace('-', '+');"), Value::string("a+b"));
        assert_eq!(
            eval(r"'john smith'.replace(/(\w+) (\w+)/, '$2 $1');"),
            Value::string("smith john")
        );
    }

    #[test]
    fn string_match_groups() {
        let m = eval(r"'a1b22'.match(/([a-z])(\d+)/);");
        let Value::Array(m) = m else { panic!("expected an array, got {m:?}") };
        assert_eq!(m.get(0), Value::string("a1"));
        assert_eq!(m.get(1), Value::string("a"));
        assert_eq!(m.get(2), Value::string("1"));
        assert_eq!(m.get(3), Value::Int64(0));
        assert_eq!(eval(r"'a1b2'.match(/\d/g).join('');"), Value::string("12"));
        assert_eq!(eval(r"'abc'.match(/\d/);"), Value::Nil);
    }

    #[test]
    fn array_stack_methods() {
        assert_eq!(eval("var a = [1]; a.push(2, 3);"), Value::Int64(3));
        assert_eq!(eval("var a = [1, 2]; a.pop(); a.length;"), Value::Int64(1));
        assert_eq!(eval("var a = [7, 8]; a.shift();"), Value::Int64(7));
        assert_eq!(eval("var a = [7, 8]; a.shift(); a[0];"), Value::Int64(8));
    }

    #[test]
    fn array_iteration_methods() {
        assert_eq!(
            eval("[1, 2, 3, 4].filter(function (n) { return n % 2 == 0; }).join(',');"),
            Value::string("2,4")
        );
        assert_eq!(
            eval("[1, 2, 3].map(function (n, i) { return n * 10 + i; }).join(',');"),
            Value::string("10,21,32")
        );
        assert_eq!(
            eval("[5, 6, 7].findIndex(function (n) { return n == 6; });"),
            Value::Int64(1)
        );
        assert_eq!(
            eval("[5, 6].find(function (n) { return n > 5; });"),
            Value::Int64(6)
        );
        assert_eq!(
            eval("var sum = 0; [1, 2, 3].forEach(function (n) { sum = sum + n; }); sum;"),
            Value::Int64(6)
        );
    }

    #[test]
    fn array_window_methods() {
        assert_eq!(eval("[1, 2, 3].includes(2);"), Value::Bool(true));
        assert_eq!(eval("[1, 2, 3].includes(1, 1);"), Value::Bool(false));
        assert_eq!(
            eval("[1, 2].concat([3, 4], 5).join('');"),
            Value::string("12345")
        );
        assert_eq!(
            eval("[1, 2, 3, 4].slice(1, -1).join('');"),
            Value::string("23")
        );
    }

    #[test]
    fn methods_through_optional_chains() {
        assert_eq!(
            eval("var a = null; typeof a?.push(1);"),
            Value::string("undefined")
        );
        assert_eq!(eval("var s = 'abc'; s?.indexOf('c');"), Value::Int64(2));
    }

    #[test]
    fn closure_methods_ignore_the_receiver_slot() {
        // member calls append the receiver past the declared parameters
        let src = "var t = {}; t.f = function (x) { return x + 1; }; t.f(41);";
        assert_eq!(eval(src), Value::Int64(42));
    }

    #[test]
    fn version_builtin_is_exposed() {
        let v = eval("__lepus_version__;");
        assert_eq!(v, Value::string(env!("CARGO_PKG_VERSION")));
    }
}
