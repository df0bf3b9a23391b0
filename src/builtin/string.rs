//! String prototype methods. Member calls pass the receiver after the
//! last argument, so every method here reads its string from the tail of
//! the window. Indices are character positions, not byte offsets.

use std::rc::Rc;

use crate::value::{Array, Table, Value};
use crate::vm::{CallArgs, Context, RuntimeError};

pub fn prototype() -> Value {
    let table = Table::new();
    table.set("indexOf", Value::CFunction(index_of));
    table.set("charAt", Value::CFunction(char_at));
    table.set("trim", Value::CFunction(trim));
    table.set("substr", Value::CFunction(substr));
    table.set("substring", Value::CFunction(substring));
    table.set("slice", Value::CFunction(slice));
    table.set("split", Value::CFunction(split));
    table.set("search", Value::CFunction(search));
    table.set("match", Value::CFunction(do_match));
    table.set("replace", Value::CFunction(replace));
    let table = Value::Table(table);
    table.mark_const();
    table
}

fn this_str(args: &CallArgs) -> Result<Rc<str>, RuntimeError> {
    match super::receiver(args) {
        Value::String(s) => Ok(s),
        other => Err(RuntimeError::throwable(
            "LEP-R006",
            format!("string method called on {}", other.type_of()),
        )),
    }
}

/// Arguments visible to the method, receiver excluded.
fn arg_count(args: &CallArgs) -> usize {
    args.params_size().saturating_sub(1)
}

fn byte_at(s: &str, char_index: usize) -> usize {
    s.char_indices()
        .nth(char_index)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

fn chars_before(s: &str, byte_index: usize) -> usize {
    s[..byte_index].chars().count()
}

/// Clamp a possibly negative index against a length, counting negatives
/// from the end.
fn clamp_index(index: i64, len: usize) -> usize {
    if index < 0 {
        (len as i64 + index).max(0) as usize
    } else {
        (index as usize).min(len)
    }
}

fn index_of(_ctx: &mut Context, args: &CallArgs) -> Result<Value, RuntimeError> {
    let s = this_str(args)?;
    let needle = args.param(0).to_string();
    let from = if arg_count(args) >= 2 {
        args.param(1).number().max(0.0) as usize
    } else {
        0
    };
    let start = byte_at(&s, from);
    match s[start..].find(&needle) {
        Some(pos) => Ok(Value::Int64(chars_before(&s, start + pos) as i64)),
        None => Ok(Value::Int64(-1)),
    }
}

fn char_at(_ctx: &mut Context, args: &CallArgs) -> Result<Value, RuntimeError> {
    let s = this_str(args)?;
    let pos = if arg_count(args) >= 1 {
        args.param(0).number()
    } else {
        0.0
    };
    if pos < 0.0 {
        return Ok(Value::string(""));
    }
    match s.chars().nth(pos as usize) {
        Some(c) => Ok(Value::string(c.to_string())),
        None => Ok(Value::string("")),
    }
}

// trims spaces only, not general whitespace
fn trim(_ctx: &mut Context, args: &CallArgs) -> Result<Value, RuntimeError> {
    let s = this_str(args)?;
    Ok(Value::string(s.trim_matches(' ')))
}

/// `substr(start[, length])`.
fn substr(_ctx: &mut Context, args: &CallArgs) -> Result<Value, RuntimeError> {
    let s = this_str(args)?;
    let n = s.chars().count();
    let raw = args.param(0).number() as i64;
    let start = if raw < 0 {
        if raw.unsigned_abs() as usize > n {
            0
        } else {
            (n as i64 + raw) as usize
        }
    } else {
        raw as usize
    };
    let from = byte_at(&s, start);
    if arg_count(args) >= 2 {
        let len = args.param(1).number() as i64;
        if len <= 0 {
            return Ok(Value::string(""));
        }
        let to = byte_at(&s, start + len as usize);
        Ok(Value::string(&s[from..to]))
    } else {
        Ok(Value::string(&s[from..]))
    }
}

/// `substring(start[, end])`: out-of-order bounds swap, negatives clamp
/// to zero.
fn substring(_ctx: &mut Context, args: &CallArgs) -> Result<Value, RuntimeError> {
    let s = this_str(args)?;
    let n = s.chars().count();
    let mut start = args.param(0).number() as i64;
    let mut end = if arg_count(args) >= 2 {
        args.param(1).number() as i64
    } else {
        n as i64
    };
    if start > end {
        std::mem::swap(&mut start, &mut end);
    }
    let start = (start.max(0) as usize).min(n);
    let end = (end.max(0) as usize).min(n);
    Ok(Value::string(&s[byte_at(&s, start)..byte_at(&s, end)]))
}

/// `slice([start[, end]])`: negatives count from the end.
fn slice(_ctx: &mut Context, args: &CallArgs) -> Result<Value, RuntimeError> {
    let s = this_str(args)?;
    if arg_count(args) == 0 {
        return Ok(Value::String(s));
    }
    let n = s.chars().count();
    let start = clamp_index(args.param(0).number() as i64, n);
    let end = if arg_count(args) >= 2 {
        clamp_index(args.param(1).number() as i64, n)
    } else {
        n
    };
    if start >= end {
        return Ok(Value::string(""));
    }
    Ok(Value::string(&s[byte_at(&s, start)..byte_at(&s, end)]))
}

/// `split(separator[, limit])`.
fn split(_ctx: &mut Context, args: &CallArgs) -> Result<Value, RuntimeError> {
    let s = this_str(args)?;
    let out = Array::new();
    if arg_count(args) == 0 {
        out.push(Value::String(s));
        return Ok(Value::Array(out));
    }
    let sep = args.param(0).to_string();
    let limit = if arg_count(args) >= 2 {
        args.param(1).number().max(0.0) as usize
    } else {
        usize::MAX
    };
    if sep.is_empty() {
        for c in s.chars().take(limit) {
            out.push(Value::string(c.to_string()));
        }
    } else {
        for piece in s.split(sep.as_str()).take(limit) {
            out.push(Value::string(piece));
        }
    }
    Ok(Value::Array(out))
}

fn pattern_of(v: &Value) -> (String, String) {
    match v {
        Value::RegExp(r) => (r.pattern.clone(), r.flags.clone()),
        other => (other.to_string(), String::new()),
    }
}

/// First match position as a character index, `-1` when nothing matches.
fn search(_ctx: &mut Context, args: &CallArgs) -> Result<Value, RuntimeError> {
    let s = this_str(args)?;
    if arg_count(args) == 0 {
        return Ok(Value::Int64(0));
    }
    let (pattern, flags) = pattern_of(&args.param(0));
    let re = super::build_regex(&pattern, &flags)?;
    match re.find(&s) {
        Some(m) => Ok(Value::Int64(chars_before(&s, m.start()) as i64)),
        None => Ok(Value::Int64(-1)),
    }
}

/// Non-global: `[match, captures.., index, input]`. Global: every match.
/// No match yields nil.
fn do_match(_ctx: &mut Context, args: &CallArgs) -> Result<Value, RuntimeError> {
    let s = this_str(args)?;
    let out = Array::new();
    if arg_count(args) == 0 {
        out.push(Value::string(""));
        out.push(Value::Int64(0));
        out.push(Value::String(s));
        return Ok(Value::Array(out));
    }
    let (pattern, flags) = pattern_of(&args.param(0));
    let re = super::build_regex(&pattern, &flags)?;
    if flags.contains('g') {
        for m in re.find_iter(&s) {
            out.push(Value::string(m.as_str()));
        }
        if out.is_empty() {
            return Ok(Value::Nil);
        }
    } else {
        let Some(caps) = re.captures(&s) else {
            return Ok(Value::Nil);
        };
        let full = caps.get(0).unwrap();
        out.push(Value::string(full.as_str()));
        for cap in caps.iter().skip(1) {
            out.push(match cap {
                Some(m) => Value::string(m.as_str()),
                None => Value::Undefined,
            });
        }
        out.push(Value::Int64(chars_before(&s, full.start()) as i64));
        out.push(Value::String(s.clone()));
    }
    Ok(Value::Array(out))
}

/// `replace(pattern, replacement)`: string patterns replace the first
/// occurrence only; regexes honor the `g` flag; a closure replacement is
/// called with `(match, captures.., offset, input)`.
fn replace(ctx: &mut Context, args: &CallArgs) -> Result<Value, RuntimeError> {
    let s = this_str(args)?;
    let pattern = args.param(0);
    let repl = args.param(1);

    if let Value::String(needle) = &pattern {
        // string pattern with a function replacement stays untouched
        if repl.is_callable() {
            return Ok(Value::String(s));
        }
        let repl = replacement_text(&repl);
        let Some(pos) = s.find(&**needle) else {
            return Ok(Value::String(s));
        };
        let end = pos + needle.len();
        let mut out = String::with_capacity(s.len());
        out.push_str(&s[..pos]);
        out.push_str(&expand_dollars(&repl, &s, &s[pos..end], &[], pos, end));
        out.push_str(&s[end..]);
        return Ok(Value::string(out));
    }

    let (pattern, flags) = pattern_of(&pattern);
    let re = super::build_regex(&pattern, &flags)?;
    let global = flags.contains('g');
    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in re.captures_iter(&s) {
        let full = caps.get(0).unwrap();
        out.push_str(&s[last..full.start()]);
        if repl.is_callable() {
            let mut call_args = vec![Value::string(full.as_str())];
            for cap in caps.iter().skip(1) {
                call_args.push(match cap {
                    Some(m) => Value::string(m.as_str()),
                    None => Value::Undefined,
                });
            }
            call_args.push(Value::Int64(chars_before(&s, full.start()) as i64));
            call_args.push(Value::String(s.clone()));
            out.push_str(&ctx.call_value(&repl, &call_args)?.to_string());
        } else {
            let groups: Vec<Option<String>> = caps
                .iter()
                .map(|c| c.map(|m| m.as_str().to_string()))
                .collect();
            out.push_str(&expand_dollars(
                &replacement_text(&repl),
                &s,
                full.as_str(),
                &groups,
                full.start(),
                full.end(),
            ));
        }
        last = full.end();
        if !global {
            break;
        }
    }
    out.push_str(&s[last..]);
    Ok(Value::string(out))
}

fn replacement_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.to_string(),
        Value::Nil => "null".to_string(),
        Value::Undefined => "undefined".to_string(),
        _ => String::new(),
    }
}

/// `$$`, `$&`, `` $` ``, `$'`, and `$n` substitution in replacement
/// strings.
fn expand_dollars(
    repl: &str,
    input: &str,
    matched: &str,
    groups: &[Option<String>],
    start: usize,
    end: usize,
) -> String {
    let mut out = String::with_capacity(repl.len());
    let mut it = repl.chars().peekable();
    while let Some(c) = it.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match it.peek() {
            Some('$') => {
                it.next();
                out.push('$');
            }
            Some('&') => {
                it.next();
                out.push_str(matched);
            }
            Some('`') => {
                it.next();
                out.push_str(&input[..start]);
            }
            Some('\'') => {
                it.next();
                out.push_str(&input[end..]);
            }
            Some(d) if d.is_ascii_digit() => {
                let mut n = 0usize;
                while let Some(d) = it.peek().and_then(|c| c.to_digit(10)) {
                    n = n * 10 + d as usize;
                    it.next();
                }
                if let Some(Some(g)) = groups.get(n) {
                    out.push_str(g);
                }
            }
            _ => out.push('$'),
        }
    }
    out
}
