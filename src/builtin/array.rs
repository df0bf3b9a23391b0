//! Array prototype methods. The receiver rides after the last argument.
//! Callbacks for the iteration methods are invoked with
//! `(element, index, array)`.

use std::rc::Rc;

use crate::value::{Array, Table, Value};
use crate::vm::{CallArgs, Context, RuntimeError};

pub fn prototype() -> Value {
    let table = Table::new();
    table.set("push", Value::CFunction(push));
    table.set("pop", Value::CFunction(pop));
    table.set("shift", Value::CFunction(shift));
    table.set("map", Value::CFunction(map));
    table.set("filter", Value::CFunction(filter));
    table.set("forEach", Value::CFunction(for_each));
    table.set("find", Value::CFunction(find));
    table.set("findIndex", Value::CFunction(find_index));
    table.set("concat", Value::CFunction(concat));
    table.set("join", Value::CFunction(join));
    table.set("includes", Value::CFunction(includes));
    table.set("slice", Value::CFunction(slice));
    let table = Value::Table(table);
    table.mark_const();
    table
}

fn this_array(args: &CallArgs) -> Result<Rc<Array>, RuntimeError> {
    match super::receiver(args) {
        Value::Array(a) => Ok(a),
        other => Err(RuntimeError::throwable(
            "LEP-R006",
            format!("array method called on {}", other.type_of()),
        )),
    }
}

fn arg_count(args: &CallArgs) -> usize {
    args.params_size().saturating_sub(1)
}

/// Appends every argument and returns the new length.
fn push(_ctx: &mut Context, args: &CallArgs) -> Result<Value, RuntimeError> {
    let this = this_array(args)?;
    for i in 0..arg_count(args) {
        this.push(args.param(i));
    }
    Ok(Value::Int64(this.len() as i64))
}

// returns the remaining length, not the removed element
fn pop(_ctx: &mut Context, args: &CallArgs) -> Result<Value, RuntimeError> {
    let this = this_array(args)?;
    this.pop();
    Ok(Value::Int64(this.len() as i64))
}

fn shift(_ctx: &mut Context, args: &CallArgs) -> Result<Value, RuntimeError> {
    let this = this_array(args)?;
    Ok(this.shift())
}

fn map(ctx: &mut Context, args: &CallArgs) -> Result<Value, RuntimeError> {
    let this = this_array(args)?;
    let callback = args.param(0);
    let out = Array::with_capacity(this.len());
    for i in 0..this.len() {
        let call_args = [this.get(i), Value::Int64(i as i64), Value::Array(this.clone())];
        out.push(ctx.call_value(&callback, &call_args)?);
    }
    Ok(Value::Array(out))
}

fn filter(ctx: &mut Context, args: &CallArgs) -> Result<Value, RuntimeError> {
    let this = this_array(args)?;
    let callback = args.param(0);
    let out = Array::new();
    for i in 0..this.len() {
        let element = this.get(i);
        let call_args = [
            element.clone(),
            Value::Int64(i as i64),
            Value::Array(this.clone()),
        ];
        if ctx.call_value(&callback, &call_args)?.bool() {
            out.push(element);
        }
    }
    Ok(Value::Array(out))
}

fn for_each(ctx: &mut Context, args: &CallArgs) -> Result<Value, RuntimeError> {
    let this = this_array(args)?;
    let callback = args.param(0);
    for i in 0..this.len() {
        let call_args = [this.get(i), Value::Int64(i as i64), Value::Array(this.clone())];
        ctx.call_value(&callback, &call_args)?;
    }
    Ok(Value::Undefined)
}

fn find(ctx: &mut Context, args: &CallArgs) -> Result<Value, RuntimeError> {
    let this = this_array(args)?;
    let callback = args.param(0);
    for i in 0..this.len() {
        let element = this.get(i);
        let call_args = [
            element.clone(),
            Value::Int64(i as i64),
            Value::Array(this.clone()),
        ];
        if ctx.call_value(&callback, &call_args)?.bool() {
            return Ok(element);
        }
    }
    Ok(Value::Undefined)
}

fn find_index(ctx: &mut Context, args: &CallArgs) -> Result<Value, RuntimeError> {
    let this = this_array(args)?;
    let callback = args.param(0);
    for i in 0..this.len() {
        let call_args = [this.get(i), Value::Int64(i as i64), Value::Array(this.clone())];
        if ctx.call_value(&callback, &call_args)?.bool() {
            return Ok(Value::Int64(i as i64));
        }
    }
    Ok(Value::Int64(-1))
}

/// New array with the receiver's elements followed by every argument,
/// array arguments flattened one level.
fn concat(_ctx: &mut Context, args: &CallArgs) -> Result<Value, RuntimeError> {
    let this = this_array(args)?;
    let out = Array::with_capacity(this.len() + arg_count(args));
    for i in 0..this.len() {
        out.push(this.get(i));
    }
    for i in 0..arg_count(args) {
        match args.param(i) {
            Value::Array(a) => {
                for j in 0..a.len() {
                    out.push(a.get(j));
                }
            }
            other => {
                out.push(other);
            }
        }
    }
    Ok(Value::Array(out))
}

fn join(_ctx: &mut Context, args: &CallArgs) -> Result<Value, RuntimeError> {
    let this = this_array(args)?;
    let separator = if arg_count(args) >= 1 {
        args.param(0).to_string()
    } else {
        ",".to_string()
    };
    let mut out = String::new();
    for i in 0..this.len() {
        if i > 0 {
            out.push_str(&separator);
        }
        out.push_str(&join_text(&this.get(i)));
    }
    Ok(Value::string(out))
}

/// Element rendering for `join`: empty holes for nil, undefined, and
/// functions; nested arrays joined with commas.
fn join_text(v: &Value) -> String {
    match v {
        Value::Nil | Value::Undefined => String::new(),
        Value::Closure(_) | Value::CFunction(_) | Value::CPointer(_) => String::new(),
        Value::Table(_) => "[object Object]".to_string(),
        Value::Array(a) => {
            let mut out = String::new();
            for i in 0..a.len() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&join_text(&a.get(i)));
            }
            out
        }
        other => other.to_string(),
    }
}

/// `includes(value[, from])`: negatives count from the end.
fn includes(_ctx: &mut Context, args: &CallArgs) -> Result<Value, RuntimeError> {
    let this = this_array(args)?;
    if arg_count(args) == 0 {
        return Ok(Value::Bool(false));
    }
    let needle = args.param(0);
    let mut start = 0i64;
    if arg_count(args) >= 2 {
        start = args.param(1).number() as i64;
        if start < 0 {
            start = (this.len() as i64 + start).max(0);
        }
    }
    for i in start as usize..this.len() {
        if this.get(i) == needle {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

/// `slice([start[, end]])`: negatives count from the end.
fn slice(_ctx: &mut Context, args: &CallArgs) -> Result<Value, RuntimeError> {
    let this = this_array(args)?;
    let len = this.len() as i64;
    let clamp = |raw: i64| -> usize {
        if raw < 0 {
            (len + raw).max(0) as usize
        } else {
            raw.min(len) as usize
        }
    };
    let start = if arg_count(args) >= 1 {
        clamp(args.param(0).number() as i64)
    } else {
        0
    };
    let end = if arg_count(args) >= 2 {
        clamp(args.param(1).number() as i64)
    } else {
        this.len()
    };
    let out = Array::new();
    for i in start..end {
        out.push(this.get(i));
    }
    Ok(Value::Array(out))
}
