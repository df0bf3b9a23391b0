use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

pub mod array;
pub mod table;

pub use array::Array;
pub use table::Table;

use crate::bridge::ForeignValue;
use crate::bytecode::Closure;

/// Host function signature. Arguments arrive through `CallArgs`; the returned
/// value lands in the caller's result register.
pub type CFunction =
    fn(&mut crate::vm::Context, &crate::vm::CallArgs) -> Result<Value, crate::vm::RuntimeError>;

/// Wire tags for the binary codec. The integer assignments are part of the
/// serialized ABI and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueType {
    Nil = 0,
    Double = 1,
    Bool = 2,
    String = 3,
    Table = 4,
    Array = 5,
    Closure = 6,
    CFunction = 7,
    CPointer = 8,
    Int32 = 9,
    Int64 = 10,
    UInt32 = 11,
    UInt64 = 12,
    NaN = 13,
    CDate = 14,
    RegExp = 15,
    Foreign = 16,
    Undefined = 17,
    ByteArray = 18,
    RefCounted = 19,
}

impl ValueType {
    pub fn from_u8(tag: u8) -> Option<ValueType> {
        Some(match tag {
            0 => ValueType::Nil,
            1 => ValueType::Double,
            2 => ValueType::Bool,
            3 => ValueType::String,
            4 => ValueType::Table,
            5 => ValueType::Array,
            6 => ValueType::Closure,
            7 => ValueType::CFunction,
            8 => ValueType::CPointer,
            9 => ValueType::Int32,
            10 => ValueType::Int64,
            11 => ValueType::UInt32,
            12 => ValueType::UInt64,
            13 => ValueType::NaN,
            14 => ValueType::CDate,
            15 => ValueType::RegExp,
            16 => ValueType::Foreign,
            17 => ValueType::Undefined,
            18 => ValueType::ByteArray,
            19 => ValueType::RefCounted,
            _ => return None,
        })
    }
}

/// Calendar date payload, field-for-field what the codec carries.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Date {
    pub year: i32,
    pub month: i32,
    pub day: i32,
    pub hour: i32,
    pub minute: i32,
    pub second: i32,
    pub weekday: i32,
    pub yearday: i32,
    pub is_dst: i32,
    pub ms: i32,
    pub language: i32,
    pub gmtoff: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegExp {
    pub pattern: String,
    pub flags: String,
}

/// Tagged dynamic value. Containers share ownership through `Rc` and mutate
/// through interior mutability; dropping the last reference releases the
/// payload deterministically.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Undefined,
    Bool(bool),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    /// Source-level NaN token; distinguishable from `Double(f64::NAN)`.
    NaN(bool),
    String(Rc<str>),
    Table(Rc<Table>),
    Array(Rc<Array>),
    Closure(Rc<Closure>),
    CFunction(CFunction),
    CPointer(usize),
    Date(Rc<Date>),
    RegExp(Rc<RegExp>),
    ByteArray(Rc<RefCell<Vec<u8>>>),
    RefCounted(Rc<dyn Any>),
    Foreign(Rc<dyn ForeignValue>),
}

impl Value {
    pub fn string(s: impl AsRef<str>) -> Value {
        Value::String(Rc::from(s.as_ref()))
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Nil => ValueType::Nil,
            Value::Undefined => ValueType::Undefined,
            Value::Bool(_) => ValueType::Bool,
            Value::Int32(_) => ValueType::Int32,
            Value::UInt32(_) => ValueType::UInt32,
            Value::Int64(_) => ValueType::Int64,
            Value::UInt64(_) => ValueType::UInt64,
            Value::Double(_) => ValueType::Double,
            Value::NaN(_) => ValueType::NaN,
            Value::String(_) => ValueType::String,
            Value::Table(_) => ValueType::Table,
            Value::Array(_) => ValueType::Array,
            Value::Closure(_) => ValueType::Closure,
            Value::CFunction(_) => ValueType::CFunction,
            Value::CPointer(_) => ValueType::CPointer,
            Value::Date(_) => ValueType::CDate,
            Value::RegExp(_) => ValueType::RegExp,
            Value::ByteArray(_) => ValueType::ByteArray,
            Value::RefCounted(_) => ValueType::RefCounted,
            Value::Foreign(_) => ValueType::Foreign,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Nil or undefined; also a foreign null/undefined.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Nil | Value::Undefined => true,
            Value::Foreign(f) => matches!(
                f.tag(),
                crate::bridge::ForeignTag::Null | crate::bridge::ForeignTag::Undefined
            ),
            _ => false,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(
            self,
            Value::Int32(_)
                | Value::UInt32(_)
                | Value::Int64(_)
                | Value::UInt64(_)
                | Value::Double(_)
        )
    }

    /// Only the signed 64-bit variant keeps integer arithmetic integral.
    pub fn is_int64(&self) -> bool {
        matches!(self, Value::Int64(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Value::String(_))
    }

    pub fn is_table(&self) -> bool {
        matches!(self, Value::Table(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    pub fn is_closure(&self) -> bool {
        matches!(self, Value::Closure(_))
    }

    pub fn is_callable(&self) -> bool {
        match self {
            Value::Closure(_) | Value::CFunction(_) => true,
            Value::Foreign(f) => matches!(f.tag(), crate::bridge::ForeignTag::Function),
            _ => false,
        }
    }

    /// Coerce to double. Non-numeric, non-parsable values become NaN.
    pub fn number(&self) -> f64 {
        match self {
            Value::Int32(n) => *n as f64,
            Value::UInt32(n) => *n as f64,
            Value::Int64(n) => *n as f64,
            Value::UInt64(n) => *n as f64,
            Value::Double(n) => *n,
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::String(s) => s.trim().parse::<f64>().unwrap_or(f64::NAN),
            _ => f64::NAN,
        }
    }

    pub fn int64(&self) -> i64 {
        match self {
            Value::Int32(n) => *n as i64,
            Value::UInt32(n) => *n as i64,
            Value::Int64(n) => *n,
            Value::UInt64(n) => *n as i64,
            Value::Double(n) => *n as i64,
            _ => 0,
        }
    }

    /// Wrap a double, narrowing to Int64 when the payload is integral. This is
    /// how codegen and arithmetic keep whole numbers integer-typed.
    pub fn from_number(n: f64) -> Value {
        if n.is_finite() && n == (n as i64) as f64 {
            Value::Int64(n as i64)
        } else {
            Value::Double(n)
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Value::String(s) => s,
            _ => panic!("value is not a string: {:?}", self.value_type()),
        }
    }

    pub fn string_view(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Truthiness: false, nil, undefined, NaN, numeric zero, and the empty
    /// string are falsy; everything else is truthy.
    pub fn bool(&self) -> bool {
        !self.is_false()
    }

    pub fn is_false(&self) -> bool {
        match self {
            Value::Nil | Value::Undefined | Value::NaN(_) => true,
            Value::Bool(b) => !*b,
            Value::String(s) => s.is_empty(),
            Value::Foreign(f) => crate::bridge::foreign_is_false(&**f),
            v if v.is_number() => v.number() == 0.0,
            _ => false,
        }
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Nil | Value::Table(_) | Value::Array(_) => "object",
            Value::Bool(_) => "boolean",
            Value::NaN(_) => "number",
            v if v.is_number() => "number",
            Value::String(_) => "string",
            Value::Closure(_) | Value::CFunction(_) => "function",
            Value::Foreign(_) => "lepusobject",
            _ => "object",
        }
    }

    /// Strict (`===`) equality: numeric compares only against numeric, and no
    /// other cross-tag coercion is performed.
    pub fn abs_equals(&self, other: &Value) -> bool {
        if self.is_number() != other.is_number() {
            return false;
        }
        self == other
    }

    /// Shallow clone: a fresh container skeleton is not built; container arms
    /// just gain a reference. Matches the "share leaves" contract.
    pub fn clone_shallow(&self) -> Value {
        self.clone()
    }

    /// Deep clone: containers are rebuilt recursively; strings stay shared.
    pub fn clone_deep(&self) -> Value {
        match self {
            Value::Table(t) => {
                let copy = Table::new();
                t.for_each(|k, v| {
                    copy.set(k, v.clone_deep());
                });
                Value::Table(copy)
            }
            Value::Array(a) => {
                let copy = Array::with_capacity(a.len());
                a.for_each(|_, v| {
                    copy.push(v.clone_deep());
                });
                Value::Array(copy)
            }
            Value::ByteArray(b) => Value::ByteArray(Rc::new(RefCell::new(b.borrow().clone()))),
            other => other.clone(),
        }
    }

    /// Recursively mark containers immutable. Writes afterwards fail and are
    /// reported through the context error channel.
    pub fn mark_const(&self) {
        match self {
            Value::Table(t) => {
                if !t.is_const() {
                    t.for_each(|_, v| v.mark_const());
                    t.mark_const();
                }
            }
            Value::Array(a) => {
                if !a.is_const() {
                    a.for_each(|_, v| v.mark_const());
                    a.mark_const();
                }
            }
            _ => {}
        }
    }

    /// Property read with an integer or string key. Missing members yield
    /// `undefined`; the VM downgrades to nil when configured.
    pub fn get_property(&self, key: &Value) -> Value {
        match (self, key) {
            (Value::Array(a), k) if k.is_number() => {
                let idx = k.number();
                if idx < 0.0 {
                    Value::Undefined
                } else {
                    a.get(idx as usize)
                }
            }
            (Value::Array(a), Value::String(s)) if &**s == "length" => {
                Value::Int64(a.len() as i64)
            }
            (Value::Table(t), Value::String(s)) => t.get(s).unwrap_or(Value::Undefined),
            (Value::Table(t), k) if k.is_number() => {
                t.get(&format_number(k.number())).unwrap_or(Value::Undefined)
            }
            (Value::String(s), Value::String(k)) if &**k == "length" => {
                Value::Int64(s.chars().count() as i64)
            }
            (Value::String(s), k) if k.is_number() => {
                let idx = k.number() as usize;
                match s.chars().nth(idx) {
                    Some(c) => Value::string(c.to_string()),
                    None => Value::string(""),
                }
            }
            _ => Value::Undefined,
        }
    }

    pub fn set_property(&self, key: &Value, value: Value) -> bool {
        match (self, key) {
            (Value::Table(t), Value::String(s)) => t.set(s, value),
            (Value::Table(t), k) if k.is_number() => t.set(&format_number(k.number()), value),
            (Value::Array(a), k) if k.is_number() => {
                let idx = k.number();
                if idx < 0.0 {
                    false
                } else {
                    a.set(idx as usize, value)
                }
            }
            _ => false,
        }
    }
}

/// Walk `target` along `path` (table keys, array indices) and store `update`
/// at the final segment. Any mismatch fails without panicking.
pub fn update_value_by_path(target: &Value, update: &Value, path: &[String]) -> bool {
    let Some((last, prefix)) = path.split_last() else {
        return false;
    };
    let mut cursor = target.clone();
    for segment in prefix {
        let next = match &cursor {
            Value::Table(t) => match t.get(segment) {
                Some(v) => v,
                None => {
                    // Missing intermediate tables are created on the way down.
                    let fresh = Value::Table(Table::new());
                    if !t.set(segment, fresh.clone()) {
                        return false;
                    }
                    fresh
                }
            },
            Value::Array(a) => match segment.parse::<usize>() {
                Ok(idx) if idx < a.len() => a.get(idx),
                _ => return false,
            },
            _ => return false,
        };
        cursor = next;
    }
    match &cursor {
        Value::Table(t) => t.set(last, update.clone()),
        Value::Array(a) => match last.parse::<usize>() {
            Ok(idx) => a.set(idx, update.clone()),
            Err(_) => false,
        },
        _ => false,
    }
}

/// Integer-like doubles print without a fractional part, the way script
/// number-to-string coercion works.
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n == (n as i64) as f64 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Undefined, Value::Undefined) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::NaN(_), Value::NaN(_)) => false,
            (a, b) if a.is_number() && b.is_number() => {
                if let (Value::Int64(x), Value::Int64(y)) = (a, b) {
                    x == y
                } else {
                    a.number() == b.number()
                }
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                if a.len() != b.len() {
                    return false;
                }
                let mut equal = true;
                a.for_each(|i, v| {
                    if equal && b.get(i) != *v {
                        equal = false;
                    }
                });
                equal
            }
            (Value::Table(a), Value::Table(b)) => {
                if a.len() != b.len() {
                    return false;
                }
                let mut equal = true;
                a.for_each(|k, v| {
                    if equal {
                        match b.get(k) {
                            Some(bv) if bv == *v => {}
                            _ => equal = false,
                        }
                    }
                });
                equal
            }
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::CFunction(a), Value::CFunction(b)) => std::ptr::fn_addr_eq(*a, *b),
            (Value::CPointer(a), Value::CPointer(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::RegExp(a), Value::RegExp(b)) => a == b,
            (Value::ByteArray(a), Value::ByteArray(b)) => *a.borrow() == *b.borrow(),
            (Value::RefCounted(a), Value::RefCounted(b)) => {
                Rc::ptr_eq(a, b)
            }
            (Value::Foreign(a), b) => crate::bridge::foreign_equals_native(&**a, b),
            (a, Value::Foreign(b)) => crate::bridge::foreign_equals_native(&**b, a),
            _ => false,
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Nil => write!(f, "null"),
            Value::Undefined => write!(f, "undefined"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::NaN(_) => write!(f, "NaN"),
            Value::Int32(_)
            | Value::UInt32(_)
            | Value::Int64(_)
            | Value::UInt64(_)
            | Value::Double(_) => write!(f, "{}", format_number(self.number())),
            Value::String(s) => write!(f, "{}", s),
            Value::Array(a) => {
                write!(f, "[")?;
                let len = a.len();
                for i in 0..len {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a.get(i))?;
                }
                write!(f, "]")
            }
            Value::Table(t) => {
                write!(f, "{{")?;
                let keys = t.keys();
                for (i, k) in keys.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, t.get(k).unwrap_or(Value::Undefined))?;
                }
                write!(f, "}}")
            }
            Value::Closure(c) => write!(f, "function {}", c.function().name()),
            Value::CFunction(_) => write!(f, "function <native>"),
            Value::CPointer(p) => write!(f, "cpointer({:#x})", p),
            Value::Date(d) => write!(
                f,
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                d.year, d.month, d.day, d.hour, d.minute, d.second
            ),
            Value::RegExp(r) => write!(f, "/{}/{}", r.pattern, r.flags),
            Value::ByteArray(b) => write!(f, "bytearray({})", b.borrow().len()),
            Value::RefCounted(_) => write!(f, "refcounted"),
            Value::Foreign(v) => write!(f, "{}", crate::bridge::foreign_to_display(&**v)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_cross_variant_equality() {
        assert_eq!(Value::Int32(3), Value::Double(3.0));
        assert_eq!(Value::UInt64(7), Value::Int64(7));
        assert_ne!(Value::Int64(3), Value::string("3"));
    }

    #[test]
    fn nan_token_never_equals_itself() {
        assert_ne!(Value::NaN(true), Value::NaN(true));
        assert!(Value::NaN(true).is_false());
    }

    #[test]
    fn truthiness_table() {
        assert!(Value::Int64(1).bool());
        assert!(Value::string("x").bool());
        assert!(!Value::Int64(0).bool());
        assert!(!Value::string("").bool());
        assert!(!Value::Nil.bool());
        assert!(!Value::Undefined.bool());
        assert!(Value::Array(Array::new()).bool());
    }

    #[test]
    fn string_coerces_to_number() {
        assert_eq!(Value::string("42").number(), 42.0);
        assert!(Value::string("wat").number().is_nan());
        assert!(Value::Undefined.number().is_nan());
        assert_eq!(Value::Bool(true).number(), 1.0);
    }

    #[test]
    fn deep_clone_detaches_containers() {
        let t = Table::new();
        t.set("a", Value::Int64(1));
        let original = Value::Table(t.clone());
        let copy = original.clone_deep();
        t.set("a", Value::Int64(2));
        assert_eq!(copy.get_property(&Value::string("a")), Value::Int64(1));
        assert_eq!(original.get_property(&Value::string("a")), Value::Int64(2));
    }

    #[test]
    fn shallow_clone_shares_containers() {
        let t = Table::new();
        t.set("a", Value::Int64(1));
        let original = Value::Table(t.clone());
        let copy = original.clone_shallow();
        t.set("a", Value::Int64(2));
        assert_eq!(copy.get_property(&Value::string("a")), Value::Int64(2));
    }

    #[test]
    fn path_update_walks_tables_and_arrays() {
        let inner = Array::new();
        inner.push(Value::Int64(1));
        let t = Table::new();
        t.set("xs", Value::Array(inner));
        let root = Value::Table(t);
        let path = vec!["xs".to_string(), "0".to_string()];
        assert!(update_value_by_path(&root, &Value::Int64(9), &path));
        assert_eq!(
            root.get_property(&Value::string("xs"))
                .get_property(&Value::Int64(0)),
            Value::Int64(9)
        );
        // mismatched traversal fails quietly
        let bad = vec!["xs".to_string(), "nope".to_string()];
        assert!(!update_value_by_path(&root, &Value::Int64(1), &bad));
    }

    #[test]
    fn every_numeric_variant_displays_as_a_number() {
        assert_eq!(Value::Int32(-3).to_string(), "-3");
        assert_eq!(Value::UInt32(7).to_string(), "7");
        assert_eq!(Value::Int64(42).to_string(), "42");
        assert_eq!(Value::UInt64(9).to_string(), "9");
        assert_eq!(Value::Double(3.5).to_string(), "3.5");
        assert_eq!(Value::NaN(true).to_string(), "NaN");
    }

    #[test]
    fn deep_equality_on_tables_ignores_order_of_comparison() {
        let a = Table::new();
        a.set("x", Value::Int64(1));
        a.set("y", Value::Int64(2));
        let b = Table::new();
        b.set("x", Value::Int64(1));
        b.set("y", Value::Int64(2));
        assert_eq!(Value::Table(a), Value::Table(b));
    }
}
