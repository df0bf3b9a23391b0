//! Boundary between VM values and a host engine.
//!
//! Values owned by the host cross into the VM as `Value::Foreign`; the VM
//! never inspects their payload directly, it goes through the installed
//! [`ForeignRuntime`]. Conversion in either direction picks a
//! [`ConvertPolicy`] so callers decide between aliasing and snapshotting.

use std::any::Any;
use std::rc::Rc;

use crate::value::Value;

/// Coarse classification of a host value. The VM only needs enough to
/// answer truthiness, emptiness, and callability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForeignTag {
    Null,
    Undefined,
    Bool,
    Number,
    String,
    Array,
    Object,
    Function,
}

/// A host-owned value held by reference inside the VM.
pub trait ForeignValue {
    fn tag(&self) -> ForeignTag;

    /// Truthiness under script rules; tags without a payload answer from
    /// the tag alone.
    fn truthy(&self) -> bool {
        !matches!(self.tag(), ForeignTag::Null | ForeignTag::Undefined)
    }

    fn number(&self) -> f64 {
        f64::NAN
    }

    fn string(&self) -> Option<String> {
        None
    }

    fn display(&self) -> String;

    fn as_any(&self) -> &dyn Any;
}

/// How a value crosses the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConvertPolicy {
    /// Alias the underlying storage; mutations are visible on both sides.
    #[default]
    Share,
    /// Copy the top container, share the leaves.
    CloneShallow,
    /// Recursive copy; the sides are fully detached.
    CloneDeep,
}

/// Host-engine services the VM calls out to for foreign values. All entry
/// points are infallible except calls, which surface a host error message
/// that the VM rethrows as a script exception.
pub trait ForeignRuntime {
    /// Wrap a VM value for the host side.
    fn export(&self, value: &Value, policy: ConvertPolicy) -> Rc<dyn ForeignValue>;

    /// Materialize a host value as a VM value.
    fn import(&self, value: &dyn ForeignValue, policy: ConvertPolicy) -> Value;

    fn call_function(&self, f: &dyn ForeignValue, args: &[Value]) -> Result<Value, String>;

    fn get_property(&self, target: &dyn ForeignValue, key: &Value) -> Value;

    fn set_property(&self, target: &dyn ForeignValue, key: &Value, value: Value) -> bool;

    /// Visit the entries of a foreign object or array.
    fn iterate(&self, target: &dyn ForeignValue, visit: &mut dyn FnMut(Value, Value));
}

pub fn foreign_is_false(value: &dyn ForeignValue) -> bool {
    !value.truthy()
}

pub fn foreign_to_display(value: &dyn ForeignValue) -> String {
    value.display()
}

/// `==` between a foreign value and a native one: payload-bearing tags
/// compare by payload, container tags never equal native containers.
pub fn foreign_equals_native(foreign: &dyn ForeignValue, native: &Value) -> bool {
    match foreign.tag() {
        ForeignTag::Null => native.is_nil(),
        ForeignTag::Undefined => native.is_undefined(),
        ForeignTag::Bool => *native == Value::Bool(foreign.truthy()),
        ForeignTag::Number => native.is_number() && native.number() == foreign.number(),
        ForeignTag::String => match (foreign.string(), native.string_view()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Array, Table};

    /// A minimal in-crate host runtime backing foreign values with native
    /// containers. Stands in for a real JS engine in tests.
    struct MockValue {
        tag: ForeignTag,
        number: f64,
        string: Option<String>,
        object: Option<Rc<Table>>,
        func: Option<fn(&[Value]) -> Result<Value, String>>,
    }

    impl MockValue {
        fn null() -> Rc<MockValue> {
            Rc::new(MockValue {
                tag: ForeignTag::Null,
                number: f64::NAN,
                string: None,
                object: None,
                func: None,
            })
        }

        fn number(n: f64) -> Rc<MockValue> {
            Rc::new(MockValue {
                tag: ForeignTag::Number,
                number: n,
                string: None,
                object: None,
                func: None,
            })
        }

        fn object(table: Rc<Table>) -> Rc<MockValue> {
            Rc::new(MockValue {
                tag: ForeignTag::Object,
                number: f64::NAN,
                string: None,
                object: Some(table),
                func: None,
            })
        }

        fn function(f: fn(&[Value]) -> Result<Value, String>) -> Rc<MockValue> {
            Rc::new(MockValue {
                tag: ForeignTag::Function,
                number: f64::NAN,
                string: None,
                object: None,
                func: Some(f),
            })
        }
    }

    impl ForeignValue for MockValue {
        fn tag(&self) -> ForeignTag {
            self.tag
        }

        fn truthy(&self) -> bool {
            match self.tag {
                ForeignTag::Null | ForeignTag::Undefined => false,
                ForeignTag::Number => self.number != 0.0 && !self.number.is_nan(),
                ForeignTag::String => self.string.as_deref().is_some_and(|s| !s.is_empty()),
                _ => true,
            }
        }

        fn number(&self) -> f64 {
            self.number
        }

        fn string(&self) -> Option<String> {
            self.string.clone()
        }

        fn display(&self) -> String {
            format!("foreign<{:?}>", self.tag)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct MockRuntime;

    impl MockRuntime {
        fn downcast<'a>(target: &'a dyn ForeignValue) -> &'a MockValue {
            target.as_any().downcast_ref::<MockValue>().unwrap()
        }
    }

    impl ForeignRuntime for MockRuntime {
        fn export(&self, value: &Value, policy: ConvertPolicy) -> Rc<dyn ForeignValue> {
            match value {
                Value::Table(t) => {
                    let table = match policy {
                        ConvertPolicy::Share => t.clone(),
                        ConvertPolicy::CloneShallow | ConvertPolicy::CloneDeep => {
                            match value.clone_deep() {
                                Value::Table(copy) => copy,
                                _ => unreachable!(),
                            }
                        }
                    };
                    MockValue::object(table)
                }
                v if v.is_number() => MockValue::number(v.number()),
                _ => MockValue::null(),
            }
        }

        fn import(&self, value: &dyn ForeignValue, policy: ConvertPolicy) -> Value {
            let mock = Self::downcast(value);
            match mock.tag {
                ForeignTag::Null => Value::Nil,
                ForeignTag::Undefined => Value::Undefined,
                ForeignTag::Number => Value::from_number(mock.number),
                ForeignTag::String => mock
                    .string
                    .as_deref()
                    .map(Value::string)
                    .unwrap_or(Value::Undefined),
                ForeignTag::Object => {
                    let table = mock.object.clone().unwrap();
                    let shared = Value::Table(table);
                    match policy {
                        ConvertPolicy::Share => shared,
                        ConvertPolicy::CloneShallow => shared.clone_shallow(),
                        ConvertPolicy::CloneDeep => shared.clone_deep(),
                    }
                }
                _ => Value::Undefined,
            }
        }

        fn call_function(&self, f: &dyn ForeignValue, args: &[Value]) -> Result<Value, String> {
            match Self::downcast(f).func {
                Some(func) => func(args),
                None => Err("not a function".to_string()),
            }
        }

        fn get_property(&self, target: &dyn ForeignValue, key: &Value) -> Value {
            match &Self::downcast(target).object {
                Some(table) => Value::Table(table.clone()).get_property(key),
                None => Value::Undefined,
            }
        }

        fn set_property(&self, target: &dyn ForeignValue, key: &Value, value: Value) -> bool {
            match &Self::downcast(target).object {
                Some(table) => Value::Table(table.clone()).set_property(key, value),
                None => false,
            }
        }

        fn iterate(&self, target: &dyn ForeignValue, visit: &mut dyn FnMut(Value, Value)) {
            if let Some(table) = &Self::downcast(target).object {
                table.for_each(|k, v| visit(Value::string(k), v.clone()));
            }
        }
    }

    #[test]
    fn foreign_null_equals_native_nil() {
        let null = MockValue::null();
        assert_eq!(Value::Foreign(null), Value::Nil);
        assert_ne!(Value::Foreign(MockValue::number(1.0)), Value::Nil);
        assert_eq!(Value::Foreign(MockValue::number(3.0)), Value::Int64(3));
    }

    #[test]
    fn foreign_truthiness_follows_script_rules() {
        assert!(Value::Foreign(MockValue::null()).is_false());
        assert!(Value::Foreign(MockValue::number(0.0)).is_false());
        assert!(!Value::Foreign(MockValue::number(2.0)).is_false());
        // foreign null/undefined also count as empty
        assert!(Value::Foreign(MockValue::null()).is_empty());
    }

    #[test]
    fn import_policies_detach_or_share() {
        let rt = MockRuntime;
        let backing = Table::new();
        backing.set("n", Value::Int64(1));
        let foreign = MockValue::object(backing.clone());

        let shared = rt.import(&*foreign, ConvertPolicy::Share);
        let deep = rt.import(&*foreign, ConvertPolicy::CloneDeep);
        backing.set("n", Value::Int64(2));
        assert_eq!(shared.get_property(&Value::string("n")), Value::Int64(2));
        assert_eq!(deep.get_property(&Value::string("n")), Value::Int64(1));
    }

    #[test]
    fn export_round_trips_through_import() {
        let rt = MockRuntime;
        let t = Table::new();
        t.set("k", Value::string("v"));
        let exported = rt.export(&Value::Table(t), ConvertPolicy::Share);
        let back = rt.import(&*exported, ConvertPolicy::Share);
        assert_eq!(back.get_property(&Value::string("k")), Value::string("v"));
    }

    #[test]
    fn script_calls_a_foreign_function() {
        fn sum(args: &[Value]) -> Result<Value, String> {
            Ok(Value::from_number(
                args.iter().map(|v| v.number()).sum::<f64>(),
            ))
        }
        let mut ctx = crate::vm::Context::new();
        ctx.set_bridge_runtime(Rc::new(MockRuntime));
        ctx.register_global("hostSum", Value::Foreign(MockValue::function(sum)));
        let result = ctx
            .call_value(
                &ctx.get_global("hostSum").unwrap(),
                &[Value::Int64(2), Value::Int64(3)],
            )
            .unwrap();
        assert_eq!(result, Value::Int64(5));
    }

    #[test]
    fn script_member_access_routes_through_the_runtime() {
        let backing = Table::new();
        backing.set("answer", Value::Int64(42));
        let mut ctx = crate::vm::Context::new();
        ctx.set_bridge_runtime(Rc::new(MockRuntime));
        ctx.register_global("host", Value::Foreign(MockValue::object(backing.clone())));

        let mut chunk = crate::parser::parse("host.answer;", "t").unwrap();
        crate::semantic::analyze(&mut chunk, true, false).unwrap();
        let script = crate::codegen::compile_chunk(
            &chunk,
            "host.answer;",
            &crate::bytecode::CompileOptions::default(),
        )
        .unwrap();
        assert_eq!(ctx.execute(&script).unwrap(), Value::Int64(42));

        let mut chunk = crate::parser::parse("host.answer = 7;", "t").unwrap();
        crate::semantic::analyze(&mut chunk, true, false).unwrap();
        let script = crate::codegen::compile_chunk(
            &chunk,
            "host.answer = 7;",
            &crate::bytecode::CompileOptions::default(),
        )
        .unwrap();
        ctx.execute(&script).unwrap();
        assert_eq!(backing.get("answer"), Some(Value::Int64(7)));
    }

    #[test]
    fn iterate_visits_every_entry() {
        let backing = Table::new();
        backing.set("a", Value::Int64(1));
        backing.set("b", Value::Int64(2));
        let foreign = MockValue::object(backing);
        let rt = MockRuntime;
        let collected = Array::new();
        rt.iterate(&*foreign, &mut |k, v| {
            collected.push(k);
            collected.push(v);
        });
        assert_eq!(collected.len(), 4);
        assert_eq!(collected.get(0), Value::string("a"));
        assert_eq!(collected.get(3), Value::Int64(2));
    }
}
