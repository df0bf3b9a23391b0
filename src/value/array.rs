use std::cell::{Cell, RefCell};
use std::rc::Rc;

use super::Value;

/// Zero-indexed dense sequence. Out-of-range reads yield `undefined`;
/// out-of-range writes grow the array with nil fill.
pub struct Array {
    items: RefCell<Vec<Value>>,
    is_const: Cell<bool>,
}

impl Array {
    pub fn new() -> Rc<Array> {
        Rc::new(Array {
            items: RefCell::new(Vec::new()),
            is_const: Cell::new(false),
        })
    }

    pub fn with_capacity(capacity: usize) -> Rc<Array> {
        Rc::new(Array {
            items: RefCell::new(Vec::with_capacity(capacity)),
            is_const: Cell::new(false),
        })
    }

    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_const(&self) -> bool {
        self.is_const.get()
    }

    pub fn mark_const(&self) {
        self.is_const.set(true);
    }

    pub fn get(&self, index: usize) -> Value {
        self.items
            .borrow()
            .get(index)
            .cloned()
            .unwrap_or(Value::Undefined)
    }

    pub fn set(&self, index: usize, value: Value) -> bool {
        if self.is_const.get() {
            return false;
        }
        let mut items = self.items.borrow_mut();
        if index >= items.len() {
            items.resize(index + 1, Value::Nil);
        }
        items[index] = value;
        true
    }

    pub fn push(&self, value: Value) -> bool {
        if self.is_const.get() {
            return false;
        }
        self.items.borrow_mut().push(value);
        true
    }

    pub fn pop(&self) -> Value {
        if self.is_const.get() {
            return Value::Undefined;
        }
        self.items.borrow_mut().pop().unwrap_or(Value::Undefined)
    }

    /// Remove and return the first element.
    pub fn shift(&self) -> Value {
        if self.is_const.get() {
            return Value::Undefined;
        }
        let mut items = self.items.borrow_mut();
        if items.is_empty() {
            Value::Undefined
        } else {
            items.remove(0)
        }
    }

    pub fn resize(&self, len: usize) {
        self.items.borrow_mut().resize(len, Value::Nil);
    }

    pub fn for_each(&self, mut visit: impl FnMut(usize, &Value)) {
        let len = self.len();
        for i in 0..len {
            let value = self.items.borrow()[i].clone();
            visit(i, &value);
        }
    }
}

impl std::fmt::Debug for Array {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.items.borrow().iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_read_is_undefined() {
        let a = Array::new();
        a.push(Value::Int64(1));
        assert_eq!(a.get(0), Value::Int64(1));
        assert_eq!(a.get(5), Value::Undefined);
    }

    #[test]
    fn sparse_write_grows_with_nil() {
        let a = Array::new();
        a.set(2, Value::Int64(9));
        assert_eq!(a.len(), 3);
        assert_eq!(a.get(0), Value::Nil);
        assert_eq!(a.get(2), Value::Int64(9));
    }
}
