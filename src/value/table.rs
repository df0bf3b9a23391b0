use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use super::Value;

/// Insertion-ordered string-keyed map. Iteration always replays keys in the
/// order they were first inserted; overwriting a key keeps its original slot.
pub struct Table {
    entries: RefCell<Vec<(Rc<str>, Value)>>,
    index: RefCell<HashMap<Rc<str>, usize>>,
    is_const: Cell<bool>,
}

impl Table {
    pub fn new() -> Rc<Table> {
        Rc::new(Table {
            entries: RefCell::new(Vec::new()),
            index: RefCell::new(HashMap::new()),
            is_const: Cell::new(false),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
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

    pub fn contains(&self, key: &str) -> bool {
        self.index.borrow().contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let index = self.index.borrow();
        let slot = *index.get(key)?;
        Some(self.entries.borrow()[slot].1.clone())
    }

    /// Returns false (and leaves the table untouched) when the table is
    /// const-marked.
    pub fn set(&self, key: &str, value: Value) -> bool {
        if self.is_const.get() {
            return false;
        }
        let mut index = self.index.borrow_mut();
        match index.get(key) {
            Some(&slot) => self.entries.borrow_mut()[slot].1 = value,
            None => {
                let key: Rc<str> = Rc::from(key);
                let mut entries = self.entries.borrow_mut();
                index.insert(key.clone(), entries.len());
                entries.push((key, value));
            }
        }
        true
    }

    pub fn key_at(&self, slot: usize) -> Option<Rc<str>> {
        self.entries.borrow().get(slot).map(|(k, _)| k.clone())
    }

    pub fn value_at(&self, slot: usize) -> Option<Value> {
        self.entries.borrow().get(slot).map(|(_, v)| v.clone())
    }

    pub fn for_each(&self, mut visit: impl FnMut(&str, &Value)) {
        // Snapshot length first so a visitor that inserts does not loop forever.
        let len = self.len();
        for slot in 0..len {
            let (key, value) = {
                let entries = self.entries.borrow();
                (entries[slot].0.clone(), entries[slot].1.clone())
            };
            visit(&key, &value);
        }
    }

    pub fn keys(&self) -> Vec<Rc<str>> {
        self.entries.borrow().iter().map(|(k, _)| k.clone()).collect()
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (k, v) in self.entries.borrow().iter() {
            map.entry(&&**k, v);
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_insertion_order() {
        let t = Table::new();
        t.set("b", Value::Int64(1));
        t.set("a", Value::Int64(2));
        t.set("b", Value::Int64(3));
        let keys: Vec<String> = t.keys().iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(t.get("b"), Some(Value::Int64(3)));
    }

    #[test]
    fn const_blocks_writes() {
        let t = Table::new();
        t.set("x", Value::Int64(1));
        t.mark_const();
        assert!(!t.set("x", Value::Int64(2)));
        assert_eq!(t.get("x"), Some(Value::Int64(1)));
    }
}
