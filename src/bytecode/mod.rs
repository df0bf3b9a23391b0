use std::cell::RefCell;
use std::rc::Rc;

use crate::value::Value;

// ── Opcodes ─────────────────────────────────────────────────────────
//
// ABC mode:  [OP:8 | A:8 | B:8 | C:8]
// ABx mode:  [OP:8 | A:8 | Bx:16]  (sBx signed for jumps)
//
// The numbering is the serialized ABI: new opcodes are appended, never
// inserted.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    LoadNil = 0,
    LoadConst = 1,
    Move = 2,
    GetUpvalue = 3,
    SetUpvalue = 4,
    GetGlobal = 5,
    SetGlobal = 6,
    Closure = 7,
    Call = 8,
    Ret = 9,
    Jmp = 10,
    JmpFalse = 11,
    JmpTrue = 12,
    Add = 13,
    Sub = 14,
    Mul = 15,
    Div = 16,
    Pow = 17,
    Mod = 18,
    BitOr = 19,
    BitAnd = 20,
    BitXor = 21,
    BitNot = 22,
    Less = 23,
    Greater = 24,
    Equal = 25,
    UnEqual = 26,
    LessEqual = 27,
    GreaterEqual = 28,
    AbsEqual = 29,
    AbsUnEqual = 30,
    NewTable = 31,
    NewArray = 32,
    GetTable = 33,
    SetTable = 34,
    Switch = 35,
    Inc = 36,
    Dec = 37,
    Typeof = 38,
    SetCatchId = 39,
    Throw = 40,
    Catch = 41,
    CreateContext = 42,
    PushContext = 43,
    PopContext = 44,
    GetContextSlot = 45,
    SetContextSlot = 46,
    EnterBlock = 47,
    LeaveBlock = 48,
    CreateBlockContext = 49,
    Noop = 50,
    // appended extensions
    Neg = 51,
    Not = 52,
    Pos = 53,
    And = 54,
    Or = 55,
    GetBuiltin = 56,
    JmpNil = 57,
}

impl OpCode {
    pub fn from_u8(op: u8) -> Option<OpCode> {
        if op <= OpCode::JmpNil as u8 {
            // repr(u8) with dense discriminants
            Some(unsafe { std::mem::transmute::<u8, OpCode>(op) })
        } else {
            None
        }
    }
}

// ── Instruction encoding ────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Instruction(pub u32);

impl Instruction {
    #[inline(always)]
    pub fn abc(op: OpCode, a: u8, b: u8, c: u8) -> Instruction {
        Instruction((op as u32) << 24 | (a as u32) << 16 | (b as u32) << 8 | c as u32)
    }

    #[inline(always)]
    pub fn abx(op: OpCode, a: u8, bx: u16) -> Instruction {
        Instruction((op as u32) << 24 | (a as u32) << 16 | bx as u32)
    }

    #[inline(always)]
    pub fn asbx(op: OpCode, a: u8, sbx: i16) -> Instruction {
        Instruction::abx(op, a, sbx as u16)
    }

    #[inline(always)]
    pub fn op(self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub fn opcode(self) -> Option<OpCode> {
        OpCode::from_u8(self.op())
    }

    #[inline(always)]
    pub fn a(self) -> u8 {
        (self.0 >> 16) as u8
    }

    #[inline(always)]
    pub fn b(self) -> u8 {
        (self.0 >> 8) as u8
    }

    #[inline(always)]
    pub fn c(self) -> u8 {
        self.0 as u8
    }

    #[inline(always)]
    pub fn bx(self) -> u16 {
        self.0 as u16
    }

    #[inline(always)]
    pub fn sbx(self) -> i16 {
        self.0 as u16 as i16
    }

    /// Rewrite the Bx field in place; used by jump fixup.
    pub fn set_sbx(&mut self, sbx: i16) {
        self.0 = (self.0 & 0xFFFF_0000) | (sbx as u16 as u32);
    }
}

impl std::fmt::Debug for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.opcode() {
            Some(op) => write!(
                f,
                "{:?} a={} b={} c={} (bx={})",
                op,
                self.a(),
                self.b(),
                self.c(),
                self.sbx()
            ),
            None => write!(f, "op?{} {:#010x}", self.op(), self.0),
        }
    }
}

// ── Line/column packing ─────────────────────────────────────────────
//
// Current layout keeps the column in the low 30 bits and the line above.
// The legacy layout was 16:16; it is recognized on decode by the
// impossible combination it produces in the current layout.

pub fn encode_line_col(line: u64, col: u64, legacy: bool) -> u64 {
    if legacy {
        (line & 0xFFFF) << 16 | (col & 0xFFFF)
    } else {
        line << 30 | (col & ((1 << 30) - 1))
    }
}

pub fn decode_line_col(lc: u64) -> (u64, u64) {
    let line = lc >> 30;
    let col = lc & ((1u64 << 30) - 1);
    if line == 0 && col > (1 << 16) {
        ((lc >> 16) & 0xFFFF, lc & 0xFFFF)
    } else {
        (line, col)
    }
}

// ── Compile options ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub target_sdk_version: String,
    /// Block-level closure capture (context arrays) instead of
    /// function-level register upvalues.
    pub closure_fix: bool,
    pub strict: bool,
    pub source_name: String,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            target_sdk_version: "2.0".to_string(),
            closure_fix: true,
            strict: false,
            source_name: "<chunk>".to_string(),
        }
    }
}

impl CompileOptions {
    /// Segment-wise numeric version compare; `"2.10"` >= `"2.9"`.
    pub fn version_at_least(version: &str, floor: &str) -> bool {
        let mut a = version.split('.').map(|s| s.trim().parse::<u64>().unwrap_or(0));
        let mut b = floor.split('.').map(|s| s.trim().parse::<u64>().unwrap_or(0));
        loop {
            match (a.next(), b.next()) {
                (Some(x), Some(y)) if x == y => continue,
                (Some(x), Some(y)) => return x > y,
                (Some(_), None) => return true,
                (None, Some(y)) => return y == 0 && b.all(|s| s == 0),
                (None, None) => return true,
            }
        }
    }

    pub fn wide_line_col(&self) -> bool {
        Self::version_at_least(&self.target_sdk_version, "2.0")
    }

    pub fn switch_tables_in_codec(&self) -> bool {
        Self::version_at_least(&self.target_sdk_version, "2.0")
    }
}

// ── Switch tables ───────────────────────────────────────────────────

pub const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
pub const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// The hash behind string-keyed lookup switches. Pinned: serialized
/// switch tables depend on it.
pub fn fnv1a64(s: &str) -> u64 {
    let mut h = FNV_OFFSET;
    for byte in s.as_bytes() {
        h ^= *byte as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SwitchType {
    /// Dense integer range, direct offset table.
    Table = 0,
    /// Sorted key/offset pairs, binary search.
    Lookup = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SwitchKeyType {
    Int = 0,
    String = 1,
}

/// Lowered `switch` dispatch data. Offsets are instruction deltas relative
/// to the `Switch` instruction itself.
#[derive(Debug, Clone)]
pub struct SwitchInfo {
    pub switch_type: SwitchType,
    pub key_type: SwitchKeyType,
    pub default_offset: i32,
    /// Table mode: offsets for min..=max, holes filled with default.
    pub min: i64,
    pub table: Vec<i32>,
    /// Lookup mode: sorted by key.
    pub lookup: Vec<(i64, i32)>,
}

impl SwitchInfo {
    pub fn switch_key(key: &Value) -> Option<i64> {
        match key {
            Value::String(s) => Some(fnv1a64(s) as i64),
            v if v.is_number() => {
                let n = v.number();
                if n.is_finite() && n == (n as i64) as f64 {
                    Some(n as i64)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Resolve a scrutinee to an instruction offset. Misses (including
    /// non-switchable values) take the default arm.
    pub fn dispatch(&self, key: &Value) -> i32 {
        let key = match (self.key_type, key) {
            (SwitchKeyType::String, Value::String(_)) => Self::switch_key(key),
            (SwitchKeyType::Int, v) if v.is_number() => Self::switch_key(key),
            _ => None,
        };
        let Some(key) = key else {
            return self.default_offset;
        };
        match self.switch_type {
            SwitchType::Table => {
                let idx = key - self.min;
                if idx >= 0 && (idx as usize) < self.table.len() {
                    self.table[idx as usize]
                } else {
                    self.default_offset
                }
            }
            SwitchType::Lookup => match self.lookup.binary_search_by_key(&key, |(k, _)| *k) {
                Ok(i) => self.lookup[i].1,
                Err(_) => self.default_offset,
            },
        }
    }
}

// ── Upvalue descriptors ─────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct UpvalueInfo {
    pub name: Rc<str>,
    /// Parent register when `in_parent_vars`, else index into the parent
    /// closure's own upvalue list.
    pub register: u32,
    pub in_parent_vars: bool,
}

// ── Function ────────────────────────────────────────────────────────

/// A compiled function: code, constants, upvalue descriptors, switch
/// tables, and nested children. Immutable once codegen finishes.
#[derive(Debug, Clone, Default)]
pub struct Function {
    pub name: Option<Rc<str>>,
    pub function_id: u32,
    pub param_count: u32,
    pub register_count: u32,
    pub code: Vec<Instruction>,
    /// Parallel to `code`; packed line/col per instruction.
    pub line_col: Vec<u64>,
    pub const_pool: Vec<Value>,
    pub upvalues: Vec<UpvalueInfo>,
    pub switch_tables: Vec<SwitchInfo>,
    pub children: Vec<Rc<Function>>,
}

impl Function {
    pub fn new(name: Option<Rc<str>>, function_id: u32) -> Function {
        Function {
            name,
            function_id,
            ..Function::default()
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("<anonymous>")
    }

    /// Intern a constant, reusing an existing slot for equal primitives.
    /// Doubles dedup bitwise so `-0.0` and NaN payloads stay distinct.
    pub fn add_const_value(&mut self, value: Value) -> u16 {
        let found = self.const_pool.iter().position(|c| match (c, &value) {
            (Value::Nil, Value::Nil) => true,
            (Value::Undefined, Value::Undefined) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::RegExp(a), Value::RegExp(b)) => a == b,
            _ => false,
        });
        match found {
            Some(i) => i as u16,
            None => {
                let idx = self.const_pool.len() as u16;
                self.const_pool.push(value);
                idx
            }
        }
    }

    /// Number literals narrow to Int64 when integral.
    pub fn add_const_number(&mut self, n: f64) -> u16 {
        self.add_const_value(Value::from_number(n))
    }

    pub fn const_value(&self, index: usize) -> Option<&Value> {
        self.const_pool.get(index)
    }

    pub fn line_col_at(&self, pc: usize) -> (u64, u64) {
        self.line_col
            .get(pc)
            .copied()
            .map(decode_line_col)
            .unwrap_or((0, 0))
    }

    pub fn child(&self, index: usize) -> Option<&Rc<Function>> {
        self.children.get(index)
    }
}

// ── Closures ────────────────────────────────────────────────────────

/// A captured variable cell. Open cells point at an absolute heap slot;
/// closing moves the value in. The transition is one-way.
#[derive(Debug)]
pub enum UpvalueCell {
    Open(usize),
    Closed(Value),
}

pub type UpvalueRef = Rc<RefCell<UpvalueCell>>;

impl UpvalueCell {
    pub fn open(slot: usize) -> UpvalueRef {
        Rc::new(RefCell::new(UpvalueCell::Open(slot)))
    }

    pub fn closed(value: Value) -> UpvalueRef {
        Rc::new(RefCell::new(UpvalueCell::Closed(value)))
    }
}

/// Runtime pairing of a `Function` with its captured environment. In
/// block-closure mode `context` holds the captured context array instead
/// of register upvalues.
pub struct Closure {
    function: Rc<Function>,
    upvalues: RefCell<Vec<UpvalueRef>>,
    context: RefCell<Value>,
}

impl Closure {
    pub fn new(function: Rc<Function>) -> Rc<Closure> {
        Rc::new(Closure {
            function,
            upvalues: RefCell::new(Vec::new()),
            context: RefCell::new(Value::Nil),
        })
    }

    pub fn function(&self) -> &Rc<Function> {
        &self.function
    }

    pub fn add_upvalue(&self, cell: UpvalueRef) {
        self.upvalues.borrow_mut().push(cell);
    }

    pub fn upvalue(&self, index: usize) -> Option<UpvalueRef> {
        self.upvalues.borrow().get(index).cloned()
    }

    pub fn upvalue_count(&self) -> usize {
        self.upvalues.borrow().len()
    }

    pub fn context(&self) -> Value {
        self.context.borrow().clone()
    }

    pub fn set_context(&self, context: Value) {
        *self.context.borrow_mut() = context;
    }

    /// Cycle breaker: drops the captured context reference.
    pub fn clear_context(&self) {
        *self.context.borrow_mut() = Value::Nil;
    }
}

impl std::fmt::Debug for Closure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "closure {} ({} upvalues)",
            self.function.name(),
            self.upvalue_count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abc_round_trip() {
        let i = Instruction::abc(OpCode::Add, 3, 7, 9);
        assert_eq!(i.opcode(), Some(OpCode::Add));
        assert_eq!((i.a(), i.b(), i.c()), (3, 7, 9));
    }

    #[test]
    fn sbx_is_signed() {
        let mut i = Instruction::asbx(OpCode::Jmp, 0, -5);
        assert_eq!(i.sbx(), -5);
        i.set_sbx(300);
        assert_eq!(i.sbx(), 300);
        assert_eq!(i.opcode(), Some(OpCode::Jmp));
    }

    #[test]
    fn opcode_table_is_dense() {
        for op in 0..=OpCode::JmpNil as u8 {
            let decoded = OpCode::from_u8(op).unwrap();
            assert_eq!(decoded as u8, op);
        }
        assert!(OpCode::from_u8(OpCode::JmpNil as u8 + 1).is_none());
        assert_eq!(OpCode::Noop as u8, 50);
        assert_eq!(OpCode::JmpNil as u8, 57);
    }

    #[test]
    fn line_col_wide_round_trip() {
        let wide = encode_line_col(12, 40, false);
        assert_eq!(decode_line_col(wide), (12, 40));
        let big = encode_line_col(100_000, 500_000, false);
        assert_eq!(decode_line_col(big), (100_000, 500_000));
    }

    #[test]
    fn legacy_fallback_triggers_on_impossible_wide_word() {
        // 16:16 word: line 2, col 9 -> wide decode would be line 0, col 131081
        let lc = (2u64 << 16) | 9;
        assert_eq!(decode_line_col(lc), (2, 9));
        // small wide word stays wide
        assert_eq!(decode_line_col(encode_line_col(0, 9, false)), (0, 9));
    }

    #[test]
    fn const_pool_dedups_primitives() {
        let mut f = Function::new(None, 1);
        let a = f.add_const_value(Value::Int64(7));
        let b = f.add_const_value(Value::Int64(7));
        let c = f.add_const_value(Value::string("x"));
        let d = f.add_const_value(Value::string("x"));
        assert_eq!(a, b);
        assert_eq!(c, d);
        assert_ne!(a, c);
        assert_eq!(f.const_pool.len(), 2);
    }

    #[test]
    fn table_switch_dispatch() {
        let info = SwitchInfo {
            switch_type: SwitchType::Table,
            key_type: SwitchKeyType::Int,
            default_offset: 99,
            min: 10,
            table: vec![1, 99, 3],
            lookup: Vec::new(),
        };
        assert_eq!(info.dispatch(&Value::Int64(10)), 1);
        assert_eq!(info.dispatch(&Value::Int64(11)), 99);
        assert_eq!(info.dispatch(&Value::Int64(12)), 3);
        assert_eq!(info.dispatch(&Value::Int64(13)), 99);
        assert_eq!(info.dispatch(&Value::string("10")), 99);
    }

    #[test]
    fn lookup_switch_dispatch_with_string_keys() {
        let mut lookup: Vec<(i64, i32)> = ["red", "green", "blue"]
            .iter()
            .enumerate()
            .map(|(i, s)| (fnv1a64(s) as i64, i as i32 + 1))
            .collect();
        lookup.sort_by_key(|(k, _)| *k);
        let info = SwitchInfo {
            switch_type: SwitchType::Lookup,
            key_type: SwitchKeyType::String,
            default_offset: -1,
            min: 0,
            table: Vec::new(),
            lookup,
        };
        assert_eq!(info.dispatch(&Value::string("green")), 2);
        assert_eq!(info.dispatch(&Value::string("mauve")), -1);
        assert_eq!(info.dispatch(&Value::Int64(3)), -1);
    }

    #[test]
    fn version_compare_is_numeric_per_segment() {
        assert!(CompileOptions::version_at_least("2.10", "2.9"));
        assert!(CompileOptions::version_at_least("2.0", "2.0"));
        assert!(!CompileOptions::version_at_least("1.9", "2.0"));
        assert!(CompileOptions::version_at_least("2.0.1", "2.0"));
        assert!(CompileOptions::version_at_least("2", "2.0.0"));
    }

    #[test]
    fn closure_context_clears() {
        let f = Rc::new(Function::new(Some(Rc::from("f")), 1));
        let c = Closure::new(f);
        let ctx = crate::value::Array::new();
        c.set_context(Value::Array(ctx));
        assert!(c.context().is_array());
        c.clear_context();
        assert!(c.context().is_nil());
    }
}
