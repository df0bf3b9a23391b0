use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::bridge::ForeignRuntime;
use crate::bytecode::{Closure, Function, OpCode, UpvalueCell, UpvalueRef};
use crate::codegen::CompiledScript;
use crate::value::{update_value_by_path, Array, Value};

/// Initial heap reservation; keeps the register file from reallocating
/// under typical scripts.
const HEAP_RESERVE: usize = 10240;
const MAX_FRAMES: usize = 512;

/// An error surfaced to the host: either an uncaught script exception or
/// a fatal interpreter fault.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RuntimeError {
    pub code: &'static str,
    pub message: String,
    pub back_trace: Option<String>,
    pub fatal: bool,
}

impl RuntimeError {
    pub fn throwable(code: &'static str, message: impl Into<String>) -> RuntimeError {
        RuntimeError {
            code,
            message: message.into(),
            back_trace: None,
            fatal: false,
        }
    }

    pub fn fatal(code: &'static str, message: impl Into<String>) -> RuntimeError {
        RuntimeError {
            code,
            message: message.into(),
            back_trace: None,
            fatal: true,
        }
    }
}

/// Arguments handed to a native function: a copy of the caller's argument
/// window, so the native side never aliases the register file.
pub struct CallArgs {
    args: Vec<Value>,
}

impl CallArgs {
    pub fn new(args: Vec<Value>) -> CallArgs {
        CallArgs { args }
    }

    pub fn params_size(&self) -> usize {
        self.args.len()
    }

    pub fn param(&self, index: usize) -> Value {
        self.args.get(index).cloned().unwrap_or(Value::Undefined)
    }
}

/// Hook for an attached debugger. Held weakly so a dropped debugger
/// detaches itself.
pub trait DebugDelegate {
    fn update_current_pc(&self, function_id: u32, pc: usize);
    fn generate_debugger_frame_id(&self) -> u64 {
        0
    }
}

struct Frame {
    closure: Rc<Closure>,
    function: Rc<Function>,
    base: usize,
    pc: usize,
    /// Absolute heap slot the return value lands in.
    result_slot: usize,
    /// Handler pcs pushed by SetCatchId inside this frame.
    catch_stack: Vec<usize>,
    /// Context-stack depth on entry; restored when the frame pops.
    context_mark: usize,
    /// Depth after the closure context auto-push; Catch restores relative
    /// to this.
    ctx_base: usize,
    /// Shared open cells per captured register.
    open_cells: HashMap<u32, UpvalueRef>,
    keep_heap: bool,
}

/// One VM instance: register heap, globals, builtins, and the top-level
/// variable table of the installed script.
pub struct Context {
    heap: Vec<Value>,
    globals: HashMap<String, Value>,
    builtins: HashMap<String, Value>,
    top_level: HashMap<String, u32>,
    /// Deep snapshot of top-level values for shadow-update detection.
    shadow: HashMap<String, Value>,
    context_stack: Vec<Value>,
    /// Closures holding a captured context; cleared on teardown to break
    /// reference cycles through context arrays.
    tracked_closures: Vec<Weak<Closure>>,
    pending_exception: Option<Value>,
    /// Method tables consulted when a property read on a string or array
    /// misses.
    string_prototype: Value,
    array_prototype: Value,
    debug_delegate: Option<Weak<dyn DebugDelegate>>,
    bridge_runtime: Option<Rc<dyn ForeignRuntime>>,
    pub enable_strict_check: bool,
    pub enable_top_var_strict_mode: bool,
    pub enable_null_prop_as_undef: bool,
    closure_fix: bool,
    source_name: String,
}

impl Default for Context {
    fn default() -> Self {
        Context::new()
    }
}

impl Context {
    pub fn new() -> Context {
        let mut ctx = Context {
            heap: Vec::with_capacity(HEAP_RESERVE),
            globals: HashMap::new(),
            builtins: HashMap::new(),
            top_level: HashMap::new(),
            shadow: HashMap::new(),
            context_stack: Vec::new(),
            tracked_closures: Vec::new(),
            pending_exception: None,
            string_prototype: Value::Nil,
            array_prototype: Value::Nil,
            debug_delegate: None,
            bridge_runtime: None,
            enable_strict_check: false,
            enable_top_var_strict_mode: false,
            enable_null_prop_as_undef: false,
            closure_fix: true,
            source_name: String::new(),
        };
        crate::builtin::install(&mut ctx);
        ctx
    }

    // ---- host API ----

    /// Install and run a compiled script. Top-level registers stay live in
    /// the heap afterwards so the host can read and update them.
    pub fn execute(&mut self, script: &CompiledScript) -> Result<Value, RuntimeError> {
        self.closure_fix = script.closure_fix;
        self.source_name = script.source_name.clone();
        self.top_level = script
            .top_level
            .iter()
            .map(|(n, r)| (n.to_string(), *r))
            .collect();
        self.heap.clear();
        let root = Closure::new(script.root.clone());
        self.heap.push(Value::Closure(root.clone()));
        let result = self.run(root, &[], 1, usize::MAX, true)?;
        self.snapshot_shadow();
        Ok(result)
    }

    pub fn register_global(&mut self, name: &str, value: Value) {
        self.globals.insert(name.to_string(), value);
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    pub fn register_native_function(&mut self, name: &str, f: crate::value::CFunction) {
        self.globals.insert(name.to_string(), Value::CFunction(f));
    }

    pub fn register_builtin(&mut self, name: &str, value: Value) {
        self.builtins.insert(name.to_string(), value);
    }

    pub fn set_string_prototype(&mut self, table: Value) {
        self.string_prototype = table;
    }

    pub fn set_array_prototype(&mut self, table: Value) {
        self.array_prototype = table;
    }

    pub fn set_bridge_runtime(&mut self, runtime: Rc<dyn ForeignRuntime>) {
        self.bridge_runtime = Some(runtime);
    }

    pub fn set_debug_delegate(&mut self, delegate: Weak<dyn DebugDelegate>) {
        self.debug_delegate = Some(delegate);
    }

    /// Call a script function by name: top-level bindings first, then
    /// globals.
    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<Value, RuntimeError> {
        let callee = self
            .get_top_level_variable_by_name(name)
            .or_else(|| self.globals.get(name).cloned())
            .or_else(|| self.builtins.get(name).cloned())
            .ok_or_else(|| {
                RuntimeError::throwable("LEP-R002", format!("'{name}' is not a function"))
            })?;
        self.call_value(&callee, args)
    }

    pub fn call_value(&mut self, callee: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
        match callee {
            Value::Closure(c) => {
                let base = self.heap.len().max(1);
                self.run(c.clone(), args, base, usize::MAX, false)
            }
            Value::CFunction(f) => f(self, &CallArgs::new(args.to_vec())),
            Value::Foreign(f) => {
                let rt = self.bridge_runtime.clone().ok_or_else(|| {
                    RuntimeError::throwable("LEP-R007", "no bridge runtime installed")
                })?;
                rt.call_function(&**f, args)
                    .map_err(|e| RuntimeError::throwable("LEP-R007", e))
            }
            _ => Err(RuntimeError::throwable(
                "LEP-R002",
                format!("{} is not a function", callee.type_of()),
            )),
        }
    }

    pub fn get_top_level_variable_by_name(&self, name: &str) -> Option<Value> {
        let reg = *self.top_level.get(name)?;
        self.heap.get(1 + reg as usize).cloned()
    }

    /// Snapshot the top-level bindings. `ignore_callable` drops functions;
    /// names starting with `$` are internal and always skipped.
    pub fn get_top_level_variables(&self, ignore_callable: bool) -> Vec<(String, Value)> {
        let mut out: Vec<(String, Value)> = self
            .top_level
            .iter()
            .filter(|(name, _)| !name.starts_with('$'))
            .filter_map(|(name, reg)| {
                let value = self.heap.get(1 + *reg as usize).cloned()?;
                if ignore_callable && value.is_callable() {
                    return None;
                }
                Some((name.clone(), value))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// `"a.b.0"` walks the top-level binding `a` down through tables and
    /// arrays. A single segment replaces the binding itself. Idempotent:
    /// re-applying the same update is a no-op.
    pub fn update_top_level_by_path(&mut self, path: &str, update: &Value) -> bool {
        let segments: Vec<String> = path.split('.').map(str::to_string).collect();
        let Some(first) = segments.first() else {
            return false;
        };
        let Some(&reg) = self.top_level.get(first.as_str()) else {
            return false;
        };
        let slot = 1 + reg as usize;
        if slot >= self.heap.len() {
            return false;
        }
        if segments.len() == 1 {
            self.heap[slot] = update.clone();
            return true;
        }
        let target = self.heap[slot].clone();
        update_value_by_path(&target, update, &segments[1..])
    }

    /// Overwrite top-level bindings from a table of name/value pairs.
    pub fn reset_top_level_variables(&mut self, values: &Value) {
        let Value::Table(table) = values else { return };
        let slots: Vec<(usize, Value)> = self
            .top_level
            .iter()
            .filter_map(|(name, reg)| {
                table.get(name).map(|v| (1 + *reg as usize, v))
            })
            .collect();
        for (slot, value) in slots {
            if slot < self.heap.len() {
                self.heap[slot] = value;
            }
        }
    }

    /// Names whose current value differs from the last snapshot. Refreshes
    /// the snapshot as it reports.
    pub fn check_top_level_shadow_updated(&mut self) -> Vec<String> {
        let mut changed: Vec<String> = self
            .top_level
            .iter()
            .filter(|(name, _)| !name.starts_with('$'))
            .filter_map(|(name, reg)| {
                let current = self.heap.get(1 + *reg as usize)?;
                match self.shadow.get(name) {
                    Some(old) if old == current => None,
                    _ => Some(name.clone()),
                }
            })
            .collect();
        changed.sort();
        if !changed.is_empty() {
            self.snapshot_shadow();
        }
        changed
    }

    /// Whether applying `update` (a table of name/value pairs) would change
    /// any top-level binding. Lets the host skip redundant updates.
    pub fn check_table_shadow_updated(&self, update: &Value) -> bool {
        let Value::Table(table) = update else {
            return false;
        };
        let mut dirty = false;
        table.for_each(|name, value| {
            if dirty {
                return;
            }
            match self
                .top_level
                .get(name)
                .and_then(|reg| self.heap.get(1 + *reg as usize))
            {
                Some(current) => dirty = current != value,
                None => dirty = true,
            }
        });
        dirty
    }

    fn snapshot_shadow(&mut self) {
        self.shadow = self
            .top_level
            .iter()
            .filter_map(|(name, reg)| {
                self.heap
                    .get(1 + *reg as usize)
                    .map(|v| (name.clone(), v.clone_deep()))
            })
            .collect();
    }

    /// Break closure/context reference cycles and drop the script state.
    /// Safe to call more than once; also runs on drop.
    pub fn teardown(&mut self) {
        for weak in self.tracked_closures.drain(..) {
            if let Some(closure) = weak.upgrade() {
                closure.clear_context();
            }
        }
        self.heap.clear();
        self.context_stack.clear();
        self.top_level.clear();
        self.shadow.clear();
    }

    // ---- interpreter ----

    fn run(
        &mut self,
        entry: Rc<Closure>,
        args: &[Value],
        base: usize,
        result_slot: usize,
        keep_heap: bool,
    ) -> Result<Value, RuntimeError> {
        let mut frames: Vec<Frame> = Vec::new();
        self.push_frame(&mut frames, entry, args, base, result_slot, keep_heap)?;

        loop {
            let fetched = {
                let frame = frames.last_mut().unwrap();
                if frame.pc < frame.function.code.len() {
                    let inst = frame.function.code[frame.pc];
                    frame.pc += 1;
                    Some((inst, frame.pc - 1))
                } else {
                    None
                }
            };
            let Some((inst, spc)) = fetched else {
                // running off the end is an implicit return
                match self.do_return(&mut frames, Value::Undefined) {
                    Some(result) => return Ok(result),
                    None => continue,
                }
            };
            if let Some(delegate) = &self.debug_delegate {
                if let Some(d) = delegate.upgrade() {
                    let frame = frames.last().unwrap();
                    d.update_current_pc(frame.function.function_id, spc);
                }
            }
            let base = frames.last().unwrap().base;
            let op = match inst.opcode() {
                Some(op) => op,
                None => {
                    return Err(self.fatal_here(
                        &frames,
                        "LEP-R005",
                        format!("bad opcode {}", inst.op()),
                    ))
                }
            };
            let (a, b, c) = (inst.a() as usize, inst.b() as usize, inst.c() as usize);

            match op {
                OpCode::Noop | OpCode::EnterBlock => {}
                OpCode::LoadNil => {
                    self.heap[base + a] = if inst.b() == 1 {
                        Value::Undefined
                    } else {
                        Value::Nil
                    };
                }
                OpCode::LoadConst => {
                    let func = frames.last().unwrap().function.clone();
                    match func.const_value(inst.bx() as usize) {
                        Some(v) => self.heap[base + a] = v.clone(),
                        None => {
                            return Err(self.fatal_here(
                                &frames,
                                "LEP-R005",
                                "constant index out of range",
                            ))
                        }
                    }
                }
                OpCode::Move => self.heap[base + a] = self.heap[base + b].clone(),
                OpCode::GetUpvalue => {
                    let frame = frames.last().unwrap();
                    let Some(cell) = frame.closure.upvalue(inst.bx() as usize) else {
                        return Err(self.fatal_here(&frames, "LEP-R005", "bad upvalue index"));
                    };
                    let value = match &*cell.borrow() {
                        UpvalueCell::Open(slot) => self.heap[*slot].clone(),
                        UpvalueCell::Closed(v) => v.clone(),
                    };
                    self.heap[base + a] = value;
                }
                OpCode::SetUpvalue => {
                    let frame = frames.last().unwrap();
                    let Some(cell) = frame.closure.upvalue(inst.bx() as usize) else {
                        return Err(self.fatal_here(&frames, "LEP-R005", "bad upvalue index"));
                    };
                    let value = self.heap[base + a].clone();
                    let mut cell = cell.borrow_mut();
                    match &mut *cell {
                        UpvalueCell::Open(slot) => self.heap[*slot] = value,
                        UpvalueCell::Closed(v) => *v = value,
                    }
                }
                OpCode::GetGlobal => {
                    let name = self.const_str(&frames, inst.bx())?;
                    let value = self
                        .globals
                        .get(&*name)
                        .or_else(|| self.builtins.get(&*name))
                        .cloned()
                        .unwrap_or(Value::Undefined);
                    self.heap[base + a] = value;
                }
                OpCode::SetGlobal => {
                    let name = self.const_str(&frames, inst.bx())?;
                    let value = self.heap[base + a].clone();
                    self.globals.insert(name.to_string(), value);
                }
                OpCode::GetBuiltin => {
                    let name = self.const_str(&frames, inst.bx())?;
                    self.heap[base + a] = self
                        .builtins
                        .get(&*name)
                        .cloned()
                        .unwrap_or(Value::Undefined);
                }
                OpCode::Closure => {
                    let func = frames.last().unwrap().function.clone();
                    let Some(child) = func.child(inst.bx() as usize) else {
                        return Err(self.fatal_here(&frames, "LEP-R005", "bad child index"));
                    };
                    let closure = self.make_closure(frames.last_mut().unwrap(), child.clone());
                    self.heap[base + a] = Value::Closure(closure);
                }
                OpCode::Call => {
                    let callee = self.heap[base + a].clone();
                    let argc = b;
                    match callee {
                        Value::Closure(closure) => {
                            if frames.len() >= MAX_FRAMES {
                                self.raise(
                                    &mut frames,
                                    Value::string("RangeError: call stack exhausted"),
                                )?;
                                continue;
                            }
                            let caller_top =
                                base + frames.last().unwrap().function.register_count as usize;
                            let args: Vec<Value> =
                                self.heap[base + a + 1..base + a + 1 + argc].to_vec();
                            self.push_frame(
                                &mut frames,
                                closure,
                                &args,
                                caller_top,
                                base + c,
                                false,
                            )?;
                        }
                        Value::CFunction(f) => {
                            let args = CallArgs::new(
                                self.heap[base + a + 1..base + a + 1 + argc].to_vec(),
                            );
                            match f(self, &args) {
                                Ok(v) => self.heap[base + c] = v,
                                Err(err) if err.fatal => {
                                    return Err(self.attach_trace(&frames, err))
                                }
                                Err(err) => {
                                    self.raise(&mut frames, Value::string(err.message))?;
                                }
                            }
                        }
                        Value::Foreign(f)
                            if matches!(f.tag(), crate::bridge::ForeignTag::Function) =>
                        {
                            let args: Vec<Value> =
                                self.heap[base + a + 1..base + a + 1 + argc].to_vec();
                            match self.bridge_runtime.clone() {
                                Some(rt) => match rt.call_function(&*f, &args) {
                                    Ok(v) => self.heap[base + c] = v,
                                    Err(e) => self.raise(&mut frames, Value::string(e))?,
                                },
                                None => self.raise(
                                    &mut frames,
                                    Value::string("no bridge runtime installed"),
                                )?,
                            }
                        }
                        other => {
                            let msg =
                                format!("TypeError: {} is not a function", other.type_of());
                            self.raise(&mut frames, Value::string(msg))?;
                        }
                    }
                }
                OpCode::Ret => {
                    let value = if inst.b() == 1 {
                        self.heap[base + a].clone()
                    } else {
                        Value::Undefined
                    };
                    match self.do_return(&mut frames, value) {
                        Some(result) => return Ok(result),
                        None => {}
                    }
                }
                OpCode::Jmp => {
                    let frame = frames.last_mut().unwrap();
                    frame.pc = (frame.pc as i64 + inst.sbx() as i64) as usize;
                }
                OpCode::JmpFalse => {
                    if self.heap[base + a].is_false() {
                        let frame = frames.last_mut().unwrap();
                        frame.pc = (frame.pc as i64 + inst.sbx() as i64) as usize;
                    }
                }
                OpCode::JmpTrue => {
                    if self.heap[base + a].bool() {
                        let frame = frames.last_mut().unwrap();
                        frame.pc = (frame.pc as i64 + inst.sbx() as i64) as usize;
                    }
                }
                OpCode::JmpNil => {
                    if self.heap[base + a].is_empty() {
                        let frame = frames.last_mut().unwrap();
                        frame.pc = (frame.pc as i64 + inst.sbx() as i64) as usize;
                    }
                }
                OpCode::Add
                | OpCode::Sub
                | OpCode::Mul
                | OpCode::Div
                | OpCode::Mod
                | OpCode::Pow => {
                    let lhs = self.heap[base + b].clone();
                    let rhs = self.heap[base + c].clone();
                    match arith(op, &lhs, &rhs) {
                        Ok(v) => self.heap[base + a] = v,
                        Err(msg) => self.raise(&mut frames, Value::string(msg))?,
                    }
                }
                OpCode::BitOr | OpCode::BitAnd | OpCode::BitXor => {
                    let lhs = to_int32(&self.heap[base + b]);
                    let rhs = to_int32(&self.heap[base + c]);
                    let out = match op {
                        OpCode::BitOr => lhs | rhs,
                        OpCode::BitAnd => lhs & rhs,
                        _ => lhs ^ rhs,
                    };
                    self.heap[base + a] = Value::Int64(out as i64);
                }
                OpCode::BitNot => {
                    let v = to_int32(&self.heap[base + b]);
                    self.heap[base + a] = Value::Int64(!v as i64);
                }
                OpCode::Less | OpCode::Greater | OpCode::LessEqual | OpCode::GreaterEqual => {
                    let lhs = &self.heap[base + b];
                    let rhs = &self.heap[base + c];
                    self.heap[base + a] = Value::Bool(compare(op, lhs, rhs));
                }
                OpCode::Equal => {
                    let eq = self.heap[base + b] == self.heap[base + c];
                    self.heap[base + a] = Value::Bool(eq);
                }
                OpCode::UnEqual => {
                    let eq = self.heap[base + b] == self.heap[base + c];
                    self.heap[base + a] = Value::Bool(!eq);
                }
                OpCode::AbsEqual => {
                    let eq = self.heap[base + b].abs_equals(&self.heap[base + c]);
                    self.heap[base + a] = Value::Bool(eq);
                }
                OpCode::AbsUnEqual => {
                    let eq = self.heap[base + b].abs_equals(&self.heap[base + c]);
                    self.heap[base + a] = Value::Bool(!eq);
                }
                OpCode::And => {
                    let lhs = self.heap[base + b].clone();
                    self.heap[base + a] = if lhs.is_false() {
                        lhs
                    } else {
                        self.heap[base + c].clone()
                    };
                }
                OpCode::Or => {
                    let lhs = self.heap[base + b].clone();
                    self.heap[base + a] = if lhs.bool() {
                        lhs
                    } else {
                        self.heap[base + c].clone()
                    };
                }
                OpCode::Neg => {
                    let v = &self.heap[base + b];
                    self.heap[base + a] = match v {
                        Value::Int64(n) => Value::Int64(n.wrapping_neg()),
                        other => Value::from_number(-other.number()),
                    };
                }
                OpCode::Pos => {
                    let v = &self.heap[base + b];
                    self.heap[base + a] = if v.is_number() {
                        v.clone()
                    } else {
                        let n = v.number();
                        if n.is_nan() {
                            Value::NaN(true)
                        } else {
                            Value::from_number(n)
                        }
                    };
                }
                OpCode::Not => {
                    let falsy = self.heap[base + b].is_false();
                    self.heap[base + a] = Value::Bool(falsy);
                }
                OpCode::Typeof => {
                    self.heap[base + a] = Value::string(self.heap[base + b].type_of());
                }
                OpCode::Inc | OpCode::Dec => {
                    let delta = Value::Int64(if op == OpCode::Inc { 1 } else { -1 });
                    let old = self.heap[base + a].clone();
                    match arith(OpCode::Add, &old, &delta) {
                        Ok(v) => self.heap[base + a] = v,
                        Err(msg) => self.raise(&mut frames, Value::string(msg))?,
                    }
                }
                OpCode::NewTable => {
                    self.heap[base + a] = Value::Table(crate::value::Table::new());
                }
                OpCode::NewArray => {
                    self.heap[base + a] = Value::Array(Array::with_capacity(inst.bx() as usize));
                }
                OpCode::GetTable => {
                    let obj = self.heap[base + b].clone();
                    let key = self.heap[base + c].clone();
                    if obj.is_empty() {
                        if self.enable_strict_check {
                            let msg = format!(
                                "TypeError: cannot read property '{}' of {}",
                                key, obj
                            );
                            self.raise(&mut frames, Value::string(msg))?;
                            continue;
                        }
                        self.heap[base + a] = if self.enable_null_prop_as_undef {
                            Value::Undefined
                        } else {
                            Value::Nil
                        };
                        continue;
                    }
                    self.heap[base + a] = match &obj {
                        Value::Foreign(f) => match &self.bridge_runtime {
                            Some(rt) => rt.get_property(&**f, &key),
                            None => Value::Undefined,
                        },
                        _ => {
                            let found = obj.get_property(&key);
                            if found.is_empty() {
                                // string and array methods live on prototype
                                // tables, not the receiver
                                match &obj {
                                    Value::String(_) => self.string_prototype.get_property(&key),
                                    Value::Array(_) => self.array_prototype.get_property(&key),
                                    _ => found,
                                }
                            } else {
                                found
                            }
                        }
                    };
                }
                OpCode::SetTable => {
                    let obj = self.heap[base + a].clone();
                    let key = self.heap[base + b].clone();
                    let value = self.heap[base + c].clone();
                    let ok = match &obj {
                        Value::Foreign(f) => match &self.bridge_runtime {
                            Some(rt) => rt.set_property(&**f, &key, value),
                            None => false,
                        },
                        _ => obj.set_property(&key, value),
                    };
                    if !ok && self.enable_strict_check {
                        let msg = format!(
                            "TypeError: cannot set property '{}' on {}",
                            key,
                            obj.type_of()
                        );
                        self.raise(&mut frames, Value::string(msg))?;
                    }
                }
                OpCode::Switch => {
                    let func = frames.last().unwrap().function.clone();
                    let Some(info) = func.switch_tables.get(inst.bx() as usize) else {
                        return Err(self.fatal_here(&frames, "LEP-R005", "bad switch table"));
                    };
                    let offset = info.dispatch(&self.heap[base + a]);
                    let frame = frames.last_mut().unwrap();
                    frame.pc = (spc as i64 + offset as i64) as usize;
                }
                OpCode::SetCatchId => {
                    let frame = frames.last_mut().unwrap();
                    if inst.a() == 0 {
                        let handler = (frame.pc as i64 + inst.sbx() as i64) as usize;
                        frame.catch_stack.push(handler);
                    } else {
                        frame.catch_stack.pop();
                    }
                }
                OpCode::Throw => {
                    let thrown = self.heap[base + a].clone();
                    self.raise(&mut frames, thrown)?;
                }
                OpCode::Catch => {
                    let thrown = self.pending_exception.take().unwrap_or(Value::Undefined);
                    let frame = frames.last().unwrap();
                    let depth = frame.ctx_base + a;
                    self.context_stack.truncate(depth);
                    self.heap[base + b] = thrown;
                }
                OpCode::CreateContext | OpCode::CreateBlockContext => {
                    let slots = a.max(1);
                    let parent = self
                        .context_stack
                        .last()
                        .cloned()
                        .unwrap_or(Value::Nil);
                    let ctx = Array::with_capacity(slots);
                    ctx.push(parent);
                    ctx.resize(slots);
                    self.context_stack.push(Value::Array(ctx));
                }
                OpCode::PushContext => {
                    let value = self.heap[base + a].clone();
                    self.context_stack.push(value);
                }
                OpCode::PopContext | OpCode::LeaveBlock => {
                    if self.context_stack.pop().is_none() {
                        return Err(self.fatal_here(
                            &frames,
                            "LEP-R005",
                            "context stack underflow",
                        ));
                    }
                }
                OpCode::GetContextSlot => {
                    match self.context_at(inst.b()) {
                        Some(ctx) => self.heap[base + a] = ctx.get(c),
                        None => {
                            return Err(self.fatal_here(&frames, "LEP-R005", "broken context chain"))
                        }
                    }
                }
                OpCode::SetContextSlot => {
                    let value = self.heap[base + a].clone();
                    match self.context_at(inst.b()) {
                        Some(ctx) => {
                            ctx.set(c, value);
                        }
                        None => {
                            return Err(self.fatal_here(&frames, "LEP-R005", "broken context chain"))
                        }
                    }
                }
            }
        }
    }

    fn push_frame(
        &mut self,
        frames: &mut Vec<Frame>,
        closure: Rc<Closure>,
        args: &[Value],
        base: usize,
        result_slot: usize,
        keep_heap: bool,
    ) -> Result<(), RuntimeError> {
        let function = closure.function().clone();
        let top = base + function.register_count.max(function.param_count) as usize;
        if self.heap.len() < top {
            self.heap.resize(top, Value::Nil);
        }
        let params = function.param_count as usize;
        for i in 0..params {
            self.heap[base + i] = args.get(i).cloned().unwrap_or(Value::Undefined);
        }
        let context_mark = self.context_stack.len();
        if self.closure_fix {
            let captured = closure.context();
            if !captured.is_nil() {
                self.context_stack.push(captured);
            }
        }
        let ctx_base = self.context_stack.len();
        frames.push(Frame {
            closure,
            function,
            base,
            pc: 0,
            result_slot,
            catch_stack: Vec::new(),
            context_mark,
            ctx_base,
            open_cells: HashMap::new(),
            keep_heap,
        });
        Ok(())
    }

    /// Pop the current frame, closing its open upvalue cells and restoring
    /// the context stack. Returns the final value when it was the last
    /// frame of this run.
    fn do_return(&mut self, frames: &mut Vec<Frame>, value: Value) -> Option<Value> {
        let frame = frames.pop().unwrap();
        self.close_cells(&frame);
        self.context_stack.truncate(frame.context_mark);
        if !frame.keep_heap {
            self.heap.truncate(frame.base);
        }
        if frames.is_empty() {
            Some(value)
        } else {
            if frame.result_slot != usize::MAX {
                if self.heap.len() <= frame.result_slot {
                    self.heap.resize(frame.result_slot + 1, Value::Nil);
                }
                self.heap[frame.result_slot] = value;
            }
            None
        }
    }

    fn close_cells(&mut self, frame: &Frame) {
        for (reg, cell) in &frame.open_cells {
            let value = self
                .heap
                .get(frame.base + *reg as usize)
                .cloned()
                .unwrap_or(Value::Nil);
            *cell.borrow_mut() = UpvalueCell::Closed(value);
        }
    }

    fn make_closure(&mut self, frame: &mut Frame, function: Rc<Function>) -> Rc<Closure> {
        let closure = Closure::new(function.clone());
        for upvalue in &function.upvalues {
            let cell = if upvalue.in_parent_vars {
                let slot = frame.base + upvalue.register as usize;
                frame
                    .open_cells
                    .entry(upvalue.register)
                    .or_insert_with(|| UpvalueCell::open(slot))
                    .clone()
            } else {
                frame
                    .closure
                    .upvalue(upvalue.register as usize)
                    .unwrap_or_else(|| UpvalueCell::closed(Value::Undefined))
            };
            closure.add_upvalue(cell);
        }
        if self.closure_fix {
            if let Some(top) = self.context_stack.last() {
                closure.set_context(top.clone());
                self.tracked_closures.push(Rc::downgrade(&closure));
            }
        }
        closure
    }

    fn context_at(&self, hops: u8) -> Option<Rc<Array>> {
        let mut current = match self.context_stack.last() {
            Some(Value::Array(a)) => a.clone(),
            _ => return None,
        };
        for _ in 0..hops {
            current = match current.get(0) {
                Value::Array(a) => a,
                _ => return None,
            };
        }
        Some(current)
    }

    fn const_str(&self, frames: &[Frame], index: u16) -> Result<Rc<str>, RuntimeError> {
        let func = &frames.last().unwrap().function;
        match func.const_value(index as usize) {
            Some(Value::String(s)) => Ok(s.clone()),
            _ => Err(self.fatal_here(frames, "LEP-R005", "expected string constant")),
        }
    }

    /// Throw a script value: unwind to the nearest catch handler, popping
    /// frames as needed. Errors out when nothing catches it.
    fn raise(&mut self, frames: &mut Vec<Frame>, thrown: Value) -> Result<(), RuntimeError> {
        let back_trace = self.build_back_trace(frames);
        loop {
            let Some(frame) = frames.last_mut() else {
                return Err(RuntimeError {
                    code: "LEP-R001",
                    message: format!("uncaught exception: {}", thrown),
                    back_trace: Some(back_trace),
                    fatal: false,
                });
            };
            if let Some(handler) = frame.catch_stack.pop() {
                frame.pc = handler;
                self.pending_exception = Some(thrown);
                return Ok(());
            }
            let frame = frames.pop().unwrap();
            self.close_cells(&frame);
            self.context_stack.truncate(frame.context_mark);
            if !frame.keep_heap {
                self.heap.truncate(frame.base);
            }
        }
    }

    /// "\tat name (source:line:col)" per frame, innermost first.
    fn build_back_trace(&self, frames: &[Frame]) -> String {
        frames
            .iter()
            .rev()
            .map(|frame| {
                let pc = frame.pc.saturating_sub(1);
                let (line, col) = frame.function.line_col_at(pc);
                format!(
                    "\tat {} ({}:{}:{})",
                    frame.function.name(),
                    self.source_name,
                    line,
                    col
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn fatal_here(
        &self,
        frames: &[Frame],
        code: &'static str,
        message: impl Into<String>,
    ) -> RuntimeError {
        RuntimeError {
            code,
            message: message.into(),
            back_trace: Some(self.build_back_trace(frames)),
            fatal: true,
        }
    }

    fn attach_trace(&self, frames: &[Frame], mut err: RuntimeError) -> RuntimeError {
        if err.back_trace.is_none() {
            err.back_trace = Some(self.build_back_trace(frames));
        }
        err
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// JS-style ToInt32 for the bitwise operators.
fn to_int32(v: &Value) -> i32 {
    let n = v.number();
    if n.is_finite() {
        n as i64 as i32
    } else {
        0
    }
}

/// Binary arithmetic. `+` concatenates when either side is a string;
/// Int64 pairs stay integral where the result is exact.
fn arith(op: OpCode, lhs: &Value, rhs: &Value) -> Result<Value, String> {
    if op == OpCode::Add && (lhs.is_string() || rhs.is_string()) {
        return Ok(Value::string(format!("{}{}", lhs, rhs)));
    }
    if let (Value::Int64(x), Value::Int64(y)) = (lhs, rhs) {
        let (x, y) = (*x, *y);
        return match op {
            OpCode::Add => Ok(Value::Int64(x.wrapping_add(y))),
            OpCode::Sub => Ok(Value::Int64(x.wrapping_sub(y))),
            OpCode::Mul => Ok(Value::Int64(x.wrapping_mul(y))),
            OpCode::Div => {
                if y == 0 {
                    Err("RangeError: division by zero".to_string())
                } else if x % y == 0 {
                    Ok(Value::Int64(x / y))
                } else {
                    Ok(Value::Double(x as f64 / y as f64))
                }
            }
            OpCode::Mod => {
                if y == 0 {
                    Err("RangeError: division by zero".to_string())
                } else {
                    Ok(Value::Int64(x.wrapping_rem(y)))
                }
            }
            OpCode::Pow => Ok(Value::from_number((x as f64).powf(y as f64))),
            _ => unreachable!(),
        };
    }
    let x = lhs.number();
    let y = rhs.number();
    let out = match op {
        OpCode::Add => x + y,
        OpCode::Sub => x - y,
        OpCode::Mul => x * y,
        OpCode::Div => x / y,
        OpCode::Mod => x % y,
        OpCode::Pow => x.powf(y),
        _ => unreachable!(),
    };
    if out.is_nan() {
        Ok(Value::NaN(true))
    } else {
        Ok(Value::from_number(out))
    }
}

/// Relational compare: numeric against numeric, string against string,
/// anything else is false.
fn compare(op: OpCode, lhs: &Value, rhs: &Value) -> bool {
    if lhs.is_number() && rhs.is_number() {
        let (x, y) = (lhs.number(), rhs.number());
        return match op {
            OpCode::Less => x < y,
            OpCode::Greater => x > y,
            OpCode::LessEqual => x <= y,
            OpCode::GreaterEqual => x >= y,
            _ => false,
        };
    }
    if let (Value::String(x), Value::String(y)) = (lhs, rhs) {
        return match op {
            OpCode::Less => x < y,
            OpCode::Greater => x > y,
            OpCode::LessEqual => x <= y,
            OpCode::GreaterEqual => x >= y,
            _ => false,
        };
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::CompileOptions;
    use crate::value::Table;
    use crate::{codegen, parser, semantic};

    fn compile(src: &str, closure_fix: bool) -> codegen::CompiledScript {
        let mut chunk = parser::parse(src, "test").unwrap();
        semantic::analyze(&mut chunk, closure_fix, false).unwrap();
        let options = CompileOptions {
            closure_fix,
            source_name: "test".to_string(),
            ..CompileOptions::default()
        };
        codegen::compile_chunk(&chunk, src, &options).unwrap()
    }

    fn eval(src: &str) -> Value {
        let mut ctx = Context::new();
        ctx.execute(&compile(src, true)).unwrap()
    }

    #[test]
    fn arithmetic_preserves_int64() {
        assert_eq!(eval("3 + 4;"), Value::Int64(7));
        assert_eq!(eval("10 / 2;"), Value::Int64(5));
        assert_eq!(eval("7 / 2;"), Value::Double(3.5));
        assert_eq!(eval("7 % 3;"), Value::Int64(1));
        assert_eq!(eval("-7 % 3;"), Value::Int64(-1));
        assert_eq!(eval("2 ** 10;"), Value::Int64(1024));
    }

    #[test]
    fn string_concat_coerces_numbers() {
        assert_eq!(eval("'n=' + 3;"), Value::string("n=3"));
        assert_eq!(eval("1 + '2';"), Value::string("12"));
    }

    #[test]
    fn comparisons_on_mixed_types_are_false() {
        assert_eq!(eval("1 < 'x';"), Value::Bool(false));
        assert_eq!(eval("'a' < 'b';"), Value::Bool(true));
        assert_eq!(eval("2 <= 2;"), Value::Bool(true));
    }

    #[test]
    fn strict_equality_rejects_coercion() {
        assert_eq!(eval("1 == 1.0;"), Value::Bool(true));
        assert_eq!(eval("'1' === 1;"), Value::Bool(false));
        assert_eq!(eval("'1' !== 1;"), Value::Bool(true));
    }

    #[test]
    fn recursion_through_upvalue() {
        let src = "function fib(n) { if (n < 2) { return n; } return fib(n - 1) + fib(n - 2); } fib(10);";
        assert_eq!(eval(src), Value::Int64(55));
    }

    #[test]
    fn closures_capture_per_iteration_in_fix_mode() {
        let src = "var fs = [];
                   for (let i = 0; i < 3; i++) { fs[i] = function () { return i; }; }
                   fs[0]() + fs[1]() * 10 + fs[2]() * 100;";
        assert_eq!(eval(src), Value::Int64(210));
    }

    #[test]
    fn legacy_mode_shares_the_loop_variable() {
        let src = "var fs = [];
                   for (var i = 0; i < 3; i++) { fs[i] = function () { return i; }; }
                   fs[0]() + fs[1]() + fs[2]();";
        let mut ctx = Context::new();
        let result = ctx.execute(&compile(src, false)).unwrap();
        assert_eq!(result, Value::Int64(9));
    }

    #[test]
    fn try_catch_binds_the_thrown_value() {
        let src = "var out = ''; try { throw 'boom'; out = 'no'; } catch (e) { out = 'caught:' + e; } out;";
        assert_eq!(eval(src), Value::string("caught:boom"));
    }

    #[test]
    fn finally_runs_on_both_paths() {
        let src = "var log = '';
                   try { log = log + 'a'; } finally { log = log + 'f'; }
                   try { throw 'x'; } catch (e) { log = log + 'c'; } finally { log = log + 'g'; }
                   log;";
        assert_eq!(eval(src), Value::string("afcg"));
    }

    #[test]
    fn finally_return_overrides_try_return() {
        let src = "function f() { try { return 1; } finally { return 2; } } f();";
        assert_eq!(eval(src), Value::Int64(2));
    }

    #[test]
    fn uncaught_rethrow_through_finally_reaches_the_host() {
        let src = "var log = '';
                   function f() { try { throw 'boom'; } finally { log = log + 'f'; } }
                   f();";
        let mut ctx = Context::new();
        let err = ctx.execute(&compile(src, true)).unwrap_err();
        assert!(err.message.contains("boom"));
        assert!(!err.fatal);
        assert!(err.back_trace.is_some());
    }

    #[test]
    fn division_by_zero_is_catchable() {
        let src = "var out = 'no'; try { 1 / 0; } catch (e) { out = e; } out;";
        assert_eq!(eval(src), Value::string("RangeError: division by zero"));
    }

    #[test]
    fn calling_a_non_function_throws() {
        let src = "var out; try { var x = 5; x(); } catch (e) { out = e; } out;";
        assert_eq!(
            eval(src),
            Value::string("TypeError: number is not a function")
        );
    }

    #[test]
    fn switch_dispatches_and_falls_through() {
        let src = "function pick(x) {
                     var out = '';
                     switch (x) {
                       case 1: out = out + 'a';
                       case 2: out = out + 'b'; break;
                       case 3: out = out + 'c'; break;
                       default: out = out + 'd';
                     }
                     return out;
                   }
                   pick(1) + '|' + pick(2) + '|' + pick(3) + '|' + pick(9);";
        assert_eq!(eval(src), Value::string("ab|b|c|d"));
    }

    #[test]
    fn string_switch_uses_hashed_lookup() {
        let src = "function hue(name) {
                     switch (name) {
                       case 'red': return 1;
                       case 'green': return 2;
                       default: return 0;
                     }
                   }
                   hue('green') * 10 + hue('teal');";
        assert_eq!(eval(src), Value::Int64(20));
    }

    #[test]
    fn optional_chain_short_circuits_to_undefined() {
        assert_eq!(eval("var a = null; a?.b?.c;"), Value::Undefined);
        assert_eq!(eval("var a = {b: {c: 7}}; a?.b?.c;"), Value::Int64(7));
        assert_eq!(eval("var f = null; f?.();"), Value::Undefined);
    }

    #[test]
    fn nullish_and_logical_operators() {
        assert_eq!(eval("null ?? 5;"), Value::Int64(5));
        assert_eq!(eval("0 ?? 5;"), Value::Int64(0));
        assert_eq!(eval("0 || 5;"), Value::Int64(5));
        assert_eq!(eval("0 && 5;"), Value::Int64(0));
    }

    #[test]
    fn typeof_reports_script_types() {
        assert_eq!(eval("typeof undefined;"), Value::string("undefined"));
        assert_eq!(eval("typeof null;"), Value::string("object"));
        assert_eq!(eval("typeof 3;"), Value::string("number"));
        assert_eq!(eval("typeof 'x';"), Value::string("string"));
        assert_eq!(eval("typeof function () {};"), Value::string("function"));
    }

    #[test]
    fn member_read_on_null_honors_flags() {
        let src = "var a = null; a.b;";
        let mut ctx = Context::new();
        assert_eq!(ctx.execute(&compile(src, true)).unwrap(), Value::Nil);

        let mut ctx = Context::new();
        ctx.enable_null_prop_as_undef = true;
        assert_eq!(ctx.execute(&compile(src, true)).unwrap(), Value::Undefined);

        let mut ctx = Context::new();
        ctx.enable_strict_check = true;
        let err = ctx.execute(&compile(src, true)).unwrap_err();
        assert!(err.message.contains("cannot read property"));
    }

    #[test]
    fn native_functions_receive_copied_args() {
        fn double(_: &mut Context, args: &CallArgs) -> Result<Value, RuntimeError> {
            Ok(Value::from_number(args.param(0).number() * 2.0))
        }
        let mut ctx = Context::new();
        ctx.register_native_function("double", double);
        let result = ctx.execute(&compile("double(21);", true)).unwrap();
        assert_eq!(result, Value::Int64(42));
    }

    #[test]
    fn host_can_call_script_functions() {
        let mut ctx = Context::new();
        ctx.execute(&compile("function add(a, b) { return a + b; }", true))
            .unwrap();
        let result = ctx.call("add", &[Value::Int64(2), Value::Int64(5)]).unwrap();
        assert_eq!(result, Value::Int64(7));
    }

    #[test]
    fn top_level_variables_are_visible_to_the_host() {
        let mut ctx = Context::new();
        ctx.execute(&compile(
            "var count = 3; var $internal = 1; function helper() {}",
            true,
        ))
        .unwrap();
        assert_eq!(
            ctx.get_top_level_variable_by_name("count"),
            Some(Value::Int64(3))
        );
        let vars = ctx.get_top_level_variables(true);
        let names: Vec<&str> = vars.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["count"]);
        let with_fns = ctx.get_top_level_variables(false);
        assert_eq!(with_fns.len(), 2);
    }

    #[test]
    fn update_top_level_by_path_is_idempotent() {
        let mut ctx = Context::new();
        ctx.execute(&compile("var state = {a: {b: 1}};", true)).unwrap();
        assert!(ctx.update_top_level_by_path("state.a.b", &Value::Int64(9)));
        assert!(ctx.update_top_level_by_path("state.a.b", &Value::Int64(9)));
        let state = ctx.get_top_level_variable_by_name("state").unwrap();
        assert_eq!(
            state
                .get_property(&Value::string("a"))
                .get_property(&Value::string("b")),
            Value::Int64(9)
        );
        assert!(!ctx.update_top_level_by_path("missing.a", &Value::Int64(1)));
    }

    #[test]
    fn shadow_check_reports_changed_top_levels_once() {
        let mut ctx = Context::new();
        ctx.execute(&compile("var a = 1; var b = 2;", true)).unwrap();
        assert!(ctx.check_top_level_shadow_updated().is_empty());
        ctx.update_top_level_by_path("a", &Value::Int64(5));
        assert_eq!(ctx.check_top_level_shadow_updated(), vec!["a".to_string()]);
        assert!(ctx.check_top_level_shadow_updated().is_empty());
    }

    #[test]
    fn reset_top_level_variables_from_table() {
        let mut ctx = Context::new();
        ctx.execute(&compile("var a = 1; var b = 2;", true)).unwrap();
        let fresh = Table::new();
        fresh.set("a", Value::Int64(10));
        ctx.reset_top_level_variables(&Value::Table(fresh));
        assert_eq!(ctx.get_top_level_variable_by_name("a"), Some(Value::Int64(10)));
        assert_eq!(ctx.get_top_level_variable_by_name("b"), Some(Value::Int64(2)));
    }

    #[test]
    fn const_container_writes_fail_quietly_unless_strict() {
        let mut ctx = Context::new();
        let frozen = Table::new();
        frozen.set("x", Value::Int64(1));
        let value = Value::Table(frozen);
        value.mark_const();
        ctx.register_global("cfg", value);
        let result = ctx
            .execute(&compile("cfg.x = 5; cfg.x;", true))
            .unwrap();
        assert_eq!(result, Value::Int64(1));

        let mut strict = Context::new();
        let frozen = Table::new();
        let value = Value::Table(frozen);
        value.mark_const();
        strict.register_global("cfg", value);
        strict.enable_strict_check = true;
        let err = strict.execute(&compile("cfg.x = 5;", true)).unwrap_err();
        assert!(err.message.contains("cannot set property"));
    }

    #[test]
    fn teardown_clears_tracked_closure_contexts() {
        let mut ctx = Context::new();
        let src = "var f; { let x = 1; f = function () { return x; }; }";
        ctx.execute(&compile(src, true)).unwrap();
        let closure = match ctx.get_top_level_variable_by_name("f").unwrap() {
            Value::Closure(c) => c,
            other => panic!("expected closure, got {other}"),
        };
        assert!(!closure.context().is_nil());
        ctx.teardown();
        assert!(closure.context().is_nil());
    }

    #[test]
    fn stack_exhaustion_is_a_throwable_error() {
        let src = "function loop() { return loop(); } loop();";
        let mut ctx = Context::new();
        let err = ctx.execute(&compile(src, true)).unwrap_err();
        assert!(err.message.contains("call stack exhausted"));
        assert!(!err.fatal);
    }

    #[test]
    fn back_trace_names_the_frames() {
        let src = "function inner() { throw 'x'; } function outer() { inner(); } outer();";
        let mut ctx = Context::new();
        let err = ctx.execute(&compile(src, true)).unwrap_err();
        let trace = err.back_trace.unwrap();
        assert!(trace.contains("\tat inner (test:"));
        assert!(trace.contains("\tat outer (test:"));
    }
}
