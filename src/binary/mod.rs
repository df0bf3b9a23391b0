//! Binary serialization of compiled scripts.
//!
//! Layout: header (magic, target SDK version, flags, source name), interned
//! string table, top-level variable map, then the function tree in
//! depth-first order. Integers are LEB128 varints, signed values zigzag.
//! Switch tables ride along only when the target SDK version understands
//! them; older engines get the compare-chain lowering instead.

use std::collections::HashMap;
use std::rc::Rc;

use crate::bytecode::{
    CompileOptions, Function, Instruction, OpCode, SwitchInfo, SwitchKeyType, SwitchType,
    UpvalueInfo,
};
use crate::codegen::CompiledScript;
use crate::value::{RegExp, Value, ValueType};

const MAGIC: &[u8; 4] = b"LEPC";

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("constant of type {0:?} cannot be serialized")]
    UnsupportedConst(ValueType),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unexpected end of input")]
    ShortRead,
    #[error("bad magic number")]
    BadMagic,
    #[error("varint exceeds 64 bits")]
    Overflow,
    #[error("invalid utf-8 in string table")]
    BadUtf8,
    #[error("bad value tag {0}")]
    BadTag(u8),
    #[error("bad opcode {0}")]
    BadOpcode(u8),
    #[error("index out of range: {0}")]
    BadIndex(&'static str),
}

// ---- varints ----

fn write_varint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn write_signed(out: &mut Vec<u8>, v: i64) {
    write_varint(out, zigzag(v));
}

fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn unzigzag(u: u64) -> i64 {
    ((u >> 1) as i64) ^ -((u & 1) as i64)
}

// ---- encoding ----

struct Writer {
    strings: Vec<Rc<str>>,
    index: HashMap<Rc<str>, u64>,
}

impl Writer {
    fn intern(&mut self, s: &Rc<str>) -> u64 {
        if let Some(&i) = self.index.get(s) {
            return i;
        }
        let i = self.strings.len() as u64;
        self.strings.push(s.clone());
        self.index.insert(s.clone(), i);
        i
    }

    /// Pre-pass: the string table must land before the function tree.
    fn collect(&mut self, script: &CompiledScript) -> Result<(), EncodeError> {
        for (name, _) in &script.top_level {
            self.intern(name);
        }
        self.collect_function(&script.root)
    }

    fn collect_function(&mut self, func: &Function) -> Result<(), EncodeError> {
        if let Some(name) = &func.name {
            self.intern(name);
        }
        for value in &func.const_pool {
            match value {
                Value::String(s) => {
                    self.intern(s);
                }
                Value::RegExp(r) => {
                    self.intern(&Rc::from(r.pattern.as_str()));
                    self.intern(&Rc::from(r.flags.as_str()));
                }
                Value::Nil
                | Value::Undefined
                | Value::Bool(_)
                | Value::Int64(_)
                | Value::Double(_)
                | Value::NaN(_) => {}
                other => return Err(EncodeError::UnsupportedConst(other.value_type())),
            }
        }
        for upvalue in &func.upvalues {
            self.intern(&upvalue.name);
        }
        for child in &func.children {
            self.collect_function(child)?;
        }
        Ok(())
    }
}

pub fn encode(script: &CompiledScript) -> Result<Vec<u8>, EncodeError> {
    let mut writer = Writer {
        strings: Vec::new(),
        index: HashMap::new(),
    };
    writer.collect(script)?;
    let with_switch_tables =
        CompileOptions::version_at_least(&script.target_sdk_version, "2.0");

    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    write_inline_str(&mut out, &script.target_sdk_version);
    out.push(script.closure_fix as u8);
    write_inline_str(&mut out, &script.source_name);

    write_varint(&mut out, writer.strings.len() as u64);
    for s in &writer.strings {
        write_inline_str(&mut out, s);
    }

    write_varint(&mut out, script.top_level.len() as u64);
    for (name, reg) in &script.top_level {
        write_varint(&mut out, writer.index[name]);
        write_varint(&mut out, *reg as u64);
    }

    encode_function(&mut out, &writer, &script.root, with_switch_tables)?;
    Ok(out)
}

fn write_inline_str(out: &mut Vec<u8>, s: &str) {
    write_varint(out, s.len() as u64);
    out.extend_from_slice(s.as_bytes());
}

fn encode_function(
    out: &mut Vec<u8>,
    writer: &Writer,
    func: &Function,
    with_switch_tables: bool,
) -> Result<(), EncodeError> {
    match &func.name {
        Some(name) => write_varint(out, writer.index[name] + 1),
        None => write_varint(out, 0),
    }
    write_varint(out, func.function_id as u64);
    write_varint(out, func.param_count as u64);
    write_varint(out, func.register_count as u64);

    write_varint(out, func.const_pool.len() as u64);
    for value in &func.const_pool {
        encode_const(out, writer, value)?;
    }

    write_varint(out, func.code.len() as u64);
    for inst in &func.code {
        write_varint(out, inst.0 as u64);
    }
    write_varint(out, func.line_col.len() as u64);
    for lc in &func.line_col {
        write_varint(out, *lc);
    }

    write_varint(out, func.upvalues.len() as u64);
    for upvalue in &func.upvalues {
        write_varint(out, writer.index[&upvalue.name]);
        write_varint(out, upvalue.register as u64);
        out.push(upvalue.in_parent_vars as u8);
    }

    if with_switch_tables {
        write_varint(out, func.switch_tables.len() as u64);
        for info in &func.switch_tables {
            out.push(info.switch_type as u8);
            out.push(info.key_type as u8);
            write_signed(out, info.default_offset as i64);
            write_signed(out, info.min);
            write_varint(out, info.table.len() as u64);
            for offset in &info.table {
                write_signed(out, *offset as i64);
            }
            write_varint(out, info.lookup.len() as u64);
            for (key, offset) in &info.lookup {
                write_signed(out, *key);
                write_signed(out, *offset as i64);
            }
        }
    }

    write_varint(out, func.children.len() as u64);
    for child in &func.children {
        encode_function(out, writer, child, with_switch_tables)?;
    }
    Ok(())
}

fn encode_const(out: &mut Vec<u8>, writer: &Writer, value: &Value) -> Result<(), EncodeError> {
    out.push(value.value_type() as u8);
    match value {
        Value::Nil | Value::Undefined => {}
        Value::Bool(b) => out.push(*b as u8),
        Value::Int64(n) => write_signed(out, *n),
        Value::Double(n) => out.extend_from_slice(&n.to_bits().to_le_bytes()),
        Value::NaN(b) => out.push(*b as u8),
        Value::String(s) => write_varint(out, writer.index[&**s]),
        Value::RegExp(r) => {
            write_varint(out, writer.index[r.pattern.as_str()]);
            write_varint(out, writer.index[r.flags.as_str()]);
        }
        other => return Err(EncodeError::UnsupportedConst(other.value_type())),
    }
    Ok(())
}

// ---- decoding ----

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    strings: Vec<Rc<str>>,
}

impl<'a> Reader<'a> {
    fn byte(&mut self) -> Result<u8, DecodeError> {
        let b = *self.bytes.get(self.pos).ok_or(DecodeError::ShortRead)?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).ok_or(DecodeError::ShortRead)?;
        let slice = self.bytes.get(self.pos..end).ok_or(DecodeError::ShortRead)?;
        self.pos = end;
        Ok(slice)
    }

    fn varint(&mut self) -> Result<u64, DecodeError> {
        let mut out: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = self.byte()?;
            if shift >= 64 {
                return Err(DecodeError::Overflow);
            }
            out |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(out);
            }
            shift += 7;
        }
    }

    fn signed(&mut self) -> Result<i64, DecodeError> {
        Ok(unzigzag(self.varint()?))
    }

    fn length(&mut self, what: &'static str) -> Result<usize, DecodeError> {
        let n = self.varint()?;
        // guards corrupt inputs from forcing huge allocations
        if n > (1 << 24) {
            return Err(DecodeError::BadIndex(what));
        }
        Ok(n as usize)
    }

    fn inline_str(&mut self) -> Result<String, DecodeError> {
        let len = self.length("string length")?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::BadUtf8)
    }

    fn string_ref(&mut self) -> Result<Rc<str>, DecodeError> {
        let index = self.varint()? as usize;
        self.strings
            .get(index)
            .cloned()
            .ok_or(DecodeError::BadIndex("string table"))
    }
}

pub fn decode(bytes: &[u8]) -> Result<CompiledScript, DecodeError> {
    let mut reader = Reader {
        bytes,
        pos: 0,
        strings: Vec::new(),
    };
    if reader.take(4)? != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let target_sdk_version = reader.inline_str()?;
    let closure_fix = reader.byte()? != 0;
    let source_name = reader.inline_str()?;

    let string_count = reader.length("string table")?;
    for _ in 0..string_count {
        let s = reader.inline_str()?;
        reader.strings.push(Rc::from(s.as_str()));
    }

    let top_count = reader.length("top-level table")?;
    let mut top_level = Vec::with_capacity(top_count);
    for _ in 0..top_count {
        let name = reader.string_ref()?;
        let reg = reader.varint()? as u32;
        top_level.push((name, reg));
    }

    let with_switch_tables = CompileOptions::version_at_least(&target_sdk_version, "2.0");
    let root = decode_function(&mut reader, with_switch_tables, None)?;
    Ok(CompiledScript {
        root: Rc::new(root),
        top_level,
        closure_fix,
        target_sdk_version,
        source_name,
    })
}

fn decode_function(
    reader: &mut Reader<'_>,
    with_switch_tables: bool,
    // (register_count, upvalue count) of the enclosing function; upvalue
    // descriptors index into one of the two
    parent: Option<(u32, usize)>,
) -> Result<Function, DecodeError> {
    let name_index = reader.varint()?;
    let name = if name_index == 0 {
        None
    } else {
        Some(
            reader
                .strings
                .get(name_index as usize - 1)
                .cloned()
                .ok_or(DecodeError::BadIndex("function name"))?,
        )
    };
    let function_id = reader.varint()? as u32;
    let mut func = Function::new(name, function_id);
    func.param_count = reader.varint()? as u32;
    func.register_count = reader.varint()? as u32;

    let const_count = reader.length("const pool")?;
    for _ in 0..const_count {
        func.const_pool.push(decode_const(reader)?);
    }

    let code_len = reader.length("code")?;
    for _ in 0..code_len {
        let word = reader.varint()?;
        if word > u32::MAX as u64 {
            return Err(DecodeError::Overflow);
        }
        let inst = Instruction(word as u32);
        if OpCode::from_u8(inst.op()).is_none() {
            return Err(DecodeError::BadOpcode(inst.op()));
        }
        func.code.push(inst);
    }
    let lc_len = reader.length("line table")?;
    if lc_len != code_len {
        return Err(DecodeError::BadIndex("line table length"));
    }
    for _ in 0..lc_len {
        func.line_col.push(reader.varint()?);
    }

    let upvalue_count = reader.length("upvalues")?;
    for _ in 0..upvalue_count {
        let name = reader.string_ref()?;
        let register = reader.varint()? as u32;
        let in_parent_vars = match reader.byte()? {
            0 => false,
            1 => true,
            other => return Err(DecodeError::BadTag(other)),
        };
        let limit = match parent {
            Some((parent_regs, _)) if in_parent_vars => parent_regs as u64,
            Some((_, parent_upvalues)) => parent_upvalues as u64,
            // the root function has nothing to capture from
            None => 0,
        };
        if register as u64 >= limit {
            return Err(DecodeError::BadIndex("upvalue register"));
        }
        func.upvalues.push(UpvalueInfo {
            name,
            register,
            in_parent_vars,
        });
    }

    if with_switch_tables {
        let table_count = reader.length("switch tables")?;
        for _ in 0..table_count {
            let info = decode_switch(reader)?;
            // dispatch adds the offset to the switch pc; anything past the
            // code vector could never land on an instruction
            let in_code = |offset: i32| offset >= 0 && offset as usize <= code_len;
            if !in_code(info.default_offset)
                || !info.table.iter().all(|o| in_code(*o))
                || !info.lookup.iter().all(|(_, o)| in_code(*o))
            {
                return Err(DecodeError::BadIndex("switch offset"));
            }
            func.switch_tables.push(info);
        }
    }

    let bounds = (func.register_count, func.upvalues.len());
    let child_count = reader.length("children")?;
    for _ in 0..child_count {
        func.children
            .push(Rc::new(decode_function(reader, with_switch_tables, Some(bounds))?));
    }
    Ok(func)
}

fn decode_switch(reader: &mut Reader<'_>) -> Result<SwitchInfo, DecodeError> {
    let switch_type = match reader.byte()? {
        0 => SwitchType::Table,
        1 => SwitchType::Lookup,
        other => return Err(DecodeError::BadTag(other)),
    };
    let key_type = match reader.byte()? {
        0 => SwitchKeyType::Int,
        1 => SwitchKeyType::String,
        other => return Err(DecodeError::BadTag(other)),
    };
    let default_offset = reader.signed()? as i32;
    let min = reader.signed()?;
    let table_len = reader.length("switch offsets")?;
    let mut table = Vec::with_capacity(table_len);
    for _ in 0..table_len {
        table.push(reader.signed()? as i32);
    }
    let lookup_len = reader.length("switch lookup")?;
    let mut lookup = Vec::with_capacity(lookup_len);
    for _ in 0..lookup_len {
        let key = reader.signed()?;
        let offset = reader.signed()? as i32;
        lookup.push((key, offset));
    }
    Ok(SwitchInfo {
        switch_type,
        key_type,
        default_offset,
        min,
        table,
        lookup,
    })
}

fn decode_const(reader: &mut Reader<'_>) -> Result<Value, DecodeError> {
    let tag = reader.byte()?;
    let Some(value_type) = ValueType::from_u8(tag) else {
        return Err(DecodeError::BadTag(tag));
    };
    Ok(match value_type {
        ValueType::Nil => Value::Nil,
        ValueType::Undefined => Value::Undefined,
        ValueType::Bool => Value::Bool(reader.byte()? != 0),
        ValueType::Int64 => Value::Int64(reader.signed()?),
        ValueType::Double => {
            let bytes = reader.take(8)?;
            Value::Double(f64::from_bits(u64::from_le_bytes(bytes.try_into().unwrap())))
        }
        ValueType::NaN => Value::NaN(reader.byte()? != 0),
        ValueType::String => Value::String(reader.string_ref()?),
        ValueType::RegExp => {
            let pattern = reader.string_ref()?.to_string();
            let flags = reader.string_ref()?.to_string();
            Value::RegExp(Rc::new(RegExp { pattern, flags }))
        }
        _ => return Err(DecodeError::BadTag(tag)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Context;
    use crate::{codegen, parser, semantic};

    fn compile(src: &str, version: &str) -> CompiledScript {
        let mut chunk = parser::parse(src, "t").unwrap();
        semantic::analyze(&mut chunk, true, false).unwrap();
        let options = CompileOptions {
            target_sdk_version: version.to_string(),
            ..CompileOptions::default()
        };
        codegen::compile_chunk(&chunk, src, &options).unwrap()
    }

    #[test]
    fn round_trip_preserves_behavior() {
        let src = "function fib(n) { if (n < 2) { return n; } return fib(n - 1) + fib(n - 2); }
                   var label = 'fib=' + fib(10);
                   label;";
        let script = compile(src, "2.0");
        let bytes = encode(&script).unwrap();
        let back = decode(&bytes).unwrap();
        assert_eq!(back.root.code, script.root.code);
        assert_eq!(back.root.const_pool, script.root.const_pool);
        assert_eq!(back.top_level.len(), script.top_level.len());
        let result = Context::new().execute(&back).unwrap();
        assert_eq!(result, Value::string("fib=55"));
    }

    #[test]
    fn round_trip_keeps_switch_tables() {
        let src = "function hue(n) { switch (n) { case 'red': return 1; default: return 0; } }
                   hue('red');";
        let script = compile(src, "2.0");
        let back = decode(&encode(&script).unwrap()).unwrap();
        let f = &back.root.children[0];
        assert_eq!(f.switch_tables.len(), 1);
        assert_eq!(f.switch_tables[0].key_type, SwitchKeyType::String);
        assert_eq!(Context::new().execute(&back).unwrap(), Value::Int64(1));
    }

    #[test]
    fn pre_2_0_scripts_carry_no_switch_tables() {
        let src = "function hue(n) { switch (n) { case 1: return 1; default: return 0; } }
                   hue(1);";
        let script = compile(src, "1.5");
        // the compare-chain lowering keeps old targets working
        assert!(script.root.children[0].switch_tables.is_empty());
        let back = decode(&encode(&script).unwrap()).unwrap();
        assert_eq!(Context::new().execute(&back).unwrap(), Value::Int64(1));
    }

    #[test]
    fn upvalues_and_line_table_survive() {
        let src = "function outer() { var y = 7; return function () { return y; }; }
                   outer()();";
        let script = compile(src, "2.0");
        let back = decode(&encode(&script).unwrap()).unwrap();
        let inner = &back.root.children[0].children[0];
        assert_eq!(inner.upvalues.len(), 1);
        assert_eq!(&*inner.upvalues[0].name, "y");
        assert!(inner.upvalues[0].in_parent_vars);
        assert_eq!(back.root.line_col, script.root.line_col);
        assert_eq!(Context::new().execute(&back).unwrap(), Value::Int64(7));
    }

    #[test]
    fn truncated_input_is_a_short_read() {
        let bytes = encode(&compile("1 + 2;", "2.0")).unwrap();
        for cut in [0, 3, bytes.len() / 2, bytes.len() - 1] {
            match decode(&bytes[..cut]) {
                Err(DecodeError::ShortRead) | Err(DecodeError::BadMagic) => {}
                other => panic!("expected a decode failure, got {other:?}"),
            }
        }
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = encode(&compile("1;", "2.0")).unwrap();
        bytes[0] ^= 0xFF;
        assert!(matches!(decode(&bytes), Err(DecodeError::BadMagic)));
    }

    #[test]
    fn corrupt_opcode_is_rejected() {
        let script = compile("1 + 2;", "2.0");
        let mut hacked = (*script.root).clone();
        hacked.code[0] = Instruction(0xFF00_0000);
        let mut script = script;
        script.root = Rc::new(hacked);
        let bytes = encode(&script).unwrap();
        assert!(matches!(decode(&bytes), Err(DecodeError::BadOpcode(0xFF))));
    }

    #[test]
    fn line_table_must_match_code_length() {
        let script = compile("1 + 2;", "2.0");
        let mut hacked = (*script.root).clone();
        hacked.line_col.pop();
        let mut script = script;
        script.root = Rc::new(hacked);
        let bytes = encode(&script).unwrap();
        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::BadIndex("line table length"))
        ));
    }

    #[test]
    fn out_of_range_upvalue_register_is_rejected() {
        let src = "function outer() { var y = 7; return function () { return y; }; }
                   outer()();";
        let script = compile(src, "2.0");
        let mut root = (*script.root).clone();
        let mut outer = (*root.children[0]).clone();
        let mut inner = (*outer.children[0]).clone();
        inner.upvalues[0].register = 9999;
        outer.children[0] = Rc::new(inner);
        root.children[0] = Rc::new(outer);
        let mut script = script;
        script.root = Rc::new(root);
        let bytes = encode(&script).unwrap();
        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::BadIndex("upvalue register"))
        ));
    }

    #[test]
    fn switch_offset_past_code_is_rejected() {
        let src = "function hue(n) { switch (n) { case 'red': return 1; default: return 0; } }
                   hue('red');";
        let script = compile(src, "2.0");
        let mut root = (*script.root).clone();
        let mut hue = (*root.children[0]).clone();
        hue.switch_tables[0].default_offset = 1_000_000;
        root.children[0] = Rc::new(hue);
        let mut script = script;
        script.root = Rc::new(root);
        let bytes = encode(&script).unwrap();
        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::BadIndex("switch offset"))
        ));
    }

    #[test]
    fn truncated_switch_section_is_rejected() {
        let src = "function hue(n) { switch (n) { case 'red': return 1; default: return 0; } }
                   hue('red');";
        let bytes = encode(&compile(src, "2.0")).unwrap();
        // the switch tables sit near the tail of the stream; every strict
        // prefix must fail, never decode to a mangled table
        for cut in bytes.len() - 12..bytes.len() {
            assert!(decode(&bytes[..cut]).is_err(), "prefix of {cut} decoded");
        }
    }

    #[test]
    fn container_constants_refuse_to_serialize() {
        let script = compile("1;", "2.0");
        let mut hacked = (*script.root).clone();
        hacked
            .const_pool
            .push(Value::Table(crate::value::Table::new()));
        let mut script = script;
        script.root = Rc::new(hacked);
        assert!(matches!(
            encode(&script),
            Err(EncodeError::UnsupportedConst(ValueType::Table))
        ));
    }
}
