//! Generic value model and its tagged binary encoding.
//!
//! [`Value`] covers everything the generic frame path can carry: undefined,
//! null, booleans, numbers (f64, JS semantics), strings, arrays and
//! key-ordered objects. [`encode_value`]/[`decode_value`] implement the
//! self-describing binary form used for untyped payloads; numbers pick the
//! narrowest integer width that round-trips, everything else is a raw f64 so
//! NaN and ±Infinity survive bit-for-bit.
//!
//! Within one top-level encode or decode pass a bounded string table dedups
//! repeated strings (object keys and string values alike): the second
//! occurrence is written as a back-reference to the table index assigned at
//! the first occurrence. Reader and writer populate the table with identical
//! rules, so the indices always agree.
//!
//! # Example
//!
//! ```
//! use sockwire::codec::{decode_value, encode_value, Value};
//!
//! let value = Value::Array(vec![Value::from("foo"), Value::from(1.5)]);
//! let bytes = encode_value(&value);
//! assert_eq!(decode_value(&bytes).unwrap(), value);
//! ```

use bytes::Bytes;

use super::reader::PacketReader;
use super::writer::PacketWriter;
use crate::error::CodecError;

/// Capacity of the per-pass string dedup table; indices wrap beyond this.
pub const STRING_TABLE_CAPACITY: usize = 32;

const TAG_UNDEFINED: u8 = 0;
const TAG_NULL: u8 = 1;
const TAG_TRUE: u8 = 2;
const TAG_FALSE: u8 = 3;
const TAG_I8: u8 = 4;
const TAG_I16: u8 = 5;
const TAG_I32: u8 = 6;
const TAG_F64: u8 = 7;
const TAG_STRING: u8 = 8;
const TAG_STRING_REF: u8 = 9;
const TAG_ARRAY: u8 = 10;
const TAG_OBJECT: u8 = 11;

/// A value transferable over the generic (schema-less) frame path.
///
/// Objects preserve insertion order. Numbers are `f64` throughout; integral
/// values are narrowed on the wire but always come back as the same number.
#[derive(Debug, Clone)]
pub enum Value {
    /// Absent value, distinct from null.
    Undefined,
    /// Explicit null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Number with JS semantics (covers NaN and ±Infinity).
    Number(f64),
    /// UTF-8 string.
    String(String),
    /// Ordered list of values.
    Array(Vec<Value>),
    /// Ordered key/value entries.
    Object(Vec<(String, Value)>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            // NaN is self-equal here so the round-trip invariant is directly
            // testable; -0.0 and 0.0 stay distinct.
            (Value::Number(a), Value::Number(b)) => {
                (a == b && a.is_sign_negative() == b.is_sign_negative())
                    || (a.is_nan() && b.is_nan())
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    /// Build an object value from key/value entries.
    pub fn object<K: Into<String>>(entries: Vec<(K, Value)>) -> Self {
        Value::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Convert to a `serde_json::Value` for the textual frame path.
    ///
    /// Undefined, NaN and ±Infinity have no JSON form and become null,
    /// matching what `JSON.stringify` produces for them.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Undefined | Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => {
                if n.fract() == 0.0
                    && n.is_finite()
                    && *n >= i64::MIN as f64
                    && *n <= i64::MAX as f64
                    && !(*n == 0.0 && n.is_sign_negative())
                {
                    serde_json::Value::from(*n as i64)
                } else {
                    serde_json::Number::from_f64(*n)
                        .map(serde_json::Value::Number)
                        .unwrap_or(serde_json::Value::Null)
                }
            }
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Convert from a `serde_json::Value` received on the textual path.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// The number as `f64`, if this is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The string slice, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Number(f64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Number(f64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

/// Bounded dictionary of strings seen within one encode/decode pass.
///
/// Indices are assigned in insertion order and wrap once the table is full,
/// overwriting the oldest slot. Writer and reader apply the same rule, so a
/// back-reference always resolves to the same string on both sides.
struct StringTable {
    entries: Vec<String>,
    count: usize,
}

impl StringTable {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            count: 0,
        }
    }

    fn find(&self, s: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry == s)
    }

    fn get(&self, index: usize) -> Option<&str> {
        self.entries.get(index).map(String::as_str)
    }

    fn insert(&mut self, s: String) {
        let slot = self.count % STRING_TABLE_CAPACITY;
        if slot < self.entries.len() {
            self.entries[slot] = s;
        } else {
            self.entries.push(s);
        }
        self.count += 1;
    }
}

/// Write a value with its own fresh string table (one top-level pass).
pub fn write_value(writer: &mut PacketWriter, value: &Value) {
    let mut table = StringTable::new();
    write_value_with(writer, &mut table, value);
}

/// Read a value with its own fresh string table (one top-level pass).
pub fn read_value(reader: &mut PacketReader<'_>) -> Result<Value, CodecError> {
    let mut table = StringTable::new();
    read_value_with(reader, &mut table)
}

/// Encode a value into a standalone byte buffer.
pub fn encode_value(value: &Value) -> Bytes {
    let mut writer = PacketWriter::new();
    write_value(&mut writer, value);
    writer.into_bytes()
}

/// Decode a value from a standalone byte buffer.
pub fn decode_value(bytes: &[u8]) -> Result<Value, CodecError> {
    let mut reader = PacketReader::new(bytes);
    read_value(&mut reader)
}

fn write_table_string(writer: &mut PacketWriter, table: &mut StringTable, s: &str) {
    if let Some(index) = table.find(s) {
        writer.write_u8(TAG_STRING_REF);
        writer.write_length(index as u64);
    } else {
        writer.write_u8(TAG_STRING);
        writer.write_length(s.len() as u64);
        writer.write_bytes(s.as_bytes());
        table.insert(s.to_string());
    }
}

fn read_table_string(
    reader: &mut PacketReader<'_>,
    table: &mut StringTable,
    tag: u8,
) -> Result<String, CodecError> {
    match tag {
        TAG_STRING => {
            let len = reader.read_length()? as usize;
            let bytes = reader.read_bytes(len)?;
            let s = std::str::from_utf8(bytes)
                .map_err(|_| CodecError::InvalidUtf8)?
                .to_string();
            table.insert(s.clone());
            Ok(s)
        }
        TAG_STRING_REF => {
            let index = reader.read_length()?;
            table
                .get(index as usize)
                .map(str::to_string)
                .ok_or(CodecError::InvalidStringRef(index))
        }
        other => Err(CodecError::InvalidTag(other)),
    }
}

fn write_number(writer: &mut PacketWriter, n: f64) {
    // -0.0 must keep its sign, so it takes the f64 path.
    let integral = n.fract() == 0.0 && !(n == 0.0 && n.is_sign_negative());
    if integral && (f64::from(i8::MIN)..=f64::from(i8::MAX)).contains(&n) {
        writer.write_u8(TAG_I8);
        writer.write_i8(n as i8);
    } else if integral && (f64::from(i16::MIN)..=f64::from(i16::MAX)).contains(&n) {
        writer.write_u8(TAG_I16);
        writer.write_i16(n as i16);
    } else if integral && (f64::from(i32::MIN)..=f64::from(i32::MAX)).contains(&n) {
        writer.write_u8(TAG_I32);
        writer.write_i32(n as i32);
    } else {
        writer.write_u8(TAG_F64);
        writer.write_f64(n);
    }
}

fn write_value_with(writer: &mut PacketWriter, table: &mut StringTable, value: &Value) {
    match value {
        Value::Undefined => writer.write_u8(TAG_UNDEFINED),
        Value::Null => writer.write_u8(TAG_NULL),
        Value::Bool(true) => writer.write_u8(TAG_TRUE),
        Value::Bool(false) => writer.write_u8(TAG_FALSE),
        Value::Number(n) => write_number(writer, *n),
        Value::String(s) => write_table_string(writer, table, s),
        Value::Array(items) => {
            writer.write_u8(TAG_ARRAY);
            writer.write_length(items.len() as u64);
            for item in items {
                write_value_with(writer, table, item);
            }
        }
        Value::Object(entries) => {
            writer.write_u8(TAG_OBJECT);
            writer.write_length(entries.len() as u64);
            for (key, item) in entries {
                write_table_string(writer, table, key);
                write_value_with(writer, table, item);
            }
        }
    }
}

fn read_value_with(
    reader: &mut PacketReader<'_>,
    table: &mut StringTable,
) -> Result<Value, CodecError> {
    let tag = reader.read_u8()?;
    match tag {
        TAG_UNDEFINED => Ok(Value::Undefined),
        TAG_NULL => Ok(Value::Null),
        TAG_TRUE => Ok(Value::Bool(true)),
        TAG_FALSE => Ok(Value::Bool(false)),
        TAG_I8 => Ok(Value::Number(f64::from(reader.read_i8()?))),
        TAG_I16 => Ok(Value::Number(f64::from(reader.read_i16()?))),
        TAG_I32 => Ok(Value::Number(f64::from(reader.read_i32()?))),
        TAG_F64 => Ok(Value::Number(reader.read_f64()?)),
        TAG_STRING | TAG_STRING_REF => {
            Ok(Value::String(read_table_string(reader, table, tag)?))
        }
        TAG_ARRAY => {
            let len = reader.read_length()? as usize;
            let mut items = Vec::with_capacity(len.min(4096));
            for _ in 0..len {
                items.push(read_value_with(reader, table)?);
            }
            Ok(Value::Array(items))
        }
        TAG_OBJECT => {
            let len = reader.read_length()? as usize;
            let mut entries = Vec::with_capacity(len.min(4096));
            for _ in 0..len {
                let key_tag = reader.read_u8()?;
                let key = read_table_string(reader, table, key_tag)?;
                let item = read_value_with(reader, table)?;
                entries.push((key, item));
            }
            Ok(Value::Object(entries))
        }
        other => Err(CodecError::InvalidTag(other)),
    }
}
