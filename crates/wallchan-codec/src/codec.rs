//! Compact tagged encoding of [`Value`]s.
//!
//! Each value is one tag byte followed by its payload:
//!
//! ```text
//! 0 Undefined   1 String  (varint len, UTF-8)   2 Bytes (varint len, raw)
//! 3 Array  (varint count, values)   4 Object (varint count, (key, value)*)
//! 5 Int (zig-zag varint)   6 Float (f64 LE)   7 Null   8 True   9 False
//! ```
//!
//! No schema travels with the data. Values are written and read strictly
//! left to right, so several values may share one envelope.

use crate::buffer::{BufferReader, BufferWriter, Envelope};
use crate::error::{CodecError, Result};
use crate::value::{Object, Value};

/// Maximum array/object nesting accepted in either direction.
pub const MAX_DEPTH: usize = 128;

/// Value tags.
pub mod tag {
    pub const UNDEFINED: u8 = 0;
    pub const STRING: u8 = 1;
    pub const BYTES: u8 = 2;
    pub const ARRAY: u8 = 3;
    pub const OBJECT: u8 = 4;
    pub const INT: u8 = 5;
    pub const FLOAT: u8 = 6;
    pub const NULL: u8 = 7;
    pub const TRUE: u8 = 8;
    pub const FALSE: u8 = 9;
}

/// Append `value` to `writer`.
pub fn serialize(writer: &mut BufferWriter, value: &Value) -> Result<()> {
    write_value(writer, value, 0)
}

/// Append `items` as one array value, for callers that hold a slice rather
/// than a [`Value::Array`].
pub fn serialize_array(writer: &mut BufferWriter, items: &[Value]) -> Result<()> {
    write_array(writer, items, 0)
}

/// Read the next value from `reader`.
pub fn deserialize(reader: &mut BufferReader) -> Result<Value> {
    read_value(reader, 0)
}

/// Encode a single value as its own envelope.
pub fn encode(value: &Value) -> Result<Envelope> {
    let mut writer = BufferWriter::new();
    serialize(&mut writer, value)?;
    Ok(writer.finish())
}

/// Decode an envelope holding exactly one value.
pub fn decode(envelope: impl Into<Envelope>) -> Result<Value> {
    let mut reader = BufferReader::new(envelope);
    let value = deserialize(&mut reader)?;
    if !reader.is_empty() {
        return Err(CodecError::TrailingBytes(reader.remaining()));
    }
    Ok(value)
}

fn zigzag(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}

fn unzigzag(n: u64) -> i64 {
    ((n >> 1) as i64) ^ -((n & 1) as i64)
}

fn write_str(writer: &mut BufferWriter, s: &str) {
    writer.write_varint(s.len() as u64);
    writer.write_slice(s.as_bytes());
}

fn write_value(writer: &mut BufferWriter, value: &Value, depth: usize) -> Result<()> {
    match value {
        Value::Undefined => writer.write_u8(tag::UNDEFINED),
        Value::Null => writer.write_u8(tag::NULL),
        Value::Bool(true) => writer.write_u8(tag::TRUE),
        Value::Bool(false) => writer.write_u8(tag::FALSE),
        Value::Int(n) => {
            writer.write_u8(tag::INT);
            writer.write_varint(zigzag(*n));
        }
        Value::Float(f) => {
            writer.write_u8(tag::FLOAT);
            writer.write_f64(*f);
        }
        Value::String(s) => {
            writer.write_u8(tag::STRING);
            write_str(writer, s);
        }
        Value::Bytes(b) => {
            writer.write_u8(tag::BYTES);
            writer.write_varint(b.len() as u64);
            writer.write_slice(b);
        }
        Value::Array(items) => write_array(writer, items, depth)?,
        Value::Object(map) => {
            check_depth(depth)?;
            writer.write_u8(tag::OBJECT);
            writer.write_varint(map.len() as u64);
            for (key, item) in map {
                write_str(writer, key);
                write_value(writer, item, depth + 1)?;
            }
        }
    }
    Ok(())
}

fn write_array(writer: &mut BufferWriter, items: &[Value], depth: usize) -> Result<()> {
    check_depth(depth)?;
    writer.write_u8(tag::ARRAY);
    writer.write_varint(items.len() as u64);
    for item in items {
        write_value(writer, item, depth + 1)?;
    }
    Ok(())
}

fn read_string(reader: &mut BufferReader) -> Result<String> {
    let len = reader.read_len()?;
    let bytes = reader.read_bytes(len)?;
    Ok(String::from_utf8(bytes.to_vec())?)
}

fn read_value(reader: &mut BufferReader, depth: usize) -> Result<Value> {
    let value = match reader.read_u8()? {
        tag::UNDEFINED => Value::Undefined,
        tag::NULL => Value::Null,
        tag::TRUE => Value::Bool(true),
        tag::FALSE => Value::Bool(false),
        tag::INT => Value::Int(unzigzag(reader.read_varint()?)),
        tag::FLOAT => Value::Float(reader.read_f64()?),
        tag::STRING => Value::String(read_string(reader)?),
        tag::BYTES => {
            let len = reader.read_len()?;
            Value::Bytes(reader.read_bytes(len)?)
        }
        tag::ARRAY => {
            check_depth(depth)?;
            // Every element takes at least one byte, so `read_len` bounds the
            // count by what is left.
            let count = reader.read_len()?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(read_value(reader, depth + 1)?);
            }
            Value::Array(items)
        }
        tag::OBJECT => {
            check_depth(depth)?;
            let count = reader.read_len()?;
            let mut map = Object::new();
            for _ in 0..count {
                let key = read_string(reader)?;
                let item = read_value(reader, depth + 1)?;
                map.insert(key, item);
            }
            Value::Object(map)
        }
        other => return Err(CodecError::UnknownTag(other)),
    };
    Ok(value)
}

fn check_depth(depth: usize) -> Result<()> {
    if depth >= MAX_DEPTH {
        return Err(CodecError::DepthExceeded { max: MAX_DEPTH });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn roundtrip(value: Value) {
        let envelope = encode(&value).unwrap();
        assert_eq!(decode(envelope).unwrap(), value, "roundtrip of {value:?}");
    }

    #[test]
    fn scalars_roundtrip() {
        roundtrip(Value::Undefined);
        roundtrip(Value::Null);
        roundtrip(Value::Bool(true));
        roundtrip(Value::Bool(false));
        roundtrip(Value::Int(0));
        roundtrip(Value::Int(-1));
        roundtrip(Value::Int(i64::MIN));
        roundtrip(Value::Int(i64::MAX));
        roundtrip(Value::Float(3.25));
        roundtrip(Value::String("héllo".into()));
        roundtrip(Value::Bytes(Bytes::from_static(&[0, 255, 7])));
    }

    #[test]
    fn empty_containers_roundtrip() {
        roundtrip(Value::String(String::new()));
        roundtrip(Value::Bytes(Bytes::new()));
        roundtrip(Value::Array(Vec::new()));
        roundtrip(Value::Object(Object::new()));
    }

    #[test]
    fn nested_values_roundtrip() {
        let mut inner = Object::new();
        inner.insert("list".into(), vec![Value::Int(1), Value::Null, "x".into()].into());
        inner.insert("blob".into(), Value::Bytes(Bytes::from_static(b"\x00\x01")));
        let mut outer = Object::new();
        outer.insert("inner".into(), inner.into());
        outer.insert("flag".into(), false.into());
        roundtrip(outer.into());
    }

    #[test]
    fn wire_layout_is_stable() {
        let value = Value::Array(vec![Value::Int(-2), "ab".into(), Value::Undefined]);
        let envelope = encode(&value).unwrap();
        assert_eq!(
            envelope.as_bytes(),
            &[tag::ARRAY, 3, tag::INT, 3, tag::STRING, 2, b'a', b'b', tag::UNDEFINED]
        );
    }

    #[test]
    fn values_share_an_envelope_left_to_right() {
        let mut writer = BufferWriter::new();
        serialize(&mut writer, &Value::Array(vec![Value::Int(201), Value::Int(4)])).unwrap();
        serialize(&mut writer, &Value::String("body".into())).unwrap();

        let mut reader = BufferReader::new(writer.finish());
        assert_eq!(
            deserialize(&mut reader).unwrap(),
            Value::Array(vec![Value::Int(201), Value::Int(4)])
        );
        assert_eq!(deserialize(&mut reader).unwrap(), Value::from("body"));
        assert!(reader.is_empty());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(matches!(
            decode(Bytes::from_static(&[42])),
            Err(CodecError::UnknownTag(42))
        ));
    }

    #[test]
    fn truncated_input_is_rejected() {
        let envelope = encode(&Value::String("truncate me".into())).unwrap();
        let short = envelope.into_bytes().slice(..5);
        assert!(matches!(decode(short), Err(CodecError::UnexpectedEof { .. })));
    }

    #[test]
    fn hostile_array_count_is_rejected_without_allocating() {
        let mut writer = BufferWriter::new();
        writer.write_u8(tag::ARRAY);
        writer.write_varint(u64::MAX);
        assert!(matches!(
            decode(writer.finish()),
            Err(CodecError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        assert!(matches!(
            decode(Bytes::from_static(&[tag::STRING, 1, 0xFF])),
            Err(CodecError::InvalidUtf8(_))
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        assert!(matches!(
            decode(Bytes::from_static(&[tag::NULL, tag::NULL])),
            Err(CodecError::TrailingBytes(1))
        ));
    }

    #[test]
    fn nesting_limit_applies_both_ways() {
        let mut deep = Value::Null;
        for _ in 0..=MAX_DEPTH {
            deep = Value::Array(vec![deep]);
        }
        assert!(matches!(
            encode(&deep),
            Err(CodecError::DepthExceeded { .. })
        ));

        let mut raw = vec![tag::ARRAY, 1].repeat(MAX_DEPTH + 1);
        raw.push(tag::NULL);
        assert!(matches!(
            decode(Bytes::from(raw)),
            Err(CodecError::DepthExceeded { .. })
        ));

        let mut ok = Value::Null;
        for _ in 0..MAX_DEPTH {
            ok = Value::Array(vec![ok]);
        }
        roundtrip(ok);
    }
}
