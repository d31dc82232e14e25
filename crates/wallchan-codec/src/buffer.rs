//! The binary envelope and its cursor-style writer/reader.
//!
//! An [`Envelope`] is the unit handed to the transport: one contiguous,
//! immutable byte region. [`BufferWriter`] appends primitives to a growing
//! buffer and seals it into an envelope; [`BufferReader`] consumes primitives
//! from the front of one, left to right.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CodecError, Result};

/// Longest valid LEB128 encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// One contiguous byte region exchanged with the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope(Bytes);

impl Envelope {
    pub fn new(bytes: Bytes) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Bytes> for Envelope {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<Envelope> for Bytes {
    fn from(envelope: Envelope) -> Self {
        envelope.0
    }
}

/// Append-only writer producing an [`Envelope`].
#[derive(Debug, Default)]
pub struct BufferWriter {
    buf: BytesMut,
}

impl BufferWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, byte: u8) {
        self.buf.put_u8(byte);
    }

    pub fn write_slice(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Unsigned LEB128: 7 bits per byte, high bit set on all but the last.
    pub fn write_varint(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.buf.put_u8((value as u8 & 0x7F) | 0x80);
            value >>= 7;
        }
        self.buf.put_u8(value as u8);
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buf.put_f64_le(value);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Seal the written bytes.
    pub fn finish(self) -> Envelope {
        Envelope(self.buf.freeze())
    }
}

/// Front-consuming reader over an [`Envelope`].
#[derive(Debug, Clone)]
pub struct BufferReader {
    buf: Bytes,
}

impl BufferReader {
    pub fn new(envelope: impl Into<Envelope>) -> Self {
        Self {
            buf: envelope.into().0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    /// Split off the next `len` bytes without copying.
    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes> {
        self.ensure(len)?;
        Ok(self.buf.split_to(len))
    }

    pub fn read_varint(&mut self) -> Result<u64> {
        let mut value: u64 = 0;
        for index in 0..MAX_VARINT_LEN {
            let byte = self.read_u8()?;
            let bits = u64::from(byte & 0x7F);
            // The 10th byte only has room for the top bit of a u64.
            if index == MAX_VARINT_LEN - 1 && bits > 1 {
                return Err(CodecError::VarintOverflow);
            }
            value |= bits << (7 * index);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(CodecError::VarintOverflow)
    }

    /// A varint used as a length or count, checked against what is left so
    /// a corrupt prefix cannot trigger a huge allocation.
    pub fn read_len(&mut self) -> Result<usize> {
        let len = self.read_varint()?;
        let remaining = self.remaining();
        match usize::try_from(len) {
            Ok(len) if len <= remaining => Ok(len),
            _ => Err(CodecError::UnexpectedEof {
                needed: usize::try_from(len).unwrap_or(usize::MAX),
                remaining,
            }),
        }
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.ensure(8)?;
        Ok(self.buf.get_f64_le())
    }

    fn ensure(&self, needed: usize) -> Result<()> {
        if self.buf.len() < needed {
            return Err(CodecError::UnexpectedEof {
                needed,
                remaining: self.buf.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varint_bytes(value: u64) -> Vec<u8> {
        let mut writer = BufferWriter::new();
        writer.write_varint(value);
        writer.finish().as_bytes().to_vec()
    }

    #[test]
    fn varint_boundaries() {
        assert_eq!(varint_bytes(0), vec![0x00]);
        assert_eq!(varint_bytes(0x7F), vec![0x7F]);
        assert_eq!(varint_bytes(0x80), vec![0x80, 0x01]);
        assert_eq!(varint_bytes(300), vec![0xAC, 0x02]);
        assert_eq!(varint_bytes(u64::MAX).len(), MAX_VARINT_LEN);

        for value in [0, 1, 127, 128, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut reader = BufferReader::new(Bytes::from(varint_bytes(value)));
            assert_eq!(reader.read_varint().unwrap(), value);
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn varint_overflow_is_rejected() {
        let mut reader = BufferReader::new(Bytes::from(vec![0xFF; 11]));
        assert!(matches!(
            reader.read_varint(),
            Err(CodecError::VarintOverflow)
        ));

        let mut tenth_byte_too_big = vec![0xFF; 9];
        tenth_byte_too_big.push(0x02);
        let mut reader = BufferReader::new(Bytes::from(tenth_byte_too_big));
        assert!(matches!(
            reader.read_varint(),
            Err(CodecError::VarintOverflow)
        ));
    }

    #[test]
    fn truncated_varint_is_eof() {
        let mut reader = BufferReader::new(Bytes::from_static(&[0x80, 0x80]));
        assert!(matches!(
            reader.read_varint(),
            Err(CodecError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn read_len_refuses_lengths_past_the_end() {
        let mut writer = BufferWriter::new();
        writer.write_varint(1_000_000);
        writer.write_slice(b"short");
        let mut reader = BufferReader::new(writer.finish());

        assert!(matches!(
            reader.read_len(),
            Err(CodecError::UnexpectedEof {
                needed: 1_000_000,
                remaining: 5
            })
        ));
    }

    #[test]
    fn primitives_read_back_in_order() {
        let mut writer = BufferWriter::with_capacity(32);
        writer.write_u8(9);
        writer.write_f64(-2.5);
        writer.write_slice(b"abc");
        assert_eq!(writer.len(), 12);

        let mut reader = BufferReader::new(writer.finish());
        assert_eq!(reader.read_u8().unwrap(), 9);
        assert_eq!(reader.read_f64().unwrap(), -2.5);
        assert_eq!(reader.read_bytes(3).unwrap().as_ref(), b"abc");
        assert!(reader.read_u8().is_err());
    }
}
