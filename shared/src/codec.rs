//! Byte-level reader and writer for packet payloads.
//!
//! Packets mix two encodings:
//! - variable-length fields (strings, lists) written field by field through
//!   [`PacketWriter`] and read back with [`PacketReader`]
//! - fixed-layout telemetry structs encoded with bincode using fixed-width,
//!   little-endian integers so their size never depends on the values
//!
//! All integers are little-endian. Strings come in two flavours: UTF-8 with a
//! one-byte byte count, and UTF-32 with a one-byte character count (used for
//! names and chat so non-Latin text survives).

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Errors produced while decoding or encoding packet payloads.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The payload ended before a field was complete.
    #[error("payload truncated: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEnd { needed: usize, remaining: usize },

    /// A tag byte did not name any known packet.
    #[error("unknown {family} tag 0x{tag:02X}")]
    UnknownTag { family: &'static str, tag: u8 },

    /// A string field held bytes that are not valid text.
    #[error("invalid string encoding")]
    InvalidString,

    /// A fixed-layout struct failed to encode or decode.
    #[error("fixed layout error: {0}")]
    Layout(#[from] bincode::Error),
}

/// Bincode options shared by every fixed-layout struct on the wire.
fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .allow_trailing_bytes()
}

/// Cursor over a received payload.
#[derive(Debug)]
pub struct PacketReader<'a> {
    buf: &'a [u8],
}

impl<'a> PacketReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Returns the unread tail without consuming it.
    pub fn rest(&self) -> &'a [u8] {
        self.buf
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() < len {
            return Err(CodecError::UnexpectedEnd {
                needed: len,
                remaining: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_i16(&mut self) -> Result<i16, CodecError> {
        Ok(i16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, CodecError> {
        Ok(f32::from_le_bytes(self.read_array()?))
    }

    /// Reads a UTF-8 string prefixed by its byte length.
    pub fn read_utf8(&mut self) -> Result<String, CodecError> {
        let len = self.read_u8()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidString)
    }

    /// Reads a UTF-32 string prefixed by its character count.
    pub fn read_utf32(&mut self) -> Result<String, CodecError> {
        let len = self.read_u8()? as usize;
        let mut out = String::with_capacity(len);
        for _ in 0..len {
            let code = self.read_u32()?;
            out.push(char::from_u32(code).ok_or(CodecError::InvalidString)?);
        }
        Ok(out)
    }

    /// Decodes a fixed-layout struct from the current position.
    pub fn read_struct<T: DeserializeOwned>(&mut self) -> Result<T, CodecError> {
        Ok(wire_options().deserialize_from(&mut self.buf)?)
    }
}

/// Growable buffer for an outgoing payload.
#[derive(Debug, Default, Clone)]
pub struct PacketWriter {
    buf: Vec<u8>,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(value as u8);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_i16(&mut self, value: i16) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_f32(&mut self, value: f32) {
        self.write_bytes(&value.to_le_bytes());
    }

    /// Writes a UTF-8 string, cut at 255 bytes on a character boundary.
    pub fn write_utf8(&mut self, value: &str) {
        let mut end = value.len().min(u8::MAX as usize);
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        self.write_u8(end as u8);
        self.write_bytes(&value.as_bytes()[..end]);
    }

    /// Writes a UTF-32 string, cut at 255 characters.
    pub fn write_utf32(&mut self, value: &str) {
        let chars: Vec<char> = value.chars().take(u8::MAX as usize).collect();
        self.write_u8(chars.len() as u8);
        for c in chars {
            self.write_u32(c as u32);
        }
    }

    /// Appends a fixed-layout struct.
    pub fn write_struct<T: Serialize>(&mut self, value: &T) -> Result<(), CodecError> {
        wire_options().serialize_into(&mut self.buf, value)?;
        Ok(())
    }
}
