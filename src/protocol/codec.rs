//! PostgreSQL wire protocol encoding and decoding primitives.
//!
//! PostgreSQL uses big-endian (network byte order) for all integers.
//!
//! Every regular message on the wire is framed as
//! `[1-byte type tag][4-byte length including itself][payload]`.
//! Startup-class messages (StartupMessage, SSLRequest, CancelRequest) omit the
//! tag.

use zerocopy::FromBytes;

use crate::error::{Error, Result};

use super::backend::RawMessage;
use super::types::{I16BE, I32BE, U16BE, U32BE};

/// Size of the tag + length header of a regular message.
pub const HEADER_LEN: usize = 5;

/// Largest message length accepted from the server.
pub const MAX_MESSAGE_LEN: usize = 0x3fff_ffff;

/// Decode one framed message from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet hold a complete message; nothing
/// is consumed in that case and the caller should read more bytes. On success
/// returns the message and the number of bytes it occupied, so trailing bytes
/// stay available for the next call.
///
/// The length field is validated before any payload access: a value below 4
/// (negative included) or above [`MAX_MESSAGE_LEN`] is a protocol error.
pub fn decode_message(buf: &[u8]) -> Result<Option<(RawMessage<'_>, usize)>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let type_byte = buf[0];
    let (length, _) = read_i32(&buf[1..HEADER_LEN])?;
    let length = check_length(length)?;

    let total = 1 + length;
    if buf.len() < total {
        return Ok(None);
    }
    Ok(Some((RawMessage::new(type_byte, &buf[HEADER_LEN..total]), total)))
}

/// Decode one untagged startup-class message from the front of `buf`.
///
/// Returns the body after the length field (starting with the protocol
/// version or request code) and the consumed byte count.
pub fn decode_startup_frame(buf: &[u8]) -> Result<Option<(&[u8], usize)>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let (length, _) = read_i32(&buf[..4])?;
    let length = check_length(length)?;
    if buf.len() < length {
        return Ok(None);
    }
    Ok(Some((&buf[4..length], length)))
}

fn check_length(length: i32) -> Result<usize> {
    if length < 4 {
        return Err(Error::Protocol(format!("invalid message length: {length}")));
    }
    let length = length as usize;
    if length > MAX_MESSAGE_LEN {
        return Err(Error::Protocol(format!(
            "message length {length} exceeds limit {MAX_MESSAGE_LEN}"
        )));
    }
    Ok(length)
}

/// Fail if a payload has bytes left after parsing.
#[inline]
pub fn expect_end(rest: &[u8], what: &str) -> Result<()> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(Error::Protocol(format!(
            "{what}: {} unexpected trailing bytes",
            rest.len()
        )))
    }
}

/// Read 1-byte unsigned integer.
#[inline]
pub fn read_u8(data: &[u8]) -> Result<(u8, &[u8])> {
    match data.split_first() {
        Some((&byte, rest)) => Ok((byte, rest)),
        None => Err(Error::Protocol("read_u8: empty buffer".into())),
    }
}

/// Read 2-byte big-endian signed integer.
#[inline]
pub fn read_i16(data: &[u8]) -> Result<(i16, &[u8])> {
    let (head, rest) = split(data, 2, "read_i16")?;
    let value = I16BE::ref_from_bytes(head)
        .map_err(|e| Error::Protocol(format!("read_i16: {e:?}")))?
        .get();
    Ok((value, rest))
}

/// Read 2-byte big-endian unsigned integer.
#[inline]
pub fn read_u16(data: &[u8]) -> Result<(u16, &[u8])> {
    let (head, rest) = split(data, 2, "read_u16")?;
    let value = U16BE::ref_from_bytes(head)
        .map_err(|e| Error::Protocol(format!("read_u16: {e:?}")))?
        .get();
    Ok((value, rest))
}

/// Read 4-byte big-endian signed integer.
#[inline]
pub fn read_i32(data: &[u8]) -> Result<(i32, &[u8])> {
    let (head, rest) = split(data, 4, "read_i32")?;
    let value = I32BE::ref_from_bytes(head)
        .map_err(|e| Error::Protocol(format!("read_i32: {e:?}")))?
        .get();
    Ok((value, rest))
}

/// Read 4-byte big-endian unsigned integer.
#[inline]
pub fn read_u32(data: &[u8]) -> Result<(u32, &[u8])> {
    let (head, rest) = split(data, 4, "read_u32")?;
    let value = U32BE::ref_from_bytes(head)
        .map_err(|e| Error::Protocol(format!("read_u32: {e:?}")))?
        .get();
    Ok((value, rest))
}

/// Read fixed-length bytes.
#[inline]
pub fn read_bytes(data: &[u8], len: usize) -> Result<(&[u8], &[u8])> {
    split(data, len, "read_bytes")
}

#[inline]
fn split<'a>(data: &'a [u8], len: usize, what: &str) -> Result<(&'a [u8], &'a [u8])> {
    data.split_at_checked(len).ok_or_else(|| {
        Error::Protocol(format!(
            "{what}: buffer too short: {} < {len}",
            data.len()
        ))
    })
}

/// Read null-terminated string (PostgreSQL String type).
/// Returns the string bytes (without the null terminator) and remaining data.
#[inline]
pub fn read_cstring(data: &[u8]) -> Result<(&[u8], &[u8])> {
    match memchr::memchr(0, data) {
        Some(pos) => Ok((&data[..pos], &data[pos + 1..])),
        None => Err(Error::Protocol(
            "read_cstring: no null terminator found".into(),
        )),
    }
}

/// Read null-terminated string as &str.
#[inline]
pub fn read_cstr(data: &[u8]) -> Result<(&str, &[u8])> {
    let (bytes, rest) = read_cstring(data)?;
    let s = simdutf8::compat::from_utf8(bytes)
        .map_err(|e| Error::Protocol(format!("read_cstr: invalid UTF-8: {e}")))?;
    Ok((s, rest))
}

/// Write 2-byte big-endian signed integer.
#[inline]
pub fn write_i16(out: &mut Vec<u8>, value: i16) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Write 4-byte big-endian signed integer.
#[inline]
pub fn write_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Write null-terminated string (PostgreSQL String type).
#[inline]
pub fn write_cstring(out: &mut Vec<u8>, s: &[u8]) {
    out.extend_from_slice(s);
    out.push(0);
}

/// Write null-terminated string from &str.
#[inline]
pub fn write_cstr(out: &mut Vec<u8>, s: &str) {
    write_cstring(out, s.as_bytes());
}

/// Message builder helper that handles the length field.
///
/// PostgreSQL message format:
/// - Type byte (1 byte) - NOT included in length
/// - Length (4 bytes) - includes itself
/// - Payload (Length - 4 bytes)
pub struct MessageBuilder<'a> {
    buf: &'a mut Vec<u8>,
    start: usize,
}

impl<'a> MessageBuilder<'a> {
    /// Start building a message with a type byte.
    pub fn new(buf: &'a mut Vec<u8>, type_byte: u8) -> Self {
        buf.push(type_byte);
        let start = buf.len();
        buf.extend_from_slice(&[0, 0, 0, 0]); // Placeholder for length
        Self { buf, start }
    }

    /// Start building a startup-class message (no type byte).
    pub fn new_startup(buf: &'a mut Vec<u8>) -> Self {
        let start = buf.len();
        buf.extend_from_slice(&[0, 0, 0, 0]);
        Self { buf, start }
    }

    /// Get mutable access to the underlying buffer.
    pub fn buf(&mut self) -> &mut Vec<u8> {
        self.buf
    }

    /// Write a u8.
    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Write an i16.
    pub fn write_i16(&mut self, value: i16) {
        write_i16(self.buf, value);
    }

    /// Write an i32.
    pub fn write_i32(&mut self, value: i32) {
        write_i32(self.buf, value);
    }

    /// Write raw bytes.
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Write null-terminated string.
    pub fn write_cstr(&mut self, s: &str) {
        write_cstr(self.buf, s);
    }

    /// Finish building the message and fill in the length field.
    pub fn finish(self) {
        let len = (self.buf.len() - self.start) as i32;
        self.buf[self.start..self.start + 4].copy_from_slice(&len.to_be_bytes());
    }
}
