//! Byte type implementations (`&[u8]`, `Vec<u8>`).

use crate::error::{Error, Result};
use crate::protocol::types::{Oid, oid};

use super::{FromWireValue, ToWireValue, cannot_decode, type_mismatch, write_len_prefixed};

impl<'a> FromWireValue<'a> for &'a [u8] {
    /// Raw bytes of the text representation, whatever the column type.
    fn from_text(_oid: Oid, bytes: &'a [u8]) -> Result<Self> {
        Ok(bytes)
    }

    fn from_binary(oid: Oid, bytes: &'a [u8]) -> Result<Self> {
        if oid != oid::BYTEA {
            return Err(cannot_decode(oid, "bytes"));
        }
        Ok(bytes)
    }
}

impl FromWireValue<'_> for Vec<u8> {
    fn from_text(oid: Oid, bytes: &[u8]) -> Result<Self> {
        if oid != oid::BYTEA {
            return Err(cannot_decode(oid, "Vec<u8>"));
        }
        // Text format for bytea is hex-encoded: \xDEADBEEF
        match bytes.strip_prefix(b"\\x") {
            Some(hex) => decode_hex(hex),
            None => Err(Error::Decode(
                "bytea text value is not in hex format".into(),
            )),
        }
    }

    fn from_binary(oid: Oid, bytes: &[u8]) -> Result<Self> {
        if oid != oid::BYTEA {
            return Err(cannot_decode(oid, "Vec<u8>"));
        }
        Ok(bytes.to_vec())
    }
}

impl ToWireValue for [u8] {
    fn natural_oid(&self) -> Oid {
        oid::BYTEA
    }

    fn encode(&self, target_oid: Oid, buf: &mut Vec<u8>) -> Result<()> {
        if target_oid != oid::BYTEA {
            return Err(type_mismatch("bytes", target_oid));
        }
        write_len_prefixed(buf, self)
    }
}

impl ToWireValue for Vec<u8> {
    fn natural_oid(&self) -> Oid {
        oid::BYTEA
    }

    fn encode(&self, target_oid: Oid, buf: &mut Vec<u8>) -> Result<()> {
        self.as_slice().encode(target_oid, buf)
    }
}

/// Decode hex string to bytes
fn decode_hex(hex: &[u8]) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(Error::Decode("invalid hex length".into()));
    }

    hex.chunks_exact(2)
        .map(|pair| -> Result<u8> { Ok((hex_digit(pair[0])? << 4) | hex_digit(pair[1])?) })
        .collect()
}

fn hex_digit(b: u8) -> Result<u8> {
    match b {
        b'0'..=b'9' => Ok(b - b'0'),
        b'a'..=b'f' => Ok(b - b'a' + 10),
        b'A'..=b'F' => Ok(b - b'A' + 10),
        _ => Err(Error::Decode(format!("invalid hex digit: {}", b as char))),
    }
}
