//! String type implementations (&str, String).

use crate::error::Result;
use crate::protocol::types::{Oid, oid};

use super::{FromWireValue, ToWireValue, cannot_decode, type_mismatch, utf8, write_len_prefixed};

/// Types whose text and binary representations are both the raw UTF-8 string.
fn is_textual(oid: Oid) -> bool {
    matches!(
        oid,
        oid::TEXT | oid::VARCHAR | oid::BPCHAR | oid::NAME | oid::UNKNOWN
    )
}

impl<'a> FromWireValue<'a> for &'a str {
    fn from_text(_oid: Oid, bytes: &'a [u8]) -> Result<Self> {
        // Every type has a text representation.
        utf8(bytes)
    }

    fn from_binary(oid: Oid, bytes: &'a [u8]) -> Result<Self> {
        if !is_textual(oid) {
            return Err(cannot_decode(oid, "str"));
        }
        utf8(bytes)
    }
}

impl FromWireValue<'_> for String {
    fn from_text(oid: Oid, bytes: &[u8]) -> Result<Self> {
        <&str>::from_text(oid, bytes).map(str::to_owned)
    }

    fn from_binary(oid: Oid, bytes: &[u8]) -> Result<Self> {
        <&str>::from_binary(oid, bytes).map(str::to_owned)
    }
}

impl ToWireValue for str {
    fn natural_oid(&self) -> Oid {
        oid::TEXT
    }

    fn encode(&self, target_oid: Oid, buf: &mut Vec<u8>) -> Result<()> {
        if !is_textual(target_oid) {
            return Err(type_mismatch("str", target_oid));
        }
        write_len_prefixed(buf, self.as_bytes())
    }
}

impl ToWireValue for String {
    fn natural_oid(&self) -> Oid {
        oid::TEXT
    }

    fn encode(&self, target_oid: Oid, buf: &mut Vec<u8>) -> Result<()> {
        self.as_str().encode(target_oid, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_text_value_reads_as_str() {
        assert_eq!(String::from_text(oid::TEXT, b"hello").unwrap(), "hello");
        assert_eq!(<&str>::from_text(oid::INT4, b"42").unwrap(), "42");
        assert_eq!(<&str>::from_text(oid::TEXT, b"").unwrap(), "");
    }

    #[test]
    fn binary_requires_textual_type() {
        assert!(String::from_binary(oid::INT4, &[0, 0, 0, 1]).is_err());
        assert_eq!(<&str>::from_binary(oid::VARCHAR, b"x").unwrap(), "x");
    }

    #[test]
    fn invalid_utf8_is_decode_error() {
        assert!(String::from_text(oid::TEXT, &[0xff, 0xfe]).is_err());
    }
}
