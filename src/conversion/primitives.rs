//! Primitive type implementations (bool, integers, floats).

use crate::error::{Error, Result};
use crate::protocol::types::{Oid, oid};

use super::{FromWireValue, ToWireValue, cannot_decode, overflow, type_mismatch, utf8};

fn fixed<const N: usize>(bytes: &[u8], what: &str) -> Result<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| Error::Decode(format!("invalid {what} length: {}", bytes.len())))
}

// === Boolean ===

impl FromWireValue<'_> for bool {
    fn from_text(oid: Oid, bytes: &[u8]) -> Result<Self> {
        if oid != oid::BOOL {
            return Err(cannot_decode(oid, "bool"));
        }
        match bytes {
            b"t" | b"true" => Ok(true),
            b"f" | b"false" => Ok(false),
            _ => Err(Error::Decode(format!(
                "invalid boolean: {:?}",
                String::from_utf8_lossy(bytes)
            ))),
        }
    }

    fn from_binary(oid: Oid, bytes: &[u8]) -> Result<Self> {
        if oid != oid::BOOL {
            return Err(cannot_decode(oid, "bool"));
        }
        let [byte] = fixed::<1>(bytes, "bool")?;
        Ok(byte != 0)
    }
}

impl ToWireValue for bool {
    fn natural_oid(&self) -> Oid {
        oid::BOOL
    }

    fn encode(&self, target_oid: Oid, buf: &mut Vec<u8>) -> Result<()> {
        if target_oid != oid::BOOL {
            return Err(type_mismatch("bool", target_oid));
        }
        buf.extend_from_slice(&1_i32.to_be_bytes());
        buf.push(u8::from(*self));
        Ok(())
    }
}

// === Integer types ===

/// Decode any integer column that fits the target without loss.
fn int_from_binary(oid: Oid, bytes: &[u8], rust_type: &str) -> Result<i64> {
    match oid {
        oid::INT2 => Ok(i16::from_be_bytes(fixed(bytes, "int2")?) as i64),
        oid::INT4 => Ok(i32::from_be_bytes(fixed(bytes, "int4")?) as i64),
        oid::INT8 => Ok(i64::from_be_bytes(fixed(bytes, "int8")?)),
        oid::OID => Ok(u32::from_be_bytes(fixed(bytes, "oid")?) as i64),
        _ => Err(cannot_decode(oid, rust_type)),
    }
}

fn int_from_text(oid: Oid, bytes: &[u8], rust_type: &str) -> Result<i64> {
    if !matches!(oid, oid::INT2 | oid::INT4 | oid::INT8 | oid::OID) {
        return Err(cannot_decode(oid, rust_type));
    }
    utf8(bytes)?
        .parse()
        .map_err(|e| Error::Decode(format!("invalid {rust_type}: {e}")))
}

fn encode_int(value: i64, rust_type: &str, target_oid: Oid, buf: &mut Vec<u8>) -> Result<()> {
    match target_oid {
        oid::INT2 => {
            let v = i16::try_from(value).map_err(|_| overflow(rust_type, "INT2"))?;
            buf.extend_from_slice(&2_i32.to_be_bytes());
            buf.extend_from_slice(&v.to_be_bytes());
        }
        oid::INT4 => {
            let v = i32::try_from(value).map_err(|_| overflow(rust_type, "INT4"))?;
            buf.extend_from_slice(&4_i32.to_be_bytes());
            buf.extend_from_slice(&v.to_be_bytes());
        }
        oid::INT8 => {
            buf.extend_from_slice(&8_i32.to_be_bytes());
            buf.extend_from_slice(&value.to_be_bytes());
        }
        oid::OID => {
            let v = u32::try_from(value).map_err(|_| overflow(rust_type, "OID"))?;
            buf.extend_from_slice(&4_i32.to_be_bytes());
            buf.extend_from_slice(&v.to_be_bytes());
        }
        _ => return Err(type_mismatch(rust_type, target_oid)),
    }
    Ok(())
}

macro_rules! impl_int {
    ($t:ty, $name:literal, $natural:expr) => {
        impl FromWireValue<'_> for $t {
            fn from_text(oid: Oid, bytes: &[u8]) -> Result<Self> {
                let value = int_from_text(oid, bytes, $name)?;
                <$t>::try_from(value)
                    .map_err(|_| Error::Decode(format!("{value} overflows {}", $name)))
            }

            fn from_binary(oid: Oid, bytes: &[u8]) -> Result<Self> {
                let value = int_from_binary(oid, bytes, $name)?;
                <$t>::try_from(value)
                    .map_err(|_| Error::Decode(format!("{value} overflows {}", $name)))
            }
        }

        impl ToWireValue for $t {
            fn natural_oid(&self) -> Oid {
                $natural
            }

            fn encode(&self, target_oid: Oid, buf: &mut Vec<u8>) -> Result<()> {
                encode_int(i64::from(*self), $name, target_oid, buf)
            }
        }
    };
}

impl_int!(i16, "i16", oid::INT2);
impl_int!(i32, "i32", oid::INT4);
impl_int!(i64, "i64", oid::INT8);
impl_int!(u32, "u32", oid::INT8);

// === Floating point types ===

fn float_from_text(oid: Oid, bytes: &[u8], rust_type: &str) -> Result<f64> {
    if !matches!(oid, oid::FLOAT4 | oid::FLOAT8 | oid::NUMERIC) {
        return Err(cannot_decode(oid, rust_type));
    }
    match utf8(bytes)? {
        "NaN" => Ok(f64::NAN),
        "Infinity" => Ok(f64::INFINITY),
        "-Infinity" => Ok(f64::NEG_INFINITY),
        s => s
            .parse()
            .map_err(|e| Error::Decode(format!("invalid {rust_type}: {e}"))),
    }
}

impl FromWireValue<'_> for f32 {
    fn from_text(oid: Oid, bytes: &[u8]) -> Result<Self> {
        if oid == oid::FLOAT8 {
            return Err(cannot_decode(oid, "f32"));
        }
        let value = float_from_text(oid, bytes, "f32")?;
        if value.is_finite() && (value > f32::MAX as f64 || value < f32::MIN as f64) {
            return Err(Error::Decode(format!("{value} overflows f32")));
        }
        Ok(value as f32)
    }

    fn from_binary(oid: Oid, bytes: &[u8]) -> Result<Self> {
        match oid {
            oid::FLOAT4 => Ok(f32::from_be_bytes(fixed(bytes, "float4")?)),
            _ => Err(cannot_decode(oid, "f32")),
        }
    }
}

impl ToWireValue for f32 {
    fn natural_oid(&self) -> Oid {
        oid::FLOAT4
    }

    fn encode(&self, target_oid: Oid, buf: &mut Vec<u8>) -> Result<()> {
        match target_oid {
            oid::FLOAT4 => {
                buf.extend_from_slice(&4_i32.to_be_bytes());
                buf.extend_from_slice(&self.to_be_bytes());
            }
            oid::FLOAT8 => {
                buf.extend_from_slice(&8_i32.to_be_bytes());
                buf.extend_from_slice(&(*self as f64).to_be_bytes());
            }
            _ => return Err(type_mismatch("f32", target_oid)),
        }
        Ok(())
    }
}

impl FromWireValue<'_> for f64 {
    fn from_text(oid: Oid, bytes: &[u8]) -> Result<Self> {
        float_from_text(oid, bytes, "f64")
    }

    fn from_binary(oid: Oid, bytes: &[u8]) -> Result<Self> {
        match oid {
            oid::FLOAT4 => Ok(f32::from_be_bytes(fixed(bytes, "float4")?) as f64),
            oid::FLOAT8 => Ok(f64::from_be_bytes(fixed(bytes, "float8")?)),
            _ => Err(cannot_decode(oid, "f64")),
        }
    }
}

impl ToWireValue for f64 {
    fn natural_oid(&self) -> Oid {
        oid::FLOAT8
    }

    fn encode(&self, target_oid: Oid, buf: &mut Vec<u8>) -> Result<()> {
        match target_oid {
            oid::FLOAT8 => {
                buf.extend_from_slice(&8_i32.to_be_bytes());
                buf.extend_from_slice(&self.to_be_bytes());
            }
            _ => return Err(type_mismatch("f64", target_oid)),
        }
        Ok(())
    }
}
