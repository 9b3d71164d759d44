//! Common PostgreSQL wire protocol types.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};

/// PostgreSQL Object Identifier (OID)
pub type Oid = u32;

/// Well-known type OIDs from `pg_type`.
pub mod oid {
    use super::Oid;

    pub const BOOL: Oid = 16;
    pub const BYTEA: Oid = 17;
    pub const NAME: Oid = 19;
    pub const INT8: Oid = 20;
    pub const INT2: Oid = 21;
    pub const INT4: Oid = 23;
    pub const TEXT: Oid = 25;
    pub const OID: Oid = 26;
    pub const FLOAT4: Oid = 700;
    pub const FLOAT8: Oid = 701;
    pub const UNKNOWN: Oid = 705;
    pub const BPCHAR: Oid = 1042;
    pub const VARCHAR: Oid = 1043;
    pub const NUMERIC: Oid = 1700;
}

/// Data format code in PostgreSQL protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum FormatCode {
    /// Text format (human-readable)
    #[default]
    Text = 0,
    /// Binary format (type-specific packed representation)
    Binary = 1,
}

impl FormatCode {
    /// Validate a raw format code from the wire.
    pub fn from_u16(value: u16) -> Result<Self> {
        match value {
            0 => Ok(FormatCode::Text),
            1 => Ok(FormatCode::Binary),
            _ => Err(Error::Protocol(format!("invalid format code: {value}"))),
        }
    }
}

impl TryFrom<u16> for FormatCode {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        Self::from_u16(value)
    }
}

/// Transaction status of the session.
///
/// `Idle`, `InTransaction` and `Failed` come from the ReadyForQuery indicator.
/// `Active` is reported while a command is in flight and `Unknown` once the
/// connection is broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    /// Idle (not in transaction block)
    #[default]
    Idle,
    /// A command is in progress
    Active,
    /// In transaction block
    InTransaction,
    /// In failed transaction block (queries will be rejected until rollback)
    Failed,
    /// Connection is bad
    Unknown,
}

impl TransactionStatus {
    /// Decode the ReadyForQuery indicator byte.
    pub fn from_byte(value: u8) -> Result<Self> {
        match value {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::Failed),
            _ => Err(Error::Protocol(format!(
                "invalid transaction status indicator: {:#04x}",
                value
            ))),
        }
    }

    /// The ReadyForQuery indicator byte, if this status has one.
    pub fn to_byte(self) -> Option<u8> {
        match self {
            TransactionStatus::Idle => Some(b'I'),
            TransactionStatus::InTransaction => Some(b'T'),
            TransactionStatus::Failed => Some(b'E'),
            TransactionStatus::Active | TransactionStatus::Unknown => None,
        }
    }

    /// Returns true if currently in a transaction (either active or failed).
    pub fn in_transaction(self) -> bool {
        matches!(self, TransactionStatus::InTransaction | TransactionStatus::Failed)
    }

    /// Returns true if the transaction has failed.
    pub fn is_failed(self) -> bool {
        matches!(self, TransactionStatus::Failed)
    }
}

/// Big-endian 16-bit unsigned integer for zerocopy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct U16BE([u8; 2]);

impl U16BE {
    pub const fn new(value: u16) -> Self {
        Self(value.to_be_bytes())
    }

    pub const fn get(self) -> u16 {
        u16::from_be_bytes(self.0)
    }
}

/// Big-endian 32-bit unsigned integer for zerocopy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct U32BE([u8; 4]);

impl U32BE {
    pub const fn new(value: u32) -> Self {
        Self(value.to_be_bytes())
    }

    pub const fn get(self) -> u32 {
        u32::from_be_bytes(self.0)
    }
}

/// Big-endian 32-bit signed integer for zerocopy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct I32BE([u8; 4]);

impl I32BE {
    pub const fn new(value: i32) -> Self {
        Self(value.to_be_bytes())
    }

    pub const fn get(self) -> i32 {
        i32::from_be_bytes(self.0)
    }
}

/// Big-endian 16-bit signed integer for zerocopy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct I16BE([u8; 2]);

impl I16BE {
    pub const fn new(value: i16) -> Self {
        Self(value.to_be_bytes())
    }

    pub const fn get(self) -> i16 {
        i16::from_be_bytes(self.0)
    }
}
