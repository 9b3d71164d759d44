//! Query-related backend messages.

use std::mem::size_of;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};
use crate::protocol::codec::{MessageBuilder, expect_end, read_bytes, read_cstr, read_i32, read_u16};
use crate::protocol::types::{FormatCode, I16BE, I32BE, Oid, U16BE, U32BE};

use super::msg_type;

/// Fixed-size tail of a field description (18 bytes).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct FieldDescriptionTail {
    /// Table OID (0 if not a table column)
    pub table_oid: U32BE,
    /// Column attribute number (0 if not a table column)
    pub column_id: I16BE,
    /// Data type OID
    pub type_oid: U32BE,
    /// Type size (-1 for variable, -2 for null-terminated)
    pub type_size: I16BE,
    /// Type modifier (type-specific)
    pub type_modifier: I32BE,
    /// Format code (0=text, 1=binary)
    pub format: U16BE,
}

/// Field description within a RowDescription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription<'a> {
    /// Field name
    pub name: &'a str,
    /// Table OID (0 if not a table column)
    pub table_oid: Oid,
    /// Column attribute number (0 if not a table column)
    pub column_id: i16,
    /// Data type OID
    pub type_oid: Oid,
    /// Type size (-1 for variable, -2 for null-terminated)
    pub type_size: i16,
    /// Type modifier (type-specific)
    pub type_modifier: i32,
    /// Format of the column values
    pub format: FormatCode,
}

impl FieldDescription<'_> {
    fn tail(&self) -> FieldDescriptionTail {
        FieldDescriptionTail {
            table_oid: U32BE::new(self.table_oid),
            column_id: I16BE::new(self.column_id),
            type_oid: U32BE::new(self.type_oid),
            type_size: I16BE::new(self.type_size),
            type_modifier: I32BE::new(self.type_modifier),
            format: U16BE::new(self.format as u16),
        }
    }
}

/// RowDescription message - describes the columns in a result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowDescription<'a> {
    fields: Vec<FieldDescription<'a>>,
}

impl<'a> RowDescription<'a> {
    pub fn new(fields: Vec<FieldDescription<'a>>) -> Self {
        Self { fields }
    }

    /// Parse a RowDescription message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        const TAIL_SIZE: usize = size_of::<FieldDescriptionTail>();

        let (num_fields, mut data) = read_u16(payload)?;
        let mut fields = Vec::with_capacity(num_fields as usize);

        for _ in 0..num_fields {
            let (name, rest) = read_cstr(data)?;
            let (tail_bytes, rest) = read_bytes(rest, TAIL_SIZE).map_err(|_| {
                Error::Protocol("RowDescription: truncated field description".into())
            })?;
            let tail = FieldDescriptionTail::ref_from_bytes(tail_bytes)
                .map_err(|e| Error::Protocol(format!("FieldDescription tail: {e:?}")))?;

            fields.push(FieldDescription {
                name,
                table_oid: tail.table_oid.get(),
                column_id: tail.column_id.get(),
                type_oid: tail.type_oid.get(),
                type_size: tail.type_size.get(),
                type_modifier: tail.type_modifier.get(),
                format: FormatCode::from_u16(tail.format.get())?,
            });
            data = rest;
        }
        expect_end(data, "RowDescription")?;

        Ok(Self { fields })
    }

    /// Get the number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if there are no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Get field descriptions.
    pub fn fields(&self) -> &[FieldDescription<'a>] {
        &self.fields
    }

    pub fn write(&self, buf: &mut Vec<u8>) {
        let mut msg = MessageBuilder::new(buf, msg_type::ROW_DESCRIPTION);
        msg.write_i16(self.fields.len() as i16);
        for field in &self.fields {
            msg.write_cstr(field.name);
            msg.write_bytes(field.tail().as_bytes());
        }
        msg.finish();
    }
}

/// DataRow message - contains a single row of data.
///
/// Parsing validates every column length against the payload, so iteration
/// afterwards cannot run past the end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRow<'a> {
    values: Vec<Option<&'a [u8]>>,
}

impl<'a> DataRow<'a> {
    /// Parse a DataRow message from payload bytes.
    ///
    /// A length of -1 is NULL; any other negative length, a value running past
    /// the payload, or bytes left after the last column are protocol errors.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (num_columns, mut data) = read_u16(payload)?;
        let mut values = Vec::with_capacity(num_columns as usize);

        for index in 0..num_columns {
            let (len, rest) = read_i32(data)?;
            if len == -1 {
                values.push(None);
                data = rest;
                continue;
            }
            if len < 0 {
                return Err(Error::Protocol(format!(
                    "DataRow: invalid length {len} for column {index}"
                )));
            }
            let (value, rest) = read_bytes(rest, len as usize).map_err(|_| {
                Error::Protocol(format!("DataRow: column {index} runs past end of message"))
            })?;
            values.push(Some(value));
            data = rest;
        }
        expect_end(data, "DataRow")?;

        Ok(Self { values })
    }

    /// Get the number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if there are no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Column values; `None` represents NULL.
    pub fn values(&self) -> &[Option<&'a [u8]>] {
        &self.values
    }

    /// Get a column value by index.
    pub fn get(&self, index: usize) -> Option<Option<&'a [u8]>> {
        self.values.get(index).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<&'a [u8]>> + '_ {
        self.values.iter().copied()
    }
}

/// Write a framed DataRow message.
pub fn write_data_row(buf: &mut Vec<u8>, values: &[Option<&[u8]>]) {
    let mut msg = MessageBuilder::new(buf, msg_type::DATA_ROW);
    msg.write_i16(values.len() as i16);
    for value in values {
        match value {
            Some(bytes) => {
                msg.write_i32(bytes.len() as i32);
                msg.write_bytes(bytes);
            }
            None => msg.write_i32(-1),
        }
    }
    msg.finish();
}

/// CommandComplete message - indicates successful completion of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandComplete<'a> {
    /// Command tag (e.g., "SELECT 5", "INSERT 0 1", "UPDATE 10")
    pub tag: &'a str,
}

impl<'a> CommandComplete<'a> {
    /// Parse a CommandComplete message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (tag, rest) = read_cstr(payload)?;
        expect_end(rest, "CommandComplete")?;
        Ok(Self { tag })
    }

    /// Parse the number of rows affected from the command tag.
    pub fn rows_affected(&self) -> Option<u64> {
        rows_affected(self.tag)
    }

    pub fn write(&self, buf: &mut Vec<u8>) {
        let mut msg = MessageBuilder::new(buf, msg_type::COMMAND_COMPLETE);
        msg.write_cstr(self.tag);
        msg.finish();
    }
}

/// Row count carried by a command tag such as `INSERT 0 1` or `UPDATE 10`.
pub fn rows_affected(tag: &str) -> Option<u64> {
    let parts: Vec<&str> = tag.split_whitespace().collect();

    match parts.as_slice() {
        ["INSERT", _oid, count] => count.parse().ok(),
        ["SELECT" | "UPDATE" | "DELETE" | "MERGE" | "COPY" | "MOVE" | "FETCH", count] => {
            count.parse().ok()
        }
        _ => None,
    }
}
