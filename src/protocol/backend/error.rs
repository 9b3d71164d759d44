//! Error and notice response messages.

use crate::error::{ErrorFields, Result};
use crate::protocol::codec::{read_cstr, read_u8, write_cstr};

/// Error field type codes from PostgreSQL protocol.
pub mod field_type {
    /// Severity (localized)
    pub const SEVERITY: u8 = b'S';
    /// Severity (non-localized, PostgreSQL 9.6+)
    pub const SEVERITY_NON_LOCALIZED: u8 = b'V';
    /// SQLSTATE code
    pub const CODE: u8 = b'C';
    /// Message
    pub const MESSAGE: u8 = b'M';
    /// Detail
    pub const DETAIL: u8 = b'D';
    /// Hint
    pub const HINT: u8 = b'H';
    /// Position in query
    pub const POSITION: u8 = b'P';
    /// Internal position
    pub const INTERNAL_POSITION: u8 = b'p';
    /// Internal query
    pub const INTERNAL_QUERY: u8 = b'q';
    /// Where (context)
    pub const WHERE: u8 = b'W';
    /// Schema name
    pub const SCHEMA: u8 = b's';
    /// Table name
    pub const TABLE: u8 = b't';
    /// Column name
    pub const COLUMN: u8 = b'c';
    /// Data type name
    pub const DATA_TYPE: u8 = b'd';
    /// Constraint name
    pub const CONSTRAINT: u8 = b'n';
    /// File name
    pub const FILE: u8 = b'F';
    /// Line number
    pub const LINE: u8 = b'L';
    /// Routine name
    pub const ROUTINE: u8 = b'R';
}

/// Parse the field list shared by ErrorResponse and NoticeResponse.
pub fn parse_fields(payload: &[u8]) -> Result<ErrorFields> {
    let mut fields = ErrorFields::default();
    let mut data = payload;

    loop {
        let (field_type, rest) = read_u8(data)?;
        if field_type == 0 {
            crate::protocol::codec::expect_end(rest, "ErrorResponse")?;
            break;
        }

        let (value, rest) = read_cstr(rest)?;
        data = rest;

        match field_type {
            field_type::SEVERITY => fields.severity = Some(value.to_string()),
            field_type::SEVERITY_NON_LOCALIZED => {
                fields.severity_non_localized = Some(value.to_string())
            }
            field_type::CODE => fields.code = Some(value.to_string()),
            field_type::MESSAGE => fields.message = Some(value.to_string()),
            field_type::DETAIL => fields.detail = Some(value.to_string()),
            field_type::HINT => fields.hint = Some(value.to_string()),
            field_type::POSITION => fields.position = value.parse().ok(),
            field_type::INTERNAL_POSITION => fields.internal_position = value.parse().ok(),
            field_type::INTERNAL_QUERY => fields.internal_query = Some(value.to_string()),
            field_type::WHERE => fields.where_ = Some(value.to_string()),
            field_type::SCHEMA => fields.schema = Some(value.to_string()),
            field_type::TABLE => fields.table = Some(value.to_string()),
            field_type::COLUMN => fields.column = Some(value.to_string()),
            field_type::DATA_TYPE => fields.data_type = Some(value.to_string()),
            field_type::CONSTRAINT => fields.constraint = Some(value.to_string()),
            field_type::FILE => fields.file = Some(value.to_string()),
            field_type::LINE => fields.line = value.parse().ok(),
            field_type::ROUTINE => fields.routine = Some(value.to_string()),
            _ => {
                // Unknown field types must be ignored per protocol
                tracing::debug!("Unknown error field type: {}", field_type as char);
            }
        }
    }

    Ok(fields)
}

/// Write the field list of an ErrorResponse / NoticeResponse payload.
pub fn write_fields(buf: &mut Vec<u8>, fields: &ErrorFields) {
    let text = [
        (field_type::SEVERITY, &fields.severity),
        (field_type::SEVERITY_NON_LOCALIZED, &fields.severity_non_localized),
        (field_type::CODE, &fields.code),
        (field_type::MESSAGE, &fields.message),
        (field_type::DETAIL, &fields.detail),
        (field_type::HINT, &fields.hint),
        (field_type::INTERNAL_QUERY, &fields.internal_query),
        (field_type::WHERE, &fields.where_),
        (field_type::SCHEMA, &fields.schema),
        (field_type::TABLE, &fields.table),
        (field_type::COLUMN, &fields.column),
        (field_type::DATA_TYPE, &fields.data_type),
        (field_type::CONSTRAINT, &fields.constraint),
        (field_type::FILE, &fields.file),
        (field_type::ROUTINE, &fields.routine),
    ];
    for (code, value) in text {
        if let Some(value) = value {
            buf.push(code);
            write_cstr(buf, value);
        }
    }

    let numeric = [
        (field_type::POSITION, fields.position),
        (field_type::INTERNAL_POSITION, fields.internal_position),
        (field_type::LINE, fields.line),
    ];
    for (code, value) in numeric {
        if let Some(value) = value {
            buf.push(code);
            write_cstr(buf, &value.to_string());
        }
    }

    buf.push(0);
}
