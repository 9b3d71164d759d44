//! Extended query protocol messages.

use crate::conversion::ToParams;
use crate::error::{Error, Result};
use crate::protocol::codec::MessageBuilder;
use crate::protocol::types::{FormatCode, Oid};

/// Write a Parse message to create a prepared statement.
///
/// - `name`: Statement name (empty string for unnamed statement)
/// - `query`: SQL query with $1, $2, ... placeholders
/// - `param_oids`: Parameter type OIDs (0 = let server infer)
pub fn write_parse(buf: &mut Vec<u8>, name: &str, query: &str, param_oids: &[Oid]) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PARSE);
    msg.write_cstr(name);
    msg.write_cstr(query);
    msg.write_i16(param_oids.len() as i16);
    for &oid in param_oids {
        msg.write_i32(oid as i32);
    }
    msg.finish();
}

/// Write a Bind message whose parameters are all sent in binary.
///
/// `param_oids` are the types the server resolved (or the natural OIDs sent in
/// Parse); each value is encoded for its target type. On error `buf` is left
/// truncated to where it was.
pub fn write_bind<P: ToParams + ?Sized>(
    buf: &mut Vec<u8>,
    portal: &str,
    statement: &str,
    params: &P,
    param_oids: &[Oid],
    result_format: FormatCode,
) -> Result<()> {
    let param_count = params.param_count();
    if param_oids.len() != param_count {
        return Err(Error::InvalidUsage(format!(
            "statement expects {} parameters, {} supplied",
            param_oids.len(),
            param_count
        )));
    }
    if param_count > i16::MAX as usize {
        return Err(Error::InvalidUsage(format!("too many parameters: {param_count}")));
    }

    let start = buf.len();
    let mut msg = MessageBuilder::new(buf, super::msg_type::BIND);
    msg.write_cstr(portal);
    msg.write_cstr(statement);

    // A single format code applies to every parameter.
    if param_count == 0 {
        msg.write_i16(0);
    } else {
        msg.write_i16(1);
        msg.write_i16(FormatCode::Binary as i16);
    }

    msg.write_i16(param_count as i16);
    if let Err(e) = params.encode(param_oids, msg.buf()) {
        buf.truncate(start);
        return Err(e);
    }

    msg.write_i16(1);
    msg.write_i16(result_format as i16);
    msg.finish();
    Ok(())
}

/// Write a Bind message from already-encoded values.
pub fn write_bind_raw(
    buf: &mut Vec<u8>,
    portal: &str,
    statement: &str,
    param_formats: &[FormatCode],
    values: &[Option<&[u8]>],
    result_formats: &[FormatCode],
) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::BIND);
    msg.write_cstr(portal);
    msg.write_cstr(statement);
    msg.write_i16(param_formats.len() as i16);
    for &fmt in param_formats {
        msg.write_i16(fmt as i16);
    }
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
    msg.write_i16(result_formats.len() as i16);
    for &fmt in result_formats {
        msg.write_i16(fmt as i16);
    }
    msg.finish();
}

/// Write an Execute message to run a portal.
///
/// - `max_rows`: Maximum number of rows to return (0 = unlimited)
pub fn write_execute(buf: &mut Vec<u8>, portal: &str, max_rows: u32) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::EXECUTE);
    msg.write_cstr(portal);
    msg.write_i32(max_rows as i32);
    msg.finish();
}

/// Write a Describe message.
///
/// - `target`: b'S' for statement, b'P' for portal
pub fn write_describe(buf: &mut Vec<u8>, target: u8, name: &str) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::DESCRIBE);
    msg.write_u8(target);
    msg.write_cstr(name);
    msg.finish();
}

/// Write a Describe message for a statement.
pub fn write_describe_statement(buf: &mut Vec<u8>, name: &str) {
    write_describe(buf, b'S', name);
}

/// Write a Describe message for a portal.
pub fn write_describe_portal(buf: &mut Vec<u8>, name: &str) {
    write_describe(buf, b'P', name);
}

/// Write a Close message.
///
/// - `target`: b'S' for statement, b'P' for portal
pub fn write_close(buf: &mut Vec<u8>, target: u8, name: &str) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::CLOSE);
    msg.write_u8(target);
    msg.write_cstr(name);
    msg.finish();
}

/// Write a Close message for a statement.
pub fn write_close_statement(buf: &mut Vec<u8>, name: &str) {
    write_close(buf, b'S', name);
}

/// Write a Sync message.
///
/// Ends an extended query sequence; the server answers with ReadyForQuery and
/// commits or rolls back an implicit transaction.
pub fn write_sync(buf: &mut Vec<u8>) {
    let msg = MessageBuilder::new(buf, super::msg_type::SYNC);
    msg.finish();
}

/// Write a Flush message.
pub fn write_flush(buf: &mut Vec<u8>) {
    let msg = MessageBuilder::new(buf, super::msg_type::FLUSH);
    msg.finish();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::oid;

    #[test]
    fn parse_length() {
        let mut buf = Vec::new();
        write_parse(&mut buf, "stmt1", "SELECT $1::int", &[0]);

        assert_eq!(buf[0], b'P');
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        assert_eq!(len as usize, buf.len() - 1);
    }

    #[test]
    fn bind_encodes_binary_params() {
        let mut buf = Vec::new();
        write_bind(&mut buf, "", "", &(42_i32,), &[oid::INT4], FormatCode::Text).unwrap();

        let mut expected = vec![b'B'];
        let body: &[u8] = &[
            0, 0, // portal, statement
            0, 1, 0, 1, // one format code: binary
            0, 1, 0, 0, 0, 4, 0, 0, 0, 42, // one int4 value
            0, 1, 0, 0, // result format: text
        ];
        expected.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        expected.extend_from_slice(body);
        assert_eq!(buf, expected);
    }

    #[test]
    fn bind_param_count_mismatch() {
        let mut buf = vec![1, 2, 3];
        let err = write_bind(&mut buf, "", "", &(1_i32, 2_i32), &[oid::INT4], FormatCode::Text)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidUsage(_)));
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn bind_overflow_restores_buffer() {
        let mut buf = Vec::new();
        let result = write_bind(&mut buf, "", "", &(i64::MAX,), &[oid::INT2], FormatCode::Text);
        assert!(result.is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn sync_and_flush() {
        let mut buf = Vec::new();
        write_sync(&mut buf);
        write_flush(&mut buf);
        assert_eq!(buf, [b'S', 0, 0, 0, 4, b'H', 0, 0, 0, 4]);
    }

    #[test]
    fn execute_length() {
        let mut buf = Vec::new();
        write_execute(&mut buf, "", 0);
        assert_eq!(buf, [b'E', 0, 0, 0, 9, 0, 0, 0, 0, 0]);
    }
}
