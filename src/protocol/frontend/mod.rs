//! PostgreSQL frontend (client → server) messages.
//!
//! The `write_*` functions are what the state machines use. [`FrontendMessage`]
//! is the typed view of the same messages; its `parse` side is what a backend
//! (or a test double of one) uses to read client traffic.

pub mod auth;
pub mod extended;
pub mod simple;
pub mod startup;

pub use auth::{md5_password, write_password, write_sasl_initial_response, write_sasl_response};
pub use extended::{
    write_bind, write_bind_raw, write_close_statement, write_describe_portal,
    write_describe_statement, write_execute, write_flush, write_parse, write_sync,
};
pub use simple::{write_copy_fail, write_query};
pub use startup::{write_cancel_request, write_ssl_request, write_startup, write_terminate};

use crate::error::{Error, Result};
use crate::protocol::codec::{
    expect_end, read_bytes, read_cstr, read_i16, read_i32, read_u8, read_u16, read_u32,
};
use crate::protocol::types::{FormatCode, Oid};

/// Frontend message type bytes.
pub mod msg_type {
    /// Password/SASL response (all auth response types use 'p')
    pub const PASSWORD: u8 = b'p';
    /// Query (simple query protocol)
    pub const QUERY: u8 = b'Q';
    /// Parse (extended query protocol)
    pub const PARSE: u8 = b'P';
    /// Bind (extended query protocol)
    pub const BIND: u8 = b'B';
    /// Execute (extended query protocol)
    pub const EXECUTE: u8 = b'E';
    /// Describe (extended query protocol)
    pub const DESCRIBE: u8 = b'D';
    /// Close (extended query protocol)
    pub const CLOSE: u8 = b'C';
    /// Sync (extended query protocol)
    pub const SYNC: u8 = b'S';
    /// Flush (extended query protocol)
    pub const FLUSH: u8 = b'H';
    /// CopyFail
    pub const COPY_FAIL: u8 = b'f';
    /// Terminate
    pub const TERMINATE: u8 = b'X';
}

/// A client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendMessage<'a> {
    Startup { params: Vec<(&'a str, &'a str)> },
    SslRequest,
    CancelRequest { pid: u32, secret_key: u32 },
    Password(&'a str),
    SaslInitialResponse { mechanism: &'a str, data: &'a [u8] },
    SaslResponse(&'a [u8]),
    /// A `'p'` message as seen by a server, which cannot tell the three
    /// authentication responses apart without knowing what it asked for.
    /// Use [`auth::parse_password`] or [`auth::parse_sasl_initial_response`].
    AuthResponse(&'a [u8]),
    Query(&'a str),
    Parse {
        name: &'a str,
        query: &'a str,
        param_oids: Vec<Oid>,
    },
    Bind {
        portal: &'a str,
        statement: &'a str,
        param_formats: Vec<FormatCode>,
        params: Vec<Option<&'a [u8]>>,
        result_formats: Vec<FormatCode>,
    },
    Describe { target: u8, name: &'a str },
    Execute { portal: &'a str, max_rows: u32 },
    Close { target: u8, name: &'a str },
    Sync,
    Flush,
    CopyFail(&'a str),
    Terminate,
}

impl<'a> FrontendMessage<'a> {
    /// Append the wire encoding of this message to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            FrontendMessage::Startup { params } => write_startup(buf, params),
            FrontendMessage::SslRequest => write_ssl_request(buf),
            FrontendMessage::CancelRequest { pid, secret_key } => {
                write_cancel_request(buf, *pid, *secret_key)
            }
            FrontendMessage::Password(password) => write_password(buf, password),
            FrontendMessage::SaslInitialResponse { mechanism, data } => {
                write_sasl_initial_response(buf, mechanism, data)
            }
            FrontendMessage::SaslResponse(data) | FrontendMessage::AuthResponse(data) => {
                write_sasl_response(buf, data)
            }
            FrontendMessage::Query(sql) => write_query(buf, sql),
            FrontendMessage::Parse {
                name,
                query,
                param_oids,
            } => write_parse(buf, name, query, param_oids),
            FrontendMessage::Bind {
                portal,
                statement,
                param_formats,
                params,
                result_formats,
            } => write_bind_raw(buf, portal, statement, param_formats, params, result_formats),
            FrontendMessage::Describe { target, name } => {
                extended::write_describe(buf, *target, name)
            }
            FrontendMessage::Execute { portal, max_rows } => write_execute(buf, portal, *max_rows),
            FrontendMessage::Close { target, name } => extended::write_close(buf, *target, name),
            FrontendMessage::Sync => write_sync(buf),
            FrontendMessage::Flush => write_flush(buf),
            FrontendMessage::CopyFail(message) => write_copy_fail(buf, message),
            FrontendMessage::Terminate => write_terminate(buf),
        }
    }

    /// Decode a tagged message payload.
    pub fn parse(type_byte: u8, payload: &'a [u8]) -> Result<Self> {
        let message = match type_byte {
            msg_type::PASSWORD => return Ok(FrontendMessage::AuthResponse(payload)),
            msg_type::QUERY => {
                let (sql, rest) = read_cstr(payload)?;
                expect_end(rest, "Query")?;
                FrontendMessage::Query(sql)
            }
            msg_type::PARSE => {
                let (name, rest) = read_cstr(payload)?;
                let (query, rest) = read_cstr(rest)?;
                let (count, mut rest) = read_u16(rest)?;
                let mut param_oids = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let (oid, remaining) = read_u32(rest)?;
                    param_oids.push(oid);
                    rest = remaining;
                }
                expect_end(rest, "Parse")?;
                FrontendMessage::Parse {
                    name,
                    query,
                    param_oids,
                }
            }
            msg_type::BIND => parse_bind(payload)?,
            msg_type::DESCRIBE | msg_type::CLOSE => {
                let (target, rest) = read_u8(payload)?;
                if target != b'S' && target != b'P' {
                    return Err(Error::Protocol(format!(
                        "invalid describe/close target: {:?}",
                        target as char
                    )));
                }
                let (name, rest) = read_cstr(rest)?;
                expect_end(rest, "Describe/Close")?;
                if type_byte == msg_type::DESCRIBE {
                    FrontendMessage::Describe { target, name }
                } else {
                    FrontendMessage::Close { target, name }
                }
            }
            msg_type::EXECUTE => {
                let (portal, rest) = read_cstr(payload)?;
                let (max_rows, rest) = read_u32(rest)?;
                expect_end(rest, "Execute")?;
                FrontendMessage::Execute { portal, max_rows }
            }
            msg_type::SYNC => {
                expect_end(payload, "Sync")?;
                FrontendMessage::Sync
            }
            msg_type::FLUSH => {
                expect_end(payload, "Flush")?;
                FrontendMessage::Flush
            }
            msg_type::COPY_FAIL => {
                let (message, rest) = read_cstr(payload)?;
                expect_end(rest, "CopyFail")?;
                FrontendMessage::CopyFail(message)
            }
            msg_type::TERMINATE => {
                expect_end(payload, "Terminate")?;
                FrontendMessage::Terminate
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unknown frontend message type: {:?}",
                    other as char
                )));
            }
        };
        Ok(message)
    }

    /// Decode an untagged startup-class body (after the length field).
    pub fn parse_startup(body: &'a [u8]) -> Result<Self> {
        let (code, rest) = read_i32(body)?;
        match code {
            startup::PROTOCOL_VERSION_3_0 => {
                let mut params = Vec::new();
                let mut data = rest;
                loop {
                    let (name, remaining) = read_cstr(data)?;
                    if name.is_empty() {
                        expect_end(remaining, "StartupMessage")?;
                        break;
                    }
                    let (value, remaining) = read_cstr(remaining)?;
                    params.push((name, value));
                    data = remaining;
                }
                Ok(FrontendMessage::Startup { params })
            }
            startup::SSL_REQUEST_CODE => {
                expect_end(rest, "SSLRequest")?;
                Ok(FrontendMessage::SslRequest)
            }
            startup::CANCEL_REQUEST_CODE => {
                let (pid, rest) = read_u32(rest)?;
                let (secret_key, rest) = read_u32(rest)?;
                expect_end(rest, "CancelRequest")?;
                Ok(FrontendMessage::CancelRequest { pid, secret_key })
            }
            other => Err(Error::Protocol(format!(
                "unsupported startup request code: {other}"
            ))),
        }
    }
}

fn parse_format_codes(data: &[u8]) -> Result<(Vec<FormatCode>, &[u8])> {
    let (count, mut rest) = read_u16(data)?;
    let mut formats = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (code, remaining) = read_i16(rest)?;
        formats.push(FormatCode::from_u16(code as u16)?);
        rest = remaining;
    }
    Ok((formats, rest))
}

fn parse_bind(payload: &[u8]) -> Result<FrontendMessage<'_>> {
    let (portal, rest) = read_cstr(payload)?;
    let (statement, rest) = read_cstr(rest)?;
    let (param_formats, rest) = parse_format_codes(rest)?;
    let (count, mut rest) = read_u16(rest)?;
    let mut params = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (len, remaining) = read_i32(rest)?;
        if len == -1 {
            params.push(None);
            rest = remaining;
            continue;
        }
        if len < 0 {
            return Err(Error::Protocol(format!("Bind: invalid parameter length {len}")));
        }
        let (value, remaining) = read_bytes(remaining, len as usize)?;
        params.push(Some(value));
        rest = remaining;
    }
    let (result_formats, rest) = parse_format_codes(rest)?;
    expect_end(rest, "Bind")?;
    Ok(FrontendMessage::Bind {
        portal,
        statement,
        param_formats,
        params,
        result_formats,
    })
}
