//! PostgreSQL backend (server → client) messages.

pub mod auth;
pub mod copy;
pub mod error;
pub mod extended;
pub mod query;

pub use auth::{
    AuthenticationMessage, BackendKeyData, NegotiateProtocolVersion, NotificationResponse,
    ParameterStatus, ReadyForQuery,
};
pub use copy::CopyResponse;
pub use error::{parse_fields, write_fields};
pub use extended::ParameterDescription;
pub use query::{CommandComplete, DataRow, FieldDescription, RowDescription, write_data_row};

use crate::error::{Error, ErrorFields, Result};
use crate::protocol::codec::{MessageBuilder, expect_end};

/// Backend message type bytes.
pub mod msg_type {
    /// Authentication message
    pub const AUTHENTICATION: u8 = b'R';
    /// BackendKeyData
    pub const BACKEND_KEY_DATA: u8 = b'K';
    /// ParameterStatus
    pub const PARAMETER_STATUS: u8 = b'S';
    /// ReadyForQuery
    pub const READY_FOR_QUERY: u8 = b'Z';
    /// RowDescription
    pub const ROW_DESCRIPTION: u8 = b'T';
    /// DataRow
    pub const DATA_ROW: u8 = b'D';
    /// CommandComplete
    pub const COMMAND_COMPLETE: u8 = b'C';
    /// EmptyQueryResponse
    pub const EMPTY_QUERY_RESPONSE: u8 = b'I';
    /// ErrorResponse
    pub const ERROR_RESPONSE: u8 = b'E';
    /// NoticeResponse
    pub const NOTICE_RESPONSE: u8 = b'N';
    /// NotificationResponse
    pub const NOTIFICATION_RESPONSE: u8 = b'A';
    /// ParseComplete
    pub const PARSE_COMPLETE: u8 = b'1';
    /// BindComplete
    pub const BIND_COMPLETE: u8 = b'2';
    /// CloseComplete
    pub const CLOSE_COMPLETE: u8 = b'3';
    /// ParameterDescription
    pub const PARAMETER_DESCRIPTION: u8 = b't';
    /// NoData
    pub const NO_DATA: u8 = b'n';
    /// PortalSuspended
    pub const PORTAL_SUSPENDED: u8 = b's';
    /// CopyInResponse
    pub const COPY_IN_RESPONSE: u8 = b'G';
    /// CopyOutResponse
    pub const COPY_OUT_RESPONSE: u8 = b'H';
    /// CopyBothResponse
    pub const COPY_BOTH_RESPONSE: u8 = b'W';
    /// CopyData
    pub const COPY_DATA: u8 = b'd';
    /// CopyDone
    pub const COPY_DONE: u8 = b'c';
    /// NegotiateProtocolVersion
    pub const NEGOTIATE_PROTOCOL_VERSION: u8 = b'v';
}

/// Raw message from the PostgreSQL server.
///
/// This is a thin wrapper around the message type byte and payload.
/// State machines parse it into a [`BackendMessage`] on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawMessage<'a> {
    /// Message type byte
    pub type_byte: u8,
    /// Message payload (after length field)
    pub payload: &'a [u8],
}

impl<'a> RawMessage<'a> {
    /// Create a new RawMessage.
    pub fn new(type_byte: u8, payload: &'a [u8]) -> Self {
        Self { type_byte, payload }
    }

    /// Check if a type byte represents an async message (can arrive at any time).
    pub fn is_async_type(type_byte: u8) -> bool {
        matches!(
            type_byte,
            msg_type::NOTICE_RESPONSE
                | msg_type::NOTIFICATION_RESPONSE
                | msg_type::PARAMETER_STATUS
        )
    }

    /// Parse into a typed message.
    pub fn parse(self) -> Result<BackendMessage<'a>> {
        BackendMessage::parse(self.type_byte, self.payload)
    }
}

/// A decoded server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage<'a> {
    Authentication(AuthenticationMessage<'a>),
    ParameterStatus(ParameterStatus<'a>),
    BackendKeyData(BackendKeyData),
    ReadyForQuery(ReadyForQuery),
    RowDescription(RowDescription<'a>),
    DataRow(DataRow<'a>),
    CommandComplete(CommandComplete<'a>),
    EmptyQueryResponse,
    ErrorResponse(ErrorFields),
    NoticeResponse(ErrorFields),
    NotificationResponse(NotificationResponse<'a>),
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ParameterDescription(ParameterDescription),
    CopyInResponse(CopyResponse),
    CopyOutResponse(CopyResponse),
    CopyBothResponse(CopyResponse),
    CopyData(&'a [u8]),
    CopyDone,
    NegotiateProtocolVersion(NegotiateProtocolVersion<'a>),
}

impl<'a> BackendMessage<'a> {
    /// Decode a payload according to its tag.
    ///
    /// Unknown tags and payloads that don't match their tag's layout are
    /// protocol errors.
    pub fn parse(type_byte: u8, payload: &'a [u8]) -> Result<Self> {
        let empty = |name: &str| expect_end(payload, name);

        Ok(match type_byte {
            msg_type::AUTHENTICATION => {
                BackendMessage::Authentication(AuthenticationMessage::parse(payload)?)
            }
            msg_type::PARAMETER_STATUS => {
                BackendMessage::ParameterStatus(ParameterStatus::parse(payload)?)
            }
            msg_type::BACKEND_KEY_DATA => {
                BackendMessage::BackendKeyData(BackendKeyData::parse(payload)?)
            }
            msg_type::READY_FOR_QUERY => {
                BackendMessage::ReadyForQuery(ReadyForQuery::parse(payload)?)
            }
            msg_type::ROW_DESCRIPTION => {
                BackendMessage::RowDescription(RowDescription::parse(payload)?)
            }
            msg_type::DATA_ROW => BackendMessage::DataRow(DataRow::parse(payload)?),
            msg_type::COMMAND_COMPLETE => {
                BackendMessage::CommandComplete(CommandComplete::parse(payload)?)
            }
            msg_type::EMPTY_QUERY_RESPONSE => {
                empty("EmptyQueryResponse")?;
                BackendMessage::EmptyQueryResponse
            }
            msg_type::ERROR_RESPONSE => BackendMessage::ErrorResponse(parse_fields(payload)?),
            msg_type::NOTICE_RESPONSE => BackendMessage::NoticeResponse(parse_fields(payload)?),
            msg_type::NOTIFICATION_RESPONSE => {
                BackendMessage::NotificationResponse(NotificationResponse::parse(payload)?)
            }
            msg_type::PARSE_COMPLETE => {
                empty("ParseComplete")?;
                BackendMessage::ParseComplete
            }
            msg_type::BIND_COMPLETE => {
                empty("BindComplete")?;
                BackendMessage::BindComplete
            }
            msg_type::CLOSE_COMPLETE => {
                empty("CloseComplete")?;
                BackendMessage::CloseComplete
            }
            msg_type::NO_DATA => {
                empty("NoData")?;
                BackendMessage::NoData
            }
            msg_type::PORTAL_SUSPENDED => {
                empty("PortalSuspended")?;
                BackendMessage::PortalSuspended
            }
            msg_type::PARAMETER_DESCRIPTION => {
                BackendMessage::ParameterDescription(ParameterDescription::parse(payload)?)
            }
            msg_type::COPY_IN_RESPONSE => {
                BackendMessage::CopyInResponse(CopyResponse::parse(payload)?)
            }
            msg_type::COPY_OUT_RESPONSE => {
                BackendMessage::CopyOutResponse(CopyResponse::parse(payload)?)
            }
            msg_type::COPY_BOTH_RESPONSE => {
                BackendMessage::CopyBothResponse(CopyResponse::parse(payload)?)
            }
            msg_type::COPY_DATA => BackendMessage::CopyData(payload),
            msg_type::COPY_DONE => {
                empty("CopyDone")?;
                BackendMessage::CopyDone
            }
            msg_type::NEGOTIATE_PROTOCOL_VERSION => {
                BackendMessage::NegotiateProtocolVersion(NegotiateProtocolVersion::parse(payload)?)
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unknown backend message type: {:?}",
                    other as char
                )));
            }
        })
    }

    /// Append the framed encoding of this message to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            BackendMessage::Authentication(m) => m.write(buf),
            BackendMessage::ParameterStatus(m) => m.write(buf),
            BackendMessage::BackendKeyData(m) => m.write(buf),
            BackendMessage::ReadyForQuery(m) => m.write(buf),
            BackendMessage::RowDescription(m) => m.write(buf),
            BackendMessage::DataRow(m) => {
                let values: Vec<Option<&[u8]>> = m.iter().collect();
                write_data_row(buf, &values);
            }
            BackendMessage::CommandComplete(m) => m.write(buf),
            BackendMessage::EmptyQueryResponse => {
                empty_message(buf, msg_type::EMPTY_QUERY_RESPONSE)
            }
            BackendMessage::ErrorResponse(fields) => {
                fields_message(buf, msg_type::ERROR_RESPONSE, fields)
            }
            BackendMessage::NoticeResponse(fields) => {
                fields_message(buf, msg_type::NOTICE_RESPONSE, fields)
            }
            BackendMessage::NotificationResponse(m) => m.write(buf),
            BackendMessage::ParseComplete => empty_message(buf, msg_type::PARSE_COMPLETE),
            BackendMessage::BindComplete => empty_message(buf, msg_type::BIND_COMPLETE),
            BackendMessage::CloseComplete => empty_message(buf, msg_type::CLOSE_COMPLETE),
            BackendMessage::NoData => empty_message(buf, msg_type::NO_DATA),
            BackendMessage::PortalSuspended => empty_message(buf, msg_type::PORTAL_SUSPENDED),
            BackendMessage::ParameterDescription(m) => m.write(buf),
            BackendMessage::CopyInResponse(m) => m.write(buf, msg_type::COPY_IN_RESPONSE),
            BackendMessage::CopyOutResponse(m) => m.write(buf, msg_type::COPY_OUT_RESPONSE),
            BackendMessage::CopyBothResponse(m) => m.write(buf, msg_type::COPY_BOTH_RESPONSE),
            BackendMessage::CopyData(data) => {
                let mut msg = MessageBuilder::new(buf, msg_type::COPY_DATA);
                msg.write_bytes(data);
                msg.finish();
            }
            BackendMessage::CopyDone => empty_message(buf, msg_type::COPY_DONE),
            BackendMessage::NegotiateProtocolVersion(m) => m.write(buf),
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            BackendMessage::Authentication(_) => "Authentication",
            BackendMessage::ParameterStatus(_) => "ParameterStatus",
            BackendMessage::BackendKeyData(_) => "BackendKeyData",
            BackendMessage::ReadyForQuery(_) => "ReadyForQuery",
            BackendMessage::RowDescription(_) => "RowDescription",
            BackendMessage::DataRow(_) => "DataRow",
            BackendMessage::CommandComplete(_) => "CommandComplete",
            BackendMessage::EmptyQueryResponse => "EmptyQueryResponse",
            BackendMessage::ErrorResponse(_) => "ErrorResponse",
            BackendMessage::NoticeResponse(_) => "NoticeResponse",
            BackendMessage::NotificationResponse(_) => "NotificationResponse",
            BackendMessage::ParseComplete => "ParseComplete",
            BackendMessage::BindComplete => "BindComplete",
            BackendMessage::CloseComplete => "CloseComplete",
            BackendMessage::NoData => "NoData",
            BackendMessage::PortalSuspended => "PortalSuspended",
            BackendMessage::ParameterDescription(_) => "ParameterDescription",
            BackendMessage::CopyInResponse(_) => "CopyInResponse",
            BackendMessage::CopyOutResponse(_) => "CopyOutResponse",
            BackendMessage::CopyBothResponse(_) => "CopyBothResponse",
            BackendMessage::CopyData(_) => "CopyData",
            BackendMessage::CopyDone => "CopyDone",
            BackendMessage::NegotiateProtocolVersion(_) => "NegotiateProtocolVersion",
        }
    }
}

fn empty_message(buf: &mut Vec<u8>, type_byte: u8) {
    MessageBuilder::new(buf, type_byte).finish();
}

fn fields_message(buf: &mut Vec<u8>, type_byte: u8, fields: &ErrorFields) {
    let mut msg = MessageBuilder::new(buf, type_byte);
    write_fields(msg.buf(), fields);
    msg.finish();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::decode_message;
    use crate::protocol::types::{FormatCode, TransactionStatus, oid};

    fn reparse(message: &BackendMessage<'_>) -> Vec<u8> {
        let mut buf = Vec::new();
        message.encode(&mut buf);
        buf
    }

    #[test]
    fn error_response_roundtrip() {
        let fields = ErrorFields {
            severity: Some("ERROR".into()),
            severity_non_localized: Some("ERROR".into()),
            code: Some("22012".into()),
            message: Some("division by zero".into()),
            position: Some(8),
            ..Default::default()
        };
        let buf = reparse(&BackendMessage::ErrorResponse(fields.clone()));
        let (raw, consumed) = decode_message(&buf).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(raw.parse().unwrap(), BackendMessage::ErrorResponse(fields));
    }

    #[test]
    fn every_message_roundtrips_and_waits_for_its_last_byte() {
        let mut row = Vec::new();
        write_data_row(&mut row, &[Some(&b"42"[..]), None, Some(&b""[..])]);
        let row_payload = &row[5..];

        let messages = vec![
            BackendMessage::Authentication(AuthenticationMessage::Ok),
            BackendMessage::Authentication(AuthenticationMessage::KerberosV5),
            BackendMessage::Authentication(AuthenticationMessage::CleartextPassword),
            BackendMessage::Authentication(AuthenticationMessage::Md5Password {
                salt: [1, 2, 3, 4],
            }),
            BackendMessage::Authentication(AuthenticationMessage::Gss),
            BackendMessage::Authentication(AuthenticationMessage::GssContinue { data: b"gss" }),
            BackendMessage::Authentication(AuthenticationMessage::Sspi),
            BackendMessage::Authentication(AuthenticationMessage::Sasl {
                mechanisms: vec!["SCRAM-SHA-256-PLUS", "SCRAM-SHA-256"],
            }),
            BackendMessage::Authentication(AuthenticationMessage::SaslContinue {
                data: b"r=abc,s=c2FsdA==,i=4096",
            }),
            BackendMessage::Authentication(AuthenticationMessage::SaslFinal { data: b"v=xyz" }),
            BackendMessage::ParameterStatus(ParameterStatus {
                name: "TimeZone",
                value: "UTC",
            }),
            BackendMessage::BackendKeyData(BackendKeyData::new(4242, 0xdead_beef)),
            BackendMessage::ReadyForQuery(ReadyForQuery {
                status: TransactionStatus::InTransaction,
            }),
            BackendMessage::RowDescription(RowDescription::new(vec![FieldDescription {
                name: "id",
                table_oid: 16384,
                column_id: 1,
                type_oid: oid::INT4,
                type_size: 4,
                type_modifier: -1,
                format: FormatCode::Binary,
            }])),
            BackendMessage::RowDescription(RowDescription::new(Vec::new())),
            BackendMessage::DataRow(DataRow::parse(row_payload).unwrap()),
            BackendMessage::CommandComplete(CommandComplete { tag: "INSERT 0 3" }),
            BackendMessage::EmptyQueryResponse,
            BackendMessage::ErrorResponse(ErrorFields {
                severity: Some("FATAL".into()),
                code: Some("57P01".into()),
                message: Some("terminating connection".into()),
                ..Default::default()
            }),
            BackendMessage::NoticeResponse(ErrorFields {
                severity: Some("NOTICE".into()),
                message: Some("skipping".into()),
                ..Default::default()
            }),
            BackendMessage::NotificationResponse(NotificationResponse {
                pid: 7,
                channel: "jobs",
                payload: "",
            }),
            BackendMessage::ParseComplete,
            BackendMessage::BindComplete,
            BackendMessage::CloseComplete,
            BackendMessage::NoData,
            BackendMessage::PortalSuspended,
            BackendMessage::ParameterDescription(ParameterDescription::new(vec![
                oid::INT8,
                oid::TEXT,
            ])),
            BackendMessage::CopyInResponse(CopyResponse {
                format: FormatCode::Text,
                column_formats: vec![FormatCode::Text, FormatCode::Text],
            }),
            BackendMessage::CopyOutResponse(CopyResponse {
                format: FormatCode::Binary,
                column_formats: vec![FormatCode::Binary],
            }),
            BackendMessage::CopyBothResponse(CopyResponse {
                format: FormatCode::Text,
                column_formats: Vec::new(),
            }),
            BackendMessage::CopyData(b"1\tann\n"),
            BackendMessage::CopyDone,
            BackendMessage::NegotiateProtocolVersion(NegotiateProtocolVersion {
                newest_minor_version: 0,
                unrecognized_options: vec!["_pq_.compression"],
            }),
        ];

        for message in &messages {
            let buf = reparse(message);
            let (raw, consumed) = decode_message(&buf).unwrap().unwrap();
            assert_eq!(consumed, buf.len(), "{}", message.name());
            assert_eq!(&raw.parse().unwrap(), message);

            for cut in 0..buf.len() {
                assert!(
                    decode_message(&buf[..cut]).unwrap().is_none(),
                    "{} decoded from {cut} of {} bytes",
                    message.name(),
                    buf.len()
                );
            }
        }
    }

    #[test]
    fn empty_messages_reject_payload() {
        assert_eq!(
            BackendMessage::parse(b'1', b"").unwrap(),
            BackendMessage::ParseComplete
        );
        assert!(BackendMessage::parse(b'1', b"x").is_err());
        assert!(BackendMessage::parse(b'I', b"x").is_err());
    }

    #[test]
    fn unknown_tag_is_protocol_error() {
        assert!(matches!(
            BackendMessage::parse(b'!', b""),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn ready_for_query_encodes_indicator() {
        let buf = reparse(&BackendMessage::ReadyForQuery(ReadyForQuery {
            status: TransactionStatus::Failed,
        }));
        assert_eq!(buf, [b'Z', 0, 0, 0, 5, b'E']);
    }

    #[test]
    fn async_types() {
        assert!(RawMessage::is_async_type(b'N'));
        assert!(RawMessage::is_async_type(b'A'));
        assert!(RawMessage::is_async_type(b'S'));
        assert!(!RawMessage::is_async_type(b'E'));
    }
}
