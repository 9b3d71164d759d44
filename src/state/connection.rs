//! Connection startup and authentication state machine.

use crate::buffer_set::BufferSet;
use crate::error::{Error, Result};
use crate::opts::{Opts, SslMode, TargetSessionAttrs};
use crate::protocol::backend::{
    AuthenticationMessage, BackendKeyData, DataRow, NegotiateProtocolVersion, ParameterStatus,
    RawMessage, ReadyForQuery, RowDescription, msg_type, parse_fields,
};
use crate::protocol::frontend::{write_query, write_ssl_request, write_startup};
use crate::protocol::types::TransactionStatus;

use super::action::{Action, AsyncMessage};
use super::auth::{AuthNegotiator, AuthStep};
use super::{StateMachine, parse_async_message, unexpected};

/// Connection status.
///
/// Only `Ok` and `Bad` are stable; the others are stages of establishing the
/// session, in the order listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Nothing attempted yet.
    Idle,
    /// The transport is being established.
    Started,
    /// Socket connected, nothing sent yet.
    Made,
    /// SSLRequest sent or TLS handshake in progress.
    SslStartup,
    /// StartupMessage sent, waiting for the first authentication request.
    AwaitingResponse,
    /// Password or SASL exchange in progress.
    AuthInProgress,
    /// Authenticated; receiving session parameters until ReadyForQuery.
    Setenv,
    /// Checking that the session accepts writes.
    CheckWritable,
    /// Reading the result of the writability check.
    Consume,
    /// Ready for queries.
    Ok,
    /// Unusable.
    Bad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SslStage {
    AwaitingAnswer,
    Handshaking,
}

/// Connection startup state machine.
///
/// The driver calls [`begin_connect`](Self::begin_connect) before opening the
/// socket and [`socket_connected`](Self::socket_connected) once it is open,
/// then runs `step` until `Finished`.
pub struct ConnectionStateMachine {
    status: ConnectionStatus,
    options: Opts,
    tls_supported: bool,
    ssl_stage: SslStage,
    auth: AuthNegotiator,
    backend_key: Option<BackendKeyData>,
    server_params: Vec<(String, String)>,
    transaction_status: TransactionStatus,
    read_only: Option<bool>,
}

impl ConnectionStateMachine {
    /// Create a new connection state machine.
    ///
    /// `tls_supported` says whether the driver can perform a TLS handshake.
    pub fn new(options: Opts, tls_supported: bool) -> Self {
        let auth = AuthNegotiator::new(&options.user, options.password.as_deref());
        Self {
            status: ConnectionStatus::Idle,
            options,
            tls_supported,
            ssl_stage: SslStage::AwaitingAnswer,
            auth,
            backend_key: None,
            server_params: Vec::new(),
            transaction_status: TransactionStatus::Unknown,
            read_only: None,
        }
    }

    /// Get the current connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Get the backend key data (for cancellation).
    pub fn backend_key(&self) -> Option<&BackendKeyData> {
        self.backend_key.as_ref()
    }

    /// Get server parameters.
    pub fn server_params(&self) -> &[(String, String)] {
        &self.server_params
    }

    /// Take server parameters.
    pub fn take_server_params(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.server_params)
    }

    /// The driver is opening the transport.
    pub fn begin_connect(&mut self) {
        self.set_status(ConnectionStatus::Started);
    }

    /// The transport is open.
    pub fn socket_connected(&mut self) {
        self.set_status(ConnectionStatus::Made);
    }

    /// The driver failed outside the state machine (I/O, TLS).
    pub fn mark_bad(&mut self) {
        self.set_status(ConnectionStatus::Bad);
        self.transaction_status = TransactionStatus::Unknown;
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            tracing::debug!(from = ?self.status, to = ?status, "connection status");
            self.status = status;
        }
    }

    fn write_startup_message(&self, buffer_set: &mut BufferSet) {
        let mut params: Vec<(&str, &str)> = vec![
            ("user", &self.options.user),
            ("client_encoding", "UTF8"),
        ];

        if let Some(ref db) = self.options.database {
            params.push(("database", db));
        }

        if let Some(ref app) = self.options.application_name {
            params.push(("application_name", app));
        }

        for (name, value) in &self.options.params {
            params.push((name, value));
        }

        buffer_set.write_buffer.clear();
        write_startup(&mut buffer_set.write_buffer, &params);
    }

    fn send_startup(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        self.write_startup_message(buffer_set);
        self.set_status(ConnectionStatus::AwaitingResponse);
        Ok(Action::WriteAndReadMessage)
    }

    fn step_inner(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        match self.status {
            ConnectionStatus::Made => self.start(buffer_set),
            ConnectionStatus::SslStartup => self.handle_ssl(buffer_set),
            ConnectionStatus::AwaitingResponse | ConnectionStatus::AuthInProgress => {
                self.handle_auth(buffer_set)
            }
            ConnectionStatus::Setenv => self.handle_setenv(buffer_set),
            ConnectionStatus::CheckWritable | ConnectionStatus::Consume => {
                self.handle_check(buffer_set)
            }
            status => Err(Error::Protocol(format!(
                "connection state machine stepped in status {status:?}"
            ))),
        }
    }

    fn start(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        match (self.options.ssl_mode, self.tls_supported) {
            (SslMode::Disable, _) | (SslMode::Prefer, false) => self.send_startup(buffer_set),
            (SslMode::Require, false) => Err(Error::Unsupported(
                "sslmode=require but TLS support is not compiled in".into(),
            )),
            (SslMode::Prefer | SslMode::Require, true) => {
                buffer_set.write_buffer.clear();
                write_ssl_request(&mut buffer_set.write_buffer);
                self.ssl_stage = SslStage::AwaitingAnswer;
                self.set_status(ConnectionStatus::SslStartup);
                Ok(Action::WriteAndReadByte)
            }
        }
    }

    fn handle_ssl(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        if self.ssl_stage == SslStage::Handshaking {
            return self.send_startup(buffer_set);
        }
        match buffer_set.type_byte {
            b'S' => {
                self.ssl_stage = SslStage::Handshaking;
                Ok(Action::TlsHandshake)
            }
            b'N' => {
                if self.options.ssl_mode == SslMode::Require {
                    return Err(Error::Unsupported(
                        "server does not support SSL, but SSL was required".into(),
                    ));
                }
                tracing::debug!("server declined SSL, continuing unencrypted");
                self.send_startup(buffer_set)
            }
            other => Err(Error::Protocol(format!(
                "Unexpected SSL response: 0x{other:02x}"
            ))),
        }
    }

    fn handle_auth(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        let type_byte = buffer_set.type_byte;
        match type_byte {
            msg_type::AUTHENTICATION => {
                let auth = AuthenticationMessage::parse(&buffer_set.read_buffer)?;
                buffer_set.write_buffer.clear();
                match self.auth.handle(auth, &mut buffer_set.write_buffer)? {
                    AuthStep::Respond => {
                        self.set_status(ConnectionStatus::AuthInProgress);
                        Ok(Action::WriteAndReadMessage)
                    }
                    AuthStep::Continue => Ok(Action::ReadMessage),
                    AuthStep::Done => {
                        self.set_status(ConnectionStatus::Setenv);
                        Ok(Action::ReadMessage)
                    }
                }
            }
            msg_type::NEGOTIATE_PROTOCOL_VERSION => {
                let negotiate = NegotiateProtocolVersion::parse(&buffer_set.read_buffer)?;
                tracing::debug!(
                    newest_minor_version = negotiate.newest_minor_version,
                    unrecognized_options = ?negotiate.unrecognized_options,
                    "server negotiated protocol version 3.{}",
                    negotiate.newest_minor_version
                );
                Ok(Action::ReadMessage)
            }
            msg_type::ERROR_RESPONSE => Err(Error::Startup(parse_fields(&buffer_set.read_buffer)?)),
            _ if RawMessage::is_async_type(type_byte) => self.handle_async(buffer_set),
            _ => Err(unexpected(type_byte, "during authentication")),
        }
    }

    fn handle_setenv(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        let type_byte = buffer_set.type_byte;
        let payload = &buffer_set.read_buffer;

        match type_byte {
            msg_type::BACKEND_KEY_DATA => {
                self.backend_key = Some(BackendKeyData::parse(payload)?);
                Ok(Action::ReadMessage)
            }
            msg_type::PARAMETER_STATUS => {
                let param = ParameterStatus::parse(payload)?;
                self.set_server_param(param.name, param.value);
                Ok(Action::ReadMessage)
            }
            msg_type::READY_FOR_QUERY => {
                self.transaction_status = ReadyForQuery::parse(payload)?.status;
                if self.options.target_session_attrs == TargetSessionAttrs::ReadWrite {
                    buffer_set.write_buffer.clear();
                    write_query(&mut buffer_set.write_buffer, "SHOW transaction_read_only");
                    self.set_status(ConnectionStatus::CheckWritable);
                    return Ok(Action::WriteAndReadMessage);
                }
                self.set_status(ConnectionStatus::Ok);
                Ok(Action::Finished)
            }
            msg_type::ERROR_RESPONSE => Err(Error::Startup(parse_fields(payload)?)),
            _ if RawMessage::is_async_type(type_byte) => self.handle_async(buffer_set),
            _ => Err(unexpected(type_byte, "during startup")),
        }
    }

    fn handle_check(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        let type_byte = buffer_set.type_byte;
        let payload = &buffer_set.read_buffer;

        match type_byte {
            msg_type::ROW_DESCRIPTION => {
                RowDescription::parse(payload)?;
                self.set_status(ConnectionStatus::Consume);
                Ok(Action::ReadMessage)
            }
            msg_type::DATA_ROW => {
                let row = DataRow::parse(payload)?;
                self.read_only = Some(matches!(row.get(0), Some(Some(b"on"))));
                Ok(Action::ReadMessage)
            }
            msg_type::COMMAND_COMPLETE => Ok(Action::ReadMessage),
            msg_type::READY_FOR_QUERY => {
                self.transaction_status = ReadyForQuery::parse(payload)?.status;
                match self.read_only {
                    Some(false) => {
                        self.set_status(ConnectionStatus::Ok);
                        Ok(Action::Finished)
                    }
                    Some(true) => Err(Error::Unsupported(
                        "session is read-only, but target_session_attrs=read-write".into(),
                    )),
                    None => Err(Error::Protocol(
                        "SHOW transaction_read_only returned no row".into(),
                    )),
                }
            }
            msg_type::ERROR_RESPONSE => Err(Error::Startup(parse_fields(payload)?)),
            _ if RawMessage::is_async_type(type_byte) => self.handle_async(buffer_set),
            _ => Err(unexpected(type_byte, "while checking target_session_attrs")),
        }
    }

    fn set_server_param(&mut self, name: &str, value: &str) {
        if let Some(entry) = self.server_params.iter_mut().find(|(n, _)| n == name) {
            entry.1 = value.to_string();
        } else {
            self.server_params.push((name.to_string(), value.to_string()));
        }
    }

    fn handle_async(&mut self, buffer_set: &BufferSet) -> Result<Action> {
        let message = parse_async_message(buffer_set.type_byte, &buffer_set.read_buffer)?;
        if let AsyncMessage::ParameterChanged { name, value } = &message {
            self.set_server_param(name, value);
        }
        Ok(Action::HandleAsyncMessageAndReadMessage(message))
    }
}

impl StateMachine for ConnectionStateMachine {
    fn step(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        let result = self.step_inner(buffer_set);
        if let Err(e) = &result {
            tracing::debug!(status = ?self.status, error = %e, "connection failed");
            self.mark_bad();
        }
        result
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorFields;
    use crate::protocol::backend::{BackendMessage, FieldDescription, write_data_row, write_fields};
    use crate::protocol::codec::decode_startup_frame;
    use crate::protocol::frontend::FrontendMessage;
    use crate::protocol::types::FormatCode;

    fn feed(buffer_set: &mut BufferSet, message: BackendMessage<'_>) {
        let mut buf = Vec::new();
        message.encode(&mut buf);
        buffer_set.type_byte = buf[0];
        buffer_set.read_buffer.clear();
        buffer_set.read_buffer.extend_from_slice(&buf[5..]);
    }

    fn started(opts: Opts, tls: bool) -> (ConnectionStateMachine, BufferSet) {
        let mut machine = ConnectionStateMachine::new(opts, tls);
        machine.begin_connect();
        machine.socket_connected();
        (machine, BufferSet::new())
    }

    fn idle() -> BackendMessage<'static> {
        BackendMessage::ReadyForQuery(ReadyForQuery {
            status: TransactionStatus::Idle,
        })
    }

    fn with_ssl(ssl_mode: SslMode) -> Opts {
        Opts {
            ssl_mode,
            ..opts()
        }
    }

    fn opts() -> Opts {
        Opts {
            user: "alice".into(),
            password: Some("pw".into()),
            database: Some("db".into()),
            ssl_mode: SslMode::Disable,
            ..Opts::default()
        }
    }

    #[test]
    fn startup_with_cleartext_password() {
        let (mut machine, mut bs) = started(opts(), false);

        assert!(matches!(
            machine.step(&mut bs).unwrap(),
            Action::WriteAndReadMessage
        ));
        assert_eq!(machine.status(), ConnectionStatus::AwaitingResponse);
        let (body, _) = decode_startup_frame(&bs.write_buffer).unwrap().unwrap();
        let startup = FrontendMessage::parse_startup(body).unwrap();
        let FrontendMessage::Startup { params } = startup else {
            panic!("expected startup message");
        };
        assert!(params.contains(&("user", "alice")));
        assert!(params.contains(&("database", "db")));
        assert!(params.contains(&("client_encoding", "UTF8")));

        feed(
            &mut bs,
            BackendMessage::Authentication(AuthenticationMessage::CleartextPassword),
        );
        assert!(matches!(
            machine.step(&mut bs).unwrap(),
            Action::WriteAndReadMessage
        ));
        assert_eq!(machine.status(), ConnectionStatus::AuthInProgress);

        feed(&mut bs, BackendMessage::Authentication(AuthenticationMessage::Ok));
        assert!(matches!(machine.step(&mut bs).unwrap(), Action::ReadMessage));
        assert_eq!(machine.status(), ConnectionStatus::Setenv);

        feed(
            &mut bs,
            BackendMessage::ParameterStatus(ParameterStatus {
                name: "server_encoding",
                value: "UTF8",
            }),
        );
        assert!(matches!(machine.step(&mut bs).unwrap(), Action::ReadMessage));
        feed(&mut bs, BackendMessage::BackendKeyData(BackendKeyData::new(42, 7)));
        assert!(matches!(machine.step(&mut bs).unwrap(), Action::ReadMessage));
        feed(&mut bs, idle());
        assert!(matches!(machine.step(&mut bs).unwrap(), Action::Finished));

        assert_eq!(machine.status(), ConnectionStatus::Ok);
        assert_eq!(machine.backend_key().unwrap().process_id(), 42);
        assert_eq!(
            machine.server_params(),
            &[("server_encoding".to_string(), "UTF8".to_string())]
        );
        assert_eq!(machine.transaction_status(), TransactionStatus::Idle);
    }

    #[test]
    fn server_rejection_is_startup_error() {
        let (mut machine, mut bs) = started(opts(), false);
        machine.step(&mut bs).unwrap();

        let mut buf = Vec::new();
        write_fields(
            &mut buf,
            &ErrorFields {
                severity: Some("FATAL".into()),
                code: Some("28P01".into()),
                message: Some("password authentication failed".into()),
                ..Default::default()
            },
        );
        bs.type_byte = msg_type::ERROR_RESPONSE;
        bs.read_buffer = buf;
        let err = machine.step(&mut bs).unwrap_err();
        assert!(matches!(err, Error::Startup(_)));
        assert_eq!(err.sqlstate(), Some("28P01"));
        assert_eq!(machine.status(), ConnectionStatus::Bad);
        assert_eq!(machine.transaction_status(), TransactionStatus::Unknown);
    }

    #[test]
    fn ssl_prefer_falls_back() {
        let (mut machine, mut bs) = started(with_ssl(SslMode::Prefer), true);
        assert!(matches!(
            machine.step(&mut bs).unwrap(),
            Action::WriteAndReadByte
        ));
        assert_eq!(machine.status(), ConnectionStatus::SslStartup);
        assert_eq!(bs.write_buffer, [0, 0, 0, 8, 0x04, 0xd2, 0x16, 0x2f]);

        bs.type_byte = b'N';
        assert!(matches!(
            machine.step(&mut bs).unwrap(),
            Action::WriteAndReadMessage
        ));
        assert_eq!(machine.status(), ConnectionStatus::AwaitingResponse);
    }

    #[test]
    fn ssl_require() {
        let (mut machine, mut bs) = started(with_ssl(SslMode::Require), true);
        machine.step(&mut bs).unwrap();
        bs.type_byte = b'S';
        assert!(matches!(machine.step(&mut bs).unwrap(), Action::TlsHandshake));
        assert!(matches!(
            machine.step(&mut bs).unwrap(),
            Action::WriteAndReadMessage
        ));

        let (mut machine, mut bs) = started(with_ssl(SslMode::Require), true);
        machine.step(&mut bs).unwrap();
        bs.type_byte = b'N';
        assert!(machine.step(&mut bs).is_err());
        assert_eq!(machine.status(), ConnectionStatus::Bad);

        let (mut machine, mut bs) = started(with_ssl(SslMode::Require), false);
        assert!(machine.step(&mut bs).is_err());
    }

    #[test]
    fn garbage_ssl_answer() {
        let (mut machine, mut bs) = started(with_ssl(SslMode::Prefer), true);
        machine.step(&mut bs).unwrap();
        bs.type_byte = b'E';
        assert!(matches!(
            machine.step(&mut bs).unwrap_err(),
            Error::Protocol(_)
        ));
    }

    #[test]
    fn read_write_check() {
        let opts = Opts {
            target_session_attrs: TargetSessionAttrs::ReadWrite,
            ..opts()
        };
        let (mut machine, mut bs) = started(opts, false);
        machine.step(&mut bs).unwrap();
        feed(&mut bs, BackendMessage::Authentication(AuthenticationMessage::Ok));
        machine.step(&mut bs).unwrap();
        feed(&mut bs, idle());
        assert!(matches!(
            machine.step(&mut bs).unwrap(),
            Action::WriteAndReadMessage
        ));
        assert_eq!(machine.status(), ConnectionStatus::CheckWritable);
        assert_eq!(
            FrontendMessage::parse(bs.write_buffer[0], &bs.write_buffer[5..]).unwrap(),
            FrontendMessage::Query("SHOW transaction_read_only")
        );

        let description = RowDescription::new(vec![FieldDescription {
            name: "transaction_read_only",
            table_oid: 0,
            column_id: 0,
            type_oid: 25,
            type_size: -1,
            type_modifier: -1,
            format: FormatCode::Text,
        }]);
        feed(&mut bs, BackendMessage::RowDescription(description));
        machine.step(&mut bs).unwrap();
        assert_eq!(machine.status(), ConnectionStatus::Consume);
        let row = [Some(&b"on"[..])];
        let mut buf = Vec::new();
        write_data_row(&mut buf, &row);
        bs.type_byte = buf[0];
        bs.read_buffer = buf[5..].to_vec();
        machine.step(&mut bs).unwrap();
        feed(&mut bs, idle());
        assert!(machine.step(&mut bs).is_err());
        assert_eq!(machine.status(), ConnectionStatus::Bad);
    }

    #[test]
    fn notice_during_startup_is_async() {
        let (mut machine, mut bs) = started(opts(), false);
        machine.step(&mut bs).unwrap();
        feed(
            &mut bs,
            BackendMessage::NoticeResponse(ErrorFields {
                severity: Some("NOTICE".into()),
                message: Some("hello".into()),
                ..Default::default()
            }),
        );
        assert!(matches!(
            machine.step(&mut bs).unwrap(),
            Action::HandleAsyncMessageAndReadMessage(AsyncMessage::Notice(_))
        ));
        assert_eq!(machine.status(), ConnectionStatus::AwaitingResponse);
    }
}
