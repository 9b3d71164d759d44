//! Connection-level bookkeeping shared by the sync and tokio drivers.

use std::collections::{HashMap, VecDeque};

use crate::error::{Error, ErrorFields, Result};
use crate::handler::{LogNotices, NoticeHandler, Notification};
use crate::protocol::backend::{BackendKeyData, RawMessage, msg_type, parse_fields};
use crate::protocol::types::TransactionStatus;
use crate::state::extended::PreparedStatement;
use crate::state::{
    AsyncMessage, ConnectionStateMachine, ConnectionStatus, StateMachine, parse_async_message,
    unexpected,
};

pub(crate) struct Session {
    pub(crate) status: ConnectionStatus,
    pub(crate) backend_key: Option<BackendKeyData>,
    pub(crate) server_params: Vec<(String, String)>,
    pub(crate) transaction_status: TransactionStatus,
    pub(crate) notifications: VecDeque<Notification>,
    pub(crate) notice_handler: Box<dyn NoticeHandler>,
    pub(crate) statements: HashMap<String, PreparedStatement>,
}

impl Session {
    pub(crate) fn new() -> Self {
        Self {
            status: ConnectionStatus::Idle,
            backend_key: None,
            server_params: Vec::new(),
            transaction_status: TransactionStatus::Unknown,
            notifications: VecDeque::new(),
            notice_handler: Box::new(LogNotices),
            statements: HashMap::new(),
        }
    }

    /// Adopt the results of a finished startup.
    pub(crate) fn established(&mut self, machine: &mut ConnectionStateMachine) {
        self.status = machine.status();
        self.backend_key = machine.backend_key().copied();
        self.server_params = machine.take_server_params();
        self.transaction_status = machine.transaction_status();
    }

    /// Forget everything tied to the previous server session.
    pub(crate) fn discard(&mut self) {
        self.notifications.clear();
        self.statements.clear();
    }

    pub(crate) fn deliver(&mut self, message: AsyncMessage) {
        match message {
            AsyncMessage::Notification(notification) => {
                tracing::trace!(
                    channel = %notification.channel,
                    pid = notification.pid,
                    "notification"
                );
                self.notifications.push_back(notification);
            }
            AsyncMessage::Notice(fields) => self.notice_handler.notice(&fields),
            AsyncMessage::ParameterChanged { name, value } => {
                match self.server_params.iter_mut().find(|(n, _)| *n == name) {
                    Some(entry) => entry.1 = value,
                    None => self.server_params.push((name, value)),
                }
            }
        }
    }

    pub(crate) fn parameter_status(&self, name: &str) -> Option<&str> {
        self.server_params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub(crate) fn mark_bad(&mut self) {
        if self.status != ConnectionStatus::Bad {
            tracing::debug!(from = ?self.status, to = ?ConnectionStatus::Bad, "connection status");
        }
        self.status = ConnectionStatus::Bad;
        self.transaction_status = TransactionStatus::Unknown;
    }

    /// Record the outcome of a finished exchange.
    pub(crate) fn finish<M: StateMachine>(&mut self, machine: &M, result: &Result<()>) {
        match result {
            Err(e) if e.is_connection_broken() => self.mark_bad(),
            _ => self.transaction_status = machine.transaction_status(),
        }
    }

    pub(crate) fn check_usable(&self) -> Result<()> {
        match self.status {
            ConnectionStatus::Ok => Ok(()),
            _ => Err(Error::ConnectionBroken),
        }
    }

    pub(crate) fn prepared(&self, name: &str) -> Result<&PreparedStatement> {
        self.statements.get(name).ok_or_else(|| {
            Error::InvalidUsage(format!("prepared statement {name:?} does not exist"))
        })
    }

    pub(crate) fn set_notice_handler<H: NoticeHandler + 'static>(&mut self, handler: H) {
        self.notice_handler = Box::new(handler);
    }

    /// A message outside any query: async messages are delivered, an
    /// ErrorResponse (the server shutting the session down) is returned.
    pub(crate) fn idle_message(&mut self, type_byte: u8, payload: &[u8]) -> Result<()> {
        if RawMessage::is_async_type(type_byte) {
            let message = parse_async_message(type_byte, payload)?;
            self.deliver(message);
            return Ok(());
        }
        if type_byte == msg_type::ERROR_RESPONSE {
            let fields: ErrorFields = parse_fields(payload)?;
            let error = Error::Server(fields);
            if error.is_connection_broken() {
                self.mark_bad();
            }
            return Err(error);
        }
        Err(unexpected(type_byte, "while idle"))
    }
}
