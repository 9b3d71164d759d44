//! Sans-I/O state machines for the PostgreSQL protocol.
//!
//! These state machines handle the protocol logic without performing any I/O.
//! They produce [`Action`] values that tell the driver what to do next; the
//! sync and tokio connections are two drivers over the same machines.

pub mod action;
pub mod auth;
pub mod connection;
pub mod extended;
pub mod simple_query;

pub use action::{Action, AsyncMessage};
pub use auth::{AuthNegotiator, AuthStep};
pub use connection::{ConnectionStateMachine, ConnectionStatus};
pub use extended::ExtendedQueryStateMachine;
pub use simple_query::SimpleQueryStateMachine;

use crate::buffer_set::BufferSet;
use crate::error::{Error, Result};
use crate::handler::{Notification, ResultQueue};
use crate::protocol::backend::{NotificationResponse, ParameterStatus, msg_type, parse_fields};
use crate::protocol::types::TransactionStatus;

/// A protocol exchange driven one message at a time.
pub trait StateMachine {
    /// Advance using the message in `buffer_set` (if the previous action
    /// read one) and say what I/O comes next.
    fn step(&mut self, buffer_set: &mut BufferSet) -> Result<Action>;

    /// Transaction status from the most recent ReadyForQuery.
    fn transaction_status(&self) -> TransactionStatus;
}

/// Decode a message that may arrive at any point of a session.
pub(crate) fn parse_async_message(type_byte: u8, payload: &[u8]) -> Result<AsyncMessage> {
    match type_byte {
        msg_type::NOTICE_RESPONSE => Ok(AsyncMessage::Notice(parse_fields(payload)?)),
        msg_type::PARAMETER_STATUS => {
            let param = ParameterStatus::parse(payload)?;
            Ok(AsyncMessage::ParameterChanged {
                name: param.name.to_string(),
                value: param.value.to_string(),
            })
        }
        msg_type::NOTIFICATION_RESPONSE => {
            let notification = NotificationResponse::parse(payload)?;
            Ok(AsyncMessage::Notification(Notification {
                pid: notification.pid,
                channel: notification.channel.to_string(),
                payload: notification.payload.to_string(),
            }))
        }
        _ => Err(Error::Protocol(format!(
            "Unknown async message type: '{}'",
            type_byte as char
        ))),
    }
}

/// Error for a message that is valid on the wire but not in this state.
pub(crate) fn unexpected(type_byte: u8, context: &str) -> Error {
    Error::Protocol(format!(
        "Unexpected message '{}' {}",
        type_byte as char, context
    ))
}

/// A query whose results are consumed through the polling API.
pub(crate) enum InFlight {
    Simple(SimpleQueryStateMachine<ResultQueue>),
    Extended(ExtendedQueryStateMachine<ResultQueue>),
}

impl InFlight {
    pub(crate) fn results(&mut self) -> &mut ResultQueue {
        match self {
            InFlight::Simple(machine) => machine.handler_mut(),
            InFlight::Extended(machine) => machine.handler_mut(),
        }
    }
}

impl StateMachine for InFlight {
    fn step(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        match self {
            InFlight::Simple(machine) => machine.step(buffer_set),
            InFlight::Extended(machine) => machine.step(buffer_set),
        }
    }

    fn transaction_status(&self) -> TransactionStatus {
        match self {
            InFlight::Simple(machine) => machine.transaction_status(),
            InFlight::Extended(machine) => machine.transaction_status(),
        }
    }
}
