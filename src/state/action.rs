//! Action types for state machine I/O requests.

use crate::error::ErrorFields;
use crate::handler::Notification;

/// Action requested by a state machine.
///
/// The driver performs the requested I/O and calls `step()` again, except
/// after `Finished`.
#[derive(Debug)]
pub enum Action {
    /// Write `buffer_set.write_buffer` to the server, then read a single byte
    /// into `buffer_set.type_byte`.
    ///
    /// Used for SSL negotiation: write SSLRequest, then read `S` or `N`.
    WriteAndReadByte,

    /// Read one framed message into `buffer_set.type_byte` and
    /// `buffer_set.read_buffer`.
    ReadMessage,

    /// Write `buffer_set.write_buffer` to the server and flush.
    Write,

    /// Write `buffer_set.write_buffer`, then read a message.
    WriteAndReadMessage,

    /// Wrap the transport in TLS.
    TlsHandshake,

    /// An asynchronous message was received.
    ///
    /// The driver delivers it, reads the next message, then calls `step()`.
    HandleAsyncMessageAndReadMessage(AsyncMessage),

    /// The state machine has finished successfully.
    Finished,
}

/// Asynchronous message from the server.
///
/// These can arrive at any time, including between queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncMessage {
    /// Notification from LISTEN/NOTIFY.
    Notification(Notification),

    /// Non-fatal notice/warning from server.
    Notice(ErrorFields),

    /// Server parameter value changed.
    ParameterChanged {
        /// Parameter name
        name: String,
        /// New value
        value: String,
    },
}
