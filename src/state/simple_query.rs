//! Simple query protocol state machine.

use crate::buffer_set::BufferSet;
use crate::error::{Error, Result};
use crate::handler::ResultHandler;
use crate::protocol::backend::{
    CommandComplete, DataRow, RawMessage, ReadyForQuery, RowDescription, msg_type, parse_fields,
};
use crate::protocol::frontend::{write_copy_fail, write_query};
use crate::protocol::types::TransactionStatus;

use super::action::Action;
use super::{StateMachine, parse_async_message, unexpected};

/// Simple query state machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    WaitingResponse,
    ProcessingRows,
    /// A statement failed; skip everything until ReadyForQuery.
    Draining,
    Finished,
}

/// Simple query protocol state machine.
///
/// Runs one Query message, which may hold several statements, and hands every
/// result to the handler. The first failure (a server ErrorResponse, a handler
/// error or an unsupported COPY) is remembered, the rest of the response is
/// drained, and the failure is returned once ReadyForQuery arrives so the
/// connection stays usable.
pub struct SimpleQueryStateMachine<H> {
    state: State,
    handler: H,
    query: String,
    error: Option<Error>,
    transaction_status: TransactionStatus,
}

impl<H: ResultHandler> SimpleQueryStateMachine<H> {
    /// Create a new simple query state machine.
    pub fn new(handler: H, query: &str) -> Self {
        Self {
            state: State::Initial,
            handler,
            query: query.to_string(),
            error: None,
            transaction_status: TransactionStatus::Active,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn into_handler(self) -> H {
        self.handler
    }

    /// Whether ReadyForQuery has been processed.
    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    fn fail(&mut self, error: Error) {
        self.handler.abort();
        if self.error.is_none() {
            self.error = Some(error);
        }
        self.state = State::Draining;
    }

    fn handle_message(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        let type_byte = buffer_set.type_byte;

        if RawMessage::is_async_type(type_byte) {
            let message = parse_async_message(type_byte, &buffer_set.read_buffer)?;
            return Ok(Action::HandleAsyncMessageAndReadMessage(message));
        }

        match type_byte {
            msg_type::ERROR_RESPONSE => {
                let fields = parse_fields(&buffer_set.read_buffer)?;
                let error = Error::Server(fields);
                // FATAL: the server closes the connection without ReadyForQuery.
                if error.is_connection_broken() {
                    return Err(error);
                }
                self.fail(error);
                return Ok(Action::ReadMessage);
            }
            msg_type::READY_FOR_QUERY => {
                self.transaction_status = ReadyForQuery::parse(&buffer_set.read_buffer)?.status;
                self.state = State::Finished;
                return match self.error.take() {
                    Some(error) => Err(error),
                    None => Ok(Action::Finished),
                };
            }
            msg_type::COPY_IN_RESPONSE | msg_type::COPY_BOTH_RESPONSE => {
                if self.state != State::Draining {
                    self.fail(Error::Unsupported("COPY FROM STDIN".into()));
                }
                buffer_set.write_buffer.clear();
                write_copy_fail(
                    &mut buffer_set.write_buffer,
                    "COPY is not supported by this client",
                );
                return Ok(Action::WriteAndReadMessage);
            }
            msg_type::COPY_OUT_RESPONSE => {
                self.fail(Error::Unsupported("COPY TO STDOUT".into()));
                return Ok(Action::ReadMessage);
            }
            _ => {}
        }

        match self.state {
            State::WaitingResponse => self.handle_response(buffer_set),
            State::ProcessingRows => self.handle_rows(buffer_set),
            // CopyData, CopyDone and whatever else the failed batch still sends.
            State::Draining => Ok(Action::ReadMessage),
            State::Initial | State::Finished => Err(Error::Protocol(format!(
                "Unexpected state {:?}",
                self.state
            ))),
        }
    }

    fn handle_response(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        let type_byte = buffer_set.type_byte;
        let payload = &buffer_set.read_buffer;

        match type_byte {
            msg_type::ROW_DESCRIPTION => {
                // Store column buffer for later use in row callbacks
                buffer_set.column_buffer.clear();
                buffer_set.column_buffer.extend_from_slice(payload);
                let cols = RowDescription::parse(&buffer_set.column_buffer)?;
                if let Err(e) = self.handler.result_start(cols) {
                    self.fail(e);
                    return Ok(Action::ReadMessage);
                }
                self.state = State::ProcessingRows;
                Ok(Action::ReadMessage)
            }
            msg_type::COMMAND_COMPLETE => {
                let complete = CommandComplete::parse(payload)?;
                if let Err(e) = self.handler.result_end(complete) {
                    self.fail(e);
                }
                Ok(Action::ReadMessage)
            }
            msg_type::EMPTY_QUERY_RESPONSE => {
                crate::protocol::codec::expect_end(payload, "EmptyQueryResponse")?;
                if let Err(e) = self.handler.empty_query() {
                    self.fail(e);
                }
                Ok(Action::ReadMessage)
            }
            _ => Err(unexpected(type_byte, "in query response")),
        }
    }

    fn handle_rows(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        let type_byte = buffer_set.type_byte;
        let payload = &buffer_set.read_buffer;

        match type_byte {
            msg_type::DATA_ROW => {
                let cols = RowDescription::parse(&buffer_set.column_buffer)?;
                let row = DataRow::parse(payload)?;
                if row.len() != cols.len() {
                    self.fail(Error::Decode(format!(
                        "DataRow has {} columns, RowDescription has {}",
                        row.len(),
                        cols.len()
                    )));
                    return Ok(Action::ReadMessage);
                }
                if let Err(e) = self.handler.row(cols, row) {
                    self.fail(e);
                }
                Ok(Action::ReadMessage)
            }
            msg_type::COMMAND_COMPLETE => {
                let complete = CommandComplete::parse(payload)?;
                if let Err(e) = self.handler.result_end(complete) {
                    self.fail(e);
                    return Ok(Action::ReadMessage);
                }
                // More commands may follow
                self.state = State::WaitingResponse;
                Ok(Action::ReadMessage)
            }
            _ => Err(unexpected(type_byte, "in row processing")),
        }
    }
}

impl<H: ResultHandler> StateMachine for SimpleQueryStateMachine<H> {
    fn step(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        if self.state == State::Initial {
            buffer_set.write_buffer.clear();
            write_query(&mut buffer_set.write_buffer, &self.query);
            self.state = State::WaitingResponse;
            return Ok(Action::WriteAndReadMessage);
        }
        if self.state == State::Finished {
            return Err(Error::Protocol("simple query already finished".into()));
        }
        self.handle_message(buffer_set)
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }
}
