//! Extended query protocol state machine.
//!
//! One machine covers the three request shapes the connection sends:
//! an unnamed-statement query (Parse, Bind, Describe portal, Execute, Sync),
//! a named prepare (Parse, Describe statement, Sync) and a close
//! (Close, Sync). Bound queries against a named statement skip the Parse.

use crate::buffer_set::BufferSet;
use crate::conversion::ToParams;
use crate::error::{Error, Result};
use crate::handler::ResultHandler;
use crate::protocol::backend::{
    CommandComplete, DataRow, ParameterDescription, RawMessage, ReadyForQuery, RowDescription,
    msg_type, parse_fields,
};
use crate::protocol::codec::expect_end;
use crate::protocol::frontend::{
    write_bind, write_close_statement, write_copy_fail, write_describe_portal,
    write_describe_statement, write_execute, write_parse, write_sync,
};
use crate::protocol::types::{FormatCode, Oid, TransactionStatus};
use crate::result::Field;

use super::action::Action;
use super::{StateMachine, parse_async_message, unexpected};

/// Extended query state machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    Exchanging,
    ProcessingRows,
    /// A statement failed; skip everything until ReadyForQuery.
    Draining,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Execute,
    Prepare,
    Close,
}

/// A named statement as the server described it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    /// Statement name
    pub name: String,
    /// Parameter type OIDs, as resolved by the server
    pub param_oids: Vec<Oid>,
    /// Result columns; empty if the statement returns no rows
    pub columns: Vec<Field>,
}

/// Extended query protocol state machine.
///
/// Errors follow the same rule as the simple protocol: the first failure is
/// held until ReadyForQuery and then returned.
pub struct ExtendedQueryStateMachine<H> {
    state: State,
    mode: Mode,
    handler: H,
    request: Vec<u8>,
    statement_name: String,
    prepared: Option<PreparedStatement>,
    error: Option<Error>,
    transaction_status: TransactionStatus,
}

impl<H: ResultHandler> ExtendedQueryStateMachine<H> {
    fn with_request(handler: H, mode: Mode, statement_name: &str, request: Vec<u8>) -> Self {
        Self {
            state: State::Initial,
            mode,
            handler,
            request,
            statement_name: statement_name.to_string(),
            prepared: None,
            error: None,
            transaction_status: TransactionStatus::Active,
        }
    }

    /// Run `query` on the unnamed statement and portal.
    ///
    /// Parameters are sent in binary with their natural types; results come
    /// back in `result_format`.
    pub fn query<P: ToParams + ?Sized>(
        handler: H,
        query: &str,
        params: &P,
        result_format: FormatCode,
    ) -> Result<Self> {
        let param_oids = params.natural_oids();
        let mut request = Vec::new();
        write_parse(&mut request, "", query, &param_oids);
        write_bind(&mut request, "", "", params, &param_oids, result_format)?;
        write_describe_portal(&mut request, "");
        write_execute(&mut request, "", 0);
        write_sync(&mut request);
        Ok(Self::with_request(handler, Mode::Execute, "", request))
    }

    /// Bind `params` to the prepared statement `statement` and run it.
    pub fn execute<P: ToParams + ?Sized>(
        handler: H,
        statement: &PreparedStatement,
        params: &P,
        result_format: FormatCode,
    ) -> Result<Self> {
        let mut request = Vec::new();
        write_bind(
            &mut request,
            "",
            &statement.name,
            params,
            &statement.param_oids,
            result_format,
        )?;
        write_describe_portal(&mut request, "");
        write_execute(&mut request, "", 0);
        write_sync(&mut request);
        Ok(Self::with_request(handler, Mode::Execute, &statement.name, request))
    }

    /// Prepare `query` as the named statement `name`.
    pub fn prepare(handler: H, name: &str, query: &str) -> Self {
        let mut request = Vec::new();
        write_parse(&mut request, name, query, &[]);
        write_describe_statement(&mut request, name);
        write_sync(&mut request);
        Self::with_request(handler, Mode::Prepare, name, request)
    }

    /// Close the named statement `name`.
    pub fn close_statement(handler: H, name: &str) -> Self {
        let mut request = Vec::new();
        write_close_statement(&mut request, name);
        write_sync(&mut request);
        Self::with_request(handler, Mode::Close, name, request)
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

    /// The statement described by a successful prepare.
    pub fn take_prepared_statement(&mut self) -> Option<PreparedStatement> {
        self.prepared.take()
    }

    fn fail(&mut self, error: Error) {
        self.handler.abort();
        if self.error.is_none() {
            self.error = Some(error);
        }
        self.state = State::Draining;
    }

    fn prepared_mut(&mut self) -> &mut PreparedStatement {
        let name = &self.statement_name;
        self.prepared.get_or_insert_with(|| PreparedStatement {
            name: name.clone(),
            param_oids: Vec::new(),
            columns: Vec::new(),
        })
    }

    fn handle_message(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        let type_byte = buffer_set.type_byte;

        if RawMessage::is_async_type(type_byte) {
            let message = parse_async_message(type_byte, &buffer_set.read_buffer)?;
            return Ok(Action::HandleAsyncMessageAndReadMessage(message));
        }

        match type_byte {
            msg_type::ERROR_RESPONSE => {
                let error = Error::Server(parse_fields(&buffer_set.read_buffer)?);
                if error.is_connection_broken() {
                    return Err(error);
                }
                self.fail(error);
                return Ok(Action::ReadMessage);
            }
            msg_type::READY_FOR_QUERY => {
                self.transaction_status = ReadyForQuery::parse(&buffer_set.read_buffer)?.status;
                self.state = State::Finished;
                if self.error.is_some() {
                    self.prepared = None;
                }
                return match self.error.take() {
                    Some(error) => Err(error),
                    None => Ok(Action::Finished),
                };
            }
            msg_type::COPY_IN_RESPONSE | msg_type::COPY_BOTH_RESPONSE => {
                self.fail(Error::Unsupported("COPY FROM STDIN".into()));
                // The Sync sent with the request is ignored in copy-in mode.
                buffer_set.write_buffer.clear();
                write_copy_fail(
                    &mut buffer_set.write_buffer,
                    "COPY is not supported by this client",
                );
                write_sync(&mut buffer_set.write_buffer);
                return Ok(Action::WriteAndReadMessage);
            }
            msg_type::COPY_OUT_RESPONSE => {
                self.fail(Error::Unsupported("COPY TO STDOUT".into()));
                return Ok(Action::ReadMessage);
            }
            _ => {}
        }

        match self.state {
            State::Exchanging => self.handle_exchange(buffer_set),
            State::ProcessingRows => self.handle_rows(buffer_set),
            State::Draining => Ok(Action::ReadMessage),
            State::Initial | State::Finished => Err(Error::Protocol(format!(
                "Unexpected state {:?}",
                self.state
            ))),
        }
    }

    fn handle_exchange(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        let type_byte = buffer_set.type_byte;
        let payload = &buffer_set.read_buffer;

        match (self.mode, type_byte) {
            (Mode::Execute | Mode::Prepare, msg_type::PARSE_COMPLETE)
            | (Mode::Execute, msg_type::BIND_COMPLETE)
            | (Mode::Close, msg_type::CLOSE_COMPLETE) => {
                expect_end(payload, "completion message")?;
                Ok(Action::ReadMessage)
            }
            (Mode::Execute | Mode::Prepare, msg_type::NO_DATA) => {
                expect_end(payload, "NoData")?;
                if self.mode == Mode::Prepare {
                    self.prepared_mut().columns.clear();
                }
                Ok(Action::ReadMessage)
            }
            (Mode::Prepare, msg_type::PARAMETER_DESCRIPTION) => {
                let oids = ParameterDescription::parse(payload)?.into_oids();
                self.prepared_mut().param_oids = oids;
                Ok(Action::ReadMessage)
            }
            (Mode::Prepare, msg_type::ROW_DESCRIPTION) => {
                let columns = RowDescription::parse(payload)?
                    .fields()
                    .iter()
                    .map(Field::from)
                    .collect();
                self.prepared_mut().columns = columns;
                Ok(Action::ReadMessage)
            }
            (Mode::Execute, msg_type::ROW_DESCRIPTION) => {
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
            (Mode::Execute, msg_type::COMMAND_COMPLETE) => {
                let complete = CommandComplete::parse(payload)?;
                if let Err(e) = self.handler.result_end(complete) {
                    self.fail(e);
                }
                Ok(Action::ReadMessage)
            }
            (Mode::Execute, msg_type::EMPTY_QUERY_RESPONSE) => {
                expect_end(payload, "EmptyQueryResponse")?;
                if let Err(e) = self.handler.empty_query() {
                    self.fail(e);
                }
                Ok(Action::ReadMessage)
            }
            _ => Err(unexpected(type_byte, "in extended query response")),
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
                self.state = State::Exchanging;
                Ok(Action::ReadMessage)
            }
            _ => Err(unexpected(type_byte, "in row processing")),
        }
    }
}

impl<H: ResultHandler> StateMachine for ExtendedQueryStateMachine<H> {
    fn step(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        if self.state == State::Initial {
            buffer_set.write_buffer.clear();
            buffer_set.write_buffer.extend_from_slice(&self.request);
            self.request = Vec::new();
            self.state = State::Exchanging;
            return Ok(Action::WriteAndReadMessage);
        }
        if self.state == State::Finished {
            return Err(Error::Protocol("extended query already finished".into()));
        }
        self.handle_message(buffer_set)
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }
}
