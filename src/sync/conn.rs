//! Synchronous PostgreSQL connection.

use crate::buffer_set::BufferSet;
use crate::cancel::CancelToken;
use crate::conversion::ToParams;
use crate::error::{Error, Result};
use crate::handler::{DropHandler, NoticeHandler, Notification, ResultQueue};
use crate::opts::Opts;
use crate::protocol::backend::BackendKeyData;
use crate::protocol::frontend::write_terminate;
use crate::protocol::types::{FormatCode, TransactionStatus};
use crate::result::QueryResult;
use crate::session::Session;
use crate::state::extended::PreparedStatement;
use crate::state::{
    Action, AsyncMessage, ConnectionStateMachine, ConnectionStatus, ExtendedQueryStateMachine,
    InFlight, SimpleQueryStateMachine, StateMachine,
};

use super::stream::Transport;

/// A query sent with one of the `send_*` methods whose results have not all
/// been fetched yet.
struct Pending {
    machine: InFlight,
    needs_message: bool,
    finished: bool,
}

/// Synchronous PostgreSQL connection.
///
/// Blocking calls (`exec`, `exec_params`, `prepare`, ...) run one exchange to
/// completion. The `send_*` methods start a query and return immediately; its
/// results are then fetched with [`result`](Self::result), and
/// [`consume_input`](Self::consume_input) / [`is_busy`](Self::is_busy) let the
/// caller wait without blocking.
pub struct Conn {
    opts: Opts,
    transport: Transport,
    buffer_set: BufferSet,
    session: Session,
    pending: Option<Pending>,
}

impl Conn {
    /// Connect to a PostgreSQL server.
    pub fn new<O: TryInto<Opts>>(opts: O) -> Result<Self>
    where
        Error: From<O::Error>,
    {
        let opts = opts.try_into()?;
        let mut buffer_set = BufferSet::new();
        let mut session = Session::new();
        let transport = connect(&opts, &mut buffer_set, &mut session)?;

        Ok(Self {
            opts,
            transport,
            buffer_set,
            session,
            pending: None,
        })
    }

    /// Connection status; `Ok` while usable, `Bad` after a fatal error.
    pub fn status(&self) -> ConnectionStatus {
        self.session.status
    }

    /// Transaction status from the last ReadyForQuery, `Active` while a query
    /// is in flight.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.session.transaction_status
    }

    /// Current value of a server parameter such as `server_version` or
    /// `client_encoding`.
    pub fn parameter_status(&self, name: &str) -> Option<&str> {
        self.session.parameter_status(name)
    }

    /// All server parameters reported so far.
    pub fn server_params(&self) -> &[(String, String)] {
        &self.session.server_params
    }

    /// Backend process ID and secret key.
    pub fn backend_key(&self) -> Option<&BackendKeyData> {
        self.session.backend_key.as_ref()
    }

    /// A token that cancels the query running on this connection, from any
    /// thread.
    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.session
            .backend_key
            .map(|key| CancelToken::new(&self.opts, key))
    }

    /// Replace the notice sink. The default logs through `tracing`.
    pub fn set_notice_handler<H: NoticeHandler + 'static>(&mut self, handler: H) {
        self.session.set_notice_handler(handler);
    }

    /// Next queued LISTEN/NOTIFY notification.
    ///
    /// Reads whatever input is already available (without blocking) when the
    /// queue is empty.
    pub fn next_notification(&mut self) -> Result<Option<Notification>> {
        if self.session.notifications.is_empty() && self.session.status == ConnectionStatus::Ok {
            self.consume_input()?;
        }
        Ok(self.session.notifications.pop_front())
    }

    // === Blocking API ===

    /// Run `sql` with the simple query protocol.
    ///
    /// `sql` may hold several statements; the result of the last one is
    /// returned. If any statement fails, the server error is returned after
    /// the connection is ready again.
    pub fn exec(&mut self, sql: &str) -> Result<QueryResult> {
        self.send_simple_query(sql)?;
        self.finish_exec()
    }

    /// Run `sql` with the extended protocol, binding `params` in binary.
    pub fn exec_params<P: ToParams + ?Sized>(
        &mut self,
        sql: &str,
        params: &P,
        result_format: FormatCode,
    ) -> Result<QueryResult> {
        self.send_query_params(sql, params, result_format)?;
        self.finish_exec()
    }

    /// Prepare `sql` as the named statement `name`.
    ///
    /// An existing statement with the same name must be closed first.
    pub fn prepare(&mut self, name: &str, sql: &str) -> Result<PreparedStatement> {
        let mut machine = ExtendedQueryStateMachine::prepare(DropHandler, name, sql);
        self.drive(&mut machine)?;
        let statement = machine
            .take_prepared_statement()
            .ok_or_else(|| Error::Protocol("server did not describe the statement".into()))?;
        self.session
            .statements
            .insert(name.to_string(), statement.clone());
        Ok(statement)
    }

    /// Execute the statement prepared as `name`.
    pub fn exec_prepared<P: ToParams + ?Sized>(
        &mut self,
        name: &str,
        params: &P,
        result_format: FormatCode,
    ) -> Result<QueryResult> {
        self.send_query_prepared(name, params, result_format)?;
        self.finish_exec()
    }

    /// Close the statement prepared as `name`.
    pub fn close_statement(&mut self, name: &str) -> Result<()> {
        let mut machine = ExtendedQueryStateMachine::close_statement(DropHandler, name);
        self.drive(&mut machine)?;
        self.session.statements.remove(name);
        Ok(())
    }

    fn finish_exec(&mut self) -> Result<QueryResult> {
        let mut last = None;
        let mut first_error = None;
        while let Some(result) = self.result() {
            match result {
                Ok(result) => last = Some(result),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        last.ok_or_else(|| Error::Protocol("query produced no result".into()))
    }

    /// Run a non-query exchange to completion.
    fn drive<M: StateMachine>(&mut self, machine: &mut M) -> Result<()> {
        self.ensure_idle()?;
        self.session.transaction_status = TransactionStatus::Active;
        let result = self.drive_inner(machine);
        self.session.finish(machine, &result);
        result
    }

    fn drive_inner<M: StateMachine>(&mut self, machine: &mut M) -> Result<()> {
        loop {
            match machine.step(&mut self.buffer_set)? {
                Action::ReadMessage => self.transport.read_message(&mut self.buffer_set)?,
                Action::Write => self.transport.send(&self.buffer_set.write_buffer)?,
                Action::WriteAndReadMessage => {
                    self.transport.send(&self.buffer_set.write_buffer)?;
                    self.transport.read_message(&mut self.buffer_set)?;
                }
                Action::HandleAsyncMessageAndReadMessage(message) => {
                    self.session.deliver(message);
                    self.transport.read_message(&mut self.buffer_set)?;
                }
                Action::Finished => return Ok(()),
                Action::WriteAndReadByte | Action::TlsHandshake => {
                    return Err(Error::Protocol(
                        "startup action requested by a query state machine".into(),
                    ));
                }
            }
        }
    }

    fn ensure_idle(&self) -> Result<()> {
        self.session.check_usable()?;
        if self.pending.is_some() {
            return Err(Error::InvalidUsage(
                "another query is in progress; fetch its results first".into(),
            ));
        }
        Ok(())
    }

    // === Polling API ===

    /// Send `sql` with the simple query protocol without waiting for results.
    pub fn send_simple_query(&mut self, sql: &str) -> Result<()> {
        let machine = SimpleQueryStateMachine::new(ResultQueue::new(), sql);
        self.start(InFlight::Simple(machine))
    }

    /// Send `sql` with the extended protocol and no parameters, text results.
    pub fn send_query(&mut self, sql: &str) -> Result<()> {
        self.send_query_params(sql, &(), FormatCode::Text)
    }

    /// Send `sql` with the extended protocol, binding `params` in binary.
    pub fn send_query_params<P: ToParams + ?Sized>(
        &mut self,
        sql: &str,
        params: &P,
        result_format: FormatCode,
    ) -> Result<()> {
        self.ensure_idle()?;
        let machine =
            ExtendedQueryStateMachine::query(ResultQueue::new(), sql, params, result_format)?;
        self.start(InFlight::Extended(machine))
    }

    /// Send an execution of the statement prepared as `name`.
    pub fn send_query_prepared<P: ToParams + ?Sized>(
        &mut self,
        name: &str,
        params: &P,
        result_format: FormatCode,
    ) -> Result<()> {
        self.ensure_idle()?;
        let statement = self.session.prepared(name)?;
        let machine = ExtendedQueryStateMachine::execute(
            ResultQueue::new(),
            statement,
            params,
            result_format,
        )?;
        self.start(InFlight::Extended(machine))
    }

    fn start(&mut self, mut machine: InFlight) -> Result<()> {
        self.ensure_idle()?;
        let action = machine.step(&mut self.buffer_set)?;
        if !matches!(action, Action::WriteAndReadMessage) {
            return Err(Error::Protocol(format!(
                "query state machine started with {action:?}"
            )));
        }
        if let Err(e) = self.transport.send(&self.buffer_set.write_buffer) {
            self.session.mark_bad();
            return Err(e);
        }
        self.session.transaction_status = TransactionStatus::Active;
        self.pending = Some(Pending {
            machine,
            needs_message: true,
            finished: false,
        });
        Ok(())
    }

    /// Read and process input that is already available, without blocking.
    ///
    /// Notifications and notices are delivered; results of an in-flight query
    /// are queued for [`result`](Self::result). If the connection breaks
    /// while a query is in flight, this returns `ConnectionBroken` and the
    /// cause is reported by `result`.
    pub fn consume_input(&mut self) -> Result<()> {
        self.session.check_usable()?;
        if self.pending.is_some() {
            self.process(false);
            return self.session.check_usable();
        }
        loop {
            match self.transport.try_read_message(&mut self.buffer_set) {
                Ok(true) => {
                    let result = self
                        .session
                        .idle_message(self.buffer_set.type_byte, &self.buffer_set.read_buffer);
                    if let Err(e) = result {
                        if e.is_connection_broken() {
                            self.session.mark_bad();
                        }
                        return Err(e);
                    }
                }
                Ok(false) => return Ok(()),
                Err(e) => {
                    self.session.mark_bad();
                    return Err(e);
                }
            }
        }
    }

    /// Whether [`result`](Self::result) would block. Reads available input
    /// first.
    pub fn is_busy(&mut self) -> bool {
        if self.consume_input().is_err() {
            return false;
        }
        self.pending
            .as_mut()
            .is_some_and(|pending| !pending.finished && pending.machine.results().is_empty())
    }

    /// Next result of the query in flight.
    ///
    /// Returns `None` once every result has been fetched and the server is
    /// ready for the next query. Blocks only while a result is still being
    /// received.
    pub fn result(&mut self) -> Option<Result<QueryResult>> {
        let pending = self.pending.as_mut()?;
        if !pending.finished && pending.machine.results().is_empty() {
            self.process(true);
        }
        let pending = self.pending.as_mut()?;
        match pending.machine.results().pop() {
            Some(result) => Some(result),
            None => {
                self.pending = None;
                None
            }
        }
    }

    /// Advance the in-flight query. With `block`, waits until a result is
    /// queued or the query is finished; otherwise stops when input runs out.
    /// Errors are queued as results.
    fn process(&mut self, block: bool) {
        let Some(pending) = self.pending.as_mut() else {
            return;
        };

        while !pending.finished {
            if block && !pending.machine.results().is_empty() {
                return;
            }

            if pending.needs_message {
                let read = if block {
                    self.transport
                        .read_message(&mut self.buffer_set)
                        .map(|()| true)
                } else {
                    self.transport.try_read_message(&mut self.buffer_set)
                };
                match read {
                    Ok(true) => pending.needs_message = false,
                    Ok(false) => return,
                    Err(e) => {
                        self.session.mark_bad();
                        pending.machine.results().push_error(e);
                        pending.finished = true;
                        return;
                    }
                }
            }

            let step = match pending.machine.step(&mut self.buffer_set) {
                Ok(Action::ReadMessage) => Ok(()),
                Ok(Action::WriteAndReadMessage) => {
                    self.transport.send(&self.buffer_set.write_buffer)
                }
                Ok(Action::HandleAsyncMessageAndReadMessage(message)) => {
                    self.session.deliver(message);
                    Ok(())
                }
                Ok(Action::Finished) => {
                    pending.finished = true;
                    self.session.transaction_status = pending.machine.transaction_status();
                    return;
                }
                // Nothing to read after a plain write; keep stepping.
                Ok(Action::Write) => match self.transport.send(&self.buffer_set.write_buffer) {
                    Ok(()) => continue,
                    Err(e) => Err(e),
                },
                Ok(action @ (Action::WriteAndReadByte | Action::TlsHandshake)) => Err(
                    Error::Protocol(format!("query state machine requested {action:?}")),
                ),
                Err(e) => Err(e),
            };

            match step {
                Ok(()) => pending.needs_message = true,
                Err(e) => {
                    if e.is_connection_broken() {
                        self.session.mark_bad();
                    } else {
                        self.session.transaction_status = pending.machine.transaction_status();
                    }
                    pending.machine.results().push_error(e);
                    pending.finished = true;
                }
            }
        }
    }

    // === Lifecycle ===

    /// Close the connection and open a new one with the same options.
    ///
    /// Unfetched results, queued notifications and prepared statements are
    /// discarded.
    pub fn reset(&mut self) -> Result<()> {
        tracing::debug!(host = %self.opts.host, "resetting connection");
        self.terminate();
        self.pending = None;
        self.buffer_set.clear();
        self.session.discard();
        self.transport = connect(&self.opts, &mut self.buffer_set, &mut self.session)?;
        Ok(())
    }

    /// Send Terminate and close the socket.
    pub fn close(mut self) -> Result<()> {
        self.buffer_set.write_buffer.clear();
        write_terminate(&mut self.buffer_set.write_buffer);
        let result = self.transport.send(&self.buffer_set.write_buffer);
        self.session.mark_bad();
        result
    }

    /// Best-effort Terminate, leaving the connection `Bad`.
    fn terminate(&mut self) {
        if self.session.status == ConnectionStatus::Ok {
            self.buffer_set.write_buffer.clear();
            write_terminate(&mut self.buffer_set.write_buffer);
            let _ = self.transport.send(&self.buffer_set.write_buffer);
        }
        self.session.mark_bad();
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Open the transport and run startup.
fn connect(opts: &Opts, buffer_set: &mut BufferSet, session: &mut Session) -> Result<Transport> {
    let mut machine = ConnectionStateMachine::new(opts.clone(), cfg!(feature = "sync-tls"));
    machine.begin_connect();
    let result = Transport::connect(opts).and_then(|transport| {
        machine.socket_connected();
        startup(transport, &mut machine, buffer_set, session, opts)
    });
    match result {
        Ok(transport) => {
            session.established(&mut machine);
            Ok(transport)
        }
        Err(e) => {
            machine.mark_bad();
            session.mark_bad();
            Err(e)
        }
    }
}

fn startup(
    mut transport: Transport,
    machine: &mut ConnectionStateMachine,
    buffer_set: &mut BufferSet,
    session: &mut Session,
    opts: &Opts,
) -> Result<Transport> {
    loop {
        match machine.step(buffer_set)? {
            Action::WriteAndReadByte => {
                transport.send(&buffer_set.write_buffer)?;
                buffer_set.type_byte = transport.read_u8()?;
            }
            Action::ReadMessage => transport.read_message(buffer_set)?,
            Action::Write => transport.send(&buffer_set.write_buffer)?,
            Action::WriteAndReadMessage => {
                transport.send(&buffer_set.write_buffer)?;
                transport.read_message(buffer_set)?;
            }
            Action::TlsHandshake => transport = upgrade(transport, &opts.host)?,
            Action::HandleAsyncMessageAndReadMessage(message) => {
                // ParameterStatus was already recorded by the state machine.
                if !matches!(message, AsyncMessage::ParameterChanged { .. }) {
                    session.deliver(message);
                }
                transport.read_message(buffer_set)?;
            }
            Action::Finished => return Ok(transport),
        }
    }
}

#[cfg(feature = "sync-tls")]
fn upgrade(transport: Transport, host: &str) -> Result<Transport> {
    transport.upgrade_to_tls(host)
}

#[cfg(not(feature = "sync-tls"))]
fn upgrade(_transport: Transport, _host: &str) -> Result<Transport> {
    Err(Error::Unsupported(
        "TLS requested but sync-tls feature not enabled".into(),
    ))
}
