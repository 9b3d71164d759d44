//! Asynchronous PostgreSQL connection.

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
use crate::row::FromRow;
use crate::session::Session;
use crate::state::extended::PreparedStatement;
use crate::state::{
    Action, AsyncMessage, ConnectionStateMachine, ConnectionStatus, ExtendedQueryStateMachine,
    InFlight, SimpleQueryStateMachine, StateMachine,
};

use super::stream::Transport;

/// Asynchronous PostgreSQL connection.
///
/// Dropping a query future before it resolves leaves its response unread on
/// the socket. The connection then reports `Bad` and must be
/// [`reset`](Self::reset) before the next query.
pub struct Conn {
    opts: Opts,
    transport: Transport,
    buffer_set: BufferSet,
    session: Session,
    /// Set while an exchange is on the wire; still set if its future was dropped.
    in_flight: bool,
}

impl Conn {
    /// Connect to a PostgreSQL server.
    pub async fn new<O: TryInto<Opts>>(opts: O) -> Result<Self>
    where
        Error: From<O::Error>,
    {
        let opts = opts.try_into()?;
        let mut buffer_set = BufferSet::new();
        let mut session = Session::new();
        let transport = connect(&opts, &mut buffer_set, &mut session).await?;

        Ok(Self {
            opts,
            transport,
            buffer_set,
            session,
            in_flight: false,
        })
    }

    /// Connection status; `Ok` while usable, `Bad` after a fatal error or
    /// an abandoned query.
    pub fn status(&self) -> ConnectionStatus {
        if self.in_flight {
            return ConnectionStatus::Bad;
        }
        self.session.status
    }

    /// Transaction status from the last ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.session.transaction_status
    }

    /// Current value of a server parameter.
    pub fn parameter_status(&self, name: &str) -> Option<&str> {
        self.session.parameter_status(name)
    }

    /// Backend process ID and secret key.
    pub fn backend_key(&self) -> Option<&BackendKeyData> {
        self.session.backend_key.as_ref()
    }

    /// A token that cancels the query running on this connection.
    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.session
            .backend_key
            .map(|key| CancelToken::new(&self.opts, key))
    }

    /// Replace the notice sink. The default logs through `tracing`.
    pub fn set_notice_handler<H: NoticeHandler + 'static>(&mut self, handler: H) {
        self.session.set_notice_handler(handler);
    }

    /// Pop a notification received so far, without reading.
    pub fn next_notification(&mut self) -> Option<Notification> {
        self.session.notifications.pop_front()
    }

    /// Wait until a notification arrives.
    ///
    /// Cancel-safe: dropping the future loses no input, so it can be raced
    /// against a timer.
    pub async fn wait_for_notification(&mut self) -> Result<Notification> {
        loop {
            if let Some(notification) = self.session.notifications.pop_front() {
                return Ok(notification);
            }
            self.check_idle()?;
            let result = match self.transport.read_message(&mut self.buffer_set).await {
                Ok(()) => self
                    .session
                    .idle_message(self.buffer_set.type_byte, &self.buffer_set.read_buffer),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                if e.is_connection_broken() {
                    self.session.mark_bad();
                }
                return Err(e);
            }
        }
    }

    /// Fail if the connection is broken or a dropped future left a response
    /// on the socket.
    fn check_idle(&mut self) -> Result<()> {
        if self.in_flight {
            tracing::debug!("previous query was abandoned before completion");
            self.in_flight = false;
            self.session.mark_bad();
        }
        self.session.check_usable()
    }

    /// Drive a state machine to completion.
    async fn drive<M: StateMachine>(&mut self, machine: &mut M) -> Result<()> {
        self.check_idle()?;
        self.session.transaction_status = TransactionStatus::Active;
        self.in_flight = true;
        let result = self.drive_inner(machine).await;
        self.in_flight = false;
        self.session.finish(machine, &result);
        result
    }

    async fn drive_inner<M: StateMachine>(&mut self, machine: &mut M) -> Result<()> {
        loop {
            match machine.step(&mut self.buffer_set)? {
                Action::ReadMessage => self.transport.read_message(&mut self.buffer_set).await?,
                Action::Write => self.transport.send(&self.buffer_set.write_buffer).await?,
                Action::WriteAndReadMessage => {
                    self.transport.send(&self.buffer_set.write_buffer).await?;
                    self.transport.read_message(&mut self.buffer_set).await?;
                }
                Action::HandleAsyncMessageAndReadMessage(message) => {
                    self.session.deliver(message);
                    self.transport.read_message(&mut self.buffer_set).await?;
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

    /// Drive a query and return its last result, or the first error.
    async fn run_query(&mut self, mut machine: InFlight) -> Result<QueryResult> {
        self.drive(&mut machine).await?;
        let mut last = None;
        while let Some(result) = machine.results().pop() {
            last = Some(result?);
        }
        last.ok_or_else(|| Error::Protocol("query produced no result".into()))
    }

    /// Run `sql` with the simple query protocol and return the last
    /// statement's result.
    pub async fn exec(&mut self, sql: &str) -> Result<QueryResult> {
        let machine = SimpleQueryStateMachine::new(ResultQueue::new(), sql);
        self.run_query(InFlight::Simple(machine)).await
    }

    /// Run `sql` with the extended protocol, binding `params` in binary.
    pub async fn exec_params<P: ToParams + ?Sized>(
        &mut self,
        sql: &str,
        params: &P,
        result_format: FormatCode,
    ) -> Result<QueryResult> {
        let machine =
            ExtendedQueryStateMachine::query(ResultQueue::new(), sql, params, result_format)?;
        self.run_query(InFlight::Extended(machine)).await
    }

    /// Run `sql` and convert every row of the last result.
    pub async fn query_collect<T: for<'a> FromRow<'a>>(&mut self, sql: &str) -> Result<Vec<T>> {
        let result = self.exec(sql).await?;
        result.collect()
    }

    /// Prepare `sql` as the named statement `name`.
    pub async fn prepare(&mut self, name: &str, sql: &str) -> Result<PreparedStatement> {
        let mut machine = ExtendedQueryStateMachine::prepare(DropHandler, name, sql);
        self.drive(&mut machine).await?;
        let statement = machine
            .take_prepared_statement()
            .ok_or_else(|| Error::Protocol("server did not describe the statement".into()))?;
        self.session
            .statements
            .insert(name.to_string(), statement.clone());
        Ok(statement)
    }

    /// Execute the statement prepared as `name`.
    pub async fn exec_prepared<P: ToParams + ?Sized>(
        &mut self,
        name: &str,
        params: &P,
        result_format: FormatCode,
    ) -> Result<QueryResult> {
        let statement = self.session.prepared(name)?;
        let machine = ExtendedQueryStateMachine::execute(
            ResultQueue::new(),
            statement,
            params,
            result_format,
        )?;
        self.run_query(InFlight::Extended(machine)).await
    }

    /// Close the statement prepared as `name`.
    pub async fn close_statement(&mut self, name: &str) -> Result<()> {
        let mut machine = ExtendedQueryStateMachine::close_statement(DropHandler, name);
        self.drive(&mut machine).await?;
        self.session.statements.remove(name);
        Ok(())
    }

    /// Close the connection and open a new one with the same options.
    pub async fn reset(&mut self) -> Result<()> {
        tracing::debug!(host = %self.opts.host, "resetting connection");
        self.in_flight = false;
        if self.session.status == ConnectionStatus::Ok {
            self.buffer_set.write_buffer.clear();
            write_terminate(&mut self.buffer_set.write_buffer);
            let _ = self.transport.send(&self.buffer_set.write_buffer).await;
        }
        self.session.mark_bad();
        self.buffer_set.clear();
        self.session.discard();
        self.transport = connect(&self.opts, &mut self.buffer_set, &mut self.session).await?;
        Ok(())
    }

    /// Send Terminate and close the socket.
    pub async fn close(mut self) -> Result<()> {
        self.buffer_set.write_buffer.clear();
        write_terminate(&mut self.buffer_set.write_buffer);
        let result = self.transport.send(&self.buffer_set.write_buffer).await;
        self.session.mark_bad();
        result
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        if self.session.status == ConnectionStatus::Ok {
            self.buffer_set.write_buffer.clear();
            write_terminate(&mut self.buffer_set.write_buffer);
            self.transport.try_send(&self.buffer_set.write_buffer);
        }
    }
}

async fn connect(
    opts: &Opts,
    buffer_set: &mut BufferSet,
    session: &mut Session,
) -> Result<Transport> {
    let mut machine = ConnectionStateMachine::new(opts.clone(), cfg!(feature = "tokio-tls"));
    machine.begin_connect();
    let result = match Transport::connect(opts).await {
        Ok(transport) => {
            machine.socket_connected();
            startup(transport, &mut machine, buffer_set, session, opts).await
        }
        Err(e) => Err(e),
    };
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

async fn startup(
    mut transport: Transport,
    machine: &mut ConnectionStateMachine,
    buffer_set: &mut BufferSet,
    session: &mut Session,
    opts: &Opts,
) -> Result<Transport> {
    loop {
        match machine.step(buffer_set)? {
            Action::WriteAndReadByte => {
                transport.send(&buffer_set.write_buffer).await?;
                buffer_set.type_byte = transport.read_u8().await?;
            }
            Action::ReadMessage => transport.read_message(buffer_set).await?,
            Action::Write => transport.send(&buffer_set.write_buffer).await?,
            Action::WriteAndReadMessage => {
                transport.send(&buffer_set.write_buffer).await?;
                transport.read_message(buffer_set).await?;
            }
            Action::TlsHandshake => transport = upgrade(transport, &opts.host).await?,
            Action::HandleAsyncMessageAndReadMessage(message) => {
                if !matches!(message, AsyncMessage::ParameterChanged { .. }) {
                    session.deliver(message);
                }
                transport.read_message(buffer_set).await?;
            }
            Action::Finished => return Ok(transport),
        }
    }
}

#[cfg(feature = "tokio-tls")]
async fn upgrade(transport: Transport, host: &str) -> Result<Transport> {
    transport.upgrade_to_tls(host).await
}

#[cfg(not(feature = "tokio-tls"))]
async fn upgrade(_transport: Transport, _host: &str) -> Result<Transport> {
    Err(Error::Unsupported(
        "TLS requested but tokio-tls feature not enabled".into(),
    ))
}
