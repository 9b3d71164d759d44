//! Query cancellation.

use crate::error::Result;
use crate::opts::Opts;
use crate::protocol::backend::BackendKeyData;
use crate::protocol::frontend::write_cancel_request;

/// Everything needed to cancel the query running on a connection.
///
/// A token is independent of its connection: it opens a new socket to the
/// same server and sends CancelRequest with the backend's pid and secret key.
/// The server gives no answer; the cancelled query fails with SQLSTATE
/// `57014` on the original connection if it was still running.
#[derive(Debug, Clone)]
pub struct CancelToken {
    opts: Opts,
    backend_key: BackendKeyData,
}

impl CancelToken {
    pub(crate) fn new(opts: &Opts, backend_key: BackendKeyData) -> Self {
        // Only the address is needed; credentials stay with the connection.
        let opts = Opts {
            host: opts.host.clone(),
            port: opts.port,
            socket: opts.socket.clone(),
            connect_timeout: opts.connect_timeout,
            socket_timeout: opts.socket_timeout,
            ..Opts::default()
        };
        Self { opts, backend_key }
    }

    /// Process ID of the backend this token cancels.
    pub fn process_id(&self) -> u32 {
        self.backend_key.process_id()
    }

    fn request(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        write_cancel_request(
            &mut buf,
            self.backend_key.process_id(),
            self.backend_key.secret(),
        );
        buf
    }

    /// Send the cancel request and wait for the server to close the socket.
    #[cfg(feature = "sync")]
    pub fn cancel(&self) -> Result<()> {
        use std::io::ErrorKind;

        use crate::sync::stream::Stream;

        tracing::debug!(pid = self.process_id(), "sending cancel request");
        let mut stream = Stream::connect(&self.opts)?;
        stream.write_all(&self.request())?;
        stream.flush()?;

        let mut scratch = [0u8; 64];
        loop {
            match stream.read(&mut scratch) {
                Ok(0) => return Ok(()),
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                // A reset after the request was delivered still counts.
                Err(e) if e.kind() == ErrorKind::ConnectionReset => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Async version of [`cancel`](Self::cancel).
    #[cfg(feature = "tokio")]
    pub async fn cancel_async(&self) -> Result<()> {
        use std::io::ErrorKind;

        use crate::tokio::stream::Stream;

        tracing::debug!(pid = self.process_id(), "sending cancel request");
        let mut stream = Stream::connect(&self.opts).await?;
        stream.write_all(&self.request()).await?;
        stream.flush().await?;

        let mut scratch = [0u8; 64];
        loop {
            match stream.read(&mut scratch).await {
                Ok(0) => return Ok(()),
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if e.kind() == ErrorKind::ConnectionReset => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }
}
