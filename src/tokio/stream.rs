//! Async stream abstraction for tokio.

use std::future::Future;
use std::io::ErrorKind;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::UnixStream;

#[cfg(feature = "tokio-tls")]
use tokio_native_tls::TlsStream;

use crate::buffer_set::BufferSet;
use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::protocol::codec::decode_message;

const READ_CHUNK: usize = 8192;

pub enum Stream {
    Tcp(TcpStream),
    #[cfg(feature = "tokio-tls")]
    Tls(Box<TlsStream<TcpStream>>),
    Unix(UnixStream),
}

impl Stream {
    /// Open a TCP or Unix socket as `opts` describes.
    pub async fn connect(opts: &Opts) -> Result<Self> {
        let connect = async {
            if let Some(path) = opts.socket_path() {
                return Ok(Stream::Unix(UnixStream::connect(path).await?));
            }
            if opts.host.is_empty() {
                return Err(Error::InvalidUsage("host is empty".into()));
            }
            let tcp = TcpStream::connect((opts.host.as_str(), opts.port)).await?;
            tcp.set_nodelay(true)?;
            Ok(Stream::Tcp(tcp))
        };
        with_timeout(opts.connect_timeout, connect).await
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf).await,
            #[cfg(feature = "tokio-tls")]
            Stream::Tls(s) => s.read(buf).await,
            Stream::Unix(s) => s.read(buf).await,
        }
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.write_all(buf).await,
            #[cfg(feature = "tokio-tls")]
            Stream::Tls(s) => s.write_all(buf).await,
            Stream::Unix(s) => s.write_all(buf).await,
        }
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush().await,
            #[cfg(feature = "tokio-tls")]
            Stream::Tls(s) => s.flush().await,
            Stream::Unix(s) => s.flush().await,
        }
    }
}

async fn with_timeout<T>(
    limit: Option<Duration>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|elapsed| {
            Error::Io(std::io::Error::new(ErrorKind::TimedOut, elapsed))
        })?,
        None => fut.await,
    }
}

fn unexpected_eof() -> Error {
    Error::Io(std::io::Error::new(
        ErrorKind::UnexpectedEof,
        "server closed the connection",
    ))
}

/// A socket plus the receive buffer that reassembles messages split across
/// reads.
pub struct Transport {
    stream: Stream,
    buf: Vec<u8>,
    pos: usize,
    timeout: Option<Duration>,
}

impl Transport {
    pub fn new(stream: Stream, timeout: Option<Duration>) -> Self {
        Self {
            stream,
            buf: Vec::with_capacity(READ_CHUNK),
            pos: 0,
            timeout,
        }
    }

    /// Connect to the server `opts` points at.
    pub async fn connect(opts: &Opts) -> Result<Self> {
        let stream = Stream::connect(opts).await?;
        Ok(Self::new(stream, opts.socket_timeout))
    }

    /// Write and flush.
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        let stream = &mut self.stream;
        with_timeout(self.timeout, async move {
            stream.write_all(data).await?;
            stream.flush().await?;
            Ok(())
        })
        .await
    }

    fn take_message(&mut self, buffer_set: &mut BufferSet) -> Result<bool> {
        let Some((raw, consumed)) = decode_message(&self.buf[self.pos..])? else {
            return Ok(false);
        };
        tracing::trace!(tag = %(raw.type_byte as char), len = raw.payload.len(), "backend message");
        buffer_set.type_byte = raw.type_byte;
        buffer_set.read_buffer.clear();
        buffer_set.read_buffer.extend_from_slice(raw.payload);
        self.pos += consumed;
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        }
        Ok(true)
    }

    /// Append one read's worth of bytes. Cancel-safe: nothing is buffered
    /// until the read completes.
    async fn fill(&mut self) -> Result<()> {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        let mut chunk = [0u8; READ_CHUNK];
        let stream = &mut self.stream;
        let n = with_timeout(self.timeout, async { Ok(stream.read(&mut chunk).await?) }).await?;
        if n == 0 {
            return Err(unexpected_eof());
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    /// Write without waiting, for use in `Drop`. Skipped over TLS.
    pub fn try_send(&mut self, data: &[u8]) {
        let _ = match &self.stream {
            Stream::Tcp(s) => s.try_write(data),
            #[cfg(feature = "tokio-tls")]
            Stream::Tls(_) => return,
            Stream::Unix(s) => s.try_write(data),
        };
    }

    /// Read one message.
    pub async fn read_message(&mut self, buffer_set: &mut BufferSet) -> Result<()> {
        while !self.take_message(buffer_set)? {
            self.fill().await?;
        }
        Ok(())
    }

    /// Read a single byte (the answer to SSLRequest).
    pub async fn read_u8(&mut self) -> Result<u8> {
        if self.pos == self.buf.len() {
            self.fill().await?;
        }
        let byte = self.buf[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    /// Wrap the TCP stream in TLS.
    ///
    /// Certificates are not verified (`sslmode=require` semantics).
    #[cfg(feature = "tokio-tls")]
    pub async fn upgrade_to_tls(self, host: &str) -> Result<Self> {
        if self.pos < self.buf.len() {
            return Err(Error::Protocol(
                "received unencrypted data after SSL response".into(),
            ));
        }
        let Stream::Tcp(tcp) = self.stream else {
            return Err(Error::InvalidUsage("TLS is only supported over TCP".into()));
        };
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()?;
        let connector = tokio_native_tls::TlsConnector::from(connector);
        let tls = with_timeout(self.timeout, async {
            Ok(connector.connect(host, tcp).await?)
        })
        .await?;
        Ok(Self::new(Stream::Tls(Box::new(tls)), self.timeout))
    }
}
