use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::net::UnixStream;
use std::time::Duration;

#[cfg(feature = "sync-tls")]
use native_tls::TlsStream;

use crate::buffer_set::BufferSet;
use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::protocol::codec::decode_message;

const READ_CHUNK: usize = 8192;

pub enum Stream {
    Tcp(TcpStream),
    #[cfg(feature = "sync-tls")]
    Tls(Box<TlsStream<TcpStream>>),
    Unix(UnixStream),
}

impl Stream {
    /// Open a TCP or Unix socket as `opts` describes.
    pub fn connect(opts: &Opts) -> Result<Self> {
        let stream = if let Some(path) = opts.socket_path() {
            Stream::Unix(UnixStream::connect(path)?)
        } else {
            if opts.host.is_empty() {
                return Err(Error::InvalidUsage("host is empty".into()));
            }
            let tcp = match opts.connect_timeout {
                Some(timeout) => connect_timeout(&opts.host, opts.port, timeout)?,
                None => TcpStream::connect((opts.host.as_str(), opts.port))?,
            };
            tcp.set_nodelay(true)?;
            Stream::Tcp(tcp)
        };
        stream.set_timeouts(opts.socket_timeout)?;
        Ok(stream)
    }

    fn set_timeouts(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => {
                s.set_read_timeout(timeout)?;
                s.set_write_timeout(timeout)
            }
            #[cfg(feature = "sync-tls")]
            Stream::Tls(s) => {
                s.get_ref().set_read_timeout(timeout)?;
                s.get_ref().set_write_timeout(timeout)
            }
            Stream::Unix(s) => {
                s.set_read_timeout(timeout)?;
                s.set_write_timeout(timeout)
            }
        }
    }

    fn set_nonblocking(&self, nonblocking: bool) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_nonblocking(nonblocking),
            #[cfg(feature = "sync-tls")]
            Stream::Tls(s) => s.get_ref().set_nonblocking(nonblocking),
            Stream::Unix(s) => s.set_nonblocking(nonblocking),
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            #[cfg(feature = "sync-tls")]
            Stream::Tls(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }

    pub fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.write_all(buf),
            #[cfg(feature = "sync-tls")]
            Stream::Tls(s) => s.write_all(buf),
            Stream::Unix(s) => s.write_all(buf),
        }
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            #[cfg(feature = "sync-tls")]
            Stream::Tls(s) => s.flush(),
            Stream::Unix(s) => s.flush(),
        }
    }
}

fn connect_timeout(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let mut last_error = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    Err(Error::Io(last_error.unwrap_or_else(|| {
        std::io::Error::new(ErrorKind::NotFound, format!("{host}: no addresses"))
    })))
}

fn unexpected_eof() -> Error {
    Error::Io(std::io::Error::new(
        ErrorKind::UnexpectedEof,
        "server closed the connection",
    ))
}

/// A socket plus the receive buffer that reassembles messages split across
/// reads. Bytes past the last decoded message stay buffered.
pub struct Transport {
    stream: Stream,
    buf: Vec<u8>,
    pos: usize,
    /// The peer closed the socket. Reported once the buffer runs dry.
    eof: bool,
}

impl Transport {
    pub fn new(stream: Stream) -> Self {
        Self {
            stream,
            buf: Vec::with_capacity(READ_CHUNK),
            pos: 0,
            eof: false,
        }
    }

    /// Connect to the server `opts` points at.
    pub fn connect(opts: &Opts) -> Result<Self> {
        Stream::connect(opts).map(Self::new)
    }

    /// Write and flush.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Decode one buffered message into `buffer_set`, if a whole one is there.
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

    fn compact(&mut self) {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }

    /// One read from the socket into the buffer. Returns 0 on EOF.
    fn fill(&mut self) -> std::io::Result<usize> {
        self.compact();
        let len = self.buf.len();
        self.buf.resize(len + READ_CHUNK, 0);
        let result = self.stream.read(&mut self.buf[len..]);
        let n = *result.as_ref().unwrap_or(&0);
        self.buf.truncate(len + n);
        result
    }

    /// Read one message, blocking until it is complete.
    pub fn read_message(&mut self, buffer_set: &mut BufferSet) -> Result<()> {
        loop {
            if self.take_message(buffer_set)? {
                return Ok(());
            }
            if self.eof {
                return Err(unexpected_eof());
            }
            match self.fill() {
                Ok(0) => return Err(unexpected_eof()),
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Read one message if one is available without blocking.
    ///
    /// Messages that arrived before the server closed the socket are still
    /// returned; the EOF surfaces only after they are consumed.
    pub fn try_read_message(&mut self, buffer_set: &mut BufferSet) -> Result<bool> {
        if self.take_message(buffer_set)? {
            return Ok(true);
        }
        if !self.eof {
            self.fill_nonblocking()?;
            if self.take_message(buffer_set)? {
                return Ok(true);
            }
        }
        if self.eof {
            return Err(unexpected_eof());
        }
        Ok(false)
    }

    /// Drain whatever the socket has ready into the buffer without blocking.
    /// Stops at EOF, which is recorded rather than returned.
    fn fill_nonblocking(&mut self) -> Result<usize> {
        self.stream.set_nonblocking(true)?;
        let result = self.fill_until_would_block();
        self.stream.set_nonblocking(false)?;
        result
    }

    fn fill_until_would_block(&mut self) -> Result<usize> {
        let mut total = 0;
        loop {
            match self.fill() {
                Ok(0) => {
                    self.eof = true;
                    return Ok(total);
                }
                Ok(n) => total += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(total),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Read a single byte (the answer to SSLRequest).
    pub fn read_u8(&mut self) -> Result<u8> {
        if self.pos < self.buf.len() {
            let byte = self.buf[self.pos];
            self.pos += 1;
            return Ok(byte);
        }
        let mut byte = [0u8; 1];
        loop {
            match self.stream.read(&mut byte) {
                Ok(0) => return Err(unexpected_eof()),
                Ok(_) => return Ok(byte[0]),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Wrap the TCP stream in TLS.
    ///
    /// Certificates are not verified (`sslmode=require` semantics).
    #[cfg(feature = "sync-tls")]
    pub fn upgrade_to_tls(self, host: &str) -> Result<Self> {
        if self.pos < self.buf.len() {
            return Err(Error::Protocol(
                "received unencrypted data after SSL response".into(),
            ));
        }
        let tcp = match self.stream {
            Stream::Tcp(tcp) => tcp,
            _ => {
                return Err(Error::InvalidUsage(
                    "TLS is only supported over TCP".into(),
                ));
            }
        };
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()?;
        let tls = connector.connect(host, tcp).map_err(|e| match e {
            native_tls::HandshakeError::Failure(e) => Error::Tls(e),
            native_tls::HandshakeError::WouldBlock(_) => Error::Io(std::io::Error::new(
                ErrorKind::WouldBlock,
                "TLS handshake interrupted",
            )),
        })?;
        Ok(Self::new(Stream::Tls(Box::new(tls))))
    }
}
