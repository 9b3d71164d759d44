//! Error types for pqwire.

use thiserror::Error;

/// Result type for pqwire operations.
pub type Result<T> = core::result::Result<T, Error>;

/// PostgreSQL error/notice field types.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    /// Severity: ERROR, FATAL, PANIC, WARNING, NOTICE, DEBUG, INFO, LOG
    pub severity: Option<String>,
    /// Non-localized severity (same as severity but never translated)
    pub severity_non_localized: Option<String>,
    /// SQLSTATE error code (5 characters)
    pub code: Option<String>,
    /// Primary error message
    pub message: Option<String>,
    /// Detailed error explanation
    pub detail: Option<String>,
    /// Suggestion for fixing the error
    pub hint: Option<String>,
    /// Cursor position in query string (1-based)
    pub position: Option<u32>,
    /// Position in internal query
    pub internal_position: Option<u32>,
    /// Failed internal command text
    pub internal_query: Option<String>,
    /// Context/stack trace
    pub where_: Option<String>,
    /// Schema name
    pub schema: Option<String>,
    /// Table name
    pub table: Option<String>,
    /// Column name
    pub column: Option<String>,
    /// Data type name
    pub data_type: Option<String>,
    /// Constraint name
    pub constraint: Option<String>,
    /// Source file name
    pub file: Option<String>,
    /// Source line number
    pub line: Option<u32>,
    /// Source routine name
    pub routine: Option<String>,
}

impl ErrorFields {
    /// Severity, preferring the non-localized variant.
    pub fn severity(&self) -> Option<&str> {
        self.severity_non_localized
            .as_deref()
            .or(self.severity.as_deref())
    }
}

impl std::fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(severity) = &self.severity {
            write!(f, "{}: ", severity)?;
        }
        if let Some(message) = &self.message {
            write!(f, "{}", message)?;
        }
        if let Some(code) = &self.code {
            write!(f, " (SQLSTATE {})", code)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, "\nDETAIL: {}", detail)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\nHINT: {}", hint)?;
        }
        Ok(())
    }
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Could not establish or keep the session: socket, TLS, authentication.
    Connect,
    /// Malformed or unexpected bytes on the wire.
    Protocol,
    /// The server rejected a statement; the connection stays usable.
    Query,
    /// A result could not be materialized or converted.
    Decode,
    /// The API was called in a way the current state does not allow.
    Usage,
}

/// Error type for pqwire.
#[derive(Debug, Error)]
pub enum Error {
    /// Server error response to a query
    #[error("PostgreSQL error: {0}")]
    Server(ErrorFields),

    /// Server rejected the connection during startup
    #[error("connection rejected: {0}")]
    Startup(ErrorFields),

    /// Protocol error (malformed message, unexpected response, etc.)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Row shape or value conversion error
    #[error("Decode error: {0}")]
    Decode(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Authentication failed on the client side
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The server asked for an authentication method this client does not speak
    #[error("Unsupported authentication method: {0}")]
    UnsupportedAuthMethod(String),

    /// TLS error
    #[cfg(any(feature = "sync-tls", feature = "tokio-tls"))]
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    /// Connection is broken and cannot be reused
    #[error("Connection is broken")]
    ConnectionBroken,

    /// Invalid usage (e.g., a second query while one is in flight)
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    /// Unsupported feature
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl From<std::convert::Infallible> for Error {
    fn from(never: std::convert::Infallible) -> Self {
        match never {}
    }
}

impl Error {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_)
            | Error::Auth(_)
            | Error::UnsupportedAuthMethod(_)
            | Error::Startup(_)
            | Error::ConnectionBroken => ErrorKind::Connect,
            #[cfg(any(feature = "sync-tls", feature = "tokio-tls"))]
            Error::Tls(_) => ErrorKind::Connect,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Server(_) => ErrorKind::Query,
            Error::Decode(_) => ErrorKind::Decode,
            Error::InvalidUsage(_) | Error::Unsupported(_) => ErrorKind::Usage,
        }
    }

    /// Returns true if the error indicates the connection is broken and cannot be reused.
    pub fn is_connection_broken(&self) -> bool {
        match self {
            Error::Server(fields) => {
                // FATAL and PANIC errors indicate connection is broken
                matches!(fields.severity(), Some("FATAL") | Some("PANIC"))
            }
            _ => matches!(self.kind(), ErrorKind::Connect | ErrorKind::Protocol),
        }
    }

    /// Get the SQLSTATE code if this is a server error.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Server(fields) | Error::Startup(fields) => fields.code.as_deref(),
            _ => None,
        }
    }

    /// Server-supplied fields, if the server sent this error.
    pub fn server_fields(&self) -> Option<&ErrorFields> {
        match self {
            Error::Server(fields) | Error::Startup(fields) => Some(fields),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_keep_connection() {
        let err = Error::Server(ErrorFields {
            severity: Some("ERROR".into()),
            code: Some("42P01".into()),
            ..Default::default()
        });
        assert_eq!(err.kind(), ErrorKind::Query);
        assert!(!err.is_connection_broken());
        assert_eq!(err.sqlstate(), Some("42P01"));
    }

    #[test]
    fn fatal_server_error_breaks_connection() {
        let err = Error::Server(ErrorFields {
            severity_non_localized: Some("FATAL".into()),
            severity: Some("FATAL".into()),
            ..Default::default()
        });
        assert!(err.is_connection_broken());
    }

    #[test]
    fn classification() {
        assert_eq!(Error::Protocol("x".into()).kind(), ErrorKind::Protocol);
        assert!(Error::Protocol("x".into()).is_connection_broken());
        assert_eq!(Error::Decode("x".into()).kind(), ErrorKind::Decode);
        assert!(!Error::Decode("x".into()).is_connection_broken());
        assert_eq!(Error::Startup(ErrorFields::default()).kind(), ErrorKind::Connect);
        assert!(!Error::InvalidUsage("x".into()).is_connection_broken());
    }

    #[test]
    fn display_includes_sqlstate() {
        let fields = ErrorFields {
            severity: Some("ERROR".into()),
            message: Some("relation \"t\" does not exist".into()),
            code: Some("42P01".into()),
            ..Default::default()
        };
        assert_eq!(
            fields.to_string(),
            "ERROR: relation \"t\" does not exist (SQLSTATE 42P01)"
        );
    }
}
