//! A PostgreSQL wire protocol 3.0 client.
//!
//! # Features
//!
//! - **Sans-I/O state machines**: startup, authentication and both query
//!   protocols are driven one message at a time, independent of the socket
//! - **Sync and async APIs**: a blocking connection with libpq-style polling,
//!   and a tokio connection
//! - **Owned results**: [`QueryResult`] keeps the rows after the connection
//!   is gone, with typed access through [`FromWireValue`]
//! - **Authentication**: cleartext, MD5 and SCRAM-SHA-256; optional TLS
//!
//! # Example
//!
//! ```no_run
//! use pqwire::sync::Conn;
//! use pqwire::{FormatCode, Opts};
//!
//! fn main() -> pqwire::Result<()> {
//!     let opts = Opts {
//!         host: "localhost".into(),
//!         user: "postgres".into(),
//!         database: Some("mydb".into()),
//!         password: Some("secret".into()),
//!         ..Default::default()
//!     };
//!
//!     let mut conn = Conn::new(opts)?;
//!
//!     let result = conn.exec_params("SELECT $1::int8 * 2 AS n", &(21_i64,), FormatCode::Binary)?;
//!     let n: i64 = result.get_by_name(0, "n")?;
//!     assert_eq!(n, 42);
//!
//!     conn.close()?;
//!     Ok(())
//! }
//! ```

pub mod buffer_set;
pub mod cancel;
pub mod conversion;
pub mod error;
pub mod handler;
pub mod opts;
pub mod protocol;
pub mod result;
pub mod row;
mod session;
pub mod state;

#[cfg(feature = "sync")]
pub mod sync;

#[cfg(feature = "tokio")]
pub mod tokio;

pub use cancel::CancelToken;
pub use conversion::{FromWireValue, ToParams, ToWireValue};
pub use error::{Error, ErrorFields, ErrorKind, Result};
pub use handler::{LogNotices, NoticeHandler, Notification};
pub use opts::{Opts, SslMode, TargetSessionAttrs};
pub use protocol::types::{FormatCode, Oid, TransactionStatus};
pub use result::{Field, QueryResult, ResultStatus};
pub use row::{FromRow, Row};
pub use state::ConnectionStatus;
pub use state::extended::PreparedStatement;
