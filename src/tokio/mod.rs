//! Asynchronous PostgreSQL client using Tokio.

mod conn;
pub(crate) mod stream;

pub use conn::Conn;
