//! PostgreSQL wire protocol implementation.
//!
//! This module contains the low-level protocol encoding and decoding. Nothing
//! in here performs I/O.
//!
//! # Structure
//!
//! - `backend`: Server → Client messages
//! - `frontend`: Client → Server messages
//! - `codec`: Framing and low-level encoding/decoding primitives
//! - `types`: Common protocol types (FormatCode, Oid, TransactionStatus)

pub mod backend;
pub mod codec;
pub mod frontend;
pub mod types;

// Re-export commonly used types
pub use backend::{BackendMessage, RawMessage};
pub use codec::{decode_message, decode_startup_frame};
pub use frontend::FrontendMessage;
pub use types::{FormatCode, Oid, TransactionStatus};
