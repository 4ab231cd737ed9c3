//! Core types shared by the sqlwire drivers.
//!
//! - `Error` taxonomy with client and server error codes
//! - `Value` for dynamically typed column values
//! - `Row` with shared column metadata
//! - `Outcome` / `Cx` re-exports from asupersync for the async drivers

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod error;
pub mod row;
pub mod value;

pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, ProtocolError, Result, ServerError,
    ServerErrorKind, TypeError, UsageError, client_code,
};
pub use row::{ColumnInfo, Row};
pub use value::Value;
