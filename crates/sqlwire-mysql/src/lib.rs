//! MySQL client wire protocol for Rust.
//!
//! This crate speaks the MySQL client/server protocol directly. It provides:
//!
//! - Packet framing with sequence numbers and >16MB splitting
//! - Handshake and authentication (mysql_native_password, with the
//!   pre-4.1 `mysql_old_password` fallback)
//! - Text query protocol with buffered and streaming result decoding
//! - A connection state machine with ping/reconnect and transaction helpers
//! - Option-file and URL based configuration
//!
//! Two connection flavours share the same protocol code:
//! [`MySqlConnection`] blocks on a [`Transport`], and
//! [`MySqlAsyncConnection`] runs on asupersync's TCP primitives.
//!
//! # Example
//!
//! ```rust,ignore
//! use sqlwire_mysql::{MySqlConfig, MySqlConnection};
//!
//! let config = MySqlConfig::new()
//!     .host("localhost")
//!     .port(3306)
//!     .user("root")
//!     .database("mydb");
//!
//! let mut conn = MySqlConnection::connect(config)?;
//! let result = conn.query("SELECT 1")?;
//! assert_eq!(result.rows().len(), 1);
//! ```

pub mod async_connection;
pub mod auth;
pub mod charset;
pub mod config;
pub mod connection;
pub(crate) mod error;
pub mod handshake;
pub mod option_file;
pub mod protocol;
pub mod result;
pub mod transport;
pub mod types;

pub use async_connection::{MySqlAsyncConnection, SharedMySqlConnection, UnbufferedResult};
pub use charset::{Charset, Encoding};
pub use config::MySqlConfig;
pub use connection::{ConnectionState, MySqlConnection, RowStream};
pub use handshake::AuthPhase;
pub use option_file::OptionFile;
pub use result::{OkResult, ResultSet, RowSet};
pub use transport::{Connector, NetConnector, QueuedConnector, Transport};
pub use types::{Converters, FieldDescriptor, FieldType};

pub use sqlwire_core::{Error, Row, Value};
