//! Error types for sqlwire operations.

use std::fmt;

/// Client-side error codes, numbered the way MySQL client libraries number them.
pub mod client_code {
    /// Can't connect to the server.
    pub const CONN_HOST_ERROR: u16 = 2003;
    /// The server has gone away (a command was attempted on a dead link).
    pub const SERVER_GONE_ERROR: u16 = 2006;
    /// The connection was lost in the middle of an exchange.
    pub const SERVER_LOST: u16 = 2013;
    /// A response arrived that does not fit the command sequence.
    pub const COMMANDS_OUT_OF_SYNC: u16 = 2014;
    /// A command was issued on a closed connection.
    pub const NOT_CONNECTED: u16 = 2048;
}

/// The primary error type for all sqlwire operations.
#[derive(Debug)]
pub enum Error {
    /// Transport-level failures (connect, lost link, authentication)
    Connection(ConnectionError),
    /// Error packet sent by the server
    Server(ServerError),
    /// Malformed or unexpected packet
    Protocol(ProtocolError),
    /// Misuse of the API, detected before any I/O
    Usage(UsageError),
    /// Value conversion errors
    Type(TypeError),
    /// Configuration errors
    Config(ConfigError),
    /// I/O errors
    Io(std::io::Error),
    /// Operation timed out
    Timeout,
    /// Operation was cancelled via asupersync
    Cancelled,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    /// Client error code (see [`client_code`]), or the server's code for
    /// authentication rejections.
    pub code: u16,
    pub host: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection refused
    Refused,
    /// Authentication failed
    Authentication,
    /// Connection lost during operation
    Disconnected,
    /// Command issued without an open transport
    NotConnected,
}

#[derive(Debug)]
pub struct ServerError {
    pub kind: ServerErrorKind,
    pub code: u16,
    pub sqlstate: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, not null)
    Constraint,
    /// Database, table or column not found
    NotFound,
    /// Access denied
    Permission,
    /// Deadlock or lock wait timeout
    Deadlock,
    /// Query interrupted (KILL QUERY, max execution time)
    Interrupted,
    /// Any other server error
    Database,
}

impl ServerErrorKind {
    /// Classify a MySQL server error number.
    pub fn from_code(code: u16) -> Self {
        match code {
            1064 | 1149 => ServerErrorKind::Syntax,
            1048 | 1062 | 1169 | 1216 | 1217 | 1451 | 1452 | 1557 | 1586 | 3819 => {
                ServerErrorKind::Constraint
            }
            1049 | 1051 | 1054 | 1091 | 1146 => ServerErrorKind::NotFound,
            1044 | 1045 | 1142 | 1143 | 1227 => ServerErrorKind::Permission,
            1205 | 1213 => ServerErrorKind::Deadlock,
            1317 | 3024 => ServerErrorKind::Interrupted,
            _ => ServerErrorKind::Database,
        }
    }
}

#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
    /// Client error code when the failure has one (e.g. commands out of sync).
    pub code: Option<u16>,
    pub raw_data: Option<Vec<u8>>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct UsageError {
    pub message: String,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Is this a retryable error (deadlock, lost connection, timeout)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Server(s) => matches!(s.kind, ServerErrorKind::Deadlock),
            Error::Connection(c) => matches!(c.kind, ConnectionErrorKind::Disconnected),
            Error::Timeout => true,
            _ => false,
        }
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Io(_))
    }

    /// Server or client error number, when one is attached.
    pub fn code(&self) -> Option<u16> {
        match self {
            Error::Server(s) => Some(s.code),
            Error::Connection(c) => Some(c.code),
            Error::Protocol(p) => p.code,
            _ => None,
        }
    }

    /// Get SQLSTATE if available (e.g., "42000" for syntax errors)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Server(s) => s.sqlstate.as_deref(),
            _ => None,
        }
    }
}

impl ServerError {
    /// Build a server error, classifying `code`.
    pub fn new(code: u16, sqlstate: Option<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ServerErrorKind::from_code(code),
            code,
            sqlstate,
            message: message.into(),
        }
    }

    /// Is this a duplicate key violation?
    pub fn is_duplicate_key(&self) -> bool {
        self.code == 1062
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        matches!(self.code, 1216 | 1217 | 1451 | 1452)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e),
            Error::Server(e) => write!(f, "Server error: {}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Usage(e) => write!(f, "Usage error: {}", e.message),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Cancelled => write!(f, "Operation cancelled"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Protocol(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Some(host) => write!(f, "({}) {} [{}]", self.code, self.message, host),
            None => write!(f, "({}) {}", self.code, self.message),
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "({}, SQLSTATE {}) {}", self.code, sqlstate, self.message)
        } else {
            write!(f, "({}) {}", self.code, self.message)
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        Error::Server(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<UsageError> for Error {
    fn from(err: UsageError) -> Self {
        Error::Usage(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for sqlwire operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_classification() {
        let dup = ServerError::new(1062, Some("23000".to_string()), "Duplicate entry '1'");
        assert_eq!(dup.kind, ServerErrorKind::Constraint);
        assert!(dup.is_duplicate_key());
        assert!(!dup.is_foreign_key_violation());

        assert_eq!(ServerErrorKind::from_code(1064), ServerErrorKind::Syntax);
        assert_eq!(ServerErrorKind::from_code(1146), ServerErrorKind::NotFound);
        assert_eq!(ServerErrorKind::from_code(1045), ServerErrorKind::Permission);
        assert_eq!(ServerErrorKind::from_code(1213), ServerErrorKind::Deadlock);
        assert_eq!(ServerErrorKind::from_code(9999), ServerErrorKind::Database);

        let err = Error::Server(dup);
        assert_eq!(err.sqlstate(), Some("23000"));
        assert_eq!(err.code(), Some(1062));
    }

    #[test]
    fn retryable_and_connection_flags() {
        let deadlock = Error::Server(ServerError::new(1213, None, "Deadlock found"));
        assert!(deadlock.is_retryable());

        let lost = Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Disconnected,
            code: client_code::SERVER_LOST,
            host: None,
            message: "Lost connection to MySQL server during query".to_string(),
            source: None,
        });
        assert!(lost.is_retryable());
        assert!(lost.is_connection_error());
        assert_eq!(lost.code(), Some(2013));

        let usage = Error::Usage(UsageError {
            message: "missing user".to_string(),
        });
        assert!(!usage.is_retryable());
        assert!(!usage.is_connection_error());
        assert_eq!(usage.code(), None);
    }

    #[test]
    fn display_includes_code_and_host() {
        let err = Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Connect,
            code: client_code::CONN_HOST_ERROR,
            host: Some("db.internal".to_string()),
            message: "Can't connect to MySQL server".to_string(),
            source: None,
        });
        assert_eq!(
            err.to_string(),
            "Connection error: (2003) Can't connect to MySQL server [db.internal]"
        );

        let err = Error::Server(ServerError::new(
            1064,
            Some("42000".to_string()),
            "You have an error in your SQL syntax",
        ));
        assert_eq!(
            err.to_string(),
            "Server error: (1064, SQLSTATE 42000) You have an error in your SQL syntax"
        );
    }
}
