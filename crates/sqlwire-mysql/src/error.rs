//! Error constructors shared by the blocking and async connections.

use sqlwire_core::error::{
    ConnectionError, ConnectionErrorKind, ProtocolError, ServerError, UsageError, client_code,
};
use sqlwire_core::Error;

use crate::protocol::{ErrPacket, Packet, PacketReader};

pub(crate) fn protocol_error(msg: impl Into<String>) -> Error {
    Error::Protocol(ProtocolError {
        message: msg.into(),
        code: None,
        raw_data: None,
        source: None,
    })
}

/// A packet that does not fit the current exchange.
pub(crate) fn out_of_sync(packet: &Packet) -> Error {
    Error::Protocol(ProtocolError {
        message: "Command Out of Sync".to_string(),
        code: Some(client_code::COMMANDS_OUT_OF_SYNC),
        raw_data: Some(packet.payload.iter().take(64).copied().collect()),
        source: None,
    })
}

pub(crate) fn usage_error(msg: impl Into<String>) -> Error {
    Error::Usage(UsageError {
        message: msg.into(),
    })
}

pub(crate) fn auth_error(code: u16, msg: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Authentication,
        code,
        host: None,
        message: msg.into(),
        source: None,
    })
}

pub(crate) fn not_connected() -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::NotConnected,
        code: client_code::NOT_CONNECTED,
        host: None,
        message: "Not connected".to_string(),
        source: None,
    })
}

pub(crate) fn lost_connection(err: std::io::Error) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Disconnected,
        code: client_code::SERVER_LOST,
        host: None,
        message: format!("Lost connection to MySQL server during query ({})", err),
        source: Some(Box::new(err)),
    })
}

pub(crate) fn connect_error(host: &str, err: std::io::Error) -> Error {
    let kind = if err.kind() == std::io::ErrorKind::ConnectionRefused {
        ConnectionErrorKind::Refused
    } else {
        ConnectionErrorKind::Connect
    };
    Error::Connection(ConnectionError {
        kind,
        code: client_code::CONN_HOST_ERROR,
        host: Some(host.to_string()),
        message: format!("Can't connect to MySQL server on '{}' ({})", host, err),
        source: Some(Box::new(err)),
    })
}

/// Re-tag a failure during connect as a connect error carrying `host`.
///
/// Server, usage and authentication errors keep their identity.
pub(crate) fn during_connect(host: &str, err: Error) -> Error {
    match err {
        Error::Connection(mut c) if c.kind == ConnectionErrorKind::Disconnected => {
            c.kind = ConnectionErrorKind::Connect;
            c.code = client_code::CONN_HOST_ERROR;
            c.message = format!("Can't connect to MySQL server on '{}' ({})", host, c.message);
            c.host = Some(host.to_string());
            Error::Connection(c)
        }
        Error::Io(e) => connect_error(host, e),
        other => other,
    }
}

pub(crate) fn server_error(err: ErrPacket) -> Error {
    Error::Server(ServerError::new(
        err.error_code,
        err.sql_state,
        err.error_message,
    ))
}

/// Decode an Error packet into a `ServerError`.
pub(crate) fn error_from_packet(packet: &Packet) -> Error {
    match PacketReader::new(&packet.payload).parse_err_packet() {
        Some(err) => server_error(err),
        None => protocol_error("Malformed error packet"),
    }
}
