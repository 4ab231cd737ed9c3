//! Connection-phase messages: the server greeting, the client's handshake
//! response and the authentication exchange that follows.
//!
//! Everything here is sans-IO. The connections read a packet, hand it to
//! [`auth_step`], and write whatever it asks them to send.
//!
//! ```text
//! client                          server
//!   |  <--------- greeting (seq 0) --|
//!   |-- handshake response (seq 1) ->|
//!   |  <------- OK / ERR / 0xFE (2) -|
//!   |-- 323 scramble + NUL (seq 3) ->|   legacy fallback only
//!   |  <------------- OK / ERR (4) --|
//! ```

use sqlwire_core::Error;

use crate::auth::{self, plugins};
use crate::charset::Encoding;
use crate::config::MySqlConfig;
use crate::error::{auth_error, error_from_packet, protocol_error};
use crate::protocol::capabilities::{
    CLIENT_CAPABILITIES, CLIENT_CONNECT_WITH_DB, CLIENT_MULTI_RESULTS, CLIENT_MULTI_STATEMENTS,
};
use crate::protocol::{OkPacket, Packet, PacketReader, PacketWriter};

/// The only greeting protocol version this client speaks.
pub const PROTOCOL_VERSION: u8 = 10;

/// Length of salt part 1.
const SALT1_LEN: usize = 8;

/// Progress of the connection phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    /// Waiting for the server greeting.
    AwaitingGreeting,
    /// Handshake response sent; waiting for the verdict.
    NegotiatingAuth,
    /// Legacy scramble sent; only OK or ERR may follow.
    LegacyAuthFallback,
    Authenticated,
}

/// Parsed server greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeInfo {
    pub protocol_version: u8,
    pub server_version: String,
    /// Connection (thread) id assigned by the server
    pub thread_id: u32,
    /// Salt part 1 followed by part 2 when present
    pub salt: Vec<u8>,
    /// Capability flags (low | high << 16)
    pub server_capabilities: u32,
    /// Server default charset id, when the greeting carries one
    pub server_charset: Option<u8>,
    pub server_status: Option<u16>,
}

impl HandshakeInfo {
    /// Parse the greeting payload.
    ///
    /// An Error packet in place of the greeting (e.g. "Host is blocked")
    /// becomes a `ServerError`.
    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        if payload.first() == Some(&0xFF) {
            return Err(error_from_packet(&Packet::new(payload.to_vec(), 0)));
        }

        let mut reader = PacketReader::new(payload);

        let protocol_version = reader
            .read_u8()
            .ok_or_else(|| protocol_error("Empty handshake packet"))?;
        if protocol_version != PROTOCOL_VERSION {
            return Err(protocol_error(format!(
                "Unsupported protocol version: {}",
                protocol_version
            )));
        }

        // Server versions are plain ASCII in practice.
        let server_version = Encoding::Latin1
            .decode(reader.read_null_bytes())
            .unwrap_or_default();

        let thread_id = reader
            .read_u32_le()
            .ok_or_else(|| protocol_error("Missing thread id"))?;

        let mut salt = reader
            .read_bytes(SALT1_LEN)
            .ok_or_else(|| protocol_error("Missing salt"))?
            .to_vec();
        reader.skip(1); // filler

        let caps_lower = reader
            .read_u16_le()
            .ok_or_else(|| protocol_error("Missing capability flags"))?;
        let mut server_capabilities = u32::from(caps_lower);

        let mut server_charset = None;
        let mut server_status = None;
        let mut salt2_len = 12;

        if reader.remaining() >= 6 {
            server_charset = reader.read_u8();
            server_status = reader.read_u16_le();
            let caps_upper = reader.read_u16_le().unwrap_or(0);
            server_capabilities |= u32::from(caps_upper) << 16;
            let salt_len = usize::from(reader.read_u8().unwrap_or(0));
            // The advertised length covers part 1 and the filler too.
            salt2_len = salt_len.saturating_sub(9).max(12);
        }

        reader.skip(10); // reserved

        if reader.remaining() >= salt2_len {
            if let Some(salt2) = reader.read_bytes(salt2_len) {
                salt.extend_from_slice(salt2);
            }
        }

        Ok(Self {
            protocol_version,
            server_version,
            thread_id,
            salt,
            server_capabilities,
            server_charset,
            server_status,
        })
    }

    /// Leading numeric component of the server version (`"5.7.10"` -> 5).
    pub fn major_version(&self) -> u32 {
        self.server_version
            .split(|c: char| !c.is_ascii_digit())
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }
}

/// Capability flags announced in the handshake response.
pub fn client_flags(config: &MySqlConfig, info: &HandshakeInfo) -> u32 {
    let mut flags = config.client_flag | CLIENT_CAPABILITIES | CLIENT_MULTI_STATEMENTS;
    if config.database.is_some() {
        flags |= CLIENT_CONNECT_WITH_DB;
    }
    if info.major_version() >= 5 {
        flags |= CLIENT_MULTI_RESULTS;
    }
    flags
}

/// Build the handshake response payload (sent with sequence number 1).
///
/// Layout: flags (4), max packet (4), charset (1), 23 zero bytes,
/// NUL-terminated user, length-prefixed native scramble, and the
/// NUL-terminated database when one is configured.
pub fn build_handshake_response(
    config: &MySqlConfig,
    info: &HandshakeInfo,
    charset_id: u8,
    encoding: Encoding,
) -> Vec<u8> {
    let password = config.password.as_deref().unwrap_or("");
    let scramble = auth::scramble_native(password.as_bytes(), &info.salt);
    let user = encoding.encode(&config.user);
    let database = config.database.as_deref().map(|db| encoding.encode(db));

    let mut writer = PacketWriter::with_capacity(
        32 + user.len() + 2 + scramble.len() + database.as_ref().map_or(0, |db| db.len() + 1),
    );
    writer.write_u32_le(client_flags(config, info));
    writer.write_u32_le(config.max_packet_size);
    writer.write_u8(charset_id);
    writer.write_zeros(23);
    writer.write_null_bytes(&user);
    // The native scramble is 20 bytes or empty.
    #[allow(clippy::cast_possible_truncation)]
    writer.write_u8(scramble.len() as u8);
    writer.write_bytes(&scramble);
    if let Some(db) = &database {
        writer.write_null_bytes(db);
    }
    writer.into_bytes()
}

/// What the connection should do after an authentication packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// The server accepted the credentials.
    Authenticated(OkPacket),
    /// Send `payload` as the next packet, then read again in `next` phase.
    Respond { payload: Vec<u8>, next: AuthPhase },
}

/// Advance the authentication exchange by one server packet.
pub fn auth_step(
    phase: AuthPhase,
    packet: &Packet,
    salt: &[u8],
    password: &[u8],
) -> Result<AuthStep, Error> {
    if packet.is_error() {
        let err = PacketReader::new(&packet.payload)
            .parse_err_packet()
            .ok_or_else(|| protocol_error("Malformed error packet during authentication"))?;
        return Err(auth_error(
            err.error_code,
            format!("Authentication failed: {}", err.error_message),
        ));
    }

    match (phase, packet.first_byte()) {
        (AuthPhase::NegotiatingAuth, Some(0xFE)) if packet.is_eof() || packet.is_auth_switch() => {
            handle_fe_packet(packet, salt, password)
        }
        (AuthPhase::NegotiatingAuth | AuthPhase::LegacyAuthFallback, Some(0x00)) if packet.is_ok() => {
            let ok = PacketReader::new(&packet.payload)
                .parse_ok_packet()
                .ok_or_else(|| protocol_error("Malformed OK packet during authentication"))?;
            Ok(AuthStep::Authenticated(ok))
        }
        (AuthPhase::LegacyAuthFallback, _) => Err(protocol_error(
            "Expected OK packet after legacy authentication",
        )),
        _ => Err(protocol_error(format!(
            "Unexpected packet during authentication (first byte {:#04x})",
            packet.first_byte().unwrap_or(0)
        ))),
    }
}

/// `0xFE` after the handshake response: a bare EOF asks for the legacy
/// scramble, a longer packet is an auth-switch request naming a plugin.
fn handle_fe_packet(packet: &Packet, salt: &[u8], password: &[u8]) -> Result<AuthStep, Error> {
    let mut reader = PacketReader::new(&packet.payload[1..]);
    let plugin = reader.read_null_bytes();

    if plugin.is_empty() {
        tracing::debug!("server requested pre-4.1 authentication");
        return Ok(legacy_response(password, salt));
    }

    let mut data = reader.read_rest();
    if data.last() == Some(&0) {
        data = &data[..data.len() - 1];
    }

    match plugin {
        p if p == plugins::MYSQL_OLD_PASSWORD.as_bytes() => {
            tracing::debug!(plugin = plugins::MYSQL_OLD_PASSWORD, "auth switch");
            let seed = if data.len() >= auth::SCRAMBLE_LENGTH_323 { data } else { salt };
            Ok(legacy_response(password, seed))
        }
        p if p == plugins::MYSQL_NATIVE_PASSWORD.as_bytes() => {
            tracing::debug!(plugin = plugins::MYSQL_NATIVE_PASSWORD, "auth switch");
            Ok(AuthStep::Respond {
                payload: auth::scramble_native(password, data),
                next: AuthPhase::NegotiatingAuth,
            })
        }
        other => {
            let name = String::from_utf8_lossy(other);
            tracing::warn!(plugin = %name, "unsupported authentication plugin requested");
            Err(auth_error(
                0,
                format!("Authentication plugin '{}' is not supported", name),
            ))
        }
    }
}

fn legacy_response(password: &[u8], salt: &[u8]) -> AuthStep {
    let mut payload = auth::scramble_323(password, salt);
    payload.push(0);
    AuthStep::Respond {
        payload,
        next: AuthPhase::LegacyAuthFallback,
    }
}
