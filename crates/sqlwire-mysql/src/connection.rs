//! Blocking MySQL connection.
//!
//! Owns the transport, the negotiated session state and at most one
//! streaming result. All I/O goes through [`MySqlConnection::read_packet`]
//! and [`MySqlConnection::write_payload`]; everything above them is
//! protocol logic shared in spirit with the async flavour.

// Frame counts and kill ids fit the wire widths they are written with.
#![allow(clippy::cast_possible_truncation)]

use std::io::{Read, Write};
use std::sync::Arc;

use sqlwire_core::{Error, Row, Value};

use crate::charset::{self, Charset, Encoding};
use crate::config::MySqlConfig;
use crate::error::{
    connect_error, during_connect, error_from_packet, lost_connection, not_connected, out_of_sync,
    usage_error,
};
use crate::handshake::{self, AuthPhase, AuthStep, HandshakeInfo};
use crate::protocol::server_status::{
    SERVER_MORE_RESULTS_EXISTS, SERVER_STATUS_AUTOCOMMIT, SERVER_STATUS_IN_TRANS,
    SERVER_STATUS_NO_BACKSLASH_ESCAPES,
};
use crate::protocol::{
    Command, Packet, PacketAssembler, PacketHeader, build_command_packet, encode_frames,
    frame_count,
};
use crate::result::{
    self, ActiveStream, OkResult, ResultHead, ResultSet, RowDecoder, RowPacket, RowSet,
    UNBUFFERED_AFFECTED_ROWS,
};
use crate::transport::{Connector, NetConnector, Transport};
use crate::types::{self, FieldDescriptor};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport
    Disconnected,
    /// Transport open, handshake in progress
    Connecting,
    /// Ready for a command
    Idle,
    /// Command sent, response not fully read
    CommandInFlight,
    /// A streaming result has rows left on the wire
    StreamingActive,
}

/// Blocking MySQL connection.
pub struct MySqlConnection {
    config: MySqlConfig,
    connector: Arc<dyn Connector>,
    transport: Option<Box<dyn Transport>>,
    state: ConnectionState,
    /// Sequence number of the next frame written
    sequence_id: u8,
    handshake: Option<HandshakeInfo>,
    charset: &'static Charset,
    server_status: u16,
    affected_rows: u64,
    insert_id: u64,
    warning_count: u16,
    has_next: bool,
    stream: Option<ActiveStream>,
}

impl std::fmt::Debug for MySqlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlConnection")
            .field("state", &self.state)
            .field("thread_id", &self.thread_id())
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("charset", &self.charset.name)
            .finish_non_exhaustive()
    }
}

impl MySqlConnection {
    /// Connect over TCP or the configured unix socket.
    pub fn connect(config: MySqlConfig) -> Result<Self, Error> {
        Self::connect_with(config, Arc::new(NetConnector))
    }

    /// Connect through a custom [`Connector`]. The connector is kept for
    /// reconnects.
    ///
    /// Runs the handshake, then `SET sql_mode`, the init command followed by
    /// `COMMIT`, and the autocommit setting, each when configured.
    #[tracing::instrument(level = "debug", skip(config, connector), fields(host = %config.host, port = config.port))]
    pub fn connect_with(config: MySqlConfig, connector: Arc<dyn Connector>) -> Result<Self, Error> {
        let charset = config.validate()?;

        let mut conn = Self {
            config,
            connector,
            transport: None,
            state: ConnectionState::Disconnected,
            sequence_id: 0,
            handshake: None,
            charset,
            server_status: 0,
            affected_rows: 0,
            insert_id: 0,
            warning_count: 0,
            has_next: false,
            stream: None,
        };
        conn.establish()?;
        Ok(conn)
    }

    /// Open the transport, authenticate and apply session settings.
    fn establish(&mut self) -> Result<(), Error> {
        let charset = self.config.validate()?;
        self.charset = charset;
        self.state = ConnectionState::Connecting;
        self.stream = None;
        self.has_next = false;

        let host = self.config.host.clone();
        let transport = match self.connector.open(&self.config) {
            Ok(t) => t,
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                return Err(connect_error(&host, e));
            }
        };
        self.transport = Some(transport);

        if let Err(e) = self.authenticate() {
            self.drop_transport();
            return Err(during_connect(&host, e));
        }
        self.state = ConnectionState::Idle;

        if let Some(info) = &self.handshake {
            tracing::debug!(
                host_info = %self.config.host_info(),
                thread_id = info.thread_id,
                server_version = %info.server_version,
                "connection established"
            );
        }

        if let Err(e) = self.apply_session_settings() {
            self.drop_transport();
            return Err(during_connect(&host, e));
        }
        Ok(())
    }

    fn authenticate(&mut self) -> Result<(), Error> {
        if let Some(transport) = self.transport.as_mut() {
            transport
                .set_timeout(Some(self.config.connect_timeout))
                .map_err(lost_connection)?;
        }

        let greeting = self.read_packet()?;
        let info = HandshakeInfo::parse(&greeting.payload)?;
        if let Some(status) = info.server_status {
            self.server_status = status;
        }

        let response = handshake::build_handshake_response(
            &self.config,
            &info,
            self.charset.handshake_id(),
            self.charset.encoding,
        );
        self.write_payload(&response)?;

        let password = self.config.password.clone().unwrap_or_default();
        let mut phase = AuthPhase::NegotiatingAuth;
        loop {
            let packet = self.read_packet()?;
            match handshake::auth_step(phase, &packet, &info.salt, password.as_bytes())? {
                AuthStep::Authenticated(ok) => {
                    self.server_status = ok.status_flags;
                    break;
                }
                AuthStep::Respond { payload, next } => {
                    if next == AuthPhase::LegacyAuthFallback {
                        tracing::debug!(sequence_id = self.sequence_id, "sending legacy scramble");
                    }
                    self.write_payload(&payload)?;
                    phase = next;
                }
            }
        }

        self.handshake = Some(info);
        if let Some(transport) = self.transport.as_mut() {
            transport.set_timeout(None).map_err(lost_connection)?;
        }
        Ok(())
    }

    fn apply_session_settings(&mut self) -> Result<(), Error> {
        if let Some(sql_mode) = self.config.sql_mode.clone() {
            let sql = format!("SET sql_mode='{}'", self.escape_string(&sql_mode));
            self.query(&sql)?;
        }
        if let Some(init) = self.config.init_command.clone() {
            self.query(&init)?;
            while self.has_next {
                self.next_result()?;
            }
            self.commit()?;
        }
        if let Some(mode) = self.config.autocommit {
            self.set_autocommit(mode)?;
        }
        Ok(())
    }

    // ==================== Accessors ====================

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether a transport is held.
    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    pub fn config(&self) -> &MySqlConfig {
        &self.config
    }

    /// Server thread (connection) id; 0 before the first handshake.
    pub fn thread_id(&self) -> u32 {
        self.handshake.as_ref().map_or(0, |h| h.thread_id)
    }

    pub fn server_version(&self) -> Option<&str> {
        self.handshake.as_ref().map(|h| h.server_version.as_str())
    }

    pub fn protocol_version(&self) -> Option<u8> {
        self.handshake.as_ref().map(|h| h.protocol_version)
    }

    /// Server capability flags from the greeting.
    pub fn server_capabilities(&self) -> u32 {
        self.handshake.as_ref().map_or(0, |h| h.server_capabilities)
    }

    pub fn host_info(&self) -> String {
        if self.is_open() {
            self.config.host_info()
        } else {
            "Not connected".to_string()
        }
    }

    pub fn charset(&self) -> &'static Charset {
        self.charset
    }

    pub fn encoding(&self) -> Encoding {
        self.charset.encoding
    }

    pub fn server_status(&self) -> u16 {
        self.server_status
    }

    /// Autocommit as last reported by the server.
    pub fn autocommit(&self) -> bool {
        self.server_status & SERVER_STATUS_AUTOCOMMIT != 0
    }

    pub fn in_transaction(&self) -> bool {
        self.server_status & SERVER_STATUS_IN_TRANS != 0
    }

    /// Affected rows of the last result. `u64::MAX` while a streaming result
    /// has not been pulled yet.
    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    pub fn insert_id(&self) -> u64 {
        self.insert_id
    }

    pub fn warning_count(&self) -> u16 {
        self.warning_count
    }

    /// Whether the last result announced another one.
    pub fn has_next_result(&self) -> bool {
        self.has_next
    }

    /// Escape a string for a quoted SQL literal, honouring the session's
    /// `NO_BACKSLASH_ESCAPES` mode.
    pub fn escape_string(&self, s: &str) -> String {
        types::escape_string(s, self.no_backslash_escapes())
    }

    /// Render a value as an SQL literal.
    pub fn escape(&self, value: &Value) -> String {
        types::escape_value(value, self.no_backslash_escapes())
    }

    fn no_backslash_escapes(&self) -> bool {
        self.server_status & SERVER_STATUS_NO_BACKSLASH_ESCAPES != 0
    }

    // ==================== Operations ====================

    /// Run `sql` and buffer its first result.
    #[tracing::instrument(level = "debug", skip(self, sql), fields(sql_len = sql.len()))]
    pub fn query(&mut self, sql: &str) -> Result<ResultSet, Error> {
        let body = self.charset.encoding.encode(sql);
        self.execute_command(Command::Query, &body)?;
        self.read_result()
    }

    /// Run `sql` and stream its rows.
    ///
    /// The returned stream borrows the connection. Dropping it early leaves
    /// the rest of the rows on the wire; the next command drains them.
    #[tracing::instrument(level = "debug", skip(self, sql), fields(sql_len = sql.len()))]
    pub fn query_unbuffered(&mut self, sql: &str) -> Result<RowStream<'_>, Error> {
        let body = self.charset.encoding.encode(sql);
        self.execute_command(Command::Query, &body)?;

        let ok = match self.start_result()? {
            Started::Ok(ok) => Some(ok),
            Started::Rows(decoder) => {
                self.affected_rows = UNBUFFERED_AFFECTED_ROWS;
                self.insert_id = 0;
                self.stream = Some(ActiveStream::new(decoder));
                self.state = ConnectionState::StreamingActive;
                None
            }
        };
        Ok(RowStream { conn: self, ok })
    }

    /// Read the next result of a multi-statement response, if announced.
    pub fn next_result(&mut self) -> Result<Option<ResultSet>, Error> {
        if self.stream.is_some() {
            self.drain_stream()?;
        }
        if !self.has_next {
            return Ok(None);
        }
        if self.transport.is_none() {
            return Err(not_connected());
        }
        self.state = ConnectionState::CommandInFlight;
        self.read_result().map(Some)
    }

    /// Check the connection. With `reconnect`, a failed ping (or a closed
    /// connection) triggers one reconnect followed by a single ping.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn ping(&mut self, reconnect: bool) -> Result<(), Error> {
        if self.transport.is_none() {
            if !reconnect {
                return Err(not_connected());
            }
            tracing::warn!("connection closed, reconnecting before ping");
            self.establish()?;
            return self.ping(false);
        }

        match self.ping_once() {
            Ok(()) => Ok(()),
            Err(e) if reconnect => {
                tracing::warn!(error = %e, "ping failed, reconnecting");
                self.drop_transport();
                self.establish()?;
                self.ping(false)
            }
            Err(e) => Err(e),
        }
    }

    fn ping_once(&mut self) -> Result<(), Error> {
        self.execute_command(Command::Ping, &[])?;
        self.read_ok().map(|_| ())
    }

    pub fn begin(&mut self) -> Result<(), Error> {
        self.simple_query("BEGIN")
    }

    pub fn commit(&mut self) -> Result<(), Error> {
        self.simple_query("COMMIT")
    }

    pub fn rollback(&mut self) -> Result<(), Error> {
        self.simple_query("ROLLBACK")
    }

    /// Change the default database (`COM_INIT_DB`).
    pub fn select_db(&mut self, db: &str) -> Result<(), Error> {
        let body = self.charset.encoding.encode(db);
        self.execute_command(Command::InitDb, &body)?;
        self.read_ok().map(|_| ())
    }

    /// Switch the session character set with `SET NAMES`.
    ///
    /// Unknown names are rejected before anything is sent.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn set_charset(&mut self, name: &str) -> Result<(), Error> {
        let new_charset = charset::charset_by_name(name)
            .ok_or_else(|| usage_error(format!("Unknown charset: {}", name)))?;

        let sql = format!("SET NAMES '{}'", new_charset.name);
        let body = self.charset.encoding.encode(&sql);
        self.execute_command(Command::Query, &body)?;

        let packet = self.read_packet()?;
        self.state = ConnectionState::Idle;
        if packet.is_error() {
            return Err(error_from_packet(&packet));
        }
        if packet.is_ok() {
            let ok = result::parse_ok_result(&packet, self.charset.encoding)?;
            self.record_ok(&ok);
        }

        self.charset = new_charset;
        // Reconnects keep the new charset.
        self.config.charset = new_charset.name.to_string();
        tracing::debug!(charset = new_charset.name, encoding = new_charset.encoding.name(), "charset changed");
        Ok(())
    }

    /// Ask the server to kill the connection with `thread_id`.
    pub fn kill(&mut self, thread_id: u32) -> Result<(), Error> {
        self.execute_command(Command::ProcessKill, &thread_id.to_le_bytes())?;
        self.read_ok().map(|_| ())
    }

    /// Set autocommit; no round trip when the server already matches.
    pub fn set_autocommit(&mut self, enabled: bool) -> Result<(), Error> {
        if enabled == self.autocommit() {
            return Ok(());
        }
        self.simple_query(if enabled {
            "SET AUTOCOMMIT = 1"
        } else {
            "SET AUTOCOMMIT = 0"
        })
    }

    /// Send `COM_QUIT` (best effort) and drop the transport. Idempotent.
    pub fn close(&mut self) -> Result<(), Error> {
        let Some(mut transport) = self.transport.take() else {
            return Ok(());
        };
        let quit = build_command_packet(Command::Quit, &[]);
        if let Err(e) = transport.write_all(&quit).and_then(|()| transport.flush()) {
            tracing::debug!(error = %e, "COM_QUIT not delivered");
        }
        let _ = transport.shutdown();
        self.reset_after_close();
        Ok(())
    }

    /// Drop the transport without notifying the server. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            let _ = transport.shutdown();
        }
        self.reset_after_close();
    }

    // ==================== Command dispatch ====================

    /// Send one command, draining any unfinished streaming result first.
    fn execute_command(&mut self, command: Command, body: &[u8]) -> Result<(), Error> {
        if self.transport.is_none() {
            return Err(not_connected());
        }
        if self.stream.is_some() {
            tracing::warn!(command = command.name(), "draining unfinished streaming result");
            self.drain_stream()?;
        }

        let wire = build_command_packet(command, body);
        tracing::debug!(command = command.name(), payload_len = body.len() + 1, "dispatching command");
        self.sequence_id = frame_count(body.len() + 1) as u8;
        self.write_raw(&wire)?;
        self.state = ConnectionState::CommandInFlight;
        Ok(())
    }

    fn simple_query(&mut self, sql: &str) -> Result<(), Error> {
        let body = self.charset.encoding.encode(sql);
        self.execute_command(Command::Query, &body)?;
        self.read_ok().map(|_| ())
    }

    /// Read a response that must be an OK packet.
    fn read_ok(&mut self) -> Result<OkResult, Error> {
        let packet = self.read_packet()?;
        self.state = ConnectionState::Idle;
        if packet.is_error() {
            return Err(error_from_packet(&packet));
        }
        if !packet.is_ok() {
            return Err(out_of_sync(&packet));
        }
        let ok = result::parse_ok_result(&packet, self.charset.encoding)?;
        self.record_ok(&ok);
        Ok(ok)
    }

    fn record_ok(&mut self, ok: &OkResult) {
        self.affected_rows = ok.affected_rows;
        self.insert_id = ok.insert_id;
        self.server_status = ok.server_status;
        self.warning_count = ok.warning_count;
        self.has_next = ok.has_next;
    }

    fn record_eof(&mut self, warnings: u16, status: u16) {
        self.server_status = status;
        self.warning_count = warnings;
        self.has_next = status & SERVER_MORE_RESULTS_EXISTS != 0;
    }

    // ==================== Result decoding ====================

    /// Read the head of a result: an OK, or the field descriptors of a
    /// result set whose rows follow.
    fn start_result(&mut self) -> Result<Started, Error> {
        let head = self.read_packet()?;
        let head = match result::read_result_head(&head, self.charset.encoding) {
            Ok(head) => head,
            Err(e) => {
                self.abandon_result(&e);
                return Err(e);
            }
        };

        match head {
            ResultHead::Ok(ok) => {
                tracing::debug!(affected_rows = ok.affected_rows, "OK result");
                self.record_ok(&ok);
                self.state = ConnectionState::Idle;
                Ok(Started::Ok(ok))
            }
            ResultHead::Columns(count) => {
                tracing::debug!(column_count = count, "result set");
                let mut fields = Vec::with_capacity(count.min(4096) as usize);
                for _ in 0..count {
                    let packet = self.read_packet()?;
                    match result::parse_field(&packet, self.charset.encoding) {
                        Ok(f) => fields.push(f),
                        Err(e) => {
                            self.abandon_result(&e);
                            return Err(e);
                        }
                    }
                }
                let packet = self.read_packet()?;
                if let Err(e) = result::expect_eof(&packet) {
                    self.abandon_result(&e);
                    return Err(e);
                }
                Ok(Started::Rows(RowDecoder::new(fields)))
            }
        }
    }

    /// Read a whole result into memory.
    fn read_result(&mut self) -> Result<ResultSet, Error> {
        let decoder = match self.start_result()? {
            Started::Ok(ok) => return Ok(ResultSet::Ok(ok)),
            Started::Rows(decoder) => decoder,
        };

        let mut rows = Vec::new();
        loop {
            let packet = self.read_packet()?;
            let decoded =
                decoder.decode_packet(&packet, self.charset.encoding, &self.config.converters);
            match decoded {
                Ok(RowPacket::Row(row)) => rows.push(row),
                Ok(RowPacket::End(eof)) => {
                    self.record_eof(eof.warnings, eof.status_flags);
                    break;
                }
                Err(e) => {
                    self.abandon_result(&e);
                    return Err(e);
                }
            }
        }

        self.affected_rows = rows.len() as u64;
        self.insert_id = 0;
        self.state = ConnectionState::Idle;
        tracing::debug!(row_count = rows.len(), "buffered result read");

        Ok(ResultSet::Rows(RowSet {
            fields: decoder.fields,
            rows,
            server_status: self.server_status,
            warning_count: self.warning_count,
            has_next: self.has_next,
        }))
    }

    /// Pull one row of the active streaming result.
    fn pull_stream_row(&mut self) -> Result<Option<Row>, Error> {
        if self.stream.is_none() {
            return Ok(None);
        }
        let packet = self.read_packet()?;
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };

        match stream
            .decoder
            .decode_packet(&packet, self.charset.encoding, &self.config.converters)
        {
            Ok(RowPacket::Row(row)) => {
                stream.rows_read += 1;
                tracing::trace!(rows_read = stream.rows_read, "streamed row");
                self.affected_rows = 1;
                Ok(Some(row))
            }
            Ok(RowPacket::End(eof)) => {
                tracing::debug!(rows_read = stream.rows_read, "streaming result finished");
                self.stream = None;
                self.record_eof(eof.warnings, eof.status_flags);
                self.state = ConnectionState::Idle;
                Ok(None)
            }
            Err(e) => {
                self.stream = None;
                self.abandon_result(&e);
                Err(e)
            }
        }
    }

    fn drain_stream(&mut self) -> Result<(), Error> {
        while self.stream.is_some() {
            self.pull_stream_row()?;
        }
        Ok(())
    }

    /// A server error ends the result cleanly; a decoding error leaves
    /// unread packets behind, so the connection cannot be reused.
    fn abandon_result(&mut self, e: &Error) {
        if matches!(e, Error::Protocol(_)) {
            tracing::warn!(error = %e, "malformed result, closing connection");
            self.drop_transport();
        } else if self.transport.is_some() {
            self.state = ConnectionState::Idle;
        }
    }

    // ==================== Framing ====================

    /// Read one logical packet, reassembling continuation frames.
    fn read_packet(&mut self) -> Result<Packet, Error> {
        let mut assembler = PacketAssembler::new();
        loop {
            let transport = self.transport.as_mut().ok_or_else(not_connected)?;

            let mut header_buf = [0u8; PacketHeader::SIZE];
            let read = transport.read_exact(&mut header_buf).and_then(|()| {
                let header = PacketHeader::from_bytes(&header_buf);
                let mut frame = vec![0u8; header.payload_length as usize];
                transport.read_exact(&mut frame).map(|()| (header, frame))
            });
            let (header, frame) = match read {
                Ok(v) => v,
                Err(e) => {
                    self.drop_transport();
                    return Err(lost_connection(e));
                }
            };
            tracing::trace!(len = header.payload_length, sequence_id = header.sequence_id, "frame read");

            match assembler.push_frame(header, &frame) {
                Ok(Some(packet)) => {
                    self.sequence_id = packet.last_sequence_id.wrapping_add(1);
                    return Ok(packet);
                }
                Ok(None) => {}
                Err(e) => {
                    self.drop_transport();
                    return Err(e);
                }
            }
        }
    }

    /// Frame `payload` from the current sequence number and send it.
    fn write_payload(&mut self, payload: &[u8]) -> Result<(), Error> {
        let wire = encode_frames(payload, self.sequence_id);
        self.sequence_id = self
            .sequence_id
            .wrapping_add(frame_count(payload.len()) as u8);
        self.write_raw(&wire)
    }

    fn write_raw(&mut self, wire: &[u8]) -> Result<(), Error> {
        let transport = self.transport.as_mut().ok_or_else(not_connected)?;
        if let Err(e) = transport.write_all(wire).and_then(|()| transport.flush()) {
            self.drop_transport();
            return Err(lost_connection(e));
        }
        Ok(())
    }

    fn drop_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            let _ = transport.shutdown();
        }
        self.reset_after_close();
    }

    fn reset_after_close(&mut self) {
        self.stream = None;
        self.has_next = false;
        self.state = ConnectionState::Disconnected;
    }
}

enum Started {
    Ok(OkResult),
    Rows(RowDecoder),
}

/// Rows of an unbuffered query, read from the wire on demand.
///
/// Also an `Iterator` over `Result<Row, Error>`.
pub struct RowStream<'c> {
    conn: &'c mut MySqlConnection,
    ok: Option<OkResult>,
}

impl RowStream<'_> {
    /// Next row, or `None` once the closing EOF has been read.
    pub fn next_row(&mut self) -> Result<Option<Row>, Error> {
        self.conn.pull_stream_row()
    }

    /// Field descriptors; empty when the statement produced an OK.
    pub fn fields(&self) -> &[FieldDescriptor] {
        match &self.conn.stream {
            Some(stream) => &stream.decoder.fields,
            None => &[],
        }
    }

    /// OK result when the statement returned no rows.
    pub fn ok_result(&self) -> Option<&OkResult> {
        self.ok.as_ref()
    }

    /// Whether every row has been read.
    pub fn is_done(&self) -> bool {
        self.conn.stream.is_none()
    }

    /// `u64::MAX` before the first pull, 1 after each row.
    pub fn affected_rows(&self) -> u64 {
        self.conn.affected_rows
    }

    pub fn has_next(&self) -> bool {
        self.conn.has_next
    }

    /// Read and discard the remaining rows.
    pub fn finish(self) -> Result<(), Error> {
        self.conn.drain_stream()
    }
}

impl Iterator for RowStream<'_> {
    type Item = Result<Row, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

impl std::fmt::Debug for RowStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStream")
            .field("done", &self.is_done())
            .field("ok", &self.ok)
            .finish()
    }
}
