//! Async MySQL connection on asupersync's TCP primitives.
//!
//! Same protocol and state machine as the blocking [`MySqlConnection`],
//! with every operation taking a `&Cx` and returning an `Outcome`. Only TCP
//! is supported here; unix sockets need the blocking connection.
//!
//! [`MySqlConnection`]: crate::connection::MySqlConnection

// The Error type is intentionally large to carry full context
#![allow(clippy::result_large_err)]
#![allow(clippy::cast_possible_truncation)]

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use asupersync::io::{AsyncRead, AsyncWrite, ReadBuf};
use asupersync::net::TcpStream;
use asupersync::sync::Mutex;
use asupersync::{Cx, Outcome};

use sqlwire_core::{Error, Row, Value};

use crate::charset::{self, Charset, Encoding};
use crate::config::MySqlConfig;
use crate::connection::ConnectionState;
use crate::error::{
    connect_error, during_connect, error_from_packet, lost_connection, not_connected, out_of_sync,
    protocol_error, usage_error,
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
use crate::types::{self, FieldDescriptor};

/// Unwrap an `Outcome`, returning early on anything but `Ok`.
macro_rules! try_outcome {
    ($e:expr) => {
        match $e {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
    };
}

/// Unwrap a sans-IO `Result` inside an `Outcome`-returning fn.
macro_rules! try_result {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return Outcome::Err(e),
        }
    };
}

/// How an unbuffered query began.
#[derive(Debug, Clone, PartialEq)]
pub enum UnbufferedResult {
    /// The statement produced no rows.
    Ok(OkResult),
    /// Rows follow; pull them with [`MySqlAsyncConnection::next_row`].
    Rows(Arc<[FieldDescriptor]>),
}

/// Async MySQL connection.
pub struct MySqlAsyncConnection {
    config: MySqlConfig,
    stream: Option<TcpStream>,
    state: ConnectionState,
    sequence_id: u8,
    handshake: Option<HandshakeInfo>,
    charset: &'static Charset,
    server_status: u16,
    affected_rows: u64,
    insert_id: u64,
    warning_count: u16,
    has_next: bool,
    active: Option<ActiveStream>,
}

impl std::fmt::Debug for MySqlAsyncConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlAsyncConnection")
            .field("state", &self.state)
            .field("thread_id", &self.thread_id())
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("charset", &self.charset.name)
            .finish_non_exhaustive()
    }
}

impl MySqlAsyncConnection {
    /// Connect and authenticate, then apply `sql_mode`, the init command and
    /// the autocommit setting when configured.
    pub async fn connect(cx: &Cx, config: MySqlConfig) -> Outcome<Self, Error> {
        let charset = try_result!(config.validate());
        if config.socket_path().is_some() {
            return Outcome::Err(usage_error(
                "unix sockets are only supported by the blocking connection",
            ));
        }

        let mut conn = Self {
            config,
            stream: None,
            state: ConnectionState::Disconnected,
            sequence_id: 0,
            handshake: None,
            charset,
            server_status: 0,
            affected_rows: 0,
            insert_id: 0,
            warning_count: 0,
            has_next: false,
            active: None,
        };
        try_outcome!(conn.establish(cx).await);
        Outcome::Ok(conn)
    }

    async fn establish(&mut self, cx: &Cx) -> Outcome<(), Error> {
        self.charset = try_result!(self.config.validate());
        self.state = ConnectionState::Connecting;
        self.active = None;
        self.has_next = false;

        let host = self.config.host.clone();
        match open_tcp(&self.config).await {
            Ok(stream) => self.stream = Some(stream),
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                return Outcome::Err(connect_error(&host, e));
            }
        }

        match self.authenticate(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => {
                self.drop_stream();
                return Outcome::Err(during_connect(&host, e));
            }
            Outcome::Cancelled(r) => {
                self.drop_stream();
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        self.state = ConnectionState::Idle;

        if let Some(info) = &self.handshake {
            tracing::debug!(
                host_info = %self.config.host_info(),
                thread_id = info.thread_id,
                server_version = %info.server_version,
                "async connection established"
            );
        }

        match self.apply_session_settings(cx).await {
            Outcome::Ok(()) => Outcome::Ok(()),
            Outcome::Err(e) => {
                self.drop_stream();
                Outcome::Err(during_connect(&host, e))
            }
            other => other,
        }
    }

    async fn authenticate(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let greeting = try_outcome!(self.read_packet(cx).await);
        let info = try_result!(HandshakeInfo::parse(&greeting.payload));
        if let Some(status) = info.server_status {
            self.server_status = status;
        }

        let response = handshake::build_handshake_response(
            &self.config,
            &info,
            self.charset.handshake_id(),
            self.charset.encoding,
        );
        try_outcome!(self.write_payload(cx, &response).await);

        let password = self.config.password.clone().unwrap_or_default();
        let mut phase = AuthPhase::NegotiatingAuth;
        loop {
            let packet = try_outcome!(self.read_packet(cx).await);
            match try_result!(handshake::auth_step(phase, &packet, &info.salt, password.as_bytes())) {
                AuthStep::Authenticated(ok) => {
                    self.server_status = ok.status_flags;
                    break;
                }
                AuthStep::Respond { payload, next } => {
                    try_outcome!(self.write_payload(cx, &payload).await);
                    phase = next;
                }
            }
        }

        self.handshake = Some(info);
        Outcome::Ok(())
    }

    async fn apply_session_settings(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if let Some(sql_mode) = self.config.sql_mode.clone() {
            let sql = format!("SET sql_mode='{}'", self.escape_string(&sql_mode));
            try_outcome!(self.query(cx, &sql).await);
        }
        if let Some(init) = self.config.init_command.clone() {
            try_outcome!(self.query(cx, &init).await);
            while self.has_next {
                try_outcome!(self.next_result(cx).await);
            }
            try_outcome!(self.commit(cx).await);
        }
        if let Some(mode) = self.config.autocommit {
            try_outcome!(self.set_autocommit(cx, mode).await);
        }
        Outcome::Ok(())
    }

    // ==================== Accessors ====================

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn config(&self) -> &MySqlConfig {
        &self.config
    }

    pub fn thread_id(&self) -> u32 {
        self.handshake.as_ref().map_or(0, |h| h.thread_id)
    }

    pub fn server_version(&self) -> Option<&str> {
        self.handshake.as_ref().map(|h| h.server_version.as_str())
    }

    pub fn protocol_version(&self) -> Option<u8> {
        self.handshake.as_ref().map(|h| h.protocol_version)
    }

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

    pub fn autocommit(&self) -> bool {
        self.server_status & SERVER_STATUS_AUTOCOMMIT != 0
    }

    pub fn in_transaction(&self) -> bool {
        self.server_status & SERVER_STATUS_IN_TRANS != 0
    }

    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    pub fn insert_id(&self) -> u64 {
        self.insert_id
    }

    pub fn warning_count(&self) -> u16 {
        self.warning_count
    }

    pub fn has_next_result(&self) -> bool {
        self.has_next
    }

    /// Field descriptors of the active streaming result, if any.
    pub fn stream_fields(&self) -> Option<&[FieldDescriptor]> {
        self.active.as_ref().map(|s| &s.decoder.fields[..])
    }

    pub fn escape_string(&self, s: &str) -> String {
        types::escape_string(s, self.server_status & SERVER_STATUS_NO_BACKSLASH_ESCAPES != 0)
    }

    pub fn escape(&self, value: &Value) -> String {
        types::escape_value(value, self.server_status & SERVER_STATUS_NO_BACKSLASH_ESCAPES != 0)
    }

    // ==================== Operations ====================

    /// Run `sql` and buffer its first result.
    pub async fn query(&mut self, cx: &Cx, sql: &str) -> Outcome<ResultSet, Error> {
        let body = self.charset.encoding.encode(sql);
        try_outcome!(self.execute_command(cx, Command::Query, &body).await);
        self.read_result(cx).await
    }

    /// Run `sql` and leave its rows on the wire for [`Self::next_row`].
    pub async fn query_unbuffered(&mut self, cx: &Cx, sql: &str) -> Outcome<UnbufferedResult, Error> {
        let body = self.charset.encoding.encode(sql);
        try_outcome!(self.execute_command(cx, Command::Query, &body).await);

        match try_outcome!(self.start_result(cx).await) {
            Started::Ok(ok) => Outcome::Ok(UnbufferedResult::Ok(ok)),
            Started::Rows(decoder) => {
                let fields = Arc::clone(&decoder.fields);
                self.affected_rows = UNBUFFERED_AFFECTED_ROWS;
                self.insert_id = 0;
                self.active = Some(ActiveStream::new(decoder));
                self.state = ConnectionState::StreamingActive;
                Outcome::Ok(UnbufferedResult::Rows(fields))
            }
        }
    }

    /// Next row of the active streaming result; `None` once it is exhausted
    /// or when no stream is active.
    pub async fn next_row(&mut self, cx: &Cx) -> Outcome<Option<Row>, Error> {
        if self.active.is_none() {
            return Outcome::Ok(None);
        }
        let packet = try_outcome!(self.read_packet(cx).await);
        let Some(active) = self.active.as_mut() else {
            return Outcome::Ok(None);
        };

        match active
            .decoder
            .decode_packet(&packet, self.charset.encoding, &self.config.converters)
        {
            Ok(RowPacket::Row(row)) => {
                active.rows_read += 1;
                tracing::trace!(rows_read = active.rows_read, "streamed row");
                self.affected_rows = 1;
                Outcome::Ok(Some(row))
            }
            Ok(RowPacket::End(eof)) => {
                tracing::debug!(rows_read = active.rows_read, "streaming result finished");
                self.active = None;
                self.record_eof(eof.warnings, eof.status_flags);
                self.state = ConnectionState::Idle;
                Outcome::Ok(None)
            }
            Err(e) => {
                self.active = None;
                self.abandon_result(&e);
                Outcome::Err(e)
            }
        }
    }

    /// Read the next result of a multi-statement response, if announced.
    pub async fn next_result(&mut self, cx: &Cx) -> Outcome<Option<ResultSet>, Error> {
        try_outcome!(self.drain_stream(cx).await);
        if !self.has_next {
            return Outcome::Ok(None);
        }
        if self.stream.is_none() {
            return Outcome::Err(not_connected());
        }
        self.state = ConnectionState::CommandInFlight;
        match self.read_result(cx).await {
            Outcome::Ok(r) => Outcome::Ok(Some(r)),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Check the connection; with `reconnect`, one reconnect and one more
    /// ping are attempted on failure.
    pub async fn ping(&mut self, cx: &Cx, reconnect: bool) -> Outcome<(), Error> {
        if self.stream.is_none() {
            if !reconnect {
                return Outcome::Err(not_connected());
            }
            tracing::warn!("connection closed, reconnecting before ping");
            try_outcome!(self.establish(cx).await);
            return self.ping_once(cx).await;
        }

        match self.ping_once(cx).await {
            Outcome::Err(e) if reconnect => {
                tracing::warn!(error = %e, "ping failed, reconnecting");
                self.drop_stream();
                try_outcome!(self.establish(cx).await);
                self.ping_once(cx).await
            }
            other => other,
        }
    }

    async fn ping_once(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_outcome!(self.execute_command(cx, Command::Ping, &[]).await);
        try_outcome!(self.read_ok(cx).await);
        Outcome::Ok(())
    }

    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        self.simple_query(cx, "BEGIN").await
    }

    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        self.simple_query(cx, "COMMIT").await
    }

    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        self.simple_query(cx, "ROLLBACK").await
    }

    pub async fn select_db(&mut self, cx: &Cx, db: &str) -> Outcome<(), Error> {
        let body = self.charset.encoding.encode(db);
        try_outcome!(self.execute_command(cx, Command::InitDb, &body).await);
        try_outcome!(self.read_ok(cx).await);
        Outcome::Ok(())
    }

    /// Switch the session character set; unknown names fail before any I/O.
    pub async fn set_charset(&mut self, cx: &Cx, name: &str) -> Outcome<(), Error> {
        let Some(new_charset) = charset::charset_by_name(name) else {
            return Outcome::Err(usage_error(format!("Unknown charset: {}", name)));
        };

        let sql = format!("SET NAMES '{}'", new_charset.name);
        let body = self.charset.encoding.encode(&sql);
        try_outcome!(self.execute_command(cx, Command::Query, &body).await);

        let packet = try_outcome!(self.read_packet(cx).await);
        self.state = ConnectionState::Idle;
        if packet.is_error() {
            return Outcome::Err(error_from_packet(&packet));
        }
        if packet.is_ok() {
            let ok = try_result!(result::parse_ok_result(&packet, self.charset.encoding));
            self.record_ok(&ok);
        }

        self.charset = new_charset;
        self.config.charset = new_charset.name.to_string();
        tracing::debug!(charset = new_charset.name, "charset changed");
        Outcome::Ok(())
    }

    pub async fn kill(&mut self, cx: &Cx, thread_id: u32) -> Outcome<(), Error> {
        try_outcome!(
            self.execute_command(cx, Command::ProcessKill, &thread_id.to_le_bytes())
                .await
        );
        try_outcome!(self.read_ok(cx).await);
        Outcome::Ok(())
    }

    /// Set autocommit; no round trip when the server already matches.
    pub async fn set_autocommit(&mut self, cx: &Cx, enabled: bool) -> Outcome<(), Error> {
        if enabled == self.autocommit() {
            return Outcome::Ok(());
        }
        let sql = if enabled {
            "SET AUTOCOMMIT = 1"
        } else {
            "SET AUTOCOMMIT = 0"
        };
        self.simple_query(cx, sql).await
    }

    /// Send `COM_QUIT` (best effort) and drop the stream. Idempotent.
    pub async fn close(&mut self, _cx: &Cx) -> Result<(), Error> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        let quit = build_command_packet(Command::Quit, &[]);
        let sent = match write_all_async(&mut stream, &quit).await {
            Ok(()) => flush_async(&mut stream).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            tracing::debug!(error = %e, "COM_QUIT not delivered");
        }
        self.reset_after_close();
        Ok(())
    }

    /// Drop the stream without notifying the server. Idempotent.
    pub fn shutdown(&mut self) {
        self.drop_stream();
    }

    // ==================== Command dispatch ====================

    async fn execute_command(&mut self, cx: &Cx, command: Command, body: &[u8]) -> Outcome<(), Error> {
        if self.stream.is_none() {
            return Outcome::Err(not_connected());
        }
        if self.active.is_some() {
            tracing::warn!(command = command.name(), "draining unfinished streaming result");
            try_outcome!(self.drain_stream(cx).await);
        }

        let wire = build_command_packet(command, body);
        tracing::debug!(command = command.name(), payload_len = body.len() + 1, "dispatching command");
        self.sequence_id = frame_count(body.len() + 1) as u8;
        try_outcome!(self.write_raw(cx, &wire).await);
        self.state = ConnectionState::CommandInFlight;
        Outcome::Ok(())
    }

    async fn simple_query(&mut self, cx: &Cx, sql: &str) -> Outcome<(), Error> {
        let body = self.charset.encoding.encode(sql);
        try_outcome!(self.execute_command(cx, Command::Query, &body).await);
        try_outcome!(self.read_ok(cx).await);
        Outcome::Ok(())
    }

    async fn read_ok(&mut self, cx: &Cx) -> Outcome<OkResult, Error> {
        let packet = try_outcome!(self.read_packet(cx).await);
        self.state = ConnectionState::Idle;
        if packet.is_error() {
            return Outcome::Err(error_from_packet(&packet));
        }
        if !packet.is_ok() {
            return Outcome::Err(out_of_sync(&packet));
        }
        let ok = try_result!(result::parse_ok_result(&packet, self.charset.encoding));
        self.record_ok(&ok);
        Outcome::Ok(ok)
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

    async fn start_result(&mut self, cx: &Cx) -> Outcome<Started, Error> {
        let head = try_outcome!(self.read_packet(cx).await);
        let head = match result::read_result_head(&head, self.charset.encoding) {
            Ok(head) => head,
            Err(e) => {
                self.abandon_result(&e);
                return Outcome::Err(e);
            }
        };

        match head {
            ResultHead::Ok(ok) => {
                tracing::debug!(affected_rows = ok.affected_rows, "OK result");
                self.record_ok(&ok);
                self.state = ConnectionState::Idle;
                Outcome::Ok(Started::Ok(ok))
            }
            ResultHead::Columns(count) => {
                tracing::debug!(column_count = count, "result set");
                let mut fields = Vec::with_capacity(count.min(4096) as usize);
                for _ in 0..count {
                    let packet = try_outcome!(self.read_packet(cx).await);
                    match result::parse_field(&packet, self.charset.encoding) {
                        Ok(f) => fields.push(f),
                        Err(e) => {
                            self.abandon_result(&e);
                            return Outcome::Err(e);
                        }
                    }
                }
                let packet = try_outcome!(self.read_packet(cx).await);
                if let Err(e) = result::expect_eof(&packet) {
                    self.abandon_result(&e);
                    return Outcome::Err(e);
                }
                Outcome::Ok(Started::Rows(RowDecoder::new(fields)))
            }
        }
    }

    async fn read_result(&mut self, cx: &Cx) -> Outcome<ResultSet, Error> {
        let decoder = match try_outcome!(self.start_result(cx).await) {
            Started::Ok(ok) => return Outcome::Ok(ResultSet::Ok(ok)),
            Started::Rows(decoder) => decoder,
        };

        let mut rows = Vec::new();
        loop {
            let packet = try_outcome!(self.read_packet(cx).await);
            match decoder.decode_packet(&packet, self.charset.encoding, &self.config.converters) {
                Ok(RowPacket::Row(row)) => rows.push(row),
                Ok(RowPacket::End(eof)) => {
                    self.record_eof(eof.warnings, eof.status_flags);
                    break;
                }
                Err(e) => {
                    self.abandon_result(&e);
                    return Outcome::Err(e);
                }
            }
        }

        self.affected_rows = rows.len() as u64;
        self.insert_id = 0;
        self.state = ConnectionState::Idle;
        tracing::debug!(row_count = rows.len(), "buffered result read");

        Outcome::Ok(ResultSet::Rows(RowSet {
            fields: decoder.fields,
            rows,
            server_status: self.server_status,
            warning_count: self.warning_count,
            has_next: self.has_next,
        }))
    }

    async fn drain_stream(&mut self, cx: &Cx) -> Outcome<(), Error> {
        while self.active.is_some() {
            try_outcome!(self.next_row(cx).await);
        }
        Outcome::Ok(())
    }

    fn abandon_result(&mut self, e: &Error) {
        if matches!(e, Error::Protocol(_)) {
            tracing::warn!(error = %e, "malformed result, closing connection");
            self.drop_stream();
        } else if self.stream.is_some() {
            self.state = ConnectionState::Idle;
        }
    }

    // ==================== Framing ====================

    async fn read_packet(&mut self, cx: &Cx) -> Outcome<Packet, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }

        let mut assembler = PacketAssembler::new();
        loop {
            let Some(stream) = self.stream.as_mut() else {
                return Outcome::Err(not_connected());
            };

            let mut header_buf = [0u8; PacketHeader::SIZE];
            let read = match read_exact_async(stream, &mut header_buf).await {
                Ok(()) => {
                    let header = PacketHeader::from_bytes(&header_buf);
                    let mut frame = vec![0u8; header.payload_length as usize];
                    read_exact_async(stream, &mut frame)
                        .await
                        .map(|()| (header, frame))
                }
                Err(e) => Err(e),
            };
            let (header, frame) = match read {
                Ok(v) => v,
                Err(e) => {
                    self.drop_stream();
                    return Outcome::Err(lost_connection(e));
                }
            };
            tracing::trace!(len = header.payload_length, sequence_id = header.sequence_id, "frame read");

            match assembler.push_frame(header, &frame) {
                Ok(Some(packet)) => {
                    self.sequence_id = packet.last_sequence_id.wrapping_add(1);
                    return Outcome::Ok(packet);
                }
                Ok(None) => {}
                Err(e) => {
                    self.drop_stream();
                    return Outcome::Err(e);
                }
            }
        }
    }

    async fn write_payload(&mut self, cx: &Cx, payload: &[u8]) -> Outcome<(), Error> {
        let wire = encode_frames(payload, self.sequence_id);
        self.sequence_id = self
            .sequence_id
            .wrapping_add(frame_count(payload.len()) as u8);
        self.write_raw(cx, &wire).await
    }

    async fn write_raw(&mut self, cx: &Cx, wire: &[u8]) -> Outcome<(), Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Outcome::Err(not_connected());
        };
        let sent = match write_all_async(stream, wire).await {
            Ok(()) => flush_async(stream).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            self.drop_stream();
            return Outcome::Err(lost_connection(e));
        }
        Outcome::Ok(())
    }

    fn drop_stream(&mut self) {
        self.stream = None;
        self.reset_after_close();
    }

    fn reset_after_close(&mut self) {
        self.active = None;
        self.has_next = false;
        self.state = ConnectionState::Disconnected;
    }
}

enum Started {
    Ok(OkResult),
    Rows(RowDecoder),
}

async fn open_tcp(config: &MySqlConfig) -> io::Result<TcpStream> {
    let addrs: Vec<SocketAddr> = (config.host.as_str(), config.port)
        .to_socket_addrs()?
        .collect();

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(addr, config.connect_timeout).await {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(config.no_delay) {
                    tracing::debug!(error = %e, "set_nodelay failed");
                }
                tracing::trace!(addr = %addr, "tcp connected");
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no address found for {}", config.host),
        )
    }))
}

async fn read_exact_async(stream: &mut TcpStream, buf: &mut [u8]) -> io::Result<()> {
    let mut read = 0;
    while read < buf.len() {
        let n = read_some_async(stream, &mut buf[read..]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed",
            ));
        }
        read += n;
    }
    Ok(())
}

async fn read_some_async(stream: &mut TcpStream, buf: &mut [u8]) -> io::Result<usize> {
    let mut read_buf = ReadBuf::new(buf);
    std::future::poll_fn(|cx| std::pin::Pin::new(&mut *stream).poll_read(cx, &mut read_buf))
        .await?;
    Ok(read_buf.filled().len())
}

async fn write_all_async(stream: &mut TcpStream, buf: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < buf.len() {
        let n = std::future::poll_fn(|cx| {
            std::pin::Pin::new(&mut *stream).poll_write(cx, &buf[written..])
        })
        .await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "connection closed",
            ));
        }
        written += n;
    }
    Ok(())
}

async fn flush_async(stream: &mut TcpStream) -> io::Result<()> {
    std::future::poll_fn(|cx| std::pin::Pin::new(&mut *stream).poll_flush(cx)).await
}

/// An async connection shared between tasks.
///
/// Each operation holds the lock for its whole request/response exchange,
/// so commands from different tasks never interleave on the wire.
///
/// ```ignore
/// let shared = SharedMySqlConnection::connect(&cx, config).await?;
/// let worker = shared.clone();
/// worker.query(&cx, "SELECT 1").await?;
/// ```
pub struct SharedMySqlConnection {
    inner: Arc<Mutex<MySqlAsyncConnection>>,
}

impl SharedMySqlConnection {
    pub fn new(conn: MySqlAsyncConnection) -> Self {
        Self {
            inner: Arc::new(Mutex::new(conn)),
        }
    }

    pub async fn connect(cx: &Cx, config: MySqlConfig) -> Outcome<Self, Error> {
        match MySqlAsyncConnection::connect(cx, config).await {
            Outcome::Ok(conn) => Outcome::Ok(Self::new(conn)),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(c) => Outcome::Cancelled(c),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Get the inner Arc, e.g. to hold the lock across a streaming read.
    pub fn inner(&self) -> &Arc<Mutex<MySqlAsyncConnection>> {
        &self.inner
    }

    pub async fn query(&self, cx: &Cx, sql: &str) -> Outcome<ResultSet, Error> {
        let Ok(mut guard) = self.inner.lock(cx).await else {
            return Outcome::Err(lock_error());
        };
        guard.query(cx, sql).await
    }

    /// Stream `sql` and collect its rows while holding the lock.
    pub async fn query_unbuffered_collect(&self, cx: &Cx, sql: &str) -> Outcome<Vec<Row>, Error> {
        let Ok(mut guard) = self.inner.lock(cx).await else {
            return Outcome::Err(lock_error());
        };
        if let UnbufferedResult::Ok(_) = try_outcome!(guard.query_unbuffered(cx, sql).await) {
            return Outcome::Ok(Vec::new());
        }
        let mut rows = Vec::new();
        while let Some(row) = try_outcome!(guard.next_row(cx).await) {
            rows.push(row);
        }
        Outcome::Ok(rows)
    }

    pub async fn ping(&self, cx: &Cx, reconnect: bool) -> Outcome<(), Error> {
        let Ok(mut guard) = self.inner.lock(cx).await else {
            return Outcome::Err(lock_error());
        };
        guard.ping(cx, reconnect).await
    }

    pub async fn begin(&self, cx: &Cx) -> Outcome<(), Error> {
        let Ok(mut guard) = self.inner.lock(cx).await else {
            return Outcome::Err(lock_error());
        };
        guard.begin(cx).await
    }

    pub async fn commit(&self, cx: &Cx) -> Outcome<(), Error> {
        let Ok(mut guard) = self.inner.lock(cx).await else {
            return Outcome::Err(lock_error());
        };
        guard.commit(cx).await
    }

    pub async fn rollback(&self, cx: &Cx) -> Outcome<(), Error> {
        let Ok(mut guard) = self.inner.lock(cx).await else {
            return Outcome::Err(lock_error());
        };
        guard.rollback(cx).await
    }

    pub async fn select_db(&self, cx: &Cx, db: &str) -> Outcome<(), Error> {
        let Ok(mut guard) = self.inner.lock(cx).await else {
            return Outcome::Err(lock_error());
        };
        guard.select_db(cx, db).await
    }

    pub async fn set_charset(&self, cx: &Cx, name: &str) -> Outcome<(), Error> {
        let Ok(mut guard) = self.inner.lock(cx).await else {
            return Outcome::Err(lock_error());
        };
        guard.set_charset(cx, name).await
    }

    pub async fn kill(&self, cx: &Cx, thread_id: u32) -> Outcome<(), Error> {
        let Ok(mut guard) = self.inner.lock(cx).await else {
            return Outcome::Err(lock_error());
        };
        guard.kill(cx, thread_id).await
    }

    pub async fn set_autocommit(&self, cx: &Cx, enabled: bool) -> Outcome<(), Error> {
        let Ok(mut guard) = self.inner.lock(cx).await else {
            return Outcome::Err(lock_error());
        };
        guard.set_autocommit(cx, enabled).await
    }

    pub async fn close(&self, cx: &Cx) -> Result<(), Error> {
        let Ok(mut guard) = self.inner.lock(cx).await else {
            return Err(lock_error());
        };
        guard.close(cx).await
    }
}

impl Clone for SharedMySqlConnection {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for SharedMySqlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMySqlConnection")
            .field("inner", &"Arc<Mutex<MySqlAsyncConnection>>")
            .finish()
    }
}

fn lock_error() -> Error {
    protocol_error("Failed to acquire connection lock")
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;

    #[test]
    fn test_connect_requires_user() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        rt.block_on(async {
            let outcome = MySqlAsyncConnection::connect(&cx, MySqlConfig::new()).await;
            assert!(matches!(outcome, Outcome::Err(Error::Usage(_))));
        });
    }

    #[test]
    fn test_connect_rejects_unix_socket() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        rt.block_on(async {
            let config = MySqlConfig::new().user("root").unix_socket("/tmp/mysql.sock");
            let outcome = MySqlAsyncConnection::connect(&cx, config).await;
            assert!(matches!(outcome, Outcome::Err(Error::Usage(_))));
        });
    }

    #[test]
    fn test_connect_refused_is_connection_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        rt.block_on(async {
            let config = MySqlConfig::new()
                .user("root")
                .host("127.0.0.1")
                .port(port)
                .connect_timeout(std::time::Duration::from_secs(2));
            match MySqlAsyncConnection::connect(&cx, config).await {
                Outcome::Err(Error::Connection(c)) => {
                    assert_eq!(c.code, 2003);
                    assert_eq!(c.host.as_deref(), Some("127.0.0.1"));
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
        });
    }
}
