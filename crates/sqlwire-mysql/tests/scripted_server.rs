//! Blocking connection against canned server byte streams.

use std::io::{Cursor, Read, Write};
use std::sync::{Arc, Mutex};

mod common;

use common::{eof, err, field, greeting, login, ok, row, select_rows, select_rows_from};
use sqlwire_core::{ConnectionErrorKind, ServerErrorKind};
use sqlwire_mysql::auth::{scramble_323, scramble_native};
use sqlwire_mysql::protocol::server_status::{SERVER_MORE_RESULTS_EXISTS, SERVER_STATUS_AUTOCOMMIT};
use sqlwire_mysql::protocol::{MAX_PACKET_SIZE, encode_frames};
use sqlwire_mysql::{
    ConnectionState, Converters, Error, FieldType, MySqlConfig, MySqlConnection, QueuedConnector,
    ResultSet, Transport, Value,
};

/// Replays server bytes and records everything the client writes.
struct Script {
    input: Cursor<Vec<u8>>,
    output: Arc<Mutex<Vec<u8>>>,
}

impl Read for Script {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.input.read(buf)
    }
}

impl Write for Script {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.output.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Transport for Script {}

fn script(bytes: Vec<u8>) -> (Box<dyn Transport>, Arc<Mutex<Vec<u8>>>) {
    let output = Arc::new(Mutex::new(Vec::new()));
    let script = Script {
        input: Cursor::new(bytes),
        output: Arc::clone(&output),
    };
    (Box::new(script), output)
}

fn config() -> MySqlConfig {
    MySqlConfig::new().user("root").autocommit(None)
}

fn connect(server: Vec<u8>, config: MySqlConfig) -> (MySqlConnection, Arc<Mutex<Vec<u8>>>) {
    let mut bytes = login();
    bytes.extend(server);
    let (transport, output) = script(bytes);
    let conn = MySqlConnection::connect_with(config, Arc::new(QueuedConnector::new(vec![transport])))
        .unwrap();
    (conn, output)
}

#[test]
fn select_one_without_converters_is_text() {
    let (mut conn, output) = connect(select_rows(&["1"]), config().converters(Converters::empty()));

    let result = conn.query("SELECT 1").unwrap();
    assert_eq!(result.fields().len(), 1);
    assert_eq!(result.fields()[0].name, "1");
    assert_eq!(result.rows().len(), 1);
    assert_eq!(result.rows()[0].get(0), Some(&Value::Text("1".into())));
    assert_eq!(conn.affected_rows(), 1);
    assert_eq!(conn.state(), ConnectionState::Idle);

    let written = output.lock().unwrap();
    let mut command = vec![9, 0, 0, 0, 0x03];
    command.extend_from_slice(b"SELECT 1");
    assert!(written.ends_with(&command));
}

#[test]
fn select_one_with_default_converters_is_integer() {
    let (mut conn, _) = connect(select_rows(&["1"]), config());
    let result = conn.query("SELECT 1").unwrap();
    assert_eq!(result.rows()[0].get(0), Some(&Value::BigInt(1)));
    assert_eq!(result.rows()[0].get_as::<i64>(0).unwrap(), 1);
}

#[test]
fn streaming_matches_buffered() {
    let mut server = select_rows(&["1", "2", "3"]);
    server.extend(select_rows(&["1", "2", "3"]));
    let (mut conn, _) = connect(server, config());

    let buffered = conn.query("SELECT n").unwrap().into_rows();

    let mut stream = conn.query_unbuffered("SELECT n").unwrap();
    assert_eq!(stream.fields().len(), 1);
    assert_eq!(stream.affected_rows(), u64::MAX);
    let mut streamed = Vec::new();
    while let Some(r) = stream.next_row().unwrap() {
        streamed.push(r);
    }
    assert!(stream.is_done());
    drop(stream);

    assert_eq!(buffered, streamed);
    assert_eq!(conn.state(), ConnectionState::Idle);
}

#[test]
fn unfinished_stream_is_drained_before_next_command() {
    let mut server = select_rows(&["1", "2", "3"]);
    server.extend(encode_frames(&ok(0, SERVER_STATUS_AUTOCOMMIT), 1));
    let (mut conn, output) = connect(server, config());

    {
        let mut stream = conn.query_unbuffered("SELECT n").unwrap();
        let first = stream.next_row().unwrap().unwrap();
        assert_eq!(first.get(0), Some(&Value::BigInt(1)));
    }
    assert_eq!(conn.state(), ConnectionState::StreamingActive);

    conn.commit().unwrap();
    assert_eq!(conn.state(), ConnectionState::Idle);
    assert!(output.lock().unwrap().ends_with(b"COMMIT"));
}

#[test]
fn iterator_yields_all_rows() {
    let (mut conn, _) = connect(select_rows(&["7", "8"]), config());
    let values: Vec<Value> = conn
        .query_unbuffered("SELECT n")
        .unwrap()
        .map(|r| r.unwrap().into_values().remove(0))
        .collect();
    assert_eq!(values, vec![Value::BigInt(7), Value::BigInt(8)]);
}

#[test]
fn null_column_stays_null() {
    let mut server = encode_frames(&[2], 1);
    server.extend(encode_frames(&field("a", FieldType::VarString, 45), 2));
    server.extend(encode_frames(&field("b", FieldType::Blob, 63), 3));
    server.extend(encode_frames(&eof(0), 4));
    server.extend(encode_frames(&row(&[None, Some("xy")]), 5));
    server.extend(encode_frames(&eof(0), 6));
    let (mut conn, _) = connect(server, config());

    let result = conn.query("SELECT a, b").unwrap();
    let r = &result.rows()[0];
    assert_eq!(r.get_by_name("a"), Some(&Value::Null));
    assert_eq!(r.get_by_name("b"), Some(&Value::Bytes(b"xy".to_vec())));
}

#[test]
fn multi_statement_results() {
    let mut server = encode_frames(&ok(3, SERVER_MORE_RESULTS_EXISTS), 1);
    server.extend(select_rows_from(2, &["5"]));
    let (mut conn, _) = connect(server, config());

    let first = conn.query("UPDATE t SET a = 1; SELECT 5").unwrap();
    assert!(matches!(first, ResultSet::Ok(_)));
    assert_eq!(first.affected_rows(), 3);
    assert!(conn.has_next_result());

    let second = conn.next_result().unwrap().unwrap();
    assert_eq!(second.rows()[0].get(0), Some(&Value::BigInt(5)));
    assert!(!conn.has_next_result());
    assert!(conn.next_result().unwrap().is_none());
}

#[test]
fn server_error_is_classified() {
    let server = encode_frames(&err(1064, "42000", "You have an error in your SQL syntax"), 1);
    let (mut conn, _) = connect(server, config());

    match conn.query("SELEKT 1").unwrap_err() {
        Error::Server(e) => {
            assert_eq!(e.code, 1064);
            assert_eq!(e.kind, ServerErrorKind::Syntax);
            assert_eq!(e.sqlstate.as_deref(), Some("42000"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(conn.state(), ConnectionState::Idle);
    assert!(conn.is_open());
}

#[test]
fn ping_ok() {
    let (mut conn, output) = connect(encode_frames(&ok(0, SERVER_STATUS_AUTOCOMMIT), 1), config());
    conn.ping(false).unwrap();
    assert!(output.lock().unwrap().ends_with(&[1, 0, 0, 0, 0x0E]));
}

#[test]
fn ping_reconnects_once() {
    // first transport dies after the handshake
    let (dead, _) = script(login());
    let mut fresh = login();
    fresh.extend(encode_frames(&ok(0, SERVER_STATUS_AUTOCOMMIT), 1));
    let (alive, alive_out) = script(fresh);

    let connector = Arc::new(QueuedConnector::new(vec![dead, alive]));
    let mut conn = MySqlConnection::connect_with(config(), connector).unwrap();

    conn.ping(true).unwrap();
    assert!(conn.is_open());
    assert_eq!(conn.state(), ConnectionState::Idle);
    assert!(alive_out.lock().unwrap().ends_with(&[1, 0, 0, 0, 0x0E]));
}

#[test]
fn ping_without_reconnect_reports_lost_connection() {
    let (mut conn, _) = connect(Vec::new(), config());
    match conn.ping(false).unwrap_err() {
        Error::Connection(c) => {
            assert_eq!(c.kind, ConnectionErrorKind::Disconnected);
            assert_eq!(c.code, 2013);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!conn.is_open());

    match conn.ping(false).unwrap_err() {
        Error::Connection(c) => assert_eq!(c.code, 2048),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn legacy_auth_fallback_replies_on_sequence_three() {
    let mut bytes = encode_frames(&greeting(7), 0);
    bytes.extend(encode_frames(&[0xFE], 2));
    bytes.extend(encode_frames(&ok(0, 0), 4));
    let (transport, output) = script(bytes);

    let conn = MySqlConnection::connect_with(
        config().password("secret"),
        Arc::new(QueuedConnector::new(vec![transport])),
    )
    .unwrap();
    assert_eq!(conn.thread_id(), 7);

    let mut expected = scramble_323(b"secret", b"abcdefgh");
    assert_eq!(expected, b"TLTVQOT]".to_vec());
    expected.push(0);
    let mut frame = vec![expected.len() as u8, 0, 0, 3];
    frame.extend(expected);
    assert!(output.lock().unwrap().ends_with(&frame));
}

#[test]
fn authentication_rejected() {
    let mut bytes = encode_frames(&greeting(7), 0);
    bytes.extend(encode_frames(&err(1045, "28000", "Access denied for user 'root'"), 2));
    let (transport, _) = script(bytes);

    let err = MySqlConnection::connect_with(
        config(),
        Arc::new(QueuedConnector::new(vec![transport])),
    )
    .unwrap_err();
    match err {
        Error::Connection(c) => {
            assert_eq!(c.kind, ConnectionErrorKind::Authentication);
            assert_eq!(c.code, 1045);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn auth_switch_to_native_password_rescrambles() {
    let new_salt: Vec<u8> = (b'A'..=b'T').collect();
    let mut switch = vec![0xFE];
    switch.extend_from_slice(b"mysql_native_password\0");
    switch.extend_from_slice(&new_salt);
    switch.push(0);

    let mut bytes = encode_frames(&greeting(7), 0);
    bytes.extend(encode_frames(&switch, 2));
    bytes.extend(encode_frames(&ok(0, SERVER_STATUS_AUTOCOMMIT), 4));
    let (transport, output) = script(bytes);

    let conn = MySqlConnection::connect_with(
        config().password("secret"),
        Arc::new(QueuedConnector::new(vec![transport])),
    )
    .unwrap();
    assert_eq!(conn.state(), ConnectionState::Idle);

    let scramble = scramble_native(b"secret", &new_salt);
    assert_eq!(scramble.len(), 20);
    let mut frame = vec![20, 0, 0, 3];
    frame.extend(scramble);
    assert!(output.lock().unwrap().ends_with(&frame));
}

#[test]
fn auth_switch_to_unknown_plugin_is_rejected() {
    let mut switch = vec![0xFE];
    switch.extend_from_slice(b"caching_sha2_password\0");
    switch.extend_from_slice(b"abcdefghijklmnopqrst\0");

    let mut bytes = encode_frames(&greeting(7), 0);
    bytes.extend(encode_frames(&switch, 2));
    let (transport, _) = script(bytes);

    let err = MySqlConnection::connect_with(
        config().password("secret"),
        Arc::new(QueuedConnector::new(vec![transport])),
    )
    .unwrap_err();
    match err {
        Error::Connection(c) => {
            assert_eq!(c.kind, ConnectionErrorKind::Authentication);
            assert!(c.message.contains("caching_sha2_password"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

/// Column count, one BIGINT field, then a row whose value claims 5 bytes but carries 2.
fn truncated_result() -> Vec<u8> {
    let mut server = encode_frames(&[1], 1);
    server.extend(encode_frames(&field("c", FieldType::LongLong, 63), 2));
    server.extend(encode_frames(&eof(SERVER_STATUS_AUTOCOMMIT), 3));
    server.extend(encode_frames(&[0x05, b'1', b'2'], 4));
    server.extend(encode_frames(&row(&[Some("7")]), 5));
    server.extend(encode_frames(&eof(SERVER_STATUS_AUTOCOMMIT), 6));
    // what a desynchronized client would read next
    server.extend(select_rows(&["1"]));
    server
}

#[test]
fn truncated_row_closes_the_connection() {
    let (mut conn, _) = connect(truncated_result(), config());

    match conn.query("SELECT c").unwrap_err() {
        Error::Protocol(e) => assert!(e.message.contains("Truncated row")),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!conn.is_open());
    assert_eq!(conn.state(), ConnectionState::Disconnected);

    match conn.query("SELECT 1").unwrap_err() {
        Error::Connection(c) => {
            assert_eq!(c.kind, ConnectionErrorKind::NotConnected);
            assert_eq!(c.code, 2048);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn truncated_streamed_row_closes_the_connection() {
    let (mut conn, _) = connect(truncated_result(), config());

    let mut stream = conn.query_unbuffered("SELECT c").unwrap();
    assert!(matches!(stream.next(), Some(Err(Error::Protocol(_)))));
    assert!(stream.next().is_none());
    drop(stream);

    assert!(!conn.is_open());
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert!(matches!(conn.query("SELECT 1"), Err(Error::Connection(_))));
}

#[test]
fn missing_username_is_usage_error() {
    let connector = Arc::new(QueuedConnector::new(Vec::new()));
    let err = MySqlConnection::connect_with(MySqlConfig::new(), connector).unwrap_err();
    assert!(matches!(err, Error::Usage(_)));
}

#[test]
fn connect_runs_session_settings() {
    let mut server = encode_frames(&ok(0, SERVER_STATUS_AUTOCOMMIT), 1);
    server.extend(encode_frames(&ok(0, 0), 1));
    let (conn, output) = connect(server, config().sql_mode("ANSI").autocommit(Some(false)));

    assert!(!conn.autocommit());
    let written = output.lock().unwrap();
    let text = String::from_utf8_lossy(&written);
    assert!(text.contains("SET sql_mode='ANSI'"));
    assert!(text.ends_with("SET AUTOCOMMIT = 0"));
}

#[test]
fn oversized_command_is_split() {
    let (mut conn, output) = connect(encode_frames(&ok(0, 0), 2), config());
    let sql = "x".repeat(MAX_PACKET_SIZE - 1);
    conn.query(&sql).unwrap();

    let written = output.lock().unwrap();
    let start = written.len() - (MAX_PACKET_SIZE + 8);
    assert_eq!(&written[start..start + 4], &[0xFF, 0xFF, 0xFF, 0]);
    assert_eq!(&written[written.len() - 4..], &[0, 0, 0, 1]);
}

#[test]
fn select_db_and_transactions() {
    let mut server = Vec::new();
    for _ in 0..4 {
        server.extend(encode_frames(&ok(0, SERVER_STATUS_AUTOCOMMIT), 1));
    }
    let (mut conn, output) = connect(server, config());

    conn.select_db("shop").unwrap();
    assert!(output.lock().unwrap().ends_with(&[5, 0, 0, 0, 0x02, b's', b'h', b'o', b'p']));
    conn.begin().unwrap();
    conn.rollback().unwrap();
    conn.commit().unwrap();
    assert!(output.lock().unwrap().ends_with(b"COMMIT"));
}

#[test]
fn set_charset_switches_encoding() {
    let (mut conn, output) = connect(encode_frames(&ok(0, 0), 1), config());
    conn.set_charset("latin1").unwrap();
    assert_eq!(conn.charset().name, "latin1");
    assert_eq!(conn.config().charset, "latin1");
    assert!(output.lock().unwrap().ends_with(b"SET NAMES 'latin1'"));
}
