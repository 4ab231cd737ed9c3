//! Server-side packet builders shared by the scripted tests.

#![allow(dead_code)]

use sqlwire_mysql::FieldType;
use sqlwire_mysql::protocol::server_status::SERVER_STATUS_AUTOCOMMIT;
use sqlwire_mysql::protocol::{PacketWriter, encode_frames};

pub fn greeting(thread_id: u32) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(10);
    w.write_null_bytes(b"5.7.10");
    w.write_u32_le(thread_id);
    w.write_bytes(b"abcdefgh");
    w.write_u8(0);
    w.write_u16_le(0xF7FF);
    w.into_bytes()
}

pub fn ok(affected: u64, status: u16) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0x00);
    w.write_lenenc_int(affected);
    w.write_lenenc_int(0);
    w.write_u16_le(status);
    w.write_u16_le(0);
    w.into_bytes()
}

pub fn eof(status: u16) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0xFE);
    w.write_u16_le(0);
    w.write_u16_le(status);
    w.into_bytes()
}

pub fn err(code: u16, state: &str, message: &str) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0xFF);
    w.write_u16_le(code);
    w.write_u8(b'#');
    w.write_bytes(state.as_bytes());
    w.write_bytes(message.as_bytes());
    w.into_bytes()
}

pub fn field(name: &str, field_type: FieldType, charset: u16) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_lenenc_bytes(b"def");
    w.write_lenenc_bytes(b"");
    w.write_lenenc_bytes(b"");
    w.write_lenenc_bytes(b"");
    w.write_lenenc_bytes(name.as_bytes());
    w.write_lenenc_bytes(b"");
    w.write_lenenc_int(0x0c);
    w.write_u16_le(charset);
    w.write_u32_le(1);
    w.write_u8(field_type as u8);
    w.write_u16_le(0x0081);
    w.write_u8(0);
    w.write_zeros(2);
    w.into_bytes()
}

pub fn row(cols: &[Option<&str>]) -> Vec<u8> {
    let mut w = PacketWriter::new();
    for col in cols {
        match col {
            Some(text) => w.write_lenenc_bytes(text.as_bytes()),
            None => w.write_u8(0xFB),
        }
    }
    w.into_bytes()
}

/// Handshake bytes: greeting on 0, OK on 2.
pub fn login() -> Vec<u8> {
    let mut bytes = encode_frames(&greeting(42), 0);
    bytes.extend(encode_frames(&ok(0, SERVER_STATUS_AUTOCOMMIT), 2));
    bytes
}

/// A one-column BIGINT result set answering a command sent on seq 0.
pub fn select_rows(values: &[&str]) -> Vec<u8> {
    select_rows_from(1, values)
}

pub fn select_rows_from(first_seq: u8, values: &[&str]) -> Vec<u8> {
    let mut bytes = encode_frames(&[1], first_seq);
    bytes.extend(encode_frames(&field("1", FieldType::LongLong, 63), first_seq + 1));
    bytes.extend(encode_frames(&eof(SERVER_STATUS_AUTOCOMMIT), first_seq + 2));
    let mut seq = first_seq + 3;
    for v in values {
        bytes.extend(encode_frames(&row(&[Some(v)]), seq));
        seq += 1;
    }
    bytes.extend(encode_frames(&eof(SERVER_STATUS_AUTOCOMMIT), seq));
    bytes
}
