//! Query results and the text-protocol result decoder.
//!
//! A response to `COM_QUERY` is either a single OK packet or a result set:
//!
//! ```text
//! column count (lenenc) | field descriptor x N | EOF | row x M | EOF
//! ```
//!
//! The decoding here is sans-IO; the connections feed it packets.

use std::sync::Arc;

use sqlwire_core::{ColumnInfo, Error, Row, Value};

use crate::charset::{self, Encoding, BINARY_CHARSET_ID};
use crate::error::{error_from_packet, out_of_sync, protocol_error};
use crate::protocol::server_status::SERVER_MORE_RESULTS_EXISTS;
use crate::protocol::{EofPacket, Packet, PacketReader};
use crate::types::{Converters, FieldDescriptor};

/// Affected-row count reported by a streaming result before its first pull.
pub const UNBUFFERED_AFFECTED_ROWS: u64 = u64::MAX;

/// Result of a statement that returns no rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkResult {
    pub affected_rows: u64,
    pub insert_id: u64,
    pub server_status: u16,
    pub warning_count: u16,
    /// Server info message ("Rows matched: 1  Changed: 1 ..."), decoded
    pub message: String,
    /// Another result of a multi-statement query follows
    pub has_next: bool,
}

/// Buffered rows of a result set.
#[derive(Debug, Clone, PartialEq)]
pub struct RowSet {
    pub fields: Arc<[FieldDescriptor]>,
    pub rows: Vec<Row>,
    pub server_status: u16,
    pub warning_count: u16,
    pub has_next: bool,
}

impl RowSet {
    /// Number of rows read.
    pub fn affected_rows(&self) -> u64 {
        self.rows.len() as u64
    }
}

/// One result of a query.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultSet {
    Ok(OkResult),
    Rows(RowSet),
}

impl ResultSet {
    pub fn affected_rows(&self) -> u64 {
        match self {
            ResultSet::Ok(ok) => ok.affected_rows,
            ResultSet::Rows(set) => set.affected_rows(),
        }
    }

    /// Last insert id; zero for row results.
    pub fn insert_id(&self) -> u64 {
        match self {
            ResultSet::Ok(ok) => ok.insert_id,
            ResultSet::Rows(_) => 0,
        }
    }

    pub fn server_status(&self) -> u16 {
        match self {
            ResultSet::Ok(ok) => ok.server_status,
            ResultSet::Rows(set) => set.server_status,
        }
    }

    pub fn warning_count(&self) -> u16 {
        match self {
            ResultSet::Ok(ok) => ok.warning_count,
            ResultSet::Rows(set) => set.warning_count,
        }
    }

    /// Whether another result follows in a multi-statement response.
    pub fn has_next(&self) -> bool {
        match self {
            ResultSet::Ok(ok) => ok.has_next,
            ResultSet::Rows(set) => set.has_next,
        }
    }

    /// Field descriptors; empty for OK results.
    pub fn fields(&self) -> &[FieldDescriptor] {
        match self {
            ResultSet::Ok(_) => &[],
            ResultSet::Rows(set) => &set.fields,
        }
    }

    /// Rows; empty for OK results.
    pub fn rows(&self) -> &[Row] {
        match self {
            ResultSet::Ok(_) => &[],
            ResultSet::Rows(set) => &set.rows,
        }
    }

    pub fn into_rows(self) -> Vec<Row> {
        match self {
            ResultSet::Ok(_) => Vec::new(),
            ResultSet::Rows(set) => set.rows,
        }
    }
}

/// How a result begins.
#[derive(Debug)]
pub(crate) enum ResultHead {
    Ok(OkResult),
    Columns(u64),
}

/// Classify the first packet of a result.
pub(crate) fn read_result_head(packet: &Packet, encoding: Encoding) -> Result<ResultHead, Error> {
    if packet.is_error() {
        return Err(error_from_packet(packet));
    }
    if packet.first_byte() == Some(0x00) {
        return Ok(ResultHead::Ok(parse_ok_result(packet, encoding)?));
    }

    let mut reader = PacketReader::new(&packet.payload);
    match reader.read_lenenc_int() {
        Some(count) if count > 0 => Ok(ResultHead::Columns(count)),
        _ => Err(out_of_sync(packet)),
    }
}

/// Parse an OK packet into an [`OkResult`].
pub(crate) fn parse_ok_result(packet: &Packet, encoding: Encoding) -> Result<OkResult, Error> {
    let ok = PacketReader::new(&packet.payload)
        .parse_ok_packet()
        .ok_or_else(|| protocol_error("Malformed OK packet"))?;
    let message = encoding
        .decode(&ok.info)
        .unwrap_or_else(|| String::from_utf8_lossy(&ok.info).into_owned());
    Ok(OkResult {
        affected_rows: ok.affected_rows,
        insert_id: ok.last_insert_id,
        server_status: ok.status_flags,
        warning_count: ok.warnings,
        message,
        has_next: ok.status_flags & SERVER_MORE_RESULTS_EXISTS != 0,
    })
}

pub(crate) fn parse_field(packet: &Packet, encoding: Encoding) -> Result<FieldDescriptor, Error> {
    if packet.is_error() {
        return Err(error_from_packet(packet));
    }
    FieldDescriptor::parse(&packet.payload, encoding)
        .ok_or_else(|| protocol_error("Malformed field descriptor packet"))
}

/// The EOF that closes the field descriptors.
pub(crate) fn expect_eof(packet: &Packet) -> Result<EofPacket, Error> {
    if packet.is_error() {
        return Err(error_from_packet(packet));
    }
    if !packet.is_eof() {
        return Err(protocol_error(format!(
            "Protocol error, expecting EOF (first byte {:#04x})",
            packet.first_byte().unwrap_or(0)
        )));
    }
    PacketReader::new(&packet.payload)
        .parse_eof_packet()
        .ok_or_else(|| protocol_error("Malformed EOF packet"))
}

/// Shape of a result set whose rows are still on the wire.
#[derive(Debug, Clone)]
pub(crate) struct RowDecoder {
    pub fields: Arc<[FieldDescriptor]>,
    columns: Arc<ColumnInfo>,
}

/// One packet of the row section.
#[derive(Debug)]
pub(crate) enum RowPacket {
    Row(Row),
    End(EofPacket),
}

impl RowDecoder {
    pub fn new(fields: Vec<FieldDescriptor>) -> Self {
        let columns = Arc::new(ColumnInfo::new(
            fields.iter().map(|f| f.name.clone()).collect(),
        ));
        Self {
            fields: fields.into(),
            columns,
        }
    }

    /// Decode one packet of the row section: a row, the closing EOF, or an
    /// Error packet (returned as `ServerError`).
    pub fn decode_packet(
        &self,
        packet: &Packet,
        encoding: Encoding,
        converters: &Converters,
    ) -> Result<RowPacket, Error> {
        if packet.is_error() {
            return Err(error_from_packet(packet));
        }
        if packet.is_eof() {
            let eof = PacketReader::new(&packet.payload)
                .parse_eof_packet()
                .ok_or_else(|| protocol_error("Malformed EOF packet"))?;
            return Ok(RowPacket::End(eof));
        }
        self.decode_row(&packet.payload, encoding, converters)
            .map(RowPacket::Row)
    }

    /// Decode a text-protocol row.
    pub fn decode_row(
        &self,
        payload: &[u8],
        encoding: Encoding,
        converters: &Converters,
    ) -> Result<Row, Error> {
        let mut reader = PacketReader::new(payload);
        let mut values = Vec::with_capacity(self.fields.len());

        for field in self.fields.iter() {
            let raw = reader.read_column_value().ok_or_else(|| {
                protocol_error(format!("Truncated row data at column '{}'", field.name))
            })?;
            let value = match raw {
                None => Value::Null,
                Some(bytes) => converters.convert(field, decode_column(field, bytes, encoding)),
            };
            values.push(value);
        }

        Ok(Row::with_columns(Arc::clone(&self.columns), values))
    }
}

/// Turn a column's raw bytes into `Text` or `Bytes`.
///
/// Textual columns use their own charset (binary charset keeps bytes);
/// everything else uses the connection encoding. Bytes that do not decode
/// stay raw.
pub(crate) fn decode_column(field: &FieldDescriptor, bytes: &[u8], encoding: Encoding) -> Value {
    let textual = field.field_type().is_some_and(|t| t.is_textual());
    let encoding = if textual {
        if field.charset == BINARY_CHARSET_ID {
            return Value::Bytes(bytes.to_vec());
        }
        charset::charset_by_id(field.charset).map_or(encoding, |c| c.encoding)
    } else {
        encoding
    };

    match encoding.decode(bytes) {
        Some(text) => Value::Text(text),
        None => Value::Bytes(bytes.to_vec()),
    }
}

/// State of a streaming result owned by the connection.
#[derive(Debug, Clone)]
pub(crate) struct ActiveStream {
    pub decoder: RowDecoder,
    /// Rows pulled so far.
    pub rows_read: u64,
}

impl ActiveStream {
    pub fn new(decoder: RowDecoder) -> Self {
        Self {
            decoder,
            rows_read: 0,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::PacketWriter;
    use crate::types::FieldType;

    /// Field descriptor packet payload for tests.
    pub(crate) fn field_payload(name: &str, field_type: FieldType, charset: u16, flags: u16) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_lenenc_bytes(b"def");
        w.write_lenenc_bytes(b"test");
        w.write_lenenc_bytes(b"t");
        w.write_lenenc_bytes(b"t");
        w.write_lenenc_bytes(name.as_bytes());
        w.write_lenenc_bytes(name.as_bytes());
        w.write_lenenc_int(0x0c);
        w.write_u16_le(charset);
        w.write_u32_le(11);
        w.write_u8(field_type as u8);
        w.write_u16_le(flags);
        w.write_u8(0);
        w.write_zeros(2);
        w.into_bytes()
    }

    fn field(name: &str, field_type: FieldType, charset: u16) -> FieldDescriptor {
        FieldDescriptor::parse(&field_payload(name, field_type, charset, 0), Encoding::Utf8).unwrap()
    }

    fn row_payload(cols: &[Option<&[u8]>]) -> Vec<u8> {
        let mut w = PacketWriter::new();
        for col in cols {
            match col {
                Some(bytes) => w.write_lenenc_bytes(bytes),
                None => w.write_u8(0xFB),
            }
        }
        w.into_bytes()
    }

    #[test]
    fn test_result_head_ok() {
        let mut payload = vec![0x00, 0x03, 0x2A];
        payload.extend_from_slice(&0x000Au16.to_le_bytes());
        payload.extend_from_slice(&1u16.to_le_bytes());
        payload.extend_from_slice(b"Records: 3");
        match read_result_head(&Packet::new(payload, 1), Encoding::Utf8).unwrap() {
            ResultHead::Ok(ok) => {
                assert_eq!(ok.affected_rows, 3);
                assert_eq!(ok.insert_id, 42);
                assert_eq!(ok.warning_count, 1);
                assert_eq!(ok.message, "Records: 3");
                assert!(ok.has_next);
            }
            other => panic!("unexpected head: {other:?}"),
        }
    }

    #[test]
    fn test_result_head_columns_and_errors() {
        assert!(matches!(
            read_result_head(&Packet::new(vec![0x02], 1), Encoding::Utf8).unwrap(),
            ResultHead::Columns(2)
        ));

        let mut err = vec![0xFF];
        err.extend_from_slice(&1064u16.to_le_bytes());
        err.extend_from_slice(b"#42000You have an error");
        match read_result_head(&Packet::new(err, 1), Encoding::Utf8).unwrap_err() {
            Error::Server(e) => {
                assert_eq!(e.code, 1064);
                assert_eq!(e.sqlstate.as_deref(), Some("42000"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = read_result_head(&Packet::new(vec![0xFE], 1), Encoding::Utf8).unwrap_err();
        assert_eq!(err.code(), Some(2014));
    }

    #[test]
    fn test_expect_eof() {
        let eof = expect_eof(&Packet::new(vec![0xFE, 0x00, 0x00, 0x02, 0x00], 3)).unwrap();
        assert_eq!(eof.status_flags, 2);
        assert!(matches!(
            expect_eof(&Packet::new(vec![0x01, 0x31], 3)),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_decode_column_charsets() {
        let text = field("name", FieldType::VarString, 45);
        assert_eq!(decode_column(&text, "héllo".as_bytes(), Encoding::Utf8), Value::Text("héllo".into()));

        let latin = field("name", FieldType::VarString, 8);
        assert_eq!(decode_column(&latin, &[0xE9], Encoding::Utf8), Value::Text("\u{e9}".into()));

        let blob = field("data", FieldType::Blob, BINARY_CHARSET_ID);
        assert_eq!(decode_column(&blob, b"abc", Encoding::Utf8), Value::Bytes(b"abc".to_vec()));

        let number = field("n", FieldType::Long, BINARY_CHARSET_ID);
        assert_eq!(decode_column(&number, b"12", Encoding::Utf8), Value::Text("12".into()));

        let bad = field("name", FieldType::VarString, 45);
        assert_eq!(decode_column(&bad, &[0xFF], Encoding::Utf8), Value::Bytes(vec![0xFF]));
    }

    #[test]
    fn test_decode_row_with_converters() {
        let decoder = RowDecoder::new(vec![
            field("id", FieldType::LongLong, BINARY_CHARSET_ID),
            field("name", FieldType::VarString, 45),
            field("note", FieldType::VarString, 45),
        ]);
        let payload = row_payload(&[Some(b"7"), Some(b"alice"), None]);

        let row = decoder
            .decode_row(&payload, Encoding::Utf8, &Converters::default())
            .unwrap();
        assert_eq!(row.get(0), Some(&Value::BigInt(7)));
        assert_eq!(row.get_by_name("name"), Some(&Value::Text("alice".into())));
        assert_eq!(row.get(2), Some(&Value::Null));

        let row = decoder
            .decode_row(&payload, Encoding::Utf8, &Converters::empty())
            .unwrap();
        assert_eq!(row.get(0), Some(&Value::Text("7".into())));
    }

    #[test]
    fn test_decode_truncated_row() {
        let decoder = RowDecoder::new(vec![
            field("a", FieldType::Long, 63),
            field("b", FieldType::Long, 63),
        ]);
        let payload = row_payload(&[Some(b"1")]);
        assert!(matches!(
            decoder.decode_row(&payload, Encoding::Utf8, &Converters::default()),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_decode_packet_kinds() {
        let decoder = RowDecoder::new(vec![field("a", FieldType::Long, 63)]);
        let converters = Converters::default();

        let row = decoder
            .decode_packet(&Packet::new(row_payload(&[Some(b"5")]), 4), Encoding::Utf8, &converters)
            .unwrap();
        assert!(matches!(row, RowPacket::Row(r) if r.get(0) == Some(&Value::Int(5))));

        let end = decoder
            .decode_packet(&Packet::new(vec![0xFE, 1, 0, 0x08, 0], 5), Encoding::Utf8, &converters)
            .unwrap();
        assert!(matches!(end, RowPacket::End(eof) if eof.warnings == 1 && eof.status_flags == 8));

        let mut err = vec![0xFF];
        err.extend_from_slice(&1317u16.to_le_bytes());
        err.extend_from_slice(b"#70100Query execution was interrupted");
        assert!(matches!(
            decoder.decode_packet(&Packet::new(err, 5), Encoding::Utf8, &converters),
            Err(Error::Server(_))
        ));
    }

    #[test]
    fn test_result_set_accessors() {
        let ok = ResultSet::Ok(OkResult {
            affected_rows: 2,
            insert_id: 9,
            server_status: 0,
            warning_count: 0,
            message: String::new(),
            has_next: false,
        });
        assert_eq!(ok.affected_rows(), 2);
        assert_eq!(ok.insert_id(), 9);
        assert!(ok.rows().is_empty());
        assert!(ok.fields().is_empty());

        let decoder = RowDecoder::new(vec![field("a", FieldType::Long, 63)]);
        let row = decoder
            .decode_row(&row_payload(&[Some(b"1")]), Encoding::Utf8, &Converters::default())
            .unwrap();
        let rows = ResultSet::Rows(RowSet {
            fields: Arc::clone(&decoder.fields),
            rows: vec![row.clone(), row],
            server_status: 0,
            warning_count: 0,
            has_next: true,
        });
        assert_eq!(rows.affected_rows(), 2);
        assert_eq!(rows.fields().len(), 1);
        assert!(rows.has_next());
        assert_eq!(rows.into_rows().len(), 2);
    }
}
