//! MySQL type system and text-protocol value conversion.
//!
//! This module provides:
//! - MySQL field type codes and column flags
//! - `FieldDescriptor`, the parsed column definition packet
//! - `Converters`, the type-code keyed table that turns decoded column text
//!   into typed values
//! - SQL literal escaping

#![allow(clippy::cast_possible_truncation)]

use std::collections::HashMap;
use std::fmt;

use sqlwire_core::Value;

use crate::charset::Encoding;
use crate::protocol::PacketReader;

/// MySQL field type codes.
///
/// These are the `MYSQL_TYPE_*` constants from the MySQL C API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FieldType {
    /// DECIMAL (MYSQL_TYPE_DECIMAL)
    Decimal = 0x00,
    /// TINYINT (MYSQL_TYPE_TINY)
    Tiny = 0x01,
    /// SMALLINT (MYSQL_TYPE_SHORT)
    Short = 0x02,
    /// INT (MYSQL_TYPE_LONG)
    Long = 0x03,
    /// FLOAT (MYSQL_TYPE_FLOAT)
    Float = 0x04,
    /// DOUBLE (MYSQL_TYPE_DOUBLE)
    Double = 0x05,
    /// NULL (MYSQL_TYPE_NULL)
    Null = 0x06,
    /// TIMESTAMP (MYSQL_TYPE_TIMESTAMP)
    Timestamp = 0x07,
    /// BIGINT (MYSQL_TYPE_LONGLONG)
    LongLong = 0x08,
    /// MEDIUMINT (MYSQL_TYPE_INT24)
    Int24 = 0x09,
    /// DATE (MYSQL_TYPE_DATE)
    Date = 0x0A,
    /// TIME (MYSQL_TYPE_TIME)
    Time = 0x0B,
    /// DATETIME (MYSQL_TYPE_DATETIME)
    DateTime = 0x0C,
    /// YEAR (MYSQL_TYPE_YEAR)
    Year = 0x0D,
    /// NEWDATE (MYSQL_TYPE_NEWDATE) - internal use
    NewDate = 0x0E,
    /// VARCHAR (MYSQL_TYPE_VARCHAR)
    VarChar = 0x0F,
    /// BIT (MYSQL_TYPE_BIT)
    Bit = 0x10,
    /// JSON (MYSQL_TYPE_JSON) - MySQL 5.7.8+
    Json = 0xF5,
    /// NEWDECIMAL (MYSQL_TYPE_NEWDECIMAL)
    NewDecimal = 0xF6,
    /// ENUM (MYSQL_TYPE_ENUM)
    Enum = 0xF7,
    /// SET (MYSQL_TYPE_SET)
    Set = 0xF8,
    /// TINYBLOB (MYSQL_TYPE_TINY_BLOB)
    TinyBlob = 0xF9,
    /// MEDIUMBLOB (MYSQL_TYPE_MEDIUM_BLOB)
    MediumBlob = 0xFA,
    /// LONGBLOB (MYSQL_TYPE_LONG_BLOB)
    LongBlob = 0xFB,
    /// BLOB (MYSQL_TYPE_BLOB)
    Blob = 0xFC,
    /// VARCHAR (MYSQL_TYPE_VAR_STRING)
    VarString = 0xFD,
    /// CHAR (MYSQL_TYPE_STRING)
    String = 0xFE,
    /// GEOMETRY (MYSQL_TYPE_GEOMETRY)
    Geometry = 0xFF,
}

impl FieldType {
    /// Parse a field type from its wire code. Unknown codes yield `None`.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFE => FieldType::String,
            0xFF => FieldType::Geometry,
            _ => return None,
        })
    }

    /// Types whose column text is decoded with the column's own charset
    /// (or kept as bytes when that charset is `binary`).
    #[must_use]
    pub const fn is_textual(self) -> bool {
        matches!(
            self,
            FieldType::Bit
                | FieldType::Blob
                | FieldType::LongBlob
                | FieldType::MediumBlob
                | FieldType::String
                | FieldType::TinyBlob
                | FieldType::VarString
                | FieldType::VarChar
                | FieldType::Geometry
                | FieldType::Json
                | FieldType::Enum
                | FieldType::Set
        )
    }

    /// Check if this is an integer type.
    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            FieldType::Tiny
                | FieldType::Short
                | FieldType::Long
                | FieldType::LongLong
                | FieldType::Int24
                | FieldType::Year
        )
    }

    /// Check if this is a date/time type.
    #[must_use]
    pub const fn is_temporal(self) -> bool {
        matches!(
            self,
            FieldType::Date
                | FieldType::Time
                | FieldType::DateTime
                | FieldType::Timestamp
                | FieldType::NewDate
        )
    }

    /// Get the type name as a string.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            FieldType::Decimal | FieldType::NewDecimal => "DECIMAL",
            FieldType::Tiny => "TINYINT",
            FieldType::Short => "SMALLINT",
            FieldType::Long => "INT",
            FieldType::Float => "FLOAT",
            FieldType::Double => "DOUBLE",
            FieldType::Null => "NULL",
            FieldType::Timestamp => "TIMESTAMP",
            FieldType::LongLong => "BIGINT",
            FieldType::Int24 => "MEDIUMINT",
            FieldType::Date | FieldType::NewDate => "DATE",
            FieldType::Time => "TIME",
            FieldType::DateTime => "DATETIME",
            FieldType::Year => "YEAR",
            FieldType::VarChar | FieldType::VarString => "VARCHAR",
            FieldType::Bit => "BIT",
            FieldType::Json => "JSON",
            FieldType::Enum => "ENUM",
            FieldType::Set => "SET",
            FieldType::TinyBlob => "TINYBLOB",
            FieldType::MediumBlob => "MEDIUMBLOB",
            FieldType::LongBlob => "LONGBLOB",
            FieldType::Blob => "BLOB",
            FieldType::String => "CHAR",
            FieldType::Geometry => "GEOMETRY",
        }
    }
}

/// Column flags in result set metadata.
#[allow(dead_code)]
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNIQUE_KEY: u16 = 4;
    pub const MULTIPLE_KEY: u16 = 8;
    pub const BLOB: u16 = 16;
    pub const UNSIGNED: u16 = 32;
    pub const ZEROFILL: u16 = 64;
    pub const BINARY: u16 = 128;
    pub const ENUM: u16 = 256;
    pub const AUTO_INCREMENT: u16 = 512;
    pub const TIMESTAMP: u16 = 1024;
    pub const SET: u16 = 2048;
    pub const NO_DEFAULT_VALUE: u16 = 4096;
    pub const ON_UPDATE_NOW: u16 = 8192;
    pub const NUM: u16 = 32768;
}

/// Column definition from a result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Catalog name (always "def")
    pub catalog: String,
    /// Schema (database) name
    pub schema: String,
    /// Table name (or alias)
    pub table: String,
    /// Original table name
    pub org_table: String,
    /// Column name (or alias)
    pub name: String,
    /// Original column name
    pub org_name: String,
    /// Character set / collation id
    pub charset: u16,
    /// Column length
    pub column_length: u32,
    /// Raw type code as sent by the server
    pub type_code: u8,
    /// Column flags
    pub flags: u16,
    /// Number of decimals
    pub decimals: u8,
}

impl FieldDescriptor {
    /// Parse a column definition packet (protocol 4.1 layout).
    ///
    /// Names are decoded with `encoding`, falling back to lossy UTF-8.
    pub fn parse(payload: &[u8], encoding: Encoding) -> Option<Self> {
        let mut reader = PacketReader::new(payload);
        let mut name = || {
            reader.read_lenenc_bytes().map(|b| {
                encoding
                    .decode(b)
                    .unwrap_or_else(|| String::from_utf8_lossy(b).into_owned())
            })
        };
        let catalog = name()?;
        let schema = name()?;
        let table = name()?;
        let org_table = name()?;
        let name_ = name()?;
        let org_name = name()?;

        // Length of the fixed-size block (always 0x0c)
        reader.read_lenenc_int()?;
        let charset = reader.read_u16_le()?;
        let column_length = reader.read_u32_le()?;
        let type_code = reader.read_u8()?;
        let flags = reader.read_u16_le()?;
        let decimals = reader.read_u8()?;

        Some(Self {
            catalog,
            schema,
            table,
            org_table,
            name: name_,
            org_name,
            charset,
            column_length,
            type_code,
            flags,
            decimals,
        })
    }

    /// Decoded field type, `None` for codes this client does not know.
    #[must_use]
    pub fn field_type(&self) -> Option<FieldType> {
        FieldType::from_u8(self.type_code)
    }

    /// Check if the column is NOT NULL.
    #[must_use]
    pub const fn is_not_null(&self) -> bool {
        self.flags & column_flags::NOT_NULL != 0
    }

    /// Check if the column is unsigned.
    #[must_use]
    pub const fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    /// Check if the column is binary.
    #[must_use]
    pub const fn is_binary(&self) -> bool {
        self.flags & column_flags::BINARY != 0
    }
}

/// A value converter: receives the column and its decoded value
/// (`Value::Text` or `Value::Bytes`, never `Value::Null`).
pub type Converter = fn(&FieldDescriptor, Value) -> Value;

/// Type-code keyed converter table.
///
/// `Converters::default()` holds the standard conversions; `empty()` leaves
/// every column as decoded text or bytes.
#[derive(Clone)]
pub struct Converters {
    map: HashMap<u8, Converter>,
}

impl Converters {
    /// A table with no converters.
    pub fn empty() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Register `converter` for `type_code`, returning the one it replaces.
    pub fn insert(&mut self, type_code: u8, converter: Converter) -> Option<Converter> {
        self.map.insert(type_code, converter)
    }

    /// Builder form of [`Converters::insert`].
    pub fn with(mut self, field_type: FieldType, converter: Converter) -> Self {
        self.insert(field_type as u8, converter);
        self
    }

    /// Remove the converter for `type_code`.
    pub fn remove(&mut self, type_code: u8) -> Option<Converter> {
        self.map.remove(&type_code)
    }

    /// Converter registered for `type_code`.
    pub fn get(&self, type_code: u8) -> Option<Converter> {
        self.map.get(&type_code).copied()
    }

    /// Number of registered converters.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no converter is registered.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Apply the converter for `field`, if any. NULL is never converted.
    pub fn convert(&self, field: &FieldDescriptor, value: Value) -> Value {
        if value.is_null() {
            return value;
        }
        match self.get(field.type_code) {
            Some(converter) => converter(field, value),
            None => value,
        }
    }
}

impl Default for Converters {
    fn default() -> Self {
        Self::empty()
            .with(FieldType::Tiny, convert_integer)
            .with(FieldType::Short, convert_integer)
            .with(FieldType::Int24, convert_integer)
            .with(FieldType::Long, convert_integer)
            .with(FieldType::LongLong, convert_integer)
            .with(FieldType::Year, convert_integer)
            .with(FieldType::Float, convert_float)
            .with(FieldType::Double, convert_double)
            .with(FieldType::Decimal, convert_decimal)
            .with(FieldType::NewDecimal, convert_decimal)
            .with(FieldType::Date, convert_date)
            .with(FieldType::NewDate, convert_date)
            .with(FieldType::DateTime, convert_datetime)
            .with(FieldType::Timestamp, convert_datetime)
            .with(FieldType::Time, convert_time)
            .with(FieldType::Json, convert_json)
            .with(FieldType::Bit, convert_bit)
    }
}

impl fmt::Debug for Converters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut codes: Vec<u8> = self.map.keys().copied().collect();
        codes.sort_unstable();
        f.debug_struct("Converters").field("type_codes", &codes).finish()
    }
}

/// Integer column text to the narrowest signed variant that holds it.
/// Unparsable text, and unsigned BIGINT values above `i64::MAX`, stay text.
pub fn convert_integer(field: &FieldDescriptor, value: Value) -> Value {
    let text = match value {
        Value::Text(text) => text,
        other => return other,
    };
    let unsigned = field.is_unsigned();
    let parsed = match (field.field_type(), unsigned) {
        (Some(FieldType::Tiny), false) => text.parse::<i8>().ok().map(Value::TinyInt),
        (Some(FieldType::Tiny), true) => text.parse::<u8>().ok().map(Value::from),
        (Some(FieldType::Short), false) => text.parse::<i16>().ok().map(Value::SmallInt),
        (Some(FieldType::Short), true) => text.parse::<u16>().ok().map(Value::from),
        (Some(FieldType::Year), _) => text.parse::<i16>().ok().map(Value::SmallInt),
        (Some(FieldType::Int24 | FieldType::Long), false) => text.parse::<i32>().ok().map(Value::Int),
        (Some(FieldType::Int24 | FieldType::Long), true) => text.parse::<u32>().ok().map(Value::from),
        (_, false) => text.parse::<i64>().ok().map(Value::BigInt),
        (_, true) => text
            .parse::<u64>()
            .ok()
            .and_then(|v| i64::try_from(v).ok())
            .map(Value::BigInt),
    };
    parsed.unwrap_or(Value::Text(text))
}

pub fn convert_float(_field: &FieldDescriptor, value: Value) -> Value {
    match value {
        Value::Text(text) => text.parse::<f32>().map_or(Value::Text(text), Value::Float),
        other => other,
    }
}

pub fn convert_double(_field: &FieldDescriptor, value: Value) -> Value {
    match value {
        Value::Text(text) => text.parse::<f64>().map_or(Value::Text(text), Value::Double),
        other => other,
    }
}

pub fn convert_decimal(_field: &FieldDescriptor, value: Value) -> Value {
    match value {
        Value::Text(text) => Value::Decimal(text),
        other => other,
    }
}

pub fn convert_date(_field: &FieldDescriptor, value: Value) -> Value {
    match value {
        Value::Text(text) => parse_date(&text).map_or(Value::Text(text), Value::Date),
        other => other,
    }
}

pub fn convert_datetime(_field: &FieldDescriptor, value: Value) -> Value {
    match value {
        Value::Text(text) => parse_datetime(&text).map_or(Value::Text(text), Value::Timestamp),
        other => other,
    }
}

pub fn convert_time(_field: &FieldDescriptor, value: Value) -> Value {
    match value {
        Value::Text(text) => parse_time(&text).map_or(Value::Text(text), Value::Time),
        other => other,
    }
}

pub fn convert_json(_field: &FieldDescriptor, value: Value) -> Value {
    let parsed = match &value {
        Value::Text(text) => serde_json::from_str(text).ok(),
        Value::Bytes(bytes) => serde_json::from_slice(bytes).ok(),
        _ => None,
    };
    parsed.map_or(value, Value::Json)
}

pub fn convert_bit(_field: &FieldDescriptor, value: Value) -> Value {
    match value {
        Value::Text(text) => Value::Bytes(text.into_bytes()),
        other => other,
    }
}

/// Parse `YYYY-MM-DD` into days since the Unix epoch.
///
/// Zero dates (`0000-00-00`) and out-of-range components yield `None`.
pub fn parse_date(s: &str) -> Option<i32> {
    let mut parts = s.splitn(3, '-');
    let year: i32 = parts.next()?.parse().ok()?;
    let month: u32 = parts.next()?.parse().ok()?;
    let day: u32 = parts.next()?.parse().ok()?;
    if year == 0 || !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    Some(date_to_days(year, month, day))
}

/// Parse `[-]H..H:MM:SS[.ffffff]` into signed microseconds.
///
/// MySQL TIME spans -838:59:59 to 838:59:59, so hours may exceed 23.
pub fn parse_time(s: &str) -> Option<i64> {
    let (negative, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let (clock, frac) = match s.split_once('.') {
        Some((clock, frac)) => (clock, Some(frac)),
        None => (s, None),
    };

    let mut parts = clock.split(':');
    let hours: i64 = parts.next()?.parse().ok()?;
    let mins: i64 = parts.next()?.parse().ok()?;
    let secs: i64 = match parts.next() {
        Some(p) => p.parse().ok()?,
        None => 0,
    };
    if parts.next().is_some() || hours < 0 || !(0..=59).contains(&mins) || !(0..=59).contains(&secs)
    {
        return None;
    }

    let mut micros = hours
        .checked_mul(3600)?
        .checked_add(mins * 60 + secs)?
        .checked_mul(1_000_000)?;
    if let Some(frac) = frac {
        if frac.is_empty() || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let digits = frac.get(..frac.len().min(6))?;
        let value: i64 = digits.parse().ok()?;
        micros = micros.checked_add(value * 10_i64.pow(6 - digits.len() as u32))?;
    }

    Some(if negative { -micros } else { micros })
}

/// Parse `YYYY-MM-DD[ HH:MM:SS[.ffffff]]` into microseconds since the epoch.
pub fn parse_datetime(s: &str) -> Option<i64> {
    let (date, time) = match s.split_once([' ', 'T']) {
        Some((date, time)) => (date, Some(time)),
        None => (s, None),
    };
    let days = parse_date(date)?;
    let time_micros = match time {
        Some(t) => {
            let micros = parse_time(t)?;
            if !(0..86_400 * 1_000_000).contains(&micros) {
                return None;
            }
            micros
        }
        None => 0,
    };
    Some(i64::from(days) * 86_400 * 1_000_000 + time_micros)
}

/// Days since 1970-01-01 for a proleptic Gregorian date.
fn date_to_days(year: i32, month: u32, day: u32) -> i32 {
    // Algorithm from https://howardhinnant.github.io/date_algorithms.html
    let y = if month <= 2 { year - 1 } else { year };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as u32;
    let doy = (153 * (if month > 2 { month - 3 } else { month + 9 }) + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe as i32 - 719_468
}

/// Escape `s` for use inside a quoted SQL string literal (quotes not added).
///
/// With `no_backslash_escapes` (server `NO_BACKSLASH_ESCAPES` mode) only
/// single quotes are doubled.
pub fn escape_string(s: &str, no_backslash_escapes: bool) -> String {
    let mut result = String::with_capacity(s.len() + 2);
    if no_backslash_escapes {
        for ch in s.chars() {
            if ch == '\'' {
                result.push_str("''");
            } else {
                result.push(ch);
            }
        }
        return result;
    }
    for ch in s.chars() {
        match ch {
            '\'' => result.push_str("\\'"),
            '"' => result.push_str("\\\""),
            '\\' => result.push_str("\\\\"),
            '\0' => result.push_str("\\0"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\x1a' => result.push_str("\\Z"), // Ctrl+Z
            _ => result.push(ch),
        }
    }
    result
}

/// Render `value` as a SQL literal.
pub fn escape_value(value: &Value, no_backslash_escapes: bool) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::TinyInt(i) => i.to_string(),
        Value::SmallInt(i) => i.to_string(),
        Value::Int(i) => i.to_string(),
        Value::BigInt(i) => i.to_string(),
        Value::Float(f) if f.is_finite() => f.to_string(),
        Value::Double(f) if f.is_finite() => f.to_string(),
        Value::Float(_) | Value::Double(_) => "NULL".to_string(),
        Value::Decimal(s) => s.clone(),
        Value::Text(s) => format!("'{}'", escape_string(s, no_backslash_escapes)),
        Value::Bytes(data) => {
            let mut result = String::with_capacity(data.len() * 2 + 3);
            result.push_str("X'");
            for byte in data {
                result.push_str(&format!("{byte:02X}"));
            }
            result.push('\'');
            result
        }
        Value::Date(days) => format!("'{}'", format_date(*days)),
        Value::Time(micros) => format!("'{}'", format_time(*micros)),
        Value::Timestamp(micros) => {
            let days = micros.div_euclid(86_400 * 1_000_000);
            let rem = micros.rem_euclid(86_400 * 1_000_000);
            format!("'{} {}'", format_date(days as i32), format_time(rem))
        }
        Value::Json(v) => format!("'{}'", escape_string(&v.to_string(), no_backslash_escapes)),
    }
}

fn format_date(days: i32) -> String {
    // Inverse of date_to_days (same source).
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe as i32 + era * 400 + i32::from(month <= 2);
    format!("{year:04}-{month:02}-{day:02}")
}

fn format_time(micros: i64) -> String {
    let sign = if micros < 0 { "-" } else { "" };
    let micros = micros.unsigned_abs();
    let secs = micros / 1_000_000;
    let frac = micros % 1_000_000;
    let (h, m, s) = (secs / 3600, (secs / 60) % 60, secs % 60);
    if frac == 0 {
        format!("{sign}{h:02}:{m:02}:{s:02}")
    } else {
        format!("{sign}{h:02}:{m:02}:{s:02}.{frac:06}")
    }
}
