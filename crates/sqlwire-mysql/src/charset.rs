//! MySQL character sets and their text encodings.
//!
//! The table covers the character sets this client can encode and decode.
//! Column charsets outside the table decode with the connection encoding.

/// Charset id of the `binary` pseudo character set.
pub const BINARY_CHARSET_ID: u16 = 63;

/// Charset used when none is configured.
pub const DEFAULT_CHARSET: &str = "utf8mb4";

/// Byte-level text encodings backing the supported character sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    /// MySQL's `latin1`, which is Windows-1252.
    Latin1,
    Ascii,
    /// No text interpretation; values stay raw bytes.
    Binary,
}

impl Encoding {
    /// Canonical codec name.
    pub const fn name(self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf8",
            Encoding::Latin1 => "cp1252",
            Encoding::Ascii => "ascii",
            Encoding::Binary => "binary",
        }
    }

    /// Decode bytes to text. `None` when the bytes are not valid in this
    /// encoding; callers keep the raw bytes in that case.
    pub fn decode(self, bytes: &[u8]) -> Option<String> {
        match self {
            Encoding::Utf8 | Encoding::Binary => std::str::from_utf8(bytes).ok().map(str::to_owned),
            Encoding::Ascii => bytes
                .is_ascii()
                .then(|| bytes.iter().map(|&b| char::from(b)).collect()),
            Encoding::Latin1 => Some(bytes.iter().map(|&b| cp1252_to_char(b)).collect()),
        }
    }

    /// Encode text. Characters the encoding cannot represent become `?`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            Encoding::Utf8 | Encoding::Binary => text.as_bytes().to_vec(),
            Encoding::Ascii => text
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect(),
            Encoding::Latin1 => text.chars().map(|c| char_to_cp1252(c).unwrap_or(b'?')).collect(),
        }
    }
}

/// One MySQL character set / collation pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Charset {
    pub id: u16,
    pub name: &'static str,
    pub collation: &'static str,
    pub is_default: bool,
    pub encoding: Encoding,
}

impl Charset {
    /// Whether this is the `binary` character set.
    pub fn is_binary(&self) -> bool {
        self.id == BINARY_CHARSET_ID
    }

    /// Id as sent in the one-byte handshake field.
    #[allow(clippy::cast_possible_truncation)]
    pub fn handshake_id(&self) -> u8 {
        if self.id > 255 {
            // Collations above 255 cannot be named in the handshake; the
            // charset's default collation is used until SET NAMES runs.
            charset_by_name(self.name).map_or(33, |c| c.id as u8)
        } else {
            self.id as u8
        }
    }
}

const fn cs(
    id: u16,
    name: &'static str,
    collation: &'static str,
    is_default: bool,
    encoding: Encoding,
) -> Charset {
    Charset {
        id,
        name,
        collation,
        is_default,
        encoding,
    }
}

static CHARSETS: &[Charset] = &[
    cs(5, "latin1", "latin1_german1_ci", false, Encoding::Latin1),
    cs(8, "latin1", "latin1_swedish_ci", true, Encoding::Latin1),
    cs(11, "ascii", "ascii_general_ci", true, Encoding::Ascii),
    cs(15, "latin1", "latin1_danish_ci", false, Encoding::Latin1),
    cs(31, "latin1", "latin1_german2_ci", false, Encoding::Latin1),
    cs(33, "utf8mb3", "utf8mb3_general_ci", true, Encoding::Utf8),
    cs(45, "utf8mb4", "utf8mb4_general_ci", true, Encoding::Utf8),
    cs(46, "utf8mb4", "utf8mb4_bin", false, Encoding::Utf8),
    cs(47, "latin1", "latin1_bin", false, Encoding::Latin1),
    cs(48, "latin1", "latin1_general_ci", false, Encoding::Latin1),
    cs(49, "latin1", "latin1_general_cs", false, Encoding::Latin1),
    cs(63, "binary", "binary", true, Encoding::Binary),
    cs(65, "ascii", "ascii_bin", false, Encoding::Ascii),
    cs(76, "utf8mb3", "utf8mb3_tolower_ci", false, Encoding::Utf8),
    cs(83, "utf8mb3", "utf8mb3_bin", false, Encoding::Utf8),
    cs(94, "latin1", "latin1_spanish_ci", false, Encoding::Latin1),
    cs(192, "utf8mb3", "utf8mb3_unicode_ci", false, Encoding::Utf8),
    cs(223, "utf8mb3", "utf8mb3_general_mysql500_ci", false, Encoding::Utf8),
    cs(224, "utf8mb4", "utf8mb4_unicode_ci", false, Encoding::Utf8),
    cs(246, "utf8mb4", "utf8mb4_unicode_520_ci", false, Encoding::Utf8),
    cs(255, "utf8mb4", "utf8mb4_0900_ai_ci", false, Encoding::Utf8),
    cs(278, "utf8mb4", "utf8mb4_0900_as_cs", false, Encoding::Utf8),
    cs(305, "utf8mb4", "utf8mb4_0900_as_ci", false, Encoding::Utf8),
    cs(309, "utf8mb4", "utf8mb4_0900_bin", false, Encoding::Utf8),
];

/// Look up a character set by name, returning its default collation.
///
/// `utf8` is accepted as an alias of `utf8mb3`; matching is case-insensitive.
pub fn charset_by_name(name: &str) -> Option<&'static Charset> {
    let name = name.trim().to_ascii_lowercase();
    let name = if name == "utf8" { "utf8mb3" } else { name.as_str() };
    CHARSETS.iter().find(|c| c.is_default && c.name == name)
}

/// Look up a character set / collation by id.
pub fn charset_by_id(id: u16) -> Option<&'static Charset> {
    CHARSETS.iter().find(|c| c.id == id)
}

/// Windows-1252 bytes 0x80..=0x9F.
const CP1252_HIGH: [char; 32] = [
    '\u{20AC}', '\u{0081}', '\u{201A}', '\u{0192}', '\u{201E}', '\u{2026}', '\u{2020}', '\u{2021}',
    '\u{02C6}', '\u{2030}', '\u{0160}', '\u{2039}', '\u{0152}', '\u{008D}', '\u{017D}', '\u{008F}',
    '\u{0090}', '\u{2018}', '\u{2019}', '\u{201C}', '\u{201D}', '\u{2022}', '\u{2013}', '\u{2014}',
    '\u{02DC}', '\u{2122}', '\u{0161}', '\u{203A}', '\u{0153}', '\u{009D}', '\u{017E}', '\u{0178}',
];

fn cp1252_to_char(b: u8) -> char {
    if (0x80..=0x9F).contains(&b) {
        CP1252_HIGH[usize::from(b - 0x80)]
    } else {
        char::from(b)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn char_to_cp1252(c: char) -> Option<u8> {
    let code = u32::from(c);
    if code < 0x80 || (0xA0..=0xFF).contains(&code) {
        return Some(code as u8);
    }
    CP1252_HIGH
        .iter()
        .position(|&h| h == c)
        .map(|i| 0x80 + i as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_name() {
        let utf8mb4 = charset_by_name("utf8mb4").unwrap();
        assert_eq!(utf8mb4.id, 45);
        assert_eq!(utf8mb4.encoding, Encoding::Utf8);

        assert_eq!(charset_by_name("UTF8").unwrap().id, 33);
        assert_eq!(charset_by_name("latin1").unwrap().id, 8);
        assert!(charset_by_name("binary").unwrap().is_binary());
        assert!(charset_by_name("klingon").is_none());
    }

    #[test]
    fn test_lookup_by_id() {
        assert_eq!(charset_by_id(255).unwrap().collation, "utf8mb4_0900_ai_ci");
        assert_eq!(charset_by_id(48).unwrap().encoding, Encoding::Latin1);
        assert!(charset_by_id(63).unwrap().is_binary());
        assert!(charset_by_id(1000).is_none());
    }

    #[test]
    fn test_handshake_id_for_wide_collations() {
        assert_eq!(charset_by_id(309).unwrap().handshake_id(), 45);
        assert_eq!(charset_by_id(224).unwrap().handshake_id(), 224);
    }

    #[test]
    fn test_latin1_round_trip() {
        let bytes = [b'a', 0xE9, 0x80, 0x99];
        let text = Encoding::Latin1.decode(&bytes).unwrap();
        assert_eq!(text, "a\u{e9}\u{20ac}\u{2122}");
        assert_eq!(Encoding::Latin1.encode(&text), bytes.to_vec());
        assert_eq!(Encoding::Latin1.encode("\u{4e2d}"), b"?".to_vec());
    }

    #[test]
    fn test_utf8_and_ascii() {
        assert_eq!(Encoding::Utf8.decode("héllo".as_bytes()).unwrap(), "héllo");
        assert_eq!(Encoding::Utf8.decode(&[0xFF, 0xFE]), None);
        assert_eq!(Encoding::Ascii.decode(b"plain").unwrap(), "plain");
        assert_eq!(Encoding::Ascii.decode(&[0xE9]), None);
        assert_eq!(Encoding::Ascii.encode("é1"), b"?1".to_vec());
    }
}
