//! MySQL option files (`my.cnf` / `my.ini`).
//!
//! ```text
//! # comment
//! [client]
//! user = app
//! password = "s3cret"
//! default-character-set = latin1
//! ```
//!
//! Option names are case-insensitive and `_` is equivalent to `-`. Values may
//! be wrapped in single or double quotes. `!include` directives are ignored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sqlwire_core::{ConfigError, Error};

/// Parsed option file: group name -> option name -> value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionFile {
    groups: HashMap<String, HashMap<String, String>>,
}

impl OptionFile {
    /// Read and parse an option file. A leading `~` expands to `$HOME`.
    ///
    /// A missing file yields an empty option set.
    pub fn read(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = expand_home(path.as_ref());
        match std::fs::read_to_string(&path) {
            Ok(text) => Self::parse(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "option file not found");
                Ok(Self::default())
            }
            Err(e) => Err(Error::Config(ConfigError {
                message: format!("cannot read option file {}: {}", path.display(), e),
                source: Some(Box::new(e)),
            })),
        }
    }

    /// Parse option-file text.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut groups: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current: Option<String> = None;

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('!') {
                tracing::debug!(line = idx + 1, directive = line, "ignoring option file directive");
                continue;
            }

            if let Some(rest) = line.strip_prefix('[') {
                let Some(name) = rest.strip_suffix(']') else {
                    return Err(parse_error(idx, "unterminated group header"));
                };
                let name = name.trim().to_ascii_lowercase();
                groups.entry(name.clone()).or_default();
                current = Some(name);
                continue;
            }

            let Some(group) = current.as_ref() else {
                return Err(parse_error(idx, "option outside of any group"));
            };

            let (key, value) = match line.split_once('=') {
                Some((k, v)) => (k.trim(), unquote(strip_comment(v.trim()))),
                None => (line, ""),
            };
            if key.is_empty() {
                return Err(parse_error(idx, "missing option name"));
            }

            groups
                .entry(group.clone())
                .or_default()
                .insert(normalize_key(key), value.to_string());
        }

        Ok(Self { groups })
    }

    /// Look up `key` in `group`.
    pub fn get(&self, group: &str, key: &str) -> Option<&str> {
        self.groups
            .get(&group.to_ascii_lowercase())?
            .get(&normalize_key(key))
            .map(String::as_str)
    }

    /// Whether `group` appears in the file.
    pub fn has_group(&self, group: &str) -> bool {
        self.groups.contains_key(&group.to_ascii_lowercase())
    }
}

fn parse_error(idx: usize, what: &str) -> Error {
    Error::Config(ConfigError {
        message: format!("option file line {}: {}", idx + 1, what),
        source: None,
    })
}

fn normalize_key(key: &str) -> String {
    key.trim().to_ascii_lowercase().replace('_', "-")
}

fn strip_comment(value: &str) -> &str {
    if value.starts_with('"') || value.starts_with('\'') {
        return value;
    }
    match value.find(" #") {
        Some(pos) => value[..pos].trim_end(),
        None => value,
    }
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' || first == b'\'') && first == last {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}
