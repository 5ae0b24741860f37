//! gRPC metadata (headers and trailers).
//!
//! Metadata is a multi-valued map from lowercase ASCII keys to values. Keys
//! ending in `-bin` carry opaque byte strings that travel base64-encoded on
//! the wire; every other key carries printable ASCII. Iteration preserves
//! key insertion order, and values within a key keep append order.

use crate::status::Status;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;

/// Suffix marking a binary-valued metadata key.
pub const BINARY_SUFFIX: &str = "-bin";

/// A single metadata value: printable ASCII text or opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    Ascii(String),
    Binary(Bytes),
}

impl MetadataValue {
    /// The text form, if this is an ASCII value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Ascii(s) => Some(s),
            MetadataValue::Binary(_) => None,
        }
    }

    /// The byte form, if this is a binary value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            MetadataValue::Ascii(_) => None,
            MetadataValue::Binary(b) => Some(b),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::Ascii(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::Ascii(s)
    }
}

impl From<Bytes> for MetadataValue {
    fn from(b: Bytes) -> Self {
        MetadataValue::Binary(b)
    }
}

impl From<Vec<u8>> for MetadataValue {
    fn from(b: Vec<u8>) -> Self {
        MetadataValue::Binary(Bytes::from(b))
    }
}

/// gRPC metadata key-value pairs.
///
/// Keys are normalized to lowercase on insertion. `set` replaces, `add`
/// appends. Clones are deep copies.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    /// Keys in insertion order, each with its ordered value sequence.
    entries: Vec<(String, Vec<MetadataValue>)>,
}

impl Metadata {
    /// Create empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all values for `key` with a single value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Result<(), Status> {
        let key = normalize_key(key)?;
        let value = check_value(&key, value.into())?;
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => {
                values.clear();
                values.push(value);
            }
            None => self.entries.push((key, vec![value])),
        }
        Ok(())
    }

    /// Append a value for `key`, keeping any existing values.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Result<(), Status> {
        let key = normalize_key(key)?;
        let value = check_value(&key, value.into())?;
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => values.push(value),
            None => self.entries.push((key, vec![value])),
        }
        Ok(())
    }

    /// Remove all values for `key`.
    pub fn remove(&mut self, key: &str) {
        let key = key.to_ascii_lowercase();
        self.entries.retain(|(k, _)| *k != key);
    }

    /// The ordered value sequence for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&[MetadataValue]> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// The first ASCII value for `key`, if present.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.first()).and_then(|v| v.as_str())
    }

    /// Snapshot of single-valued keys. When a key holds several values the
    /// last one wins.
    pub fn get_map(&self) -> HashMap<String, MetadataValue> {
        self.entries
            .iter()
            .filter_map(|(k, v)| v.last().map(|v| (k.clone(), v.clone())))
            .collect()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        self.entries.iter().any(|(k, _)| *k == key)
    }

    /// Iterate over all entries in insertion order, one item per value.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.entries
            .iter()
            .flat_map(|(k, values)| values.iter().map(move |v| (k.as_str(), v)))
    }

    /// Append every entry of `other`, after this metadata's own entries.
    pub fn merge(&mut self, other: Metadata) {
        for (key, values) in other.entries {
            match self.entries.iter_mut().find(|(k, _)| *k == key) {
                Some((_, existing)) => existing.extend(values),
                None => self.entries.push((key, values)),
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries, counting duplicates.
    pub fn len(&self) -> usize {
        self.entries.iter().map(|(_, v)| v.len()).sum()
    }

    /// Serialize to wire header pairs. Binary values are base64-encoded,
    /// ASCII values pass through. Keys reserved for the protocol itself
    /// are dropped so application metadata cannot clobber pseudo-headers
    /// or trailer fields on the peer.
    pub fn to_wire(&self) -> Vec<(String, String)> {
        self.iter()
            .filter(|(k, _)| {
                if is_reserved_key(k) {
                    tracing::warn!(key = %k, "dropping reserved key from wire metadata");
                    return false;
                }
                true
            })
            .map(|(k, v)| {
                let value = match v {
                    MetadataValue::Ascii(s) => s.clone(),
                    MetadataValue::Binary(b) => BASE64.encode(b),
                };
                (k.to_string(), value)
            })
            .collect()
    }

    /// Parse wire header pairs back into metadata. Entries with invalid
    /// keys or undecodable base64 are skipped.
    pub fn from_wire<I, K, V>(pairs: I) -> Metadata
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut metadata = Metadata::new();
        for (key, value) in pairs {
            let key = key.as_ref();
            let value = value.as_ref();
            let result = if key.ends_with(BINARY_SUFFIX) {
                match BASE64.decode(value) {
                    Ok(bytes) => metadata.add(key, Bytes::from(bytes)),
                    Err(_) => {
                        tracing::warn!(key, "skipping undecodable binary metadata");
                        continue;
                    }
                }
            } else {
                metadata.add(key, value)
            };
            if result.is_err() {
                tracing::warn!(key, "skipping invalid metadata key");
            }
        }
        metadata
    }
}

/// Whether a header key is reserved for the protocol itself and must not be
/// carried as application metadata.
pub fn is_reserved_key(key: &str) -> bool {
    key.starts_with(':')
        || key == "content-type"
        || key == "te"
        || key == "grpc-status"
        || key == "grpc-message"
        || key == "grpc-timeout"
}

fn normalize_key(key: impl Into<String>) -> Result<String, Status> {
    let key = key.into().to_ascii_lowercase();
    let legal = !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_' || b == b'.');
    if !legal {
        return Err(Status::invalid_argument(format!("invalid metadata key: {:?}", key)));
    }
    Ok(key)
}

fn check_value(key: &str, value: MetadataValue) -> Result<MetadataValue, Status> {
    match (&value, key.ends_with(BINARY_SUFFIX)) {
        (MetadataValue::Binary(_), true) => Ok(value),
        (MetadataValue::Ascii(s), false) => {
            if s.bytes().all(|b| (0x20..0x7f).contains(&b)) {
                Ok(value)
            } else {
                Err(Status::invalid_argument(format!(
                    "metadata value for {:?} is not printable ASCII",
                    key
                )))
            }
        }
        (MetadataValue::Binary(_), false) => Err(Status::invalid_argument(format!(
            "binary value requires a -bin key, got {:?}",
            key
        ))),
        (MetadataValue::Ascii(_), true) => Err(Status::invalid_argument(format!(
            "-bin key {:?} requires a binary value",
            key
        ))),
    }
}

/// Remaining call time formatted for the `grpc-timeout` request header.
///
/// Format is `<value><unit>` with the largest unit that divides the value
/// exactly: `H`ours, `M`inutes, `S`econds, `m`illis, `u`icros, `n`anos.
#[derive(Debug, Clone, Copy)]
pub struct Timeout {
    nanos: u64,
}

impl Timeout {
    pub fn from_duration(duration: Duration) -> Self {
        Self {
            nanos: duration.as_nanos().min(u64::MAX as u128) as u64,
        }
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_nanos(self.nanos)
    }

    /// Format as a `grpc-timeout` header value.
    pub fn to_grpc_format(self) -> String {
        const UNITS: [(u64, char); 5] = [
            (3_600_000_000_000, 'H'),
            (60_000_000_000, 'M'),
            (1_000_000_000, 'S'),
            (1_000_000, 'm'),
            (1_000, 'u'),
        ];
        for (scale, unit) in UNITS {
            if self.nanos >= scale && self.nanos % scale == 0 {
                return format!("{}{}", self.nanos / scale, unit);
            }
        }
        format!("{}n", self.nanos)
    }
}
