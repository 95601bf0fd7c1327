//! Cache entry codec.
//!
//! Every value written by the loader is one of two things:
//!
//! - a [`CacheEntry`], a payload plus an optional logical-expiry timestamp,
//!   encoded either as a versioned binary envelope or as JSON;
//! - the [`NULL_MARKER`], cached in place of a not-found result.
//!
//! # Binary format
//!
//! ```text
//! [MAGIC: 4 bytes "CSHD"] [VERSION: u32 LE] [POSTCARD PAYLOAD]
//! ```
//!
//! # JSON format
//!
//! ```text
//! {"data": <payload>, "expireTime": <unix millis | null>}
//! ```
//!
//! [`decode_entry`] detects the format from the first byte, so processes
//! writing either format can share one store.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Magic header identifying a binary cache envelope.
pub const CACHE_MAGIC: [u8; 4] = *b"CSHD";

/// Bump when the layout of cached payloads changes incompatibly.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Sentinel cached for keys known to be absent from the repository.
///
/// Starts with a NUL byte so it can never collide with a binary envelope
/// or a JSON document.
pub const NULL_MARKER: &[u8] = b"\0CSHD:null";

const HEADER_LEN: usize = 8;

/// Wire format used when writing entries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EntryFormat {
    /// Magic + version + postcard
    #[default]
    Binary,
    /// Self-describing JSON, readable by other processes sharing the store
    Json,
}

/// A cached payload with an optional logical expiry.
///
/// Entries without `logical_expiry` never report themselves stale; they live
/// until the store's physical TTL evicts them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    #[serde(rename = "data")]
    pub payload: T,
    /// Unix timestamp in milliseconds.
    #[serde(rename = "expireTime", default)]
    pub logical_expiry: Option<i64>,
}

impl<T> CacheEntry<T> {
    /// Entry governed only by the physical TTL.
    pub fn new(payload: T) -> Self {
        CacheEntry {
            payload,
            logical_expiry: None,
        }
    }

    /// Entry that becomes logically stale `window` from now.
    pub fn expiring_in(payload: T, window: Duration) -> Self {
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        CacheEntry {
            payload,
            logical_expiry: Some(now_millis().saturating_add(window_ms)),
        }
    }

    pub fn is_stale_at(&self, now_ms: i64) -> bool {
        self.logical_expiry.is_some_and(|expiry| now_ms >= expiry)
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale_at(now_millis())
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.logical_expiry.and_then(DateTime::from_timestamp_millis)
    }

    pub fn into_payload(self) -> T {
        self.payload
    }
}

/// Decoded value of a cache key.
#[derive(Debug, Clone, PartialEq)]
pub enum Cached<T> {
    Entry(CacheEntry<T>),
    /// The key is known to be absent from the repository.
    Null,
}

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Whether stored bytes mean "known absent".
///
/// Blank values count too: older writers cached an empty or whitespace
/// string for missing records.
pub fn is_null_marker(bytes: &[u8]) -> bool {
    bytes == NULL_MARKER || bytes.iter().all(u8::is_ascii_whitespace)
}

/// Encode an entry in the requested format.
pub fn encode_entry<T: Serialize>(entry: &CacheEntry<T>, format: EntryFormat) -> Result<Vec<u8>> {
    match format {
        EntryFormat::Binary => {
            let payload = postcard::to_allocvec(entry)
                .map_err(|e| Error::SerializationError(e.to_string()))?;
            let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
            bytes.extend_from_slice(&CACHE_MAGIC);
            bytes.extend_from_slice(&CURRENT_SCHEMA_VERSION.to_le_bytes());
            bytes.extend_from_slice(&payload);
            Ok(bytes)
        }
        EntryFormat::Json => {
            serde_json::to_vec(entry).map_err(|e| Error::SerializationError(e.to_string()))
        }
    }
}

/// Decode stored bytes into an entry or the null marker.
///
/// # Errors
///
/// - `Error::InvalidCacheEntry`: unknown format or truncated envelope
/// - `Error::VersionMismatch`: envelope from another schema version
/// - `Error::DeserializationError`: corrupted payload
pub fn decode_entry<T: DeserializeOwned>(bytes: &[u8]) -> Result<Cached<T>> {
    if is_null_marker(bytes) {
        return Ok(Cached::Null);
    }

    if bytes.first() == Some(&b'{') {
        let entry: CacheEntry<T> = serde_json::from_slice(bytes)?;
        return Ok(Cached::Entry(entry));
    }

    if bytes.len() < HEADER_LEN {
        return Err(Error::InvalidCacheEntry(format!(
            "entry too short: {} bytes",
            bytes.len()
        )));
    }

    let (header, payload) = bytes.split_at(HEADER_LEN);
    if header[..4] != CACHE_MAGIC {
        return Err(Error::InvalidCacheEntry("bad magic header".to_string()));
    }

    let mut version = [0u8; 4];
    version.copy_from_slice(&header[4..]);
    let found = u32::from_le_bytes(version);
    if found != CURRENT_SCHEMA_VERSION {
        return Err(Error::VersionMismatch {
            expected: CURRENT_SCHEMA_VERSION,
            found,
        });
    }

    let entry: CacheEntry<T> = postcard::from_bytes(payload)?;
    Ok(Cached::Entry(entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Shop {
        id: u64,
        name: String,
    }

    fn shop() -> Shop {
        Shop {
            id: 7,
            name: "Tea House".to_string(),
        }
    }

    #[test]
    fn test_binary_envelope_layout() {
        let bytes = encode_entry(&CacheEntry::new(shop()), EntryFormat::Binary).unwrap();
        assert_eq!(&bytes[..4], b"CSHD");
        assert_eq!(&bytes[4..8], &CURRENT_SCHEMA_VERSION.to_le_bytes());
    }

    #[test]
    fn test_logical_expiry_survives_both_formats() {
        let entry = CacheEntry::expiring_in(shop(), Duration::from_secs(30));
        for format in [EntryFormat::Binary, EntryFormat::Json] {
            let bytes = encode_entry(&entry, format).unwrap();
            match decode_entry::<Shop>(&bytes).unwrap() {
                Cached::Entry(decoded) => assert_eq!(decoded, entry),
                Cached::Null => panic!("decoded entry as null"),
            }
        }
    }

    #[test]
    fn test_json_uses_interop_field_names() {
        let entry = CacheEntry {
            payload: shop(),
            logical_expiry: Some(1_700_000_000_000),
        };
        let json: serde_json::Value =
            serde_json::from_slice(&encode_entry(&entry, EntryFormat::Json).unwrap()).unwrap();
        assert_eq!(json["data"]["name"], "Tea House");
        assert_eq!(json["expireTime"], 1_700_000_000_000_i64);
    }

    #[test]
    fn test_json_without_expire_time_is_fresh() {
        let bytes = br#"{"data":{"id":1,"name":"x"}}"#;
        match decode_entry::<Shop>(bytes).unwrap() {
            Cached::Entry(entry) => {
                assert_eq!(entry.logical_expiry, None);
                assert!(!entry.is_stale());
            }
            Cached::Null => panic!("expected entry"),
        }
    }

    #[test]
    fn test_null_marker_and_blank_values_decode_as_null() {
        assert_eq!(decode_entry::<Shop>(NULL_MARKER).unwrap(), Cached::Null);
        assert_eq!(decode_entry::<Shop>(b" ").unwrap(), Cached::Null);
        assert_eq!(decode_entry::<Shop>(b"").unwrap(), Cached::Null);
    }

    #[test]
    fn test_version_mismatch() {
        let mut bytes = encode_entry(&CacheEntry::new(shop()), EntryFormat::Binary).unwrap();
        bytes[4..8].copy_from_slice(&99u32.to_le_bytes());
        assert_eq!(
            decode_entry::<Shop>(&bytes).unwrap_err(),
            Error::VersionMismatch {
                expected: CURRENT_SCHEMA_VERSION,
                found: 99
            }
        );
    }

    #[test]
    fn test_bad_magic_and_truncation() {
        assert!(matches!(
            decode_entry::<Shop>(b"XXXX\x01\x00\x00\x00abc"),
            Err(Error::InvalidCacheEntry(_))
        ));
        assert!(matches!(
            decode_entry::<Shop>(b"CSH"),
            Err(Error::InvalidCacheEntry(_))
        ));
    }

    #[test]
    fn test_staleness_boundary() {
        let entry = CacheEntry {
            payload: shop(),
            logical_expiry: Some(1_000),
        };
        assert!(!entry.is_stale_at(999));
        assert!(entry.is_stale_at(1_000));
        assert!(entry.expires_at().is_some());
    }

    proptest! {
        #[test]
        fn prop_arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = decode_entry::<Shop>(&bytes);
        }

        #[test]
        fn prop_encoded_entries_never_read_as_null(id in any::<u64>(), name in ".{0,16}") {
            let entry = CacheEntry::new(Shop { id, name });
            for format in [EntryFormat::Binary, EntryFormat::Json] {
                let bytes = encode_entry(&entry, format).unwrap();
                prop_assert!(!is_null_marker(&bytes));
            }
        }
    }
}
