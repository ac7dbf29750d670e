//! The unit of flow. A [`Record`] is created by a monitor, owned by
//! the dispatcher queue once enqueued, and from that point on is frozen:
//! `labels`/`fields` are reached only through copy-on-write accessors so that
//! a record fanned out to N sinks never exposes a mutable map to more than
//! one owner at a time.

use std::borrow::Cow;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a record originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    File,
    Container,
    Http,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::File => "file",
            SourceType::Container => "container",
            SourceType::Http => "http",
        }
    }
}

/// Opaque per-source cursor. File sources carry byte offset + inode;
/// container sources carry stream-start timestamp + line number in stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Cursor {
    File { inode: u64, byte_offset: u64 },
    Container { stream_start_ns: i64, line_number: u64 },
    /// Records pushed directly through the admin ingestion endpoint have no
    /// upstream offset to resume from; `sequence` only needs to be unique
    /// per process for dedup fingerprinting.
    Http { sequence: u64 },
}

impl Cursor {
    /// Ordering is only meaningful within the same variant and source; used
    /// by the position store to detect regression outside a rotation event.
    pub fn advances_from(&self, previous: &Cursor) -> bool {
        match (previous, self) {
            (
                Cursor::File { inode: pi, byte_offset: po },
                Cursor::File { inode: ni, byte_offset: no },
            ) => ni != pi || no >= po,
            (
                Cursor::Container { stream_start_ns: ps, line_number: pl },
                Cursor::Container { stream_start_ns: ns, line_number: nl },
            ) => ns != ps || nl >= pl,
            (Cursor::Http { sequence: ps }, Cursor::Http { sequence: ns }) => ns >= ps,
            _ => true,
        }
    }
}

/// A reason a timestamp was adjusted away from what the pipeline parsed,
/// preserved for audit even though the field on `Record` takes the clamped
/// value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampAdjustment {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub reason: String,
}

/// Copy-on-write string map. Clones of a `Record` share the underlying map
/// via `Arc` until a writer calls [`CowMap::set`], at which point the writer
/// gets its own copy and other holders are unaffected.
#[derive(Debug, Clone, Default)]
pub struct CowMap(Arc<std::collections::BTreeMap<String, String>>);

impl CowMap {
    pub fn new() -> Self {
        Self(Arc::new(std::collections::BTreeMap::new()))
    }

    pub fn from_map(map: std::collections::BTreeMap<String, String>) -> Self {
        Self(Arc::new(map))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy-on-write set: if this map is uniquely held, mutate in place;
    /// otherwise clone the underlying map first. Either way the caller's
    /// other clones of this `CowMap` are unaffected.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let map = Arc::make_mut(&mut self.0);
        map.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) {
        let map = Arc::make_mut(&mut self.0);
        map.remove(key);
    }
}

impl Serialize for CowMap {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CowMap {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let map = std::collections::BTreeMap::deserialize(deserializer)?;
        Ok(CowMap(Arc::new(map)))
    }
}

/// Non-UTF-8 input is replaced per byte sequence, never silently truncated
/// mid-codepoint; see [`Payload::from_bytes`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload(String);

impl Payload {
    pub fn from_bytes(bytes: &[u8]) -> (Self, bool) {
        match std::str::from_utf8(bytes) {
            Ok(s) => (Payload(s.to_string()), false),
            Err(_) => (Payload(String::from_utf8_lossy(bytes).into_owned()), true),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn truncate(&mut self, max_len: usize) -> bool {
        if self.0.len() <= max_len {
            return false;
        }
        let mut cut = max_len;
        while cut > 0 && !self.0.is_char_boundary(cut) {
            cut -= 1;
        }
        self.0.truncate(cut);
        true
    }
}

impl<'a> From<&'a Payload> for Cow<'a, str> {
    fn from(p: &'a Payload) -> Self {
        Cow::Borrowed(p.as_str())
    }
}

/// The unit of flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub source_type: SourceType,
    pub source_id: String,
    pub cursor: Cursor,
    pub timestamp: DateTime<Utc>,
    pub ingestion_timestamp: DateTime<Utc>,
    pub processed_timestamp: Option<DateTime<Utc>>,
    pub original_timestamp: Option<DateTime<Utc>>,
    pub payload: Payload,
    pub labels: CowMap,
    pub fields: CowMap,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub truncated: bool,
    pub timestamp_adjustments: Vec<TimestampAdjustment>,
    /// Monotonically increasing per-record retry attempt count, used by the
    /// retry scheduler and surfaced on DLQ entries.
    pub retry_count: u32,
}

impl Record {
    pub fn new(
        source_type: SourceType,
        source_id: impl Into<String>,
        cursor: Cursor,
        payload_bytes: &[u8],
        ingestion_timestamp: DateTime<Utc>,
    ) -> Self {
        let (payload, truncated_utf8) = Payload::from_bytes(payload_bytes);
        Record {
            source_type,
            source_id: source_id.into(),
            cursor,
            timestamp: ingestion_timestamp,
            ingestion_timestamp,
            processed_timestamp: None,
            original_timestamp: None,
            payload,
            labels: CowMap::new(),
            fields: CowMap::new(),
            trace_id: None,
            span_id: None,
            truncated: truncated_utf8,
            timestamp_adjustments: Vec::new(),
            retry_count: 0,
        }
    }

    /// Stable hash input for dedup fingerprinting: source id,
    /// offset, payload length, and payload content all participate so that
    /// two different lines landing at the same offset after a rotation race
    /// never collide.
    pub fn fingerprint_key(&self) -> FingerprintKey {
        FingerprintKey {
            source_id: self.source_id.clone(),
            cursor: self.cursor.clone(),
            payload_len: self.payload.len(),
            payload: self.payload.as_str().to_string(),
        }
    }

    /// Deep copy for sinks that cannot honor the immutability contract
    ///. Ordinary fan-out instead clones the `Arc`
    /// handles inside `CowMap`, which is cheap and still safe because
    /// readers never mutate without triggering copy-on-write.
    pub fn deep_clone(&self) -> Self {
        let mut labels = CowMap::new();
        for (k, v) in self.labels.iter() {
            labels.set(k, v);
        }
        let mut fields = CowMap::new();
        for (k, v) in self.fields.iter() {
            fields.set(k, v);
        }
        Record {
            labels,
            fields,
            ..self.clone()
        }
    }
}

/// Input to the fingerprint hash. Kept as a distinct type from
/// `Record` so the dedup cache never has to clone a whole record just to
/// check membership.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FingerprintKey {
    pub source_id: String,
    pub cursor: Cursor,
    pub payload_len: usize,
    pub payload: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fingerprint_key_changes_with_offset() {
        let a = Record::new(SourceType::File, "a.log", Cursor::File { inode: 1, byte_offset: 0 }, b"line", Utc::now());
        let b = Record::new(SourceType::File, "a.log", Cursor::File { inode: 1, byte_offset: 4 }, b"line", Utc::now());
        assert_ne!(a.fingerprint_key(), b.fingerprint_key());
    }

    #[test]
    fn deep_clone_labels_are_independent_of_the_original() {
        let mut original = Record::new(SourceType::File, "a.log", Cursor::File { inode: 1, byte_offset: 0 }, b"line", Utc::now());
        original.labels.set("k", "v");
        let mut cloned = original.deep_clone();
        cloned.labels.set("k", "v2");
        assert_eq!(original.labels.get("k"), Some("v"));
        assert_eq!(cloned.labels.get("k"), Some("v2"));
    }

    proptest! {
        /// `Payload::truncate` must never leave a dangling UTF-8 codepoint
        /// and must never lengthen the string.
        #[test]
        fn truncate_never_splits_a_codepoint(s in ".{0,200}", max_len in 0usize..250) {
            let (mut payload, _) = Payload::from_bytes(s.as_bytes());
            let original_len = payload.len();
            payload.truncate(max_len);
            prop_assert!(payload.len() <= original_len);
            prop_assert!(std::str::from_utf8(payload.as_str().as_bytes()).is_ok());
        }

        /// Cursor monotonicity is reflexive and forward-only within a
        /// matching variant.
        #[test]
        fn file_cursor_advances_iff_offset_non_decreasing(inode in 1u64..5, a in 0u64..10_000, b in 0u64..10_000) {
            let prev = Cursor::File { inode, byte_offset: a };
            let next = Cursor::File { inode, byte_offset: b };
            prop_assert_eq!(next.advances_from(&prev), b >= a);
        }
    }
}
