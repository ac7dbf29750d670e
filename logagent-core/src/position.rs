//! Durable `{source_id → cursor}` map. Writes are buffered in
//! memory and flushed on an interval plus on clean shutdown; each flush is
//! write-to-temp-then-rename so a crash mid-write never corrupts the file
//! on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::record::Cursor;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionEntry {
    pub cursor: Cursor,
    pub last_seen: SystemTime,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PositionFile {
    entries: HashMap<String, PositionEntry>,
}

/// In-memory positions with bounded residency backed by a single
/// on-disk file per source type.
#[derive(Debug)]
pub struct PositionStore {
    path: PathBuf,
    state: RwLock<PositionFile>,
    max_resident: usize,
    eviction_ttl: Duration,
}

impl PositionStore {
    pub fn new(path: impl Into<PathBuf>, max_resident: usize, eviction_ttl: Duration) -> Self {
        PositionStore {
            path: path.into(),
            state: RwLock::new(PositionFile::default()),
            max_resident,
            eviction_ttl,
        }
    }

    /// Loads the on-disk file if present; a missing file is not an error
    /// (first run), a malformed file is (spec: "forward-compatible reader
    /// required", which we satisfy by refusing to silently discard state we
    /// don't understand).
    pub fn load(path: impl Into<PathBuf>, max_resident: usize, eviction_ttl: Duration) -> Result<Self> {
        let path = path.into();
        let state = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| AgentError::Config(format!("corrupt position file {}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PositionFile::default(),
            Err(e) => return Err(AgentError::Io(e)),
        };
        Ok(PositionStore {
            path,
            state: RwLock::new(state),
            max_resident,
            eviction_ttl,
        })
    }

    /// A position is only advanced after the dispatcher has accepted
    /// ownership of the record. Callers must only invoke this after
    /// enqueue (or disk-buffer spill) succeeds, never speculatively.
    pub fn advance(&self, source_id: &str, cursor: Cursor) {
        let mut state = self.state.write();
        let advances = state
            .entries
            .get(source_id)
            .map(|existing| cursor.advances_from(&existing.cursor))
            .unwrap_or(true);
        if advances {
            state.entries.insert(
                source_id.to_string(),
                PositionEntry { cursor, last_seen: SystemTime::now() },
            );
        }
    }

    /// Explicit reset for detected rotation.
    pub fn reset(&self, source_id: &str, cursor: Cursor) {
        let mut state = self.state.write();
        state
            .entries
            .insert(source_id.to_string(), PositionEntry { cursor, last_seen: SystemTime::now() });
    }

    pub fn get(&self, source_id: &str) -> Option<Cursor> {
        self.state.read().entries.get(source_id).map(|e| e.cursor.clone())
    }

    pub fn remove(&self, source_id: &str) {
        self.state.write().entries.remove(source_id);
    }

    pub fn snapshot(&self) -> HashMap<String, PositionEntry> {
        self.state.read().entries.clone()
    }

    /// LRU eviction by `last_seen` bounded by both count and TTL (spec
    /// §4.6). Intended to run alongside the periodic flush.
    pub fn evict(&self) {
        let mut state = self.state.write();
        let now = SystemTime::now();
        state.entries.retain(|_, entry| {
            now.duration_since(entry.last_seen).unwrap_or_default() < self.eviction_ttl
        });
        if state.entries.len() > self.max_resident {
            let mut by_age: Vec<(String, SystemTime)> =
                state.entries.iter().map(|(k, v)| (k.clone(), v.last_seen)).collect();
            by_age.sort_by_key(|(_, last_seen)| *last_seen);
            let excess = state.entries.len() - self.max_resident;
            for (key, _) in by_age.into_iter().take(excess) {
                state.entries.remove(&key);
            }
        }
    }

    /// Atomic flush: serialize, write to a temp file in the same directory,
    /// then rename over the target. All writes are tmp+rename, never
    /// in-place.
    pub fn flush(&self) -> Result<()> {
        let snapshot = self.state.read();
        let bytes = serde_json::to_vec_pretty(&*snapshot)?;
        write_atomic(&self.path, &bytes)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let tmp = dir.join(format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("position"),
        std::process::id()
    ));
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_cursor(offset: u64) -> Cursor {
        Cursor::File { inode: 1, byte_offset: offset }
    }

    #[test]
    fn advance_accepts_forward_progress() {
        let store = PositionStore::new("/tmp/does-not-matter", 10_000, Duration::from_secs(86_400));
        store.advance("a.log", file_cursor(10));
        store.advance("a.log", file_cursor(20));
        assert_eq!(store.get("a.log"), Some(file_cursor(20)));
    }

    #[test]
    fn advance_rejects_regression_within_same_inode() {
        let store = PositionStore::new("/tmp/does-not-matter", 10_000, Duration::from_secs(86_400));
        store.advance("a.log", file_cursor(20));
        store.advance("a.log", file_cursor(5));
        assert_eq!(store.get("a.log"), Some(file_cursor(20)));
    }

    #[test]
    fn reset_allows_regression_for_rotation() {
        let store = PositionStore::new("/tmp/does-not-matter", 10_000, Duration::from_secs(86_400));
        store.advance("a.log", file_cursor(20));
        store.reset("a.log", Cursor::File { inode: 2, byte_offset: 0 });
        assert_eq!(store.get("a.log"), Some(Cursor::File { inode: 2, byte_offset: 0 }));
    }

    #[test]
    fn flush_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.json");
        let store = PositionStore::new(&path, 10_000, Duration::from_secs(86_400));
        store.advance("a.log", file_cursor(42));
        store.flush().unwrap();

        let reloaded = PositionStore::load(&path, 10_000, Duration::from_secs(86_400)).unwrap();
        assert_eq!(reloaded.get("a.log"), Some(file_cursor(42)));
    }

    #[test]
    fn eviction_respects_max_resident() {
        let store = PositionStore::new("/tmp/does-not-matter", 2, Duration::from_secs(86_400));
        store.advance("a", file_cursor(1));
        store.advance("b", file_cursor(1));
        store.advance("c", file_cursor(1));
        store.evict();
        assert_eq!(store.snapshot().len(), 2);
    }
}
