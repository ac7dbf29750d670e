//! Local file sink: one output file per pattern-derived name,
//! bounded open-file count with LRU eviction, periodic or per-batch fsync.
//! Two-level locking — a map mutex guarding which files are open, and a
//! per-file mutex guarding the handle itself — so that writing to file A
//! never blocks on I/O for file B. Lock order (map then file) is fixed
//! throughout to prevent deadlock.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::record::Record;

use super::Sink;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsyncPolicy {
    PerBatch,
    Periodic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSinkConfig {
    pub output_dir: PathBuf,
    /// Template over `source`/`date`/`hour`, e.g. `{source}-{date}.log`.
    #[serde(default = "default_template")]
    pub filename_template: String,
    #[serde(default = "default_max_open_files")]
    pub max_open_files: usize,
    #[serde(default = "default_fsync_policy")]
    pub fsync_policy: FsyncPolicy,
}

fn default_template() -> String {
    "{source}-{date}.log".to_string()
}

fn default_max_open_files() -> usize {
    256
}

fn default_fsync_policy() -> FsyncPolicy {
    FsyncPolicy::PerBatch
}

struct OpenFile {
    file: Mutex<File>,
    last_used: AtomicU64,
}

/// Open handles keyed by rendered filename. The map mutex is held only
/// long enough to look up or insert an entry; all I/O happens under the
/// per-file mutex after releasing it.
pub struct FileSink {
    name: String,
    config: FileSinkConfig,
    open_files: Mutex<HashMap<String, Arc<OpenFile>>>,
    clock: AtomicU64,
    evictions: AtomicI64,
}

impl std::fmt::Debug for FileSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSink").field("name", &self.name).finish()
    }
}

impl FileSink {
    pub fn new(name: impl Into<String>, config: FileSinkConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.output_dir)?;
        Ok(FileSink {
            name: name.into(),
            config,
            open_files: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(0),
            evictions: AtomicI64::new(0),
        })
    }

    fn render_name(&self, record: &Record) -> String {
        let date = record.timestamp.format("%Y-%m-%d").to_string();
        let hour = record.timestamp.format("%H").to_string();
        self.config
            .filename_template
            .replace("{source}", &sanitize(&record.source_id))
            .replace("{date}", &date)
            .replace("{hour}", &hour)
    }

    /// Returns a handle for `filename`, evicting the least-recently-used
    /// open handle first if `max_open_files` would otherwise be exceeded.
    /// Checks the limit before opening rather than after — opening then
    /// checking leaks an FD on every limit breach.
    fn acquire(&self, filename: &str) -> Result<Arc<OpenFile>> {
        let mut map = self.open_files.lock();
        if let Some(existing) = map.get(filename) {
            let tick = self.clock.fetch_add(1, Ordering::Relaxed);
            existing.last_used.store(tick, Ordering::Relaxed);
            return Ok(existing.clone());
        }

        if map.len() >= self.config.max_open_files {
            if let Some(lru_key) = map
                .iter()
                .min_by_key(|(_, f)| f.last_used.load(Ordering::Relaxed))
                .map(|(k, _)| k.clone())
            {
                map.remove(&lru_key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        let path = self.config.output_dir.join(filename);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(OpenFile { file: Mutex::new(file), last_used: AtomicU64::new(tick) });
        map.insert(filename.to_string(), handle.clone());
        Ok(handle)
    }

    pub fn open_file_count(&self) -> usize {
        self.open_files.lock().len()
    }

    pub fn eviction_count(&self) -> i64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars().map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' }).collect()
}

#[async_trait]
impl Sink for FileSink {
    async fn send(&self, records: &[Arc<Record>]) -> Result<()> {
        let mut by_filename: HashMap<String, Vec<&Arc<Record>>> = HashMap::new();
        for record in records {
            by_filename.entry(self.render_name(record)).or_default().push(record);
        }

        for (filename, group) in by_filename {
            let handle = self.acquire(&filename)?;
            let mut file = handle.file.lock();
            for record in group {
                file.write_all(record.payload.as_str().as_bytes())
                    .map_err(AgentError::Io)?;
                file.write_all(b"\n").map_err(AgentError::Io)?;
            }
            if matches!(self.config.fsync_policy, FsyncPolicy::PerBatch) {
                file.sync_data().map_err(AgentError::Io)?;
            }
        }
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Cursor, SourceType};

    fn record(source: &str, line: &str) -> Arc<Record> {
        Arc::new(Record::new(SourceType::File, source, Cursor::File { inode: 1, byte_offset: 0 }, line.as_bytes(), chrono::Utc::now()))
    }

    #[tokio::test]
    async fn writes_one_file_per_source() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(
            "local",
            FileSinkConfig {
                output_dir: dir.path().to_path_buf(),
                filename_template: "{source}.log".into(),
                max_open_files: 10,
                fsync_policy: FsyncPolicy::PerBatch,
            },
        )
        .unwrap();

        sink.send(&[record("app-a", "hello"), record("app-b", "world")]).await.unwrap();
        assert!(dir.path().join("app-a.log").exists());
        assert!(dir.path().join("app-b.log").exists());
    }

    #[tokio::test]
    async fn respects_max_open_files_via_lru_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(
            "local",
            FileSinkConfig {
                output_dir: dir.path().to_path_buf(),
                filename_template: "{source}.log".into(),
                max_open_files: 2,
                fsync_policy: FsyncPolicy::PerBatch,
            },
        )
        .unwrap();

        for i in 0..10 {
            sink.send(&[record(&format!("app-{i}"), "line")]).await.unwrap();
        }
        assert!(sink.open_file_count() <= 2);
        assert!(sink.eviction_count() > 0);
        for i in 0..10 {
            assert!(dir.path().join(format!("app-{i}.log")).exists());
        }
    }
}
