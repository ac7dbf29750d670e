//! Tails files, detects rotation, emits records with offsets.
//! Grounded on Vector's `kubernetes_logs` `FileServer` defaults
//! (64 KiB reads, bounded max line length, cooldown between rescans), with
//! a cursor model for what a restart should resume from.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::{Dispatcher, EnqueueOutcome};
use crate::error::{AgentError, Result};
use crate::position::PositionStore;
use crate::record::{Cursor, Record, SourceType};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StartFrom {
    Beginning,
    End,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultilineConfig {
    /// A line matching `pattern` starts a new logical record; lines that
    /// don't match are appended to the current one. `negate` inverts that
    /// (pattern identifies continuation lines instead of start lines).
    pub pattern: String,
    #[serde(default)]
    pub negate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMonitorConfig {
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(with = "humantime_serde", default = "default_rescan_interval")]
    pub rescan_interval: Duration,
    #[serde(default = "default_read_chunk_bytes")]
    pub read_chunk_bytes: usize,
    #[serde(with = "humantime_serde", default = "default_line_timeout")]
    pub line_timeout: Duration,
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
    #[serde(default = "default_start_from")]
    pub start_from: StartFrom,
    #[serde(default)]
    pub multiline: Option<MultilineConfig>,
    #[serde(with = "humantime_serde", default = "default_rotation_ttl")]
    pub rotation_ttl: Duration,
}

fn default_rescan_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_read_chunk_bytes() -> usize {
    64 * 1024
}

fn default_line_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_line_length() -> usize {
    1024 * 1024
}

fn default_start_from() -> StartFrom {
    StartFrom::End
}

fn default_rotation_ttl() -> Duration {
    Duration::from_secs(24 * 3600)
}

struct TrackedFile {
    handle: File,
    inode: u64,
    offset: u64,
    pending: Vec<u8>,
    pending_since: Option<std::time::Instant>,
    multiline_buffer: Option<Vec<u8>>,
    missing_since: Option<std::time::Instant>,
}

/// One monitor instance owns every file matched by its `include`/`exclude`
/// globs. Position advancement happens only after the dispatcher accepts
/// the record, so `tracked` and `positions` can
/// briefly disagree during an in-flight enqueue.
pub struct FileMonitor {
    config: FileMonitorConfig,
    dispatcher: Arc<Dispatcher>,
    positions: Arc<PositionStore>,
    tracked: Mutex<HashMap<PathBuf, TrackedFile>>,
    multiline_regex: Option<Regex>,
}

impl FileMonitor {
    pub fn new(config: FileMonitorConfig, dispatcher: Arc<Dispatcher>, positions: Arc<PositionStore>) -> Result<Self> {
        let multiline_regex = match &config.multiline {
            Some(m) => Some(Regex::new(&m.pattern).map_err(|e| AgentError::Config(format!("invalid multiline pattern: {e}")))?),
            None => None,
        };
        Ok(FileMonitor { config, dispatcher, positions, tracked: Mutex::new(HashMap::new()), multiline_regex })
    }

    fn discover(&self) -> Vec<PathBuf> {
        let mut matched = Vec::new();
        for pattern in &self.config.include {
            let Ok(paths) = glob::glob(pattern) else { continue };
            for entry in paths.flatten() {
                if !self.is_excluded(&entry) {
                    matched.push(entry);
                }
            }
        }
        matched
    }

    fn is_excluded(&self, path: &Path) -> bool {
        self.config.exclude.iter().any(|pattern| {
            glob::Pattern::new(pattern).map(|p| p.matches_path(path)).unwrap_or(false)
        })
    }

    fn source_id(path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }

    /// Periodic rescan loop.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.rescan_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.clone().poll_once(&shutdown).await;
                }
            }
        }
        self.flush_all_positions();
    }

    async fn poll_once(self: Arc<Self>, shutdown: &CancellationToken) {
        let discovered = self.discover();
        for path in &discovered {
            if shutdown.is_cancelled() {
                return;
            }
            self.clear_missing(path);
            if let Err(e) = self.clone().tail_once(path).await {
                tracing::warn!(path = %path.display(), error = %e, "file monitor read error");
            }
        }

        // A tracked file that dropped out of discovery (deleted, or excluded
        // by a config change) still has an open handle whose fd stays valid
        // per POSIX after unlink; drain it before starting the eviction TTL.
        for path in self.vanished_tracked_paths(&discovered) {
            if shutdown.is_cancelled() {
                return;
            }
            let source_id = Self::source_id(&path);
            if let Err(e) = self.drain_to_eof(&path, &source_id).await {
                tracing::warn!(path = %path.display(), error = %e, "file monitor drain-on-removal error");
            }
        }

        self.evict_vanished(&discovered);
    }

    fn vanished_tracked_paths(&self, discovered: &[PathBuf]) -> Vec<PathBuf> {
        self.tracked.lock().keys().filter(|path| !discovered.contains(path)).cloned().collect()
    }

    fn clear_missing(&self, path: &Path) {
        if let Some(entry) = self.tracked.lock().get_mut(path) {
            entry.missing_since = None;
        }
    }

    /// A file that drops out of discovery (deleted, or excluded by a config
    /// change) keeps its tracked state around for `rotation_ttl` in case it
    /// reappears before giving up its position, matching the same
    /// bounded-residency trade-off `PositionStore::evict` makes.
    fn evict_vanished(&self, discovered: &[PathBuf]) {
        let mut to_remove = Vec::new();
        {
            let mut tracked = self.tracked.lock();
            for (path, entry) in tracked.iter_mut() {
                if discovered.contains(path) {
                    continue;
                }
                let since = entry.missing_since.get_or_insert_with(std::time::Instant::now);
                if since.elapsed() >= self.config.rotation_ttl {
                    to_remove.push(path.clone());
                }
            }
            for path in &to_remove {
                tracked.remove(path);
            }
        }
        for path in to_remove {
            self.positions.remove(&Self::source_id(&path));
        }
    }

    /// Opens (or reopens, on rotation) the file and drains whatever is
    /// newly available, enforcing backpressure from the dispatcher by
    /// simply not advancing past a record the dispatcher rejected.
    async fn tail_once(self: Arc<Self>, path: &Path) -> Result<()> {
        let metadata = std::fs::metadata(path)?;
        let current_inode = metadata.ino();
        let current_len = metadata.len();
        let source_id = Self::source_id(path);

        let rotated = {
            let tracked = self.tracked.lock();
            tracked.get(path).map(|existing| existing.inode != current_inode).unwrap_or(false)
        };

        if rotated {
            // Finish draining the old inode on its own handle before the
            // tracked entry is replaced and that handle is dropped.
            self.drain_to_eof(path, &source_id).await?;
        }

        let needs_open = {
            let tracked = self.tracked.lock();
            match tracked.get(path) {
                Some(existing) => existing.inode != current_inode,
                None => true,
            }
        };

        if needs_open {
            self.open_or_reopen(path, &source_id, current_inode, current_len)?;
        } else {
            let mut tracked = self.tracked.lock();
            if let Some(entry) = tracked.get_mut(path) {
                if current_len < entry.offset {
                    // copytruncate rotation: file shrank under us, restart from offset 0.
                    entry.offset = 0;
                    entry.handle.seek(SeekFrom::Start(0))?;
                    self.positions.reset(&source_id, Cursor::File { inode: current_inode, byte_offset: 0 });
                }
            }
        }

        self.read_available(path, &source_id).await
    }

    fn open_or_reopen(&self, path: &Path, source_id: &str, inode: u64, current_len: u64) -> Result<()> {
        let mut handle = File::open(path)?;
        let stored = self.positions.get(source_id);
        let start_offset = match stored {
            Some(Cursor::File { inode: stored_inode, byte_offset }) if stored_inode == inode => byte_offset,
            _ => match self.config.start_from {
                StartFrom::Beginning => 0,
                StartFrom::End => current_len,
            },
        };
        handle.seek(SeekFrom::Start(start_offset))?;
        self.tracked.lock().insert(
            path.to_path_buf(),
            TrackedFile {
                handle,
                inode,
                offset: start_offset,
                pending: Vec::new(),
                pending_since: None,
                multiline_buffer: None,
                missing_since: None,
            },
        );
        self.positions.reset(source_id, Cursor::File { inode, byte_offset: start_offset });
        Ok(())
    }

    async fn read_available(&self, path: &Path, source_id: &str) -> Result<()> {
        loop {
            let chunk = {
                let mut tracked = self.tracked.lock();
                let Some(entry) = tracked.get_mut(path) else { return Ok(()) };
                let mut buf = vec![0u8; self.config.read_chunk_bytes];
                let n = entry.handle.read(&mut buf)?;
                if n == 0 {
                    None
                } else {
                    buf.truncate(n);
                    entry.pending.extend_from_slice(&buf);
                    Some(())
                }
            };
            if chunk.is_none() {
                self.flush_stalled_line(path, source_id).await?;
                return Ok(());
            }

            self.emit_complete_lines(path, source_id).await?;
        }
    }

    async fn emit_complete_lines(&self, path: &Path, source_id: &str) -> Result<()> {
        loop {
            let line = {
                let mut tracked = self.tracked.lock();
                let Some(entry) = tracked.get_mut(path) else { return Ok(()) };
                match entry.pending.iter().position(|&b| b == b'\n') {
                    Some(pos) => {
                        let line: Vec<u8> = entry.pending.drain(..=pos).collect();
                        entry.offset += line.len() as u64;
                        entry.pending_since = if entry.pending.is_empty() { None } else { Some(std::time::Instant::now()) };
                        Some(line)
                    }
                    None => {
                        if entry.pending_since.is_none() && !entry.pending.is_empty() {
                            entry.pending_since = Some(std::time::Instant::now());
                        }
                        None
                    }
                }
            };

            let Some(raw_line) = line else { return Ok(()) };
            let trimmed: &[u8] = raw_line.strip_suffix(b"\n").unwrap_or(&raw_line);
            self.handle_line(path, source_id, trimmed).await?;
        }
    }

    /// An incomplete trailing line is buffered until the next read, or
    /// until the line timeout (default 5s) forces emission.
    async fn flush_stalled_line(&self, path: &Path, source_id: &str) -> Result<()> {
        let forced = {
            let mut tracked = self.tracked.lock();
            let Some(entry) = tracked.get_mut(path) else { return Ok(()) };
            match entry.pending_since {
                Some(since) if since.elapsed() >= self.config.line_timeout && !entry.pending.is_empty() => {
                    let line = std::mem::take(&mut entry.pending);
                    entry.offset += line.len() as u64;
                    entry.pending_since = None;
                    Some(line)
                }
                _ => None,
            }
        };
        if let Some(line) = forced {
            self.handle_line(path, source_id, &line).await?;
        }
        Ok(())
    }

    /// Reads the tracked handle to EOF and force-emits any trailing partial
    /// line regardless of `line_timeout` — used when the handle is about to
    /// be replaced (rotation) or dropped (deletion) and won't see more data.
    async fn drain_to_eof(&self, path: &Path, source_id: &str) -> Result<()> {
        self.read_available(path, source_id).await?;

        let forced = {
            let mut tracked = self.tracked.lock();
            let Some(entry) = tracked.get_mut(path) else { return Ok(()) };
            if entry.pending.is_empty() {
                None
            } else {
                let line = std::mem::take(&mut entry.pending);
                entry.offset += line.len() as u64;
                entry.pending_since = None;
                Some(line)
            }
        };
        if let Some(line) = forced {
            self.handle_line(path, source_id, &line).await?;
        }
        Ok(())
    }

    async fn handle_line(&self, path: &Path, source_id: &str, line: &[u8]) -> Result<()> {
        let completed_line = match &self.multiline_regex {
            None => Some(line.to_vec()),
            Some(re) => self.accumulate_multiline(path, re, line),
        };

        let Some(mut payload) = completed_line else { return Ok(()) };
        let mut truncated = false;
        if payload.len() > self.config.max_line_length {
            payload.truncate(self.config.max_line_length);
            truncated = true;
        }

        let (inode, offset) = {
            let tracked = self.tracked.lock();
            let entry = tracked.get(path).expect("tracked entry present while handling its line");
            (entry.inode, entry.offset)
        };

        let mut record =
            Record::new(SourceType::File, source_id, Cursor::File { inode, byte_offset: offset }, &payload, chrono::Utc::now());
        record.labels.set("file_path", source_id);
        record.truncated = record.truncated || truncated;

        match self.dispatcher.enqueue(record).await {
            EnqueueOutcome::Accepted | EnqueueOutcome::Spilled => {
                self.positions.advance(source_id, Cursor::File { inode, byte_offset: offset });
                Ok(())
            }
            EnqueueOutcome::Rejected(e) => {
                tracing::warn!(source = source_id, error = %e, "dispatcher rejected record, holding read position");
                Err(e)
            }
        }
    }

    /// Buffers continuation lines until the next start-pattern line (or
    /// its negated form) arrives, then returns the joined record.
    fn accumulate_multiline(&self, path: &Path, re: &Regex, line: &[u8]) -> Option<Vec<u8>> {
        let is_start = {
            let text = String::from_utf8_lossy(line);
            let matches = re.is_match(&text);
            let negate = self.config.multiline.as_ref().map(|m| m.negate).unwrap_or(false);
            matches != negate
        };

        let mut tracked = self.tracked.lock();
        let entry = tracked.get_mut(path)?;

        if is_start {
            let previous = entry.multiline_buffer.take();
            entry.multiline_buffer = Some(line.to_vec());
            previous
        } else {
            match &mut entry.multiline_buffer {
                Some(buf) => {
                    buf.push(b'\n');
                    buf.extend_from_slice(line);
                    None
                }
                None => {
                    entry.multiline_buffer = Some(line.to_vec());
                    None
                }
            }
        }
    }

    fn flush_all_positions(&self) {
        let _ = self.positions.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{DeadLetterQueue, DispatcherConfig, PriorityClassifier, PriorityRuleConfig, RetryConfig};
    use crate::metrics::Registry;
    use crate::pipeline::Pipeline;
    use crate::sink::DiskBuffer;
    use std::io::Write as _;

    fn build_dispatcher(dir: &Path) -> (Arc<Dispatcher>, Arc<PositionStore>) {
        let metrics = Arc::new(Registry::new());
        let dlq = Arc::new(DeadLetterQueue::open(dir.join("dlq")).unwrap());
        let buffer = Arc::new(DiskBuffer::open(dir.join("buffer")).unwrap());
        let positions = Arc::new(PositionStore::new(dir.join("positions.json"), 1000, Duration::from_secs(86_400)));
        let dispatcher = Arc::new(Dispatcher::new(
            DispatcherConfig { worker_count: 1, ..Default::default() },
            Pipeline::new(Vec::new()),
            PriorityClassifier::new(PriorityRuleConfig::default()),
            Vec::new(),
            RetryConfig::default(),
            dlq,
            buffer,
            positions.clone(),
            metrics,
        ));
        (dispatcher, positions)
    }

    fn default_config(include: String) -> FileMonitorConfig {
        FileMonitorConfig {
            include: vec![include],
            exclude: Vec::new(),
            rescan_interval: Duration::from_secs(30),
            read_chunk_bytes: 64 * 1024,
            line_timeout: Duration::from_secs(5),
            max_line_length: 1024 * 1024,
            start_from: StartFrom::Beginning,
            multiline: None,
            rotation_ttl: Duration::from_secs(86_400),
        }
    }

    #[tokio::test]
    async fn tails_existing_lines_from_beginning() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("a.log");
        {
            let mut f = File::create(&log_path).unwrap();
            writeln!(f, "hello").unwrap();
            writeln!(f, "world").unwrap();
        }

        let (dispatcher, positions) = build_dispatcher(dir.path());
        let config = default_config(log_path.to_string_lossy().into_owned());
        let monitor = Arc::new(FileMonitor::new(config, dispatcher.clone(), positions.clone()).unwrap());

        let shutdown = CancellationToken::new();
        monitor.clone().poll_once(&shutdown).await;

        let source_id = FileMonitor::source_id(&log_path);
        assert!(positions.get(&source_id).is_some());
        assert_eq!(dispatcher.queue().len(), 2);
    }

    #[tokio::test]
    async fn forces_emission_of_stalled_partial_line_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("a.log");
        std::fs::write(&log_path, b"partial-no-newline").unwrap();

        let (dispatcher, positions) = build_dispatcher(dir.path());
        let mut config = default_config(log_path.to_string_lossy().into_owned());
        config.line_timeout = Duration::from_millis(1);
        let monitor = Arc::new(FileMonitor::new(config, dispatcher.clone(), positions.clone()).unwrap());

        let shutdown = CancellationToken::new();
        monitor.clone().poll_once(&shutdown).await;
        assert_eq!(dispatcher.queue().len(), 0);

        tokio::time::sleep(Duration::from_millis(10)).await;
        monitor.clone().poll_once(&shutdown).await;
        assert_eq!(dispatcher.queue().len(), 1);
    }

    #[tokio::test]
    async fn reopens_from_offset_zero_after_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("a.log");
        {
            let mut f = File::create(&log_path).unwrap();
            writeln!(f, "first-line-before-truncate").unwrap();
        }

        let (dispatcher, positions) = build_dispatcher(dir.path());
        let config = default_config(log_path.to_string_lossy().into_owned());
        let monitor = Arc::new(FileMonitor::new(config, dispatcher.clone(), positions.clone()).unwrap());
        let shutdown = CancellationToken::new();
        monitor.clone().poll_once(&shutdown).await;
        assert_eq!(dispatcher.queue().len(), 1);

        // copytruncate rotation: same inode, shorter file.
        std::fs::write(&log_path, b"").unwrap();
        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&log_path).unwrap();
            writeln!(f, "after-truncate").unwrap();
        }
        monitor.clone().poll_once(&shutdown).await;
        assert_eq!(dispatcher.queue().len(), 2);
    }

    #[tokio::test]
    async fn rename_rotation_drains_old_inodes_tail_before_switching() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("a.log");
        std::fs::write(&log_path, b"unterminated-tail").unwrap();

        let (dispatcher, positions) = build_dispatcher(dir.path());
        let config = default_config(log_path.to_string_lossy().into_owned());
        let monitor = Arc::new(FileMonitor::new(config, dispatcher.clone(), positions.clone()).unwrap());
        let shutdown = CancellationToken::new();

        monitor.clone().poll_once(&shutdown).await;
        assert_eq!(dispatcher.queue().len(), 0);

        // rename-rotation: a new inode appears at the same path while the
        // old handle still has an unread, unterminated tail.
        std::fs::remove_file(&log_path).unwrap();
        std::fs::write(&log_path, b"new-line\n").unwrap();

        monitor.clone().poll_once(&shutdown).await;
        assert_eq!(dispatcher.queue().len(), 2);
    }

    #[tokio::test]
    async fn deleted_file_drains_trailing_partial_line_before_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("a.log");
        std::fs::write(&log_path, b"partial-no-newline").unwrap();

        let (dispatcher, positions) = build_dispatcher(dir.path());
        let config = default_config(log_path.to_string_lossy().into_owned());
        let monitor = Arc::new(FileMonitor::new(config, dispatcher.clone(), positions.clone()).unwrap());
        let shutdown = CancellationToken::new();

        monitor.clone().poll_once(&shutdown).await;
        assert_eq!(dispatcher.queue().len(), 0);

        std::fs::remove_file(&log_path).unwrap();
        monitor.clone().poll_once(&shutdown).await;

        assert_eq!(dispatcher.queue().len(), 1);
    }
}
