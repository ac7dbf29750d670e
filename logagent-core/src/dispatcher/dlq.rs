//! Dead-letter queue: append-only durable store for records
//! that exhausted retries, with a `reprocess` operation that re-injects
//! matching entries into the dispatcher.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::record::Record;

/// One durable DLQ row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub record: Record,
    pub failure_reason: String,
    pub failed_sink: String,
    pub retry_count: u32,
    pub context: std::collections::BTreeMap<String, String>,
    pub failed_at: DateTime<Utc>,
}

/// Selects which DLQ entries `reprocess` re-injects.
#[derive(Debug, Clone, Default)]
pub struct ReprocessFilter {
    pub source_id_prefix: Option<String>,
    pub sink_name: Option<String>,
    pub min_retry_count: Option<u32>,
    pub failed_after: Option<DateTime<Utc>>,
}

impl ReprocessFilter {
    fn matches(&self, entry: &DlqEntry) -> bool {
        if let Some(prefix) = &self.source_id_prefix {
            if !entry.record.source_id.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(sink) = &self.sink_name {
            if &entry.failed_sink != sink {
                return false;
            }
        }
        if let Some(min_retries) = self.min_retry_count {
            if entry.retry_count < min_retries {
                return false;
            }
        }
        if let Some(after) = self.failed_after {
            if entry.failed_at < after {
                return false;
            }
        }
        true
    }
}

#[derive(Debug)]
pub struct DeadLetterQueue {
    path: PathBuf,
    writer: Mutex<Option<File>>,
    len: AtomicU64,
}

impl DeadLetterQueue {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("dlq.jsonl");
        let len = count_lines(&path)?;
        Ok(DeadLetterQueue { path, writer: Mutex::new(None), len: AtomicU64::new(len) })
    }

    pub fn append(&self, entry: DlqEntry) -> Result<()> {
        let line = serde_json::to_vec(&entry)?;
        let mut guard = self.writer.lock();
        if guard.is_none() {
            *guard = Some(OpenOptions::new().create(true).append(true).open(&self.path)?);
        }
        let file = guard.as_mut().expect("just opened");
        file.write_all(&line)?;
        file.write_all(b"\n")?;
        file.flush()?;
        self.len.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_all(&self) -> Result<Vec<DlqEntry>> {
        match File::open(&self.path) {
            Ok(f) => {
                let mut out = Vec::new();
                for line in BufReader::new(f).lines() {
                    let line = line?;
                    if line.is_empty() {
                        continue;
                    }
                    out.push(serde_json::from_str(&line)?);
                }
                Ok(out)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(AgentError::Io(e)),
        }
    }

    /// Re-injects selected entries back into the dispatcher. Matching
    /// entries are removed from the durable store and returned to the
    /// caller for re-enqueue; non-matching entries are rewritten back.
    pub fn reprocess(&self, filter: &ReprocessFilter) -> Result<Vec<DlqEntry>> {
        let mut guard = self.writer.lock();
        *guard = None;

        let all = self.read_all()?;
        let (matched, remaining): (Vec<_>, Vec<_>) = all.into_iter().partition(|e| filter.matches(e));

        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut tmp_file = File::create(&tmp)?;
            for entry in &remaining {
                let line = serde_json::to_vec(entry)?;
                tmp_file.write_all(&line)?;
                tmp_file.write_all(b"\n")?;
            }
        }
        std::fs::rename(&tmp, &self.path)?;
        self.len.store(remaining.len() as u64, Ordering::Relaxed);

        Ok(matched)
    }

    pub fn stats(&self) -> Result<Vec<(String, u64)>> {
        let entries = self.read_all()?;
        let mut by_sink: std::collections::BTreeMap<String, u64> = std::collections::BTreeMap::new();
        for entry in entries {
            *by_sink.entry(entry.failed_sink).or_insert(0) += 1;
        }
        Ok(by_sink.into_iter().collect())
    }
}

fn count_lines(path: &std::path::Path) -> Result<u64> {
    match File::open(path) {
        Ok(f) => Ok(BufReader::new(f).lines().count() as u64),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(AgentError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Cursor, SourceType};

    fn entry(source_id: &str, sink: &str, retries: u32) -> DlqEntry {
        DlqEntry {
            record: Record::new(SourceType::File, source_id, Cursor::File { inode: 1, byte_offset: 0 }, b"line", Utc::now()),
            failure_reason: "boom".into(),
            failed_sink: sink.into(),
            retry_count: retries,
            context: Default::default(),
            failed_at: Utc::now(),
        }
    }

    #[test]
    fn append_then_stats_groups_by_sink() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = DeadLetterQueue::open(dir.path()).unwrap();
        dlq.append(entry("a.log", "remote_index", 5)).unwrap();
        dlq.append(entry("b.log", "remote_index", 5)).unwrap();
        dlq.append(entry("c.log", "local_file", 5)).unwrap();

        let stats = dlq.stats().unwrap();
        assert_eq!(stats, vec![("local_file".to_string(), 1), ("remote_index".to_string(), 2)]);
    }

    #[test]
    fn reprocess_removes_matched_entries_and_keeps_rest() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = DeadLetterQueue::open(dir.path()).unwrap();
        dlq.append(entry("a.log", "remote_index", 5)).unwrap();
        dlq.append(entry("b.log", "local_file", 5)).unwrap();

        let matched = dlq
            .reprocess(&ReprocessFilter { sink_name: Some("remote_index".into()), ..Default::default() })
            .unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(dlq.len(), 1);
    }

    #[test]
    fn round_trip_through_append_and_reprocess_preserves_record_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = DeadLetterQueue::open(dir.path()).unwrap();
        let original = entry("a.log", "remote_index", 3);
        let original_payload = original.record.payload.as_str().to_string();
        dlq.append(original).unwrap();

        let matched = dlq.reprocess(&ReprocessFilter::default()).unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].record.payload.as_str(), original_payload);
    }
}
