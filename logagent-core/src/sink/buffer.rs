//! Overflow persistence when the dispatcher queue saturates. Append-only
//! newline-delimited JSON, drained back into the queue once the worker
//! pool catches up — same on-disk shape as the DLQ so both can share the
//! same rotation/atomic-write helper if this grows further.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{AgentError, Result};
use crate::record::Record;

#[derive(Debug)]
pub struct DiskBuffer {
    dir: PathBuf,
    writer: Mutex<Option<File>>,
    len: AtomicU64,
}

impl DiskBuffer {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let len = count_spilled(&dir)?;
        Ok(DiskBuffer { dir, writer: Mutex::new(None), len: AtomicU64::new(len) })
    }

    fn spill_path(&self) -> PathBuf {
        self.dir.join("spill.jsonl")
    }

    pub fn push(&self, record: &Record) -> Result<()> {
        let line = serde_json::to_vec(record)?;
        let mut guard = self.writer.lock();
        if guard.is_none() {
            *guard = Some(OpenOptions::new().create(true).append(true).open(self.spill_path())?);
        }
        let file = guard.as_mut().expect("just opened");
        file.write_all(&line)?;
        file.write_all(b"\n")?;
        file.flush()?;
        self.len.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Drains up to `max` records, removing them from the backing file.
    /// Implemented as read-all-then-truncate-and-rewrite-remainder, which
    /// is adequate for the overflow path (not the steady-state hot path).
    pub fn drain(&self, max: usize) -> Result<Vec<Record>> {
        let mut guard = self.writer.lock();
        *guard = None; // release the append handle before rewriting

        let path = self.spill_path();
        let records = match File::open(&path) {
            Ok(f) => {
                let reader = BufReader::new(f);
                let mut all = Vec::new();
                for line in reader.lines() {
                    let line = line?;
                    if line.is_empty() {
                        continue;
                    }
                    all.push(serde_json::from_str::<Record>(&line)?);
                }
                all
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(AgentError::Io(e)),
        };

        let take = max.min(records.len());
        let (drained, remaining) = records.split_at(take);

        let tmp = self.dir.join(".spill.jsonl.tmp");
        {
            let mut tmp_file = File::create(&tmp)?;
            for record in remaining {
                let line = serde_json::to_vec(record)?;
                tmp_file.write_all(&line)?;
                tmp_file.write_all(b"\n")?;
            }
        }
        std::fs::rename(&tmp, &path)?;

        self.len.store(remaining.len() as u64, Ordering::Relaxed);
        Ok(drained.to_vec())
    }

    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn count_spilled(dir: &std::path::Path) -> Result<u64> {
    let path = dir.join("spill.jsonl");
    match File::open(&path) {
        Ok(f) => Ok(BufReader::new(f).lines().count() as u64),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(AgentError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Cursor, SourceType};

    fn record(n: u64) -> Record {
        Record::new(
            SourceType::File,
            "a.log",
            Cursor::File { inode: 1, byte_offset: n },
            b"line",
            chrono::Utc::now(),
        )
    }

    #[test]
    fn push_then_drain_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = DiskBuffer::open(dir.path()).unwrap();
        buffer.push(&record(1)).unwrap();
        buffer.push(&record(2)).unwrap();
        assert_eq!(buffer.len(), 2);

        let drained = buffer.drain(10).unwrap();
        assert_eq!(drained.len(), 2);
        assert!(buffer.is_empty());
    }

    #[test]
    fn partial_drain_leaves_remainder() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = DiskBuffer::open(dir.path()).unwrap();
        for i in 0..5 {
            buffer.push(&record(i)).unwrap();
        }
        let drained = buffer.drain(3).unwrap();
        assert_eq!(drained.len(), 3);
        assert_eq!(buffer.len(), 2);
    }
}
