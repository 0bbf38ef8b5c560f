//! File Update Log
//!
//! A partitioned update log backed by JSON-lines files, one per partition:
//!
//! ```text
//! <log_dir>/<topic>/partition-0.jsonl
//! <log_dir>/<topic>/partition-1.jsonl
//! ```
//!
//! Each line is `{"key": "...", "value": {...}}` with `"value": null` for a
//! tombstone. A record's offset is its zero-based index among the non-empty
//! lines; blank lines are skipped. Files are only ever appended to; the log
//! tails them incrementally, keeping only the byte position of each record
//! in memory and reading records back from disk on fetch.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::ports::{LogBatch, RawRecord, UpdateLog};
use crate::error::{Error, Result};

/// Poll interval while tailing for new lines
const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Serialize, Deserialize)]
struct LogLine {
    key: String,
    #[serde(default)]
    value: Option<serde_json::Value>,
}

#[derive(Debug, Default)]
struct PartitionTail {
    /// Bytes indexed so far (always at a line boundary)
    position: u64,
    /// Byte position of each record's line, indexed by offset
    starts: Vec<u64>,
}

/// Update log over JSON-lines files.
pub struct FileUpdateLog {
    topic: String,
    dir: PathBuf,
    tails: Mutex<BTreeMap<u32, PartitionTail>>,
}

impl FileUpdateLog {
    /// Open `<log_dir>/<topic>`, creating `partitions` empty files when the
    /// directory holds none yet.
    pub async fn open(log_dir: impl AsRef<Path>, topic: impl Into<String>, partitions: u32) -> Result<Self> {
        let topic = topic.into();
        let dir = log_dir.as_ref().join(&topic);
        tokio::fs::create_dir_all(&dir).await?;

        let mut found = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(partition) = parse_partition_file(&entry.file_name().to_string_lossy()) {
                found.push(partition);
            }
        }
        if found.is_empty() {
            for partition in 0..partitions.max(1) {
                tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(partition_path(&dir, partition))
                    .await?;
                found.push(partition);
            }
        }

        debug!(topic = %topic, dir = %dir.display(), partitions = ?found, "Opened file update log");
        Ok(Self {
            topic,
            dir,
            tails: Mutex::new(found.into_iter().map(|p| (p, PartitionTail::default())).collect()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn unknown_partition(&self, partition: u32) -> Error {
        Error::UpdateLog {
            topic: self.topic.clone(),
            reason: format!("unknown partition {}", partition),
        }
    }

    /// Append one record; `None` writes a tombstone. Returns its offset.
    pub async fn append(&self, partition: u32, key: &str, value: Option<&serde_json::Value>) -> Result<u64> {
        let mut tails = self.tails.lock().await;
        let tail = tails
            .get_mut(&partition)
            .ok_or_else(|| self.unknown_partition(partition))?;
        self.catch_up(partition, tail).await?;

        let mut line = serde_json::to_vec(&LogLine {
            key: key.to_string(),
            value: value.cloned(),
        })?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(partition_path(&self.dir, partition))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;

        self.catch_up(partition, tail).await?;
        Ok(tail.starts.len() as u64 - 1)
    }

    /// Index lines appended since the last call.
    async fn catch_up(&self, partition: u32, tail: &mut PartitionTail) -> Result<()> {
        let mut file = tokio::fs::File::open(partition_path(&self.dir, partition)).await?;
        let len = file.metadata().await?.len();
        if len < tail.position {
            return Err(Error::UpdateLog {
                topic: self.topic.clone(),
                reason: format!("partition {} file shrank", partition),
            });
        }
        if len == tail.position {
            return Ok(());
        }

        file.seek(std::io::SeekFrom::Start(tail.position)).await?;
        let mut reader = BufReader::new(file);
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = reader.read_until(b'\n', &mut line).await?;
            // a trailing partial line is left for the next call
            if read == 0 || line.last() != Some(&b'\n') {
                break;
            }
            if line.len() > 1 {
                tail.starts.push(tail.position);
            }
            tail.position += read as u64;
        }
        Ok(())
    }

    fn parse_line(&self, partition: u32, offset: u64, line: &[u8]) -> RawRecord {
        match serde_json::from_slice::<LogLine>(line) {
            Ok(parsed) => {
                let payload = parsed
                    .value
                    .filter(|v| !v.is_null())
                    .and_then(|v| serde_json::to_vec(&v).ok())
                    .map(Bytes::from);
                RawRecord {
                    partition,
                    offset,
                    key: Some(parsed.key),
                    payload,
                }
            }
            Err(e) => {
                // handed to the decoder as-is so it is counted there
                warn!(topic = %self.topic, partition, offset, "Malformed log line: {}", e);
                RawRecord {
                    partition,
                    offset,
                    key: None,
                    payload: Some(Bytes::copy_from_slice(line)),
                }
            }
        }
    }

    async fn read(&self, partition: u32, from: u64, max_records: usize) -> Result<(Vec<RawRecord>, u64)> {
        let mut tails = self.tails.lock().await;
        let tail = tails
            .get_mut(&partition)
            .ok_or_else(|| self.unknown_partition(partition))?;
        self.catch_up(partition, tail).await?;

        let end = tail.starts.len() as u64;
        if from >= end || max_records == 0 {
            return Ok((Vec::new(), end));
        }
        let last = end.min(from.saturating_add(max_records as u64));

        let mut file = tokio::fs::File::open(partition_path(&self.dir, partition)).await?;
        file.seek(std::io::SeekFrom::Start(tail.starts[from as usize])).await?;
        let mut reader = BufReader::new(file);

        let mut records = Vec::with_capacity((last - from) as usize);
        let mut line = Vec::new();
        let mut offset = from;
        while offset < last {
            line.clear();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                break;
            }
            let body = line.strip_suffix(b"\n").unwrap_or(&line[..]);
            if body.is_empty() {
                continue;
            }
            records.push(self.parse_line(partition, offset, body));
            offset += 1;
        }
        Ok((records, end))
    }
}

fn partition_path(dir: &Path, partition: u32) -> PathBuf {
    dir.join(format!("partition-{}.jsonl", partition))
}

fn parse_partition_file(name: &str) -> Option<u32> {
    name.strip_prefix("partition-")?
        .strip_suffix(".jsonl")?
        .parse()
        .ok()
}

#[async_trait]
impl UpdateLog for FileUpdateLog {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn partitions(&self) -> Result<Vec<u32>> {
        Ok(self.tails.lock().await.keys().copied().collect())
    }

    async fn earliest_offset(&self, partition: u32) -> Result<u64> {
        if self.tails.lock().await.contains_key(&partition) {
            Ok(0)
        } else {
            Err(self.unknown_partition(partition))
        }
    }

    async fn end_offset(&self, partition: u32) -> Result<u64> {
        Ok(self.read(partition, u64::MAX, 0).await?.1)
    }

    async fn fetch(
        &self,
        partition: u32,
        from: u64,
        max_records: usize,
        wait: Duration,
    ) -> Result<LogBatch> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let (records, _) = self.read(partition, from, max_records).await?;
            let now = tokio::time::Instant::now();
            if !records.is_empty() || now >= deadline {
                return Ok(LogBatch::Records(records));
            }
            tokio::time::sleep(TAIL_POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_creates_partitions() {
        let dir = TempDir::new().unwrap();
        let log = FileUpdateLog::open(dir.path(), "countries", 3).await.unwrap();

        assert_eq!(log.partitions().await.unwrap(), vec![0, 1, 2]);
        assert!(dir.path().join("countries/partition-2.jsonl").exists());
        assert_eq!(log.end_offset(0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_append_and_fetch() {
        let dir = TempDir::new().unwrap();
        let log = FileUpdateLog::open(dir.path(), "countries", 1).await.unwrap();

        assert_eq!(log.append(0, "US", Some(&json!({"name": "USA"}))).await.unwrap(), 0);
        assert_eq!(log.append(0, "FR", None).await.unwrap(), 1);

        let batch = log.fetch(0, 0, 10, Duration::ZERO).await.unwrap();
        assert_matches!(batch, LogBatch::Records(records) => {
            assert_eq!(records.len(), 2);
            assert_eq!(records[0].key.as_deref(), Some("US"));
            assert!(records[0].payload.is_some());
            assert!(records[1].payload.is_none());
        });
        assert_eq!(log.end_offset(0).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reopen_discovers_existing_files() {
        let dir = TempDir::new().unwrap();
        {
            let log = FileUpdateLog::open(dir.path(), "t", 2).await.unwrap();
            log.append(1, "a", Some(&json!({"v": 1}))).await.unwrap();
        }

        let log = FileUpdateLog::open(dir.path(), "t", 8).await.unwrap();
        assert_eq!(log.partitions().await.unwrap(), vec![0, 1]);
        assert_eq!(log.end_offset(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_tails_externally_written_lines() {
        let dir = TempDir::new().unwrap();
        let log = FileUpdateLog::open(dir.path(), "t", 1).await.unwrap();
        let path = dir.path().join("t/partition-0.jsonl");

        std::fs::write(&path, "{\"key\":\"a\",\"value\":{\"v\":1}}\nnot json\n{\"key\":\"b\"").unwrap();
        assert_eq!(log.end_offset(0).await.unwrap(), 2);

        let batch = log.fetch(0, 1, 10, Duration::ZERO).await.unwrap();
        assert_matches!(batch, LogBatch::Records(records) => {
            assert_eq!(records.len(), 1);
            assert!(records[0].key.is_none());
        });
    }

    #[tokio::test]
    async fn test_blank_lines_take_no_offset() {
        let dir = TempDir::new().unwrap();
        let log = FileUpdateLog::open(dir.path(), "t", 1).await.unwrap();
        let path = dir.path().join("t/partition-0.jsonl");

        std::fs::write(&path, "{\"key\":\"a\"}\n\n\n{\"key\":\"b\"}\n").unwrap();
        assert_eq!(log.end_offset(0).await.unwrap(), 2);
        assert_eq!(log.append(0, "c", None).await.unwrap(), 2);

        let batch = log.fetch(0, 1, 10, Duration::ZERO).await.unwrap();
        assert_matches!(batch, LogBatch::Records(records) => {
            let keys: Vec<_> = records.iter().map(|r| (r.offset, r.key.clone().unwrap())).collect();
            assert_eq!(keys, vec![(1, "b".to_string()), (2, "c".to_string())]);
        });
    }

    #[tokio::test]
    async fn test_fetch_reads_window_from_disk() {
        let dir = TempDir::new().unwrap();
        let log = FileUpdateLog::open(dir.path(), "t", 1).await.unwrap();
        let path = dir.path().join("t/partition-0.jsonl");

        let contents: String = (0..1000)
            .map(|i| format!("{{\"key\":\"k{}\",\"value\":{{\"n\":{}}}}}\n", i, i))
            .collect();
        std::fs::write(&path, contents).unwrap();

        let batch = log.fetch(0, 998, 10, Duration::ZERO).await.unwrap();
        assert_matches!(batch, LogBatch::Records(records) => {
            assert_eq!(records.len(), 2);
            assert_eq!(records[0].offset, 998);
            assert_eq!(records[0].key.as_deref(), Some("k998"));
            assert_eq!(records[1].key.as_deref(), Some("k999"));
        });

        let batch = log.fetch(0, 500, 3, Duration::ZERO).await.unwrap();
        assert_matches!(batch, LogBatch::Records(records) => {
            let offsets: Vec<u64> = records.iter().map(|r| r.offset).collect();
            assert_eq!(offsets, vec![500, 501, 502]);
        });

        let tails = log.tails.lock().await;
        assert_eq!(tails[&0].starts.len(), 1000);
    }

    #[test]
    fn test_parse_partition_file() {
        assert_eq!(parse_partition_file("partition-12.jsonl"), Some(12));
        assert_eq!(parse_partition_file("partition-x.jsonl"), None);
        assert_eq!(parse_partition_file("offsets.redb"), None);
    }
}
