//! In-Memory Sources
//!
//! [`InMemoryRowSource`] and [`InMemoryUpdateLog`] implement the source ports
//! entirely in process. They back embedded deployments that push reference
//! data programmatically, and every test that needs a controllable source:
//! rows and versions can be replaced at any time, failures injected, and
//! fetches slowed down.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::domain::ports::{LogBatch, RawRecord, RowSource, SourceQuery, SourceRow, UpdateLog};
use crate::error::{DecodeError, Error, Result};

// =============================================================================
// Row Source
// =============================================================================

#[derive(Debug, Clone)]
enum RowItem {
    Row(SourceRow),
    Undecodable(String),
}

/// Bulk row source holding its rows in memory.
pub struct InMemoryRowSource {
    name: String,
    rows: RwLock<Vec<RowItem>>,
    version: RwLock<Option<String>>,
    failure: RwLock<Option<String>>,
    delay: RwLock<Option<Duration>>,
    fetches: AtomicU64,
}

impl InMemoryRowSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: RwLock::new(Vec::new()),
            version: RwLock::new(None),
            failure: RwLock::new(None),
            delay: RwLock::new(None),
            fetches: AtomicU64::new(0),
        }
    }

    pub fn with_rows(self, rows: impl IntoIterator<Item = SourceRow>) -> Self {
        self.set_rows(rows);
        self
    }

    /// Replace every row.
    pub fn set_rows(&self, rows: impl IntoIterator<Item = SourceRow>) {
        *self.rows.write() = rows.into_iter().map(RowItem::Row).collect();
    }

    pub fn push_row(&self, row: SourceRow) {
        self.rows.write().push(RowItem::Row(row));
    }

    /// Add an item the driver itself fails to convert.
    pub fn push_undecodable(&self, reason: impl Into<String>) {
        self.rows.write().push(RowItem::Undecodable(reason.into()));
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    pub fn set_version(&self, version: Option<&str>) {
        *self.version.write() = version.map(str::to_string);
    }

    /// Make every call fail as unreachable until [`recover`](Self::recover).
    pub fn fail_with(&self, reason: impl Into<String>) {
        *self.failure.write() = Some(reason.into());
    }

    pub fn recover(&self) {
        *self.failure.write() = None;
    }

    /// Delay each fetch before the first row is returned.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.write() = delay;
    }

    /// Number of row fetches served (version checks excluded).
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    fn check_reachable(&self) -> Result<()> {
        match self.failure.read().as_ref() {
            Some(reason) => Err(Error::SourceUnreachable {
                namespace: self.name.clone(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RowSource for InMemoryRowSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_rows(
        &self,
        _query: &SourceQuery,
    ) -> Result<BoxStream<'static, Result<SourceRow>>> {
        self.check_reachable()?;
        self.fetches.fetch_add(1, Ordering::Relaxed);

        let delay = *self.delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let items: Vec<Result<SourceRow>> = self
            .rows
            .read()
            .iter()
            .map(|item| match item {
                RowItem::Row(row) => Ok(row.clone()),
                RowItem::Undecodable(reason) => Err(Error::Decode(DecodeError::new(reason.clone()))),
            })
            .collect();
        Ok(stream::iter(items).boxed())
    }

    async fn source_version(&self, _query: &SourceQuery) -> Result<Option<String>> {
        self.check_reachable()?;
        Ok(self.version.read().clone())
    }
}

// =============================================================================
// Update Log
// =============================================================================

#[derive(Debug, Default)]
struct PartitionLog {
    /// Offset of the first retained record
    earliest: u64,
    records: VecDeque<RawRecord>,
}

impl PartitionLog {
    fn end(&self) -> u64 {
        self.earliest + self.records.len() as u64
    }

    fn read(&self, from: u64, max_records: usize) -> Vec<RawRecord> {
        let skip = from.saturating_sub(self.earliest) as usize;
        self.records
            .iter()
            .skip(skip)
            .take(max_records)
            .cloned()
            .collect()
    }
}

/// Partitioned update log held in memory. Offsets are contiguous per
/// partition and start at zero.
pub struct InMemoryUpdateLog {
    topic: String,
    partitions: RwLock<BTreeMap<u32, PartitionLog>>,
    resubscribe: Mutex<HashSet<u32>>,
    appended: Notify,
}

impl InMemoryUpdateLog {
    pub fn new(topic: impl Into<String>, partitions: u32) -> Self {
        Self {
            topic: topic.into(),
            partitions: RwLock::new(
                (0..partitions.max(1))
                    .map(|p| (p, PartitionLog::default()))
                    .collect(),
            ),
            resubscribe: Mutex::new(HashSet::new()),
            appended: Notify::new(),
        }
    }

    fn unknown_partition(&self, partition: u32) -> Error {
        Error::UpdateLog {
            topic: self.topic.clone(),
            reason: format!("unknown partition {}", partition),
        }
    }

    /// Append a raw record; returns its offset.
    pub fn append(&self, partition: u32, key: impl Into<String>, payload: Option<Bytes>) -> Result<u64> {
        let offset = {
            let mut partitions = self.partitions.write();
            let log = partitions
                .get_mut(&partition)
                .ok_or_else(|| self.unknown_partition(partition))?;
            let offset = log.end();
            log.records.push_back(RawRecord {
                partition,
                offset,
                key: Some(key.into()),
                payload,
            });
            offset
        };
        self.appended.notify_waiters();
        Ok(offset)
    }

    /// Append a JSON payload.
    pub fn append_json(&self, partition: u32, key: impl Into<String>, value: &serde_json::Value) -> Result<u64> {
        let payload = serde_json::to_vec(value)?;
        self.append(partition, key, Some(Bytes::from(payload)))
    }

    pub fn tombstone(&self, partition: u32, key: impl Into<String>) -> Result<u64> {
        self.append(partition, key, None)
    }

    /// Drop every record below `offset`, as retention would.
    pub fn truncate_before(&self, partition: u32, offset: u64) -> Result<()> {
        let mut partitions = self.partitions.write();
        let log = partitions
            .get_mut(&partition)
            .ok_or_else(|| self.unknown_partition(partition))?;
        while log.earliest < offset.min(log.end()) {
            log.records.pop_front();
            log.earliest += 1;
        }
        Ok(())
    }

    /// The next fetch on `partition` reports a rebalance.
    pub fn trigger_resubscribe(&self, partition: u32) {
        self.resubscribe.lock().insert(partition);
        self.appended.notify_waiters();
    }

    fn read(&self, partition: u32, from: u64, max_records: usize) -> Result<Vec<RawRecord>> {
        let partitions = self.partitions.read();
        let log = partitions
            .get(&partition)
            .ok_or_else(|| self.unknown_partition(partition))?;
        Ok(log.read(from, max_records))
    }

    fn take_resubscribe(&self, partition: u32) -> bool {
        self.resubscribe.lock().remove(&partition)
    }
}

#[async_trait]
impl UpdateLog for InMemoryUpdateLog {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn partitions(&self) -> Result<Vec<u32>> {
        Ok(self.partitions.read().keys().copied().collect())
    }

    async fn earliest_offset(&self, partition: u32) -> Result<u64> {
        self.partitions
            .read()
            .get(&partition)
            .map(|log| log.earliest)
            .ok_or_else(|| self.unknown_partition(partition))
    }

    async fn end_offset(&self, partition: u32) -> Result<u64> {
        self.partitions
            .read()
            .get(&partition)
            .map(PartitionLog::end)
            .ok_or_else(|| self.unknown_partition(partition))
    }

    async fn fetch(
        &self,
        partition: u32,
        from: u64,
        max_records: usize,
        wait: Duration,
    ) -> Result<LogBatch> {
        let notified = self.appended.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.take_resubscribe(partition) {
            return Ok(LogBatch::Resubscribe);
        }
        let records = self.read(partition, from, max_records)?;
        if !records.is_empty() || wait.is_zero() {
            return Ok(LogBatch::Records(records));
        }

        let _ = tokio::time::timeout(wait, notified).await;
        if self.take_resubscribe(partition) {
            return Ok(LogBatch::Resubscribe);
        }
        Ok(LogBatch::Records(self.read(partition, from, max_records)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::sync::Arc;

    fn query() -> SourceQuery {
        SourceQuery {
            table: "countries".to_string(),
            columns: vec!["code".to_string(), "name".to_string()],
            filter: None,
            version_column: None,
        }
    }

    #[tokio::test]
    async fn test_row_source_streams_rows_and_errors() {
        let source = InMemoryRowSource::new("ref").with_rows(vec![
            SourceRow::new().with("code", "US"),
            SourceRow::new().with("code", "FR"),
        ]);
        source.push_undecodable("bad bytes");

        let items: Vec<_> = source.fetch_rows(&query()).await.unwrap().collect().await;
        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok());
        assert_matches!(items[2], Err(Error::Decode(_)));
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_row_source_failure_injection() {
        let source = InMemoryRowSource::new("ref");
        source.set_version(Some("v1"));
        source.fail_with("connection refused");

        assert!(matches!(
            source.fetch_rows(&query()).await,
            Err(Error::SourceUnreachable { .. })
        ));
        assert_matches!(
            source.source_version(&query()).await,
            Err(Error::SourceUnreachable { .. })
        );

        source.recover();
        assert_eq!(
            source.source_version(&query()).await.unwrap(),
            Some("v1".to_string())
        );
    }

    #[tokio::test]
    async fn test_update_log_offsets_and_fetch() {
        let log = InMemoryUpdateLog::new("countries", 2);
        assert_eq!(log.append_json(0, "US", &json!({"name": "USA"})).unwrap(), 0);
        assert_eq!(log.tombstone(0, "FR").unwrap(), 1);
        assert_eq!(log.append_json(1, "DE", &json!({"name": "Germany"})).unwrap(), 0);

        assert_eq!(log.partitions().await.unwrap(), vec![0, 1]);
        assert_eq!(log.end_offset(0).await.unwrap(), 2);

        let batch = log.fetch(0, 1, 10, Duration::ZERO).await.unwrap();
        assert_matches!(batch, LogBatch::Records(records) => {
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].offset, 1);
            assert!(records[0].payload.is_none());
        });

        assert_matches!(
            log.fetch(7, 0, 10, Duration::ZERO).await,
            Err(Error::UpdateLog { .. })
        );
    }

    #[tokio::test]
    async fn test_update_log_truncate_moves_earliest() {
        let log = InMemoryUpdateLog::new("t", 1);
        for i in 0..5 {
            log.append(0, format!("k{}", i), Some(Bytes::from_static(b"{}"))).unwrap();
        }
        log.truncate_before(0, 3).unwrap();

        assert_eq!(log.earliest_offset(0).await.unwrap(), 3);
        assert_eq!(log.end_offset(0).await.unwrap(), 5);
        assert_matches!(log.fetch(0, 0, 10, Duration::ZERO).await.unwrap(), LogBatch::Records(records) => {
            assert_eq!(records.first().map(|r| r.offset), Some(3));
        });
    }

    #[tokio::test]
    async fn test_update_log_fetch_waits_for_append() {
        let log = Arc::new(InMemoryUpdateLog::new("t", 1));
        let writer = Arc::clone(&log);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append(0, "k", None).unwrap();
        });

        let batch = log.fetch(0, 0, 10, Duration::from_secs(5)).await.unwrap();
        assert_matches!(batch, LogBatch::Records(records) => assert_eq!(records.len(), 1));
    }

    #[tokio::test]
    async fn test_update_log_resubscribe_once() {
        let log = InMemoryUpdateLog::new("t", 1);
        log.trigger_resubscribe(0);
        assert_eq!(
            log.fetch(0, 0, 10, Duration::ZERO).await.unwrap(),
            LogBatch::Resubscribe
        );
        assert_eq!(
            log.fetch(0, 0, 10, Duration::ZERO).await.unwrap(),
            LogBatch::Records(vec![])
        );
    }
}
