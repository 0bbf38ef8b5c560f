//! Partition Consumer
//!
//! Applies one partition of a namespace's update log to the cache.
//!
//! # Flow
//!
//! ```text
//!   subscribe ──► fetch ──► decode ──► CacheManager::apply_update ──► checkpoint
//!      ▲            │
//!      └─Resubscribe┘
//! ```
//!
//! Records are applied strictly in partition order. Anything below the next
//! expected offset is a duplicate and is skipped, so a restart that replays
//! already-applied records leaves the store unchanged (last write wins).
//! Offsets are only checkpointed for durable namespaces, and only while a
//! generation is published, so a checkpoint never covers records that exist
//! solely in the in-memory pending buffer.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cache::manager::{ApplyOutcome, CacheManager};
use crate::config::{ConsumerConfig, GapPolicy, SourceKind, StartPosition, StoreBackend};
use crate::domain::ports::{LogBatch, OffsetStore, RawRecord, UpdateLog};
use crate::error::{Error, Result};

/// Per-consumer counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: u64,
    pub applied: u64,
    pub buffered: u64,
    pub duplicates: u64,
    pub decode_errors: u64,
    pub gaps: u64,
    pub resubscribes: u64,
    pub checkpoints: u64,
}

/// Consumer for one (namespace, partition).
pub struct PartitionConsumer {
    manager: Arc<CacheManager>,
    namespace: String,
    partition: u32,
    log: Arc<dyn UpdateLog>,
    offsets: Arc<dyn OffsetStore>,
    config: ConsumerConfig,

    /// Next offset to apply; anything lower is a duplicate
    next_offset: u64,
    subscribed: bool,
    last_checkpointed: Option<u64>,
    since_checkpoint: u64,
    last_checkpoint_at: Instant,
    stats: ConsumerStats,
}

impl PartitionConsumer {
    pub fn new(
        manager: Arc<CacheManager>,
        namespace: impl Into<String>,
        partition: u32,
        log: Arc<dyn UpdateLog>,
        offsets: Arc<dyn OffsetStore>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            manager,
            namespace: namespace.into(),
            partition,
            log,
            offsets,
            config,
            next_offset: 0,
            subscribed: false,
            last_checkpointed: None,
            since_checkpoint: 0,
            last_checkpoint_at: Instant::now(),
            stats: ConsumerStats::default(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    fn durable(&self) -> Result<bool> {
        Ok(self.manager.namespace(&self.namespace)?.backend() == StoreBackend::Durable)
    }

    /// Position the consumer: resume after the checkpoint, after the
    /// bootstrap of a streamed namespace, or at the configured start.
    ///
    /// Streamed namespaces wait for their bootstrap generation first.
    /// Returns `false` if cancelled while waiting.
    #[instrument(skip(self, cancel), fields(namespace = %self.namespace, partition = self.partition))]
    pub async fn subscribe(&mut self, cancel: &CancellationToken) -> Result<bool> {
        let namespace = self.manager.namespace(&self.namespace)?;

        let bootstrap_position = match namespace.source_kind() {
            SourceKind::InMemoryStreamed => {
                let Some(generation) = self
                    .manager
                    .wait_until_published(&self.namespace, cancel)
                    .await?
                else {
                    return Ok(false);
                };
                generation.info().log_positions.get(&self.partition).copied()
            }
            SourceKind::BulkRelational => None,
        };

        let checkpoint = if namespace.backend() == StoreBackend::Durable {
            self.offsets.load(&self.namespace, self.partition)?
        } else {
            None
        };

        let earliest = self.log.earliest_offset(self.partition).await?;
        let end = self.log.end_offset(self.partition).await?;

        let mut start = match (checkpoint, bootstrap_position) {
            (Some(last), Some(position)) => (last + 1).max(position),
            (Some(last), None) => last + 1,
            (None, Some(position)) => position,
            (None, None) => match namespace.config().start_position() {
                StartPosition::Earliest => earliest,
                StartPosition::Latest => end,
            },
        };

        if start < earliest {
            self.handle_gap(start, earliest).await;
            start = earliest;
        }
        if start > end {
            warn!(start, end, "Start offset beyond end of log, starting at end");
            start = end;
        }

        self.next_offset = start;
        self.last_checkpointed = checkpoint;
        self.since_checkpoint = 0;
        self.last_checkpoint_at = Instant::now();
        self.subscribed = true;

        info!(start, earliest, end, checkpoint = ?checkpoint, "Subscribed");
        Ok(true)
    }

    async fn handle_gap(&mut self, expected: u64, available: u64) {
        self.stats.gaps += 1;
        warn!(
            expected,
            available,
            policy = ?self.config.gap_policy,
            "Offset gap detected, resuming from earliest available offset"
        );
        self.manager
            .report_offset_gap(&self.namespace, self.partition, expected, available)
            .await;

        if self.config.gap_policy == GapPolicy::ForceReload {
            if let Err(e) = self.manager.request_reload(&self.namespace) {
                warn!("Failed to request reload after gap: {}", e);
            }
        }
    }

    /// Decode and apply one record.
    ///
    /// Undecodable records are counted and skipped.
    pub async fn on_record(&mut self, record: RawRecord) -> Result<()> {
        self.stats.received += 1;
        if record.offset < self.next_offset {
            self.stats.duplicates += 1;
            debug!(offset = record.offset, next = self.next_offset, "Skipping duplicate record");
            return Ok(());
        }

        let namespace = self.manager.namespace(&self.namespace)?;
        let offset = record.offset;
        match namespace.decoder().decode_record(&record) {
            Ok(update) => {
                match self.manager.apply_update(&self.namespace, update).await? {
                    ApplyOutcome::Applied | ApplyOutcome::Covered => self.stats.applied += 1,
                    ApplyOutcome::Buffered | ApplyOutcome::Overflow => self.stats.buffered += 1,
                }
            }
            Err(e) => {
                self.stats.decode_errors += 1;
                self.manager
                    .metrics()
                    .record_decode_errors(&self.namespace, "stream", 1);
                warn!(
                    namespace = %self.namespace,
                    partition = self.partition,
                    offset,
                    "Skipping undecodable record: {}",
                    e
                );
            }
        }

        self.next_offset = offset + 1;
        self.since_checkpoint += 1;
        Ok(())
    }

    /// Persist the last applied offset if due (or `force`d).
    ///
    /// Returns whether an offset was written.
    pub fn checkpoint(&mut self, force: bool) -> Result<bool> {
        if !self.subscribed || self.next_offset == 0 || !self.durable()? {
            return Ok(false);
        }
        if !self.manager.is_ready(&self.namespace) {
            return Ok(false);
        }

        let due = force
            || self.since_checkpoint >= self.config.checkpoint_every
            || self.last_checkpoint_at.elapsed() >= self.config.checkpoint_interval;
        let last_applied = self.next_offset - 1;
        if !due || self.last_checkpointed == Some(last_applied) {
            return Ok(false);
        }

        self.offsets
            .commit(&self.namespace, self.partition, last_applied)?;
        self.last_checkpointed = Some(last_applied);
        self.since_checkpoint = 0;
        self.last_checkpoint_at = Instant::now();
        self.stats.checkpoints += 1;
        Ok(true)
    }

    fn checkpoint_quietly(&mut self, force: bool) {
        if let Err(e) = self.checkpoint(force) {
            warn!(namespace = %self.namespace, partition = self.partition, "Checkpoint failed: {}", e);
        }
    }

    async fn backoff(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.config.error_backoff) => true,
        }
    }

    /// Consume until cancelled or the namespace closes.
    #[instrument(skip(self, cancel), fields(namespace = %self.namespace, partition = self.partition))]
    pub async fn run(mut self, cancel: CancellationToken) -> ConsumerStats {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            if !self.subscribed {
                match self.subscribe(&cancel).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(Error::Closed) | Err(Error::NamespaceNotFound(_)) => break,
                    Err(e) => {
                        warn!("Subscribe failed: {}", e);
                        if !self.backoff(&cancel).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                fetched = self.log.fetch(
                    self.partition,
                    self.next_offset,
                    self.config.batch_size,
                    self.config.poll_wait,
                ) => fetched,
            };

            let records = match fetched {
                Ok(LogBatch::Records(records)) => records,
                Ok(LogBatch::Resubscribe) => {
                    info!("Transport rebalanced, resubscribing");
                    self.stats.resubscribes += 1;
                    self.checkpoint_quietly(true);
                    self.subscribed = false;
                    continue;
                }
                Err(e) => {
                    warn!("Fetch failed: {}", e);
                    if !self.backoff(&cancel).await {
                        break;
                    }
                    continue;
                }
            };

            if let Some(first) = records.first() {
                if first.offset > self.next_offset {
                    // holes are normal in compacted logs; only retention loss is a gap
                    match self.log.earliest_offset(self.partition).await {
                        Ok(earliest) if earliest > self.next_offset => {
                            self.handle_gap(self.next_offset, earliest).await;
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Failed to read earliest offset: {}", e),
                    }
                }
            }

            let mut closed = false;
            for record in records {
                match self.on_record(record).await {
                    Ok(()) => {}
                    Err(Error::Closed) | Err(Error::NamespaceNotFound(_)) => {
                        closed = true;
                        break;
                    }
                    Err(e) => {
                        // retried from next_offset after the backoff
                        warn!(offset = self.next_offset, "Failed to apply record: {}", e);
                        if !self.backoff(&cancel).await {
                            closed = true;
                        }
                        break;
                    }
                }
            }
            if closed {
                break;
            }

            self.checkpoint_quietly(false);
        }

        self.checkpoint_quietly(true);
        info!(
            applied = self.stats.applied,
            duplicates = self.stats.duplicates,
            decode_errors = self.stats.decode_errors,
            "Consumer stopped"
        );
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryEventCollector, InMemoryRowSource, InMemoryUpdateLog, JsonRowDecoder};
    use crate::cache::Namespace;
    use crate::config::{ManagerConfig, NamespaceConfig, StoreConfig, UpdatesConfig};
    use crate::domain::ports::SourceRow;
    use crate::store::{InMemoryOffsetStore, StoreManager};
    use bytes::Bytes;
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        manager: Arc<CacheManager>,
        log: Arc<InMemoryUpdateLog>,
        offsets: Arc<InMemoryOffsetStore>,
        events: Arc<InMemoryEventCollector>,
    }

    async fn fixture(backend: StoreBackend) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = StoreManager::new(&StoreConfig {
            root_dir: dir.path().to_path_buf(),
            ..StoreConfig::default()
        });
        let events = Arc::new(InMemoryEventCollector::new());
        let manager = Arc::new(
            CacheManager::new(Arc::new(store), ManagerConfig::default())
                .unwrap()
                .with_publisher(events.clone()),
        );

        let mut config = NamespaceConfig::bulk("countries", "countries", "code", &["name"]);
        config.backend = backend;
        config.updates = Some(UpdatesConfig {
            topic: "countries".to_string(),
            start_from: StartPosition::Earliest,
        });
        let log = Arc::new(InMemoryUpdateLog::new("countries", 1));
        let source = InMemoryRowSource::new("ref")
            .with_rows(vec![SourceRow::new().with("code", "US").with("name", "United States")]);
        let namespace = Namespace::new(config.clone(), Arc::new(JsonRowDecoder::from_config(&config)))
            .with_row_source(Arc::new(source))
            .with_update_log(log.clone());
        manager.register(namespace).await.unwrap();

        Fixture {
            _dir: dir,
            manager,
            log,
            offsets: Arc::new(InMemoryOffsetStore::new()),
            events,
        }
    }

    fn consumer(f: &Fixture, config: ConsumerConfig) -> PartitionConsumer {
        PartitionConsumer::new(
            Arc::clone(&f.manager),
            "countries",
            0,
            f.log.clone(),
            f.offsets.clone(),
            config,
        )
    }

    fn upsert(offset: u64, key: &str, name: &str) -> RawRecord {
        RawRecord {
            partition: 0,
            offset,
            key: Some(key.to_string()),
            payload: Some(Bytes::from(json!({ "name": name }).to_string())),
        }
    }

    #[tokio::test]
    async fn test_duplicates_and_decode_errors_are_skipped() {
        let f = fixture(StoreBackend::Memory).await;
        f.manager.refresh("countries").await.unwrap();

        let mut consumer = consumer(&f, ConsumerConfig::default());
        assert!(consumer.subscribe(&CancellationToken::new()).await.unwrap());
        assert_eq!(consumer.next_offset(), 0);

        consumer.on_record(upsert(0, "FR", "France")).await.unwrap();
        consumer.on_record(upsert(0, "FR", "Francia")).await.unwrap();
        consumer
            .on_record(RawRecord {
                partition: 0,
                offset: 1,
                key: Some("XX".to_string()),
                payload: Some(Bytes::from_static(b"{broken")),
            })
            .await
            .unwrap();

        let stats = consumer.stats();
        assert_eq!(stats.applied, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.decode_errors, 1);
        assert_eq!(consumer.next_offset(), 2);

        let stored = f.manager.get("countries", "FR").unwrap().unwrap();
        assert_eq!(
            crate::adapters::json_decoder::column_text(&stored, "name").unwrap().as_deref(),
            Some("France")
        );
    }

    #[tokio::test]
    async fn test_records_before_first_load_are_buffered() {
        let f = fixture(StoreBackend::Memory).await;
        let mut consumer = consumer(&f, ConsumerConfig::default());
        consumer.subscribe(&CancellationToken::new()).await.unwrap();

        consumer.on_record(upsert(0, "FR", "France")).await.unwrap();
        assert_eq!(consumer.stats().buffered, 1);
        assert!(f.manager.get("countries", "FR").unwrap().is_none());

        f.manager.refresh("countries").await.unwrap();
        assert!(f.manager.get("countries", "FR").unwrap().is_some());
        assert!(f.manager.get("countries", "US").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_checkpoint_requires_durable_and_ready() {
        let f = fixture(StoreBackend::Durable).await;
        let mut consumer = consumer(&f, ConsumerConfig::default());
        consumer.subscribe(&CancellationToken::new()).await.unwrap();
        consumer.on_record(upsert(0, "FR", "France")).await.unwrap();

        // nothing published yet
        assert!(!consumer.checkpoint(true).unwrap());
        assert_eq!(f.offsets.load("countries", 0).unwrap(), None);

        f.manager.refresh("countries").await.unwrap();
        assert!(consumer.checkpoint(true).unwrap());
        assert_eq!(f.offsets.load("countries", 0).unwrap(), Some(0));
        assert!(!consumer.checkpoint(true).unwrap());

        let memory = fixture(StoreBackend::Memory).await;
        memory.manager.refresh("countries").await.unwrap();
        let mut consumer = self::consumer(&memory, ConsumerConfig::default());
        consumer.subscribe(&CancellationToken::new()).await.unwrap();
        consumer.on_record(upsert(0, "FR", "France")).await.unwrap();
        assert!(!consumer.checkpoint(true).unwrap());
    }

    #[tokio::test]
    async fn test_checkpoint_every_n_records() {
        let f = fixture(StoreBackend::Durable).await;
        f.manager.refresh("countries").await.unwrap();
        let config = ConsumerConfig {
            checkpoint_every: 2,
            checkpoint_interval: std::time::Duration::from_secs(3600),
            ..ConsumerConfig::default()
        };
        let mut consumer = consumer(&f, config);
        consumer.subscribe(&CancellationToken::new()).await.unwrap();

        consumer.on_record(upsert(0, "FR", "France")).await.unwrap();
        assert!(!consumer.checkpoint(false).unwrap());
        consumer.on_record(upsert(1, "DE", "Germany")).await.unwrap();
        assert!(consumer.checkpoint(false).unwrap());
        assert_eq!(f.offsets.load("countries", 0).unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_resume_after_checkpoint() {
        let f = fixture(StoreBackend::Durable).await;
        for i in 0..4 {
            f.log.append_json(0, format!("K{}", i), &json!({"name": "x"})).unwrap();
        }
        f.offsets.commit("countries", 0, 2).unwrap();

        let mut consumer = consumer(&f, ConsumerConfig::default());
        consumer.subscribe(&CancellationToken::new()).await.unwrap();
        assert_eq!(consumer.next_offset(), 3);
    }

    #[tokio::test]
    async fn test_gap_at_subscribe_resumes_from_earliest() {
        let f = fixture(StoreBackend::Durable).await;
        for i in 0..10 {
            f.log.append_json(0, format!("K{}", i), &json!({"name": "x"})).unwrap();
        }
        f.log.truncate_before(0, 6).unwrap();
        f.offsets.commit("countries", 0, 2).unwrap();

        let mut consumer = consumer(&f, ConsumerConfig::default());
        consumer.subscribe(&CancellationToken::new()).await.unwrap();

        assert_eq!(consumer.next_offset(), 6);
        assert_eq!(consumer.stats().gaps, 1);
        assert_eq!(f.events.events_of_type("OffsetGapDetected").len(), 1);
        assert_eq!(
            f.manager.metrics().offset_gaps_total.with_label_values(&["countries"]).get(),
            1
        );
        assert!(!f.manager.entry("countries").unwrap().reload_requested());
    }

    #[tokio::test]
    async fn test_gap_with_force_reload_requests_reload() {
        let f = fixture(StoreBackend::Durable).await;
        for i in 0..10 {
            f.log.append_json(0, format!("K{}", i), &json!({"name": "x"})).unwrap();
        }
        f.log.truncate_before(0, 6).unwrap();
        f.offsets.commit("countries", 0, 2).unwrap();

        let config = ConsumerConfig {
            gap_policy: GapPolicy::ForceReload,
            ..ConsumerConfig::default()
        };
        let mut consumer = consumer(&f, config);
        consumer.subscribe(&CancellationToken::new()).await.unwrap();

        assert_eq!(consumer.next_offset(), 6);
        assert_eq!(consumer.stats().gaps, 1);
        let entry = f.manager.entry("countries").unwrap();
        assert!(entry.reload_requested());

        // the request is picked up by the refresh loop without a new trigger
        let cancel = CancellationToken::new();
        let task = tokio::spawn(crate::cache::scheduler::run_refresh_loop(
            Arc::clone(&f.manager),
            "countries".to_string(),
            cancel.clone(),
        ));
        for _ in 0..200 {
            if f.manager.is_ready("countries") && !entry.reload_requested() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(f.manager.is_ready("countries"));
        assert!(!entry.reload_requested());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_applies_until_cancelled() {
        let f = fixture(StoreBackend::Memory).await;
        f.manager.refresh("countries").await.unwrap();
        f.log.append_json(0, "FR", &json!({"name": "France"})).unwrap();
        f.log.tombstone(0, "US").unwrap();

        let cancel = CancellationToken::new();
        let config = ConsumerConfig {
            poll_wait: std::time::Duration::from_millis(20),
            ..ConsumerConfig::default()
        };
        let task = tokio::spawn(consumer(&f, config).run(cancel.clone()));

        let mut applied = false;
        for _ in 0..200 {
            if f.manager.get("countries", "US").unwrap().is_none() {
                applied = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        cancel.cancel();
        let stats = task.await.unwrap();

        assert!(applied);
        assert_eq!(stats.applied, 2);
        assert!(f.manager.get("countries", "FR").unwrap().is_some());
    }
}
