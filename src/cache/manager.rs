//! Cache Manager
//!
//! Orchestrates every registered namespace: owns the current pointers and
//! refresh state, runs full loads through the matching factory, publishes
//! new generations with a single atomic swap, applies streamed deltas and
//! disposes of superseded generations once readers have drained.
//!
//! # Publication
//!
//! ```text
//!  refresh()                       apply_update()
//!     │                                 │
//!     │ open gen N+1                    │ lock pending
//!     │ factory.load_full ──────────┐   │   apply to current (gen N)
//!     │                             │   │   capture while loading
//!     │ seal gen N+1                │   │ unlock
//!     │ lock pending ◄──────────────┘
//!     │   replay captured deltas onto gen N+1
//!     │   swap current: N → N+1
//!     │ unlock
//!     │ retire gen N ──► destroyed when the last reader drops it
//! ```
//!
//! At most one load per namespace is in flight; a tick that finds a load
//! running is skipped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::generation::{Generation, GenerationInfo, RetiredGeneration};
use super::namespace::{InFlightGuard, Namespace, NamespaceEntry, NamespaceState, NamespaceStatus};
use crate::adapters::event_publisher::LoggingEventPublisher;
use crate::config::{ManagerConfig, SourceKind, StoreBackend};
use crate::domain::events::NamespaceEvent;
use crate::domain::ports::{EventPublisher, UpdateRecord};
use crate::error::{Error, Result};
use crate::factory::{CacheFactory, Factory, LoadContext, LoadResult};
use crate::metrics::CacheMetrics;
use crate::store::{StoreHandle, StoreManager, WriteOp};

/// Poll interval while waiting for in-flight loads during shutdown
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of a refresh request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new generation was published
    Published { generation: u64, entries: u64 },
    /// The load produced identical data; the current generation stays
    Unchanged { generation: u64 },
    /// Another load was already in flight
    Skipped,
}

/// Outcome of applying one streamed delta
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Written to the current generation
    Applied,
    /// Held until a generation is published
    Buffered,
    /// Already reflected in the current generation
    Covered,
    /// The pending buffer overflowed; a full reload was requested
    Overflow,
}

impl ApplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Applied => "applied",
            ApplyOutcome::Buffered => "buffered",
            ApplyOutcome::Covered => "covered",
            ApplyOutcome::Overflow => "overflow",
        }
    }
}

/// Cache manager
pub struct CacheManager {
    store: Arc<StoreManager>,
    config: ManagerConfig,
    namespaces: DashMap<String, Arc<NamespaceEntry>>,
    publisher: Arc<dyn EventPublisher>,
    metrics: Arc<CacheMetrics>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl CacheManager {
    pub fn new(store: Arc<StoreManager>, config: ManagerConfig) -> Result<Self> {
        Ok(Self {
            store,
            config,
            namespaces: DashMap::new(),
            publisher: Arc::new(LoggingEventPublisher::new()),
            metrics: Arc::new(CacheMetrics::new()?),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<CacheMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn store(&self) -> &Arc<StoreManager> {
        &self.store
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    /// Token cancelled when the manager closes; background tasks derive
    /// child tokens from it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn entry(&self, name: &str) -> Result<Arc<NamespaceEntry>> {
        self.namespaces
            .get(name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| Error::NamespaceNotFound(name.to_string()))
    }

    /// Registered namespace names, sorted.
    pub fn namespace_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.namespaces.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn namespace(&self, name: &str) -> Result<Arc<Namespace>> {
        Ok(Arc::clone(&self.entry(name)?.namespace))
    }

    async fn emit(&self, event: NamespaceEvent) {
        if let Err(e) = self.publisher.publish(event).await {
            warn!("Failed to publish namespace event: {}", e);
        }
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register a namespace. Durable namespaces come back Ready when a
    /// published generation survives on disk.
    #[instrument(skip(self, namespace), fields(namespace = %namespace.name()))]
    pub async fn register(&self, namespace: Namespace) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        namespace.config().validate()?;

        let name = namespace.name().to_string();
        match namespace.source_kind() {
            SourceKind::BulkRelational if namespace.row_source().is_none() => {
                return Err(Error::Config(format!(
                    "namespace {} needs a row source",
                    name
                )));
            }
            SourceKind::InMemoryStreamed if namespace.update_log().is_none() => {
                return Err(Error::Config(format!(
                    "namespace {} needs an update log",
                    name
                )));
            }
            _ => {}
        }

        let source_kind = namespace.source_kind();
        let backend = namespace.backend();
        let entry = Arc::new(NamespaceEntry::new(Arc::new(namespace)));

        match self.namespaces.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(Error::NamespaceExists(name));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&entry));
            }
        }
        self.metrics.set_not_ready(&name);

        self.emit(NamespaceEvent::NamespaceRegistered {
            namespace: name.clone(),
            source_kind: source_kind.to_string(),
            backend: backend.to_string(),
            timestamp: Utc::now(),
        })
        .await;

        if backend == StoreBackend::Durable {
            self.recover(&entry).await;
        }

        info!(source_kind = %source_kind, backend = %backend, state = %entry.state(), "Registered namespace");
        Ok(())
    }

    async fn recover(&self, entry: &Arc<NamespaceEntry>) {
        let name = entry.name();
        let store = Arc::clone(&self.store);
        let ns = name.to_string();
        let recovered = tokio::task::spawn_blocking(move || store.recover(&ns))
            .await
            .map_err(|e| Error::Internal(format!("recovery task failed: {}", e)))
            .and_then(|r| r);

        match recovered {
            Ok(Some((handle, info))) => {
                let created_at = info.created_at;
                let generation = info.id;
                let entries = info.entries;
                self.metrics.set_generation(&info);
                entry.swap_current(Some(Arc::new(Generation::new(info, handle))));
                entry.transition(NamespaceState::Ready);
                entry.refresh.lock().last_success = Some(created_at);

                self.emit(NamespaceEvent::GenerationRecovered {
                    namespace: name.to_string(),
                    generation,
                    entries,
                    timestamp: Utc::now(),
                })
                .await;
            }
            Ok(None) => debug!(namespace = %name, "No published generation to recover"),
            Err(e) => {
                // contained: the namespace starts Unloaded and loads normally
                warn!(namespace = %name, "Failed to recover generation: {}", e);
                self.record_failure_state(entry, &e);
            }
        }
    }

    // =========================================================================
    // Full Loads
    // =========================================================================

    /// Run one full load unless one is already in flight.
    #[instrument(skip(self), fields(namespace = %name))]
    pub async fn refresh(&self, name: &str) -> Result<RefreshOutcome> {
        let entry = self.entry(name)?;
        if self.is_closed() || entry.state() == NamespaceState::Closed {
            return Err(Error::Closed);
        }

        let Some(_guard) = InFlightGuard::acquire(&entry) else {
            entry.skipped_ticks.fetch_add(1, Ordering::Relaxed);
            self.metrics.record_refresh(name, "skipped", None);
            debug!("Load already in flight, skipping");
            return Ok(RefreshOutcome::Skipped);
        };

        self.run_load(&entry).await
    }

    async fn run_load(&self, entry: &Arc<NamespaceEntry>) -> Result<RefreshOutcome> {
        let name = entry.name();
        let started = Instant::now();
        // metadata only: holding the Arc would keep the old generation alive
        let previous = entry.current().map(|g| g.info().clone());

        let loading = if previous.is_some() {
            NamespaceState::Refreshing
        } else {
            NamespaceState::Loading
        };
        if !entry.transition(loading) {
            return Err(Error::Closed);
        }

        {
            let mut refresh = entry.refresh.lock();
            refresh.last_attempt = Some(Utc::now());
            refresh.attempts += 1;
        }
        {
            // deltas from here on must reach the new generation
            let mut pending = entry.pending.lock();
            pending.capturing = true;
            if std::mem::take(&mut pending.overflowed) {
                entry.take_reload_request();
            }
        }

        let generation = self.store.next_generation_id(name);
        let backend = entry.namespace.backend();
        info!(generation, previous = ?previous.as_ref().map(|p| p.id), "Starting full load");

        let target = match self.store.open(name, generation, backend) {
            Ok(target) => target,
            Err(e) => return Err(self.fail_load(entry, e, started).await),
        };

        let ctx = LoadContext {
            namespace: Arc::clone(&entry.namespace),
            store: Arc::clone(&self.store),
            target: target.clone(),
            previous: previous.clone(),
            write_batch_size: self.config.write_batch_size,
            cancel: self.cancel.child_token(),
        };

        let factory = Factory::for_kind(entry.namespace.source_kind());
        let result = factory.load_full(&ctx).await;
        drop(ctx);

        match result {
            Err(e) => {
                self.discard(&target);
                Err(self.fail_load(entry, e, started).await)
            }
            Ok(load) if !load.changed && previous.is_some() => {
                self.discard(&target);
                Ok(self.finish_unchanged(entry, &load, started).await)
            }
            Ok(load) => match self.publish(entry, target.clone(), load, started).await {
                Ok(outcome) => Ok(outcome),
                Err(e) => {
                    self.discard(&target);
                    Err(self.fail_load(entry, e, started).await)
                }
            },
        }
    }

    fn discard(&self, target: &StoreHandle) {
        if let Err(e) = self.store.destroy(target) {
            warn!(generation = target.generation(), "Failed to destroy discarded region: {}", e);
        }
    }

    async fn publish(
        &self,
        entry: &Arc<NamespaceEntry>,
        target: StoreHandle,
        load: LoadResult,
        started: Instant,
    ) -> Result<RefreshOutcome> {
        let name = entry.name();
        let mut info = GenerationInfo {
            namespace: name.to_string(),
            id: target.generation(),
            created_at: Utc::now(),
            entries: load.entries,
            size_bytes: 0,
            fingerprint: load.fingerprint,
            source_version: load.source_version.clone(),
            log_positions: load.log_positions.clone(),
            backend: target.backend(),
        };

        let store = Arc::clone(&self.store);
        let sealing = target.clone();
        info = tokio::task::spawn_blocking(move || {
            store.seal(&sealing, &mut info)?;
            Ok::<_, Error>(info)
        })
        .await
        .map_err(|e| Error::Internal(format!("seal task failed: {}", e)))??;

        let generation = Arc::new(Generation::new(info, target));

        let (previous, replayed, overflowed) = {
            let mut pending = entry.pending.lock();
            if entry.state() == NamespaceState::Closed {
                pending.capturing = false;
                return Err(Error::Closed);
            }
            let ops: Vec<WriteOp> = pending
                .records
                .iter()
                .filter(|r| !generation.info().covers(r.partition, r.offset))
                .map(|r| match &r.value {
                    Some(value) => WriteOp::put(r.key.clone(), value.clone()),
                    None => WriteOp::delete(r.key.clone()),
                })
                .collect();
            let replayed = ops.len();

            if let Err(e) = self.store.write_batch(generation.handle(), ops) {
                pending.records.clear();
                pending.capturing = false;
                pending.overflowed = true;
                entry.request_reload();
                return Err(e);
            }

            // CURRENT must name the new generation before the old one can be
            // retired; on failure the buffered deltas stay for the next load
            if let Err(e) = self.store.publish_current(generation.handle()) {
                pending.capturing = false;
                return Err(e);
            }

            pending.records.clear();
            pending.capturing = false;
            let overflowed = std::mem::take(&mut pending.overflowed);
            let previous = entry.swap_current(Some(Arc::clone(&generation)));
            (previous, replayed, overflowed)
        };

        if overflowed {
            warn!("Deltas were dropped during the load, scheduling another reload");
            entry.request_reload();
        }

        entry.transition(NamespaceState::Ready);

        let elapsed = started.elapsed();
        {
            let mut refresh = entry.refresh.lock();
            refresh.last_success = Some(Utc::now());
            refresh.last_error = None;
            refresh.last_error_kind = None;
            refresh.consecutive_failures = 0;
            refresh.published += 1;
        }
        self.metrics.set_generation(generation.info());
        self.metrics.set_buffered(name, 0);
        self.metrics
            .record_refresh(name, "published", Some(elapsed));
        self.metrics
            .record_decode_errors(name, "load", load.decode_errors);

        let previous_id = previous.as_ref().map(|g| g.id());
        if let Some(previous) = previous {
            entry.retired.lock().push(RetiredGeneration::new(previous));
        }

        info!(
            generation = generation.id(),
            previous = ?previous_id,
            entries = generation.info().entries,
            size_bytes = generation.info().size_bytes,
            replayed,
            duration_ms = elapsed.as_millis() as u64,
            "Published generation"
        );

        self.emit(NamespaceEvent::GenerationPublished {
            namespace: name.to_string(),
            generation: generation.id(),
            previous_generation: previous_id,
            entries: generation.info().entries,
            size_bytes: generation.info().size_bytes,
            duration_ms: elapsed.as_millis() as u64,
            timestamp: Utc::now(),
        })
        .await;

        self.reap_entry(entry).await;

        Ok(RefreshOutcome::Published {
            generation: generation.id(),
            entries: generation.info().entries,
        })
    }

    async fn finish_unchanged(
        &self,
        entry: &Arc<NamespaceEntry>,
        load: &LoadResult,
        started: Instant,
    ) -> RefreshOutcome {
        let name = entry.name();
        {
            // captured deltas already live in the current generation
            let mut pending = entry.pending.lock();
            pending.records.clear();
            pending.capturing = false;
            if std::mem::take(&mut pending.overflowed) {
                entry.take_reload_request();
            }
        }
        entry.transition(NamespaceState::Ready);

        let generation = entry.current().map_or(0, |g| g.id());
        {
            let mut refresh = entry.refresh.lock();
            refresh.last_success = Some(Utc::now());
            refresh.last_error = None;
            refresh.last_error_kind = None;
            refresh.consecutive_failures = 0;
            refresh.unchanged += 1;
        }
        self.metrics
            .record_refresh(name, "unchanged", Some(started.elapsed()));
        self.metrics
            .record_decode_errors(name, "load", load.decode_errors);

        info!(generation, "Source unchanged, keeping current generation");
        self.emit(NamespaceEvent::RefreshUnchanged {
            namespace: name.to_string(),
            generation,
            timestamp: Utc::now(),
        })
        .await;

        RefreshOutcome::Unchanged { generation }
    }

    /// Record a failed attempt and restore the pre-load state. Returns the
    /// error for the caller to propagate.
    async fn fail_load(&self, entry: &Arc<NamespaceEntry>, error: Error, started: Instant) -> Error {
        let name = entry.name();
        let has_current = entry.current().is_some();
        {
            let mut pending = entry.pending.lock();
            pending.capturing = false;
            if has_current {
                pending.records.clear();
            }
        }
        entry.transition(if has_current {
            NamespaceState::Ready
        } else {
            NamespaceState::Unloaded
        });

        self.record_failure_state(entry, &error);
        self.metrics
            .record_refresh(name, "failed", Some(started.elapsed()));
        if let Error::DecodeErrorRateExceeded { errors, .. } = &error {
            self.metrics.record_decode_errors(name, "load", *errors);
        }

        match &error {
            Error::Cancelled { .. } => info!("Load cancelled"),
            e if e.is_retryable() => warn!(serving_previous = has_current, "Load failed: {}", e),
            e => error!(serving_previous = has_current, "Load failed: {}", e),
        }

        self.emit(NamespaceEvent::RefreshFailed {
            namespace: name.to_string(),
            kind: error.kind().to_string(),
            reason: error.to_string(),
            retryable: error.is_retryable(),
            timestamp: Utc::now(),
        })
        .await;

        error
    }

    fn record_failure_state(&self, entry: &NamespaceEntry, error: &Error) {
        let mut refresh = entry.refresh.lock();
        refresh.last_error = Some(error.to_string());
        refresh.last_error_kind = Some(error.kind().to_string());
        refresh.consecutive_failures += 1;
        refresh.failures += 1;
    }

    // =========================================================================
    // Streamed Deltas
    // =========================================================================

    /// Apply one streamed delta to the namespace's current generation, or
    /// hold it until a generation exists.
    pub async fn apply_update(&self, name: &str, record: UpdateRecord) -> Result<ApplyOutcome> {
        let entry = self.entry(name)?;
        if entry.state() == NamespaceState::Closed {
            return Err(Error::Closed);
        }

        // Only the routing decision is made under the buffer lock; a record
        // pushed there before a publish is replayed into the new generation
        let (outcome, target, buffered, newly_overflowed) = {
            let mut pending = entry.pending.lock();
            let was_overflowed = pending.overflowed;

            let (outcome, target) = match entry.current() {
                Some(generation) if generation.info().covers(record.partition, record.offset) => {
                    (ApplyOutcome::Covered, None)
                }
                Some(generation) => {
                    if pending.capturing && !pending.push(record.clone()) && !was_overflowed {
                        entry.request_reload();
                    }
                    (ApplyOutcome::Applied, Some(generation))
                }
                None => {
                    if pending.push(record.clone()) {
                        (ApplyOutcome::Buffered, None)
                    } else {
                        if !was_overflowed {
                            entry.request_reload();
                        }
                        (ApplyOutcome::Overflow, None)
                    }
                }
            };
            let newly_overflowed = !was_overflowed && pending.overflowed;
            (outcome, target, pending.records.len(), newly_overflowed)
        };

        if let Some(generation) = target {
            match &record.value {
                Some(value) => self.store.put(generation.handle(), &record.key, value)?,
                None => self.store.delete(generation.handle(), &record.key)?,
            }
        }

        self.metrics.record_update(name, outcome.as_str());
        self.metrics.set_buffered(name, buffered);

        if newly_overflowed {
            let capacity = entry.namespace.config().update_buffer_capacity;
            warn!(namespace = %name, capacity, "Update buffer overflowed, full reload requested");
            self.emit(NamespaceEvent::UpdateBufferOverflow {
                namespace: name.to_string(),
                capacity,
                timestamp: Utc::now(),
            })
            .await;
        }

        Ok(outcome)
    }

    /// Report an offset gap seen by a consumer.
    pub async fn report_offset_gap(&self, name: &str, partition: u32, expected: u64, available: u64) {
        self.metrics.record_offset_gap(name);
        self.emit(NamespaceEvent::OffsetGapDetected {
            namespace: name.to_string(),
            partition,
            expected,
            available,
            timestamp: Utc::now(),
        })
        .await;
    }

    // =========================================================================
    // Read Path
    // =========================================================================

    /// Current generation, captured once; later swaps do not affect it.
    pub fn current(&self, name: &str) -> Option<Arc<Generation>> {
        self.namespaces.get(name).and_then(|e| e.current())
    }

    /// Value stored under `key` in the namespace's current generation.
    pub fn get(&self, name: &str, key: &str) -> Result<Option<Bytes>> {
        match self.current(name) {
            Some(generation) => self.store.get(generation.handle(), key),
            None => Ok(None),
        }
    }

    pub fn is_ready(&self, name: &str) -> bool {
        self.namespaces
            .get(name)
            .map(|e| e.state() != NamespaceState::Closed && e.current().is_some())
            .unwrap_or(false)
    }

    /// Every registered namespace serves a generation.
    pub fn all_ready(&self) -> bool {
        self.namespaces
            .iter()
            .all(|e| e.state() != NamespaceState::Closed && e.current().is_some())
    }

    /// Wait until the namespace publishes its first generation. Returns
    /// `None` if `cancel` fires first.
    pub async fn wait_until_published(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<Generation>>> {
        let entry = self.entry(name)?;
        let mut published = entry.subscribe_published();
        tokio::select! {
            _ = cancel.cancelled() => Ok(None),
            changed = async { published.wait_for(|id| *id > 0).await.map(|_| ()) } => {
                changed.map_err(|_| Error::Closed)?;
                Ok(entry.current())
            }
        }
    }

    // =========================================================================
    // Management
    // =========================================================================

    /// Trigger an immediate refresh. A request that arrives while a load is
    /// in flight is counted as a skipped tick and dropped. Returns whether
    /// the refresh was triggered.
    pub fn request_refresh(&self, name: &str) -> Result<bool> {
        let entry = self.entry(name)?;
        if entry.state() == NamespaceState::Closed {
            return Err(Error::Closed);
        }
        if entry.is_in_flight() {
            entry.skipped_ticks.fetch_add(1, Ordering::Relaxed);
            self.metrics.record_refresh(name, "skipped", None);
            debug!(namespace = %name, "Load already in flight, forced refresh skipped");
            return Ok(false);
        }
        entry.force.notify_one();
        debug!(namespace = %name, "Forced refresh requested");
        Ok(true)
    }

    /// Ask for a full reload once the current one, if any, has finished.
    /// Unlike [`request_refresh`](Self::request_refresh) the request survives
    /// an in-flight load.
    pub fn request_reload(&self, name: &str) -> Result<()> {
        let entry = self.entry(name)?;
        entry.request_reload();
        debug!(namespace = %name, "Reload requested");
        Ok(())
    }

    pub fn status(&self, name: &str) -> Result<NamespaceStatus> {
        let entry = self.entry(name)?;
        Ok(self.status_of(&entry))
    }

    pub fn statuses(&self) -> Vec<NamespaceStatus> {
        let mut statuses: Vec<NamespaceStatus> = self
            .namespaces
            .iter()
            .map(|e| self.status_of(e.value()))
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    fn status_of(&self, entry: &NamespaceEntry) -> NamespaceStatus {
        let current = entry.current();
        let live_entries = current
            .as_ref()
            .and_then(|g| self.store.entry_count(g.handle()).ok());
        NamespaceStatus {
            name: entry.name().to_string(),
            state: entry.state(),
            source_kind: entry.namespace.source_kind(),
            backend: entry.namespace.backend(),
            in_flight: entry.is_in_flight(),
            generation: current.map(|g| g.info().clone()),
            live_entries,
            refresh: entry.refresh.lock().clone(),
            skipped_ticks: entry.skipped_ticks.load(Ordering::Relaxed),
            buffered_updates: entry.pending.lock().records.len(),
            retired_generations: entry.retired.lock().len(),
        }
    }

    // =========================================================================
    // Disposal
    // =========================================================================

    /// Destroy retired generations no reader holds anymore. Returns how many
    /// were destroyed.
    pub async fn reap_retired(&self) -> usize {
        let entries: Vec<Arc<NamespaceEntry>> =
            self.namespaces.iter().map(|e| Arc::clone(e.value())).collect();
        let mut reaped = 0;
        for entry in entries {
            reaped += self.reap_entry(&entry).await;
        }
        reaped
    }

    async fn reap_entry(&self, entry: &NamespaceEntry) -> usize {
        let drained: Vec<RetiredGeneration> = {
            let mut retired = entry.retired.lock();
            let (drained, waiting): (Vec<_>, Vec<_>) =
                retired.drain(..).partition(|r| r.is_drained());
            *retired = waiting;
            drained
        };

        for retired in &drained {
            let generation = &retired.generation;
            if let Err(e) = self.store.destroy(generation.handle()) {
                warn!(namespace = %entry.name(), generation = generation.id(), "Failed to destroy generation: {}", e);
            }
            debug!(
                namespace = %entry.name(),
                generation = generation.id(),
                retired_for_ms = (Utc::now() - retired.retired_at).num_milliseconds(),
                "Disposed generation"
            );
            self.emit(NamespaceEvent::GenerationDisposed {
                namespace: entry.name().to_string(),
                generation: generation.id(),
                timestamp: Utc::now(),
            })
            .await;
        }
        drained.len()
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop every namespace: cancel loads, wait up to the grace period for
    /// them to finish, then release all generations. Durable data stays on
    /// disk for recovery.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Closing cache manager");
        self.cancel.cancel();

        let deadline = Instant::now() + self.config.shutdown_grace_period;
        while self.namespaces.iter().any(|e| e.is_in_flight()) {
            if Instant::now() >= deadline {
                warn!("Grace period elapsed with loads still in flight");
                break;
            }
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }

        let entries: Vec<Arc<NamespaceEntry>> =
            self.namespaces.iter().map(|e| Arc::clone(e.value())).collect();
        for entry in entries {
            entry.set_state(NamespaceState::Closed);
            {
                let mut pending = entry.pending.lock();
                pending.records.clear();
                pending.capturing = false;
            }

            if let Some(current) = entry.swap_current(None) {
                self.store.close(current.handle());
            }
            let retired: Vec<RetiredGeneration> = entry.retired.lock().drain(..).collect();
            for r in retired {
                if let Err(e) = self.store.destroy(r.generation.handle()) {
                    warn!(namespace = %entry.name(), "Failed to destroy generation: {}", e);
                }
            }
            self.metrics.set_not_ready(entry.name());

            self.emit(NamespaceEvent::NamespaceClosed {
                namespace: entry.name().to_string(),
                timestamp: Utc::now(),
            })
            .await;
        }
        info!("Cache manager closed");
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("namespaces", &self.namespace_names())
            .field("closed", &self.is_closed())
            .finish()
    }
}
