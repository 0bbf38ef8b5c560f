//! Namespaces
//!
//! [`Namespace`] is the immutable descriptor registered at startup: its
//! configuration plus the injected decoder and source ports.
//! [`NamespaceEntry`] is the cache manager's mutable per-namespace record:
//! the current pointer, the lifecycle state, refresh bookkeeping and the
//! buffer of streamed deltas awaiting a generation.
//!
//! # State Machine
//!
//! ```text
//!   ┌──────────┐  load   ┌─────────┐  ok   ┌───────┐  tick  ┌────────────┐
//!   │ Unloaded │────────►│ Loading │──────►│ Ready │───────►│ Refreshing │
//!   └──────────┘         └─────────┘       └───────┘◄───────└────────────┘
//!        ▲                    │ fail                   ok / fail / unchanged
//!        └────────────────────┘
//!
//!   any state ──shutdown──► Closed
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};

use super::generation::{Generation, GenerationInfo, RetiredGeneration};
use crate::config::{NamespaceConfig, SourceKind, StoreBackend};
use crate::domain::ports::{RowDecoder, RowSource, UpdateLog, UpdateRecord};

// =============================================================================
// Namespace Descriptor
// =============================================================================

/// A named, independently refreshed lookup table.
pub struct Namespace {
    config: NamespaceConfig,
    decoder: Arc<dyn RowDecoder>,
    rows: Option<Arc<dyn RowSource>>,
    updates: Option<Arc<dyn UpdateLog>>,
}

impl Namespace {
    pub fn new(config: NamespaceConfig, decoder: Arc<dyn RowDecoder>) -> Self {
        Self {
            config,
            decoder,
            rows: None,
            updates: None,
        }
    }

    /// Attach the bulk source used by full loads.
    pub fn with_row_source(mut self, source: Arc<dyn RowSource>) -> Self {
        self.rows = Some(source);
        self
    }

    /// Attach the update log used for bootstrap and streamed deltas.
    pub fn with_update_log(mut self, log: Arc<dyn UpdateLog>) -> Self {
        self.updates = Some(log);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &NamespaceConfig {
        &self.config
    }

    pub fn decoder(&self) -> &dyn RowDecoder {
        self.decoder.as_ref()
    }

    pub fn row_source(&self) -> Option<&Arc<dyn RowSource>> {
        self.rows.as_ref()
    }

    pub fn update_log(&self) -> Option<&Arc<dyn UpdateLog>> {
        self.updates.as_ref()
    }

    pub fn source_kind(&self) -> SourceKind {
        self.config.source_kind()
    }

    pub fn backend(&self) -> StoreBackend {
        self.config.backend
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("name", &self.config.name)
            .field("source_kind", &self.source_kind())
            .field("backend", &self.config.backend)
            .field("has_row_source", &self.rows.is_some())
            .field("has_update_log", &self.updates.is_some())
            .finish()
    }
}

// =============================================================================
// Lifecycle State
// =============================================================================

/// Per-namespace lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NamespaceState {
    /// No generation published yet
    Unloaded = 0,
    /// First load in flight
    Loading = 1,
    /// Serving a published generation
    Ready = 2,
    /// Reload in flight while the current generation keeps serving
    Refreshing = 3,
    /// Shut down
    Closed = 4,
}

impl NamespaceState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => NamespaceState::Unloaded,
            1 => NamespaceState::Loading,
            2 => NamespaceState::Ready,
            3 => NamespaceState::Refreshing,
            _ => NamespaceState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NamespaceState::Unloaded => "unloaded",
            NamespaceState::Loading => "loading",
            NamespaceState::Ready => "ready",
            NamespaceState::Refreshing => "refreshing",
            NamespaceState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for NamespaceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Refresh bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefreshState {
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Stable label of the last error (see [`crate::Error::kind`])
    pub last_error_kind: Option<String>,
    pub consecutive_failures: u32,
    pub attempts: u64,
    /// Loads that published a new generation
    pub published: u64,
    /// Loads that found nothing new
    pub unchanged: u64,
    pub failures: u64,
}

/// Introspection snapshot of one namespace.
#[derive(Debug, Clone, Serialize)]
pub struct NamespaceStatus {
    pub name: String,
    pub state: NamespaceState,
    pub source_kind: SourceKind,
    pub backend: StoreBackend,
    pub in_flight: bool,
    /// Metadata of the published generation
    pub generation: Option<GenerationInfo>,
    /// Entries currently in the published generation, deltas included
    pub live_entries: Option<u64>,
    pub refresh: RefreshState,
    /// Ticks dropped because a load was already in flight
    pub skipped_ticks: u64,
    /// Streamed deltas waiting for the next generation
    pub buffered_updates: usize,
    /// Superseded generations still held by readers
    pub retired_generations: usize,
}

// =============================================================================
// Pending Updates
// =============================================================================

/// Streamed deltas held for replay onto the next published generation.
///
/// Filled while no generation exists, and while a load is in flight
/// (`capturing`), so deltas applied to the old generation are not lost when
/// the new one replaces it.
#[derive(Debug)]
pub(crate) struct PendingUpdates {
    pub(crate) records: VecDeque<UpdateRecord>,
    pub(crate) capacity: usize,
    pub(crate) capturing: bool,
    /// Records were dropped; the next published generation is incomplete
    pub(crate) overflowed: bool,
}

impl PendingUpdates {
    fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::new(),
            capacity,
            capturing: false,
            overflowed: false,
        }
    }

    /// Buffer a record. Returns false (and drops everything) on overflow.
    pub(crate) fn push(&mut self, record: UpdateRecord) -> bool {
        if self.overflowed {
            return false;
        }
        if self.records.len() >= self.capacity {
            self.records.clear();
            self.overflowed = true;
            return false;
        }
        self.records.push_back(record);
        true
    }
}

// =============================================================================
// Namespace Entry
// =============================================================================

/// Mutable per-namespace record owned by the cache manager.
pub(crate) struct NamespaceEntry {
    pub(crate) namespace: Arc<Namespace>,
    /// Reader-visible generation; never points at a partial load
    current: ArcSwapOption<Generation>,
    state: AtomicU8,
    in_flight: AtomicBool,
    pub(crate) refresh: Mutex<RefreshState>,
    /// Orders delta application against generation publication
    pub(crate) pending: Mutex<PendingUpdates>,
    pub(crate) retired: Mutex<Vec<RetiredGeneration>>,
    /// Wakes the scheduler for a forced refresh
    pub(crate) force: Notify,
    /// A reload should follow as soon as possible
    reload_requested: AtomicBool,
    /// Id of the published generation (0 = none)
    published: watch::Sender<u64>,
    pub(crate) skipped_ticks: AtomicU64,
}

impl NamespaceEntry {
    pub(crate) fn new(namespace: Arc<Namespace>) -> Self {
        let capacity = namespace.config().update_buffer_capacity;
        let (published, _) = watch::channel(0);
        Self {
            namespace,
            current: ArcSwapOption::const_empty(),
            state: AtomicU8::new(NamespaceState::Unloaded as u8),
            in_flight: AtomicBool::new(false),
            refresh: Mutex::new(RefreshState::default()),
            pending: Mutex::new(PendingUpdates::new(capacity)),
            retired: Mutex::new(Vec::new()),
            force: Notify::new(),
            reload_requested: AtomicBool::new(false),
            published,
            skipped_ticks: AtomicU64::new(0),
        }
    }

    pub(crate) fn name(&self) -> &str {
        self.namespace.name()
    }

    pub(crate) fn state(&self) -> NamespaceState {
        NamespaceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: NamespaceState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move to `to` unless the namespace has been closed.
    pub(crate) fn transition(&self, to: NamespaceState) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                (s != NamespaceState::Closed as u8).then_some(to as u8)
            })
            .is_ok()
    }

    pub(crate) fn current(&self) -> Option<Arc<Generation>> {
        self.current.load_full()
    }

    /// Swap in a new generation, returning the one it replaces.
    pub(crate) fn swap_current(&self, generation: Option<Arc<Generation>>) -> Option<Arc<Generation>> {
        let id = generation.as_ref().map_or(0, |g| g.id());
        let previous = self.current.swap(generation);
        self.published.send_replace(id);
        previous
    }

    /// Claim the single in-flight load slot.
    pub(crate) fn try_begin_load(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn end_load(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    pub(crate) fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn request_reload(&self) {
        self.reload_requested.store(true, Ordering::Release);
        self.force.notify_one();
    }

    pub(crate) fn take_reload_request(&self) -> bool {
        self.reload_requested.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn reload_requested(&self) -> bool {
        self.reload_requested.load(Ordering::Acquire)
    }

    pub(crate) fn subscribe_published(&self) -> watch::Receiver<u64> {
        self.published.subscribe()
    }
}

/// Clears the in-flight flag when a load ends, however it ends.
pub(crate) struct InFlightGuard {
    entry: Arc<NamespaceEntry>,
}

impl InFlightGuard {
    pub(crate) fn acquire(entry: &Arc<NamespaceEntry>) -> Option<Self> {
        entry.try_begin_load().then(|| Self {
            entry: Arc::clone(entry),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.entry.end_load();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::json_decoder::JsonRowDecoder;

    fn entry(capacity: usize) -> Arc<NamespaceEntry> {
        let mut config = NamespaceConfig::bulk("countries", "countries", "code", &["name"]);
        config.update_buffer_capacity = capacity;
        let decoder = Arc::new(JsonRowDecoder::from_config(&config));
        Arc::new(NamespaceEntry::new(Arc::new(Namespace::new(config, decoder))))
    }

    #[test]
    fn test_in_flight_guard_is_exclusive() {
        let entry = entry(4);

        let guard = InFlightGuard::acquire(&entry).unwrap();
        assert!(entry.is_in_flight());
        assert!(InFlightGuard::acquire(&entry).is_none());

        drop(guard);
        assert!(!entry.is_in_flight());
        assert!(InFlightGuard::acquire(&entry).is_some());
    }

    #[test]
    fn test_closed_state_is_terminal() {
        let entry = entry(4);
        assert_eq!(entry.state(), NamespaceState::Unloaded);

        assert!(entry.transition(NamespaceState::Loading));
        entry.set_state(NamespaceState::Closed);
        assert!(!entry.transition(NamespaceState::Ready));
        assert_eq!(entry.state(), NamespaceState::Closed);
    }

    #[test]
    fn test_pending_overflow_drops_buffer() {
        let mut pending = PendingUpdates::new(2);
        assert!(pending.push(UpdateRecord::tombstone("a", 0, 1)));
        assert!(pending.push(UpdateRecord::tombstone("b", 0, 2)));
        assert!(!pending.push(UpdateRecord::tombstone("c", 0, 3)));

        assert!(pending.overflowed);
        assert!(pending.records.is_empty());
        assert!(!pending.push(UpdateRecord::tombstone("d", 0, 4)));
    }

    #[test]
    fn test_reload_request_is_taken_once() {
        let entry = entry(4);
        entry.request_reload();
        assert!(entry.reload_requested());
        assert!(entry.take_reload_request());
        assert!(!entry.take_reload_request());
    }
}
