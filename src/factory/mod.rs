//! Namespace Cache Factories
//!
//! A factory performs a *full load* of one namespace from its source of
//! truth into a fresh target region and reports whether the result differs
//! from the generation currently published.
//!
//! ```text
//!                 ┌────────────────────┐
//!  SourceKind ───►│      Factory       │──► LoadResult { rows_written, changed, .. }
//!                 └────────┬───────────┘
//!             ┌────────────┴────────────┐
//!             ▼                         ▼
//!   BulkRelationalFactory     InMemoryStreamedFactory
//!   (RowSource snapshot)      (UpdateLog bootstrap)
//! ```
//!
//! Factories never touch a live generation: they always write into the
//! target handle they are given, so a failed or cancelled load can simply be
//! discarded and retried.

pub mod bulk;
pub mod streamed;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::generation::GenerationInfo;
use crate::cache::namespace::Namespace;
use crate::config::SourceKind;
use crate::error::{DecodeError, Error, Result};
use crate::store::{StoreHandle, StoreManager, WriteOp};

pub use bulk::BulkRelationalFactory;
pub use streamed::InMemoryStreamedFactory;

/// Decode failures logged at warn level per load before switching to debug
const LOGGED_DECODE_ERRORS: u64 = 10;

// =============================================================================
// Load Context and Result
// =============================================================================

/// Everything a factory needs for one full load.
pub struct LoadContext {
    pub namespace: Arc<Namespace>,
    pub store: Arc<StoreManager>,
    /// Fresh, empty region to load into
    pub target: StoreHandle,
    /// Generation currently published, if any
    pub previous: Option<GenerationInfo>,
    /// Entries per store transaction
    pub write_batch_size: usize,
    pub cancel: CancellationToken,
}

impl LoadContext {
    pub fn namespace_name(&self) -> &str {
        self.namespace.name()
    }

    /// Write a batch into the target region off the async workers.
    pub async fn write(&self, ops: Vec<WriteOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let store = Arc::clone(&self.store);
        let target = self.target.clone();
        tokio::task::spawn_blocking(move || store.write_batch(&target, ops))
            .await
            .map_err(|e| Error::Internal(format!("write task failed: {}", e)))?
    }

    pub(crate) fn cancelled(&self) -> Error {
        Error::Cancelled {
            namespace: self.namespace_name().to_string(),
        }
    }

    /// Count and fingerprint the loaded target and compare with the previous
    /// generation.
    pub async fn summarize(
        &self,
        tracker: &DecodeTracker,
        source_version: Option<String>,
        log_positions: BTreeMap<u32, u64>,
    ) -> Result<LoadResult> {
        let store = Arc::clone(&self.store);
        let target = self.target.clone();
        let (entries, fingerprint) = tokio::task::spawn_blocking(move || {
            let mut fingerprint = Fingerprint::default();
            store.scan(&target, |key, value| {
                fingerprint.add(key, &value);
                Ok(())
            })?;
            Ok::<_, Error>((fingerprint.count(), fingerprint.value()))
        })
        .await
        .map_err(|e| Error::Internal(format!("scan task failed: {}", e)))??;

        let changed = match &self.previous {
            Some(previous) => previous.fingerprint != fingerprint || previous.entries != entries,
            None => true,
        };

        Ok(LoadResult {
            rows_written: tracker.decoded(),
            changed,
            entries,
            decode_errors: tracker.errors(),
            records_seen: tracker.seen(),
            fingerprint,
            source_version,
            log_positions,
        })
    }
}

/// Outcome of a full load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadResult {
    /// Records decoded and written (duplicates included)
    pub rows_written: u64,
    /// Whether the data differs from the previous generation
    pub changed: bool,
    /// Distinct keys in the target
    pub entries: u64,
    pub decode_errors: u64,
    pub records_seen: u64,
    pub fingerprint: u64,
    pub source_version: Option<String>,
    /// Per-partition offset the bootstrap read up to (exclusive)
    pub log_positions: BTreeMap<u32, u64>,
}

impl LoadResult {
    /// Result of a load skipped because the source version did not move.
    pub fn unchanged(previous: &GenerationInfo) -> Self {
        Self {
            rows_written: 0,
            changed: false,
            entries: previous.entries,
            decode_errors: 0,
            records_seen: 0,
            fingerprint: previous.fingerprint,
            source_version: previous.source_version.clone(),
            log_positions: previous.log_positions.clone(),
        }
    }
}

// =============================================================================
// Factory Trait
// =============================================================================

/// Full-load strategy for one source kind.
#[async_trait]
pub trait CacheFactory: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Load the namespace into `ctx.target`.
    ///
    /// Errors: `SourceUnreachable` (retryable), `DecodeErrorRateExceeded`,
    /// `StoreUnavailable`, `Cancelled`.
    async fn load_full(&self, ctx: &LoadContext) -> Result<LoadResult>;
}

/// Closed set of factories, one per [`SourceKind`].
pub enum Factory {
    BulkRelational(BulkRelationalFactory),
    InMemoryStreamed(InMemoryStreamedFactory),
}

impl Factory {
    pub fn for_kind(kind: SourceKind) -> Self {
        match kind {
            SourceKind::BulkRelational => Factory::BulkRelational(BulkRelationalFactory),
            SourceKind::InMemoryStreamed => {
                Factory::InMemoryStreamed(InMemoryStreamedFactory::default())
            }
        }
    }
}

#[async_trait]
impl CacheFactory for Factory {
    fn kind(&self) -> SourceKind {
        match self {
            Factory::BulkRelational(f) => f.kind(),
            Factory::InMemoryStreamed(f) => f.kind(),
        }
    }

    async fn load_full(&self, ctx: &LoadContext) -> Result<LoadResult> {
        match self {
            Factory::BulkRelational(f) => f.load_full(ctx).await,
            Factory::InMemoryStreamed(f) => f.load_full(ctx).await,
        }
    }
}

// =============================================================================
// Decode Error Accounting
// =============================================================================

/// Counts decoded and undecodable records during one load.
pub struct DecodeTracker {
    namespace: String,
    threshold: f64,
    decoded: u64,
    errors: u64,
}

impl DecodeTracker {
    pub fn new(namespace: &str, threshold: f64) -> Self {
        Self {
            namespace: namespace.to_string(),
            threshold,
            decoded: 0,
            errors: 0,
        }
    }

    pub fn record_ok(&mut self) {
        self.decoded += 1;
    }

    pub fn record_error(&mut self, error: &DecodeError) {
        self.errors += 1;
        if self.errors <= LOGGED_DECODE_ERRORS {
            warn!(namespace = %self.namespace, "Skipping undecodable record: {}", error);
        } else {
            debug!(namespace = %self.namespace, "Skipping undecodable record: {}", error);
        }
    }

    pub fn decoded(&self) -> u64 {
        self.decoded
    }

    pub fn errors(&self) -> u64 {
        self.errors
    }

    pub fn seen(&self) -> u64 {
        self.decoded + self.errors
    }

    pub fn rate(&self) -> f64 {
        match self.seen() {
            0 => 0.0,
            seen => self.errors as f64 / seen as f64,
        }
    }

    /// Fail the load if the error rate exceeds the threshold.
    pub fn finish(&self) -> Result<()> {
        let rate = self.rate();
        if rate > self.threshold {
            return Err(Error::DecodeErrorRateExceeded {
                namespace: self.namespace.clone(),
                errors: self.errors,
                total: self.seen(),
                rate,
                threshold: self.threshold,
            });
        }
        Ok(())
    }
}

// =============================================================================
// Content Fingerprint
// =============================================================================

const FX_SEED: u64 = 0x51_7c_c1_b7_27_22_0a_95;

/// Order-independent content hash over key/value pairs.
#[derive(Debug, Default, Clone, Copy)]
pub struct Fingerprint {
    sum: u64,
    count: u64,
}

impl Fingerprint {
    pub fn add(&mut self, key: &str, value: &[u8]) {
        let mut hash = fx_hash(FX_SEED, key.as_bytes());
        // separator so ("ab", "c") and ("a", "bc") differ
        hash = fx_hash(hash, &[0xff]);
        hash = fx_hash(hash, value);
        self.sum = self.sum.wrapping_add(hash);
        self.count += 1;
    }

    pub fn value(&self) -> u64 {
        self.sum
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

/// Fast non-cryptographic hash (FxHash algorithm)
fn fx_hash(mut hash: u64, bytes: &[u8]) -> u64 {
    for &byte in bytes {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(FX_SEED);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_tracker_threshold() {
        let mut tracker = DecodeTracker::new("countries", 0.5);
        for _ in 0..4 {
            tracker.record_ok();
        }
        for _ in 0..6 {
            tracker.record_error(&DecodeError::new("bad row"));
        }

        assert_eq!(tracker.seen(), 10);
        assert!((tracker.rate() - 0.6).abs() < f64::EPSILON);
        assert!(matches!(
            tracker.finish(),
            Err(Error::DecodeErrorRateExceeded { errors: 6, total: 10, .. })
        ));
    }

    #[test]
    fn test_decode_tracker_at_threshold_passes() {
        let mut tracker = DecodeTracker::new("countries", 0.5);
        tracker.record_ok();
        tracker.record_error(&DecodeError::new("bad row"));
        assert!(tracker.finish().is_ok());

        let empty = DecodeTracker::new("countries", 0.0);
        assert!(empty.finish().is_ok());
    }

    #[test]
    fn test_fingerprint_order_independent() {
        let mut a = Fingerprint::default();
        a.add("US", b"United States");
        a.add("FR", b"France");

        let mut b = Fingerprint::default();
        b.add("FR", b"France");
        b.add("US", b"United States");

        assert_eq!(a.value(), b.value());
        assert_eq!(a.count(), 2);

        let mut c = Fingerprint::default();
        c.add("US", b"United States");
        c.add("FR", b"Francia");
        assert_ne!(a.value(), c.value());
    }

    #[test]
    fn test_fingerprint_separates_key_and_value() {
        let mut a = Fingerprint::default();
        a.add("ab", b"c");
        let mut b = Fingerprint::default();
        b.add("a", b"bc");
        assert_ne!(a.value(), b.value());
    }
}
