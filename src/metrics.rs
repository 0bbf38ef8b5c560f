//! Prometheus Metrics
//!
//! Collectors for lookups, refreshes, generations and streamed updates,
//! registered in a registry owned by [`CacheMetrics`] so several caches can
//! coexist in one process (and in one test binary).

use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::cache::generation::GenerationInfo;
use crate::error::Result;

/// Full load duration buckets (seconds)
const REFRESH_DURATION_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0, 3600.0,
];

/// Lookup outcome label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupResult {
    Hit,
    Miss,
    NotReady,
    Error,
}

impl LookupResult {
    fn as_str(&self) -> &'static str {
        match self {
            LookupResult::Hit => "hit",
            LookupResult::Miss => "miss",
            LookupResult::NotReady => "not_ready",
            LookupResult::Error => "error",
        }
    }
}

/// Container for all cache metrics.
#[derive(Clone)]
pub struct CacheMetrics {
    registry: Registry,

    /// Lookups - labels: namespace, result
    pub lookups_total: IntCounterVec,

    /// Full load attempts - labels: namespace, outcome
    pub refresh_total: IntCounterVec,

    /// Full load duration - labels: namespace
    pub refresh_duration_seconds: HistogramVec,

    /// Published generation id - labels: namespace
    pub generation_id: IntGaugeVec,

    /// Entries in the published generation - labels: namespace
    pub generation_entries: IntGaugeVec,

    /// Size of the published generation - labels: namespace
    pub generation_size_bytes: IntGaugeVec,

    /// Undecodable records - labels: namespace, path (load/stream)
    pub decode_errors_total: IntCounterVec,

    /// Streamed updates - labels: namespace, outcome
    pub updates_total: IntCounterVec,

    /// Streamed updates waiting for a generation - labels: namespace
    pub buffered_updates: IntGaugeVec,

    /// Offset gaps detected - labels: namespace
    pub offset_gaps_total: IntCounterVec,

    /// 1 when the namespace serves a generation - labels: namespace
    pub namespace_ready: IntGaugeVec,
}

impl CacheMetrics {
    /// Create a registry and register every collector in it.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let lookups_total = IntCounterVec::new(
            Opts::new("nscache_lookups_total", "Total number of lookups"),
            &["namespace", "result"],
        )?;
        let refresh_total = IntCounterVec::new(
            Opts::new("nscache_refresh_total", "Total number of full load attempts"),
            &["namespace", "outcome"],
        )?;
        let refresh_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "nscache_refresh_duration_seconds",
                "Full load duration in seconds",
            )
            .buckets(REFRESH_DURATION_BUCKETS.to_vec()),
            &["namespace"],
        )?;
        let generation_id = IntGaugeVec::new(
            Opts::new("nscache_generation_id", "Published generation id"),
            &["namespace"],
        )?;
        let generation_entries = IntGaugeVec::new(
            Opts::new(
                "nscache_generation_entries",
                "Entries in the published generation",
            ),
            &["namespace"],
        )?;
        let generation_size_bytes = IntGaugeVec::new(
            Opts::new(
                "nscache_generation_size_bytes",
                "Size of the published generation in bytes",
            ),
            &["namespace"],
        )?;
        let decode_errors_total = IntCounterVec::new(
            Opts::new("nscache_decode_errors_total", "Records that failed to decode"),
            &["namespace", "path"],
        )?;
        let updates_total = IntCounterVec::new(
            Opts::new("nscache_updates_total", "Streamed updates by outcome"),
            &["namespace", "outcome"],
        )?;
        let buffered_updates = IntGaugeVec::new(
            Opts::new(
                "nscache_buffered_updates",
                "Streamed updates waiting for the next generation",
            ),
            &["namespace"],
        )?;
        let offset_gaps_total = IntCounterVec::new(
            Opts::new("nscache_offset_gaps_total", "Offset gaps detected"),
            &["namespace"],
        )?;
        let namespace_ready = IntGaugeVec::new(
            Opts::new(
                "nscache_namespace_ready",
                "Whether the namespace serves a generation",
            ),
            &["namespace"],
        )?;

        registry.register(Box::new(lookups_total.clone()))?;
        registry.register(Box::new(refresh_total.clone()))?;
        registry.register(Box::new(refresh_duration_seconds.clone()))?;
        registry.register(Box::new(generation_id.clone()))?;
        registry.register(Box::new(generation_entries.clone()))?;
        registry.register(Box::new(generation_size_bytes.clone()))?;
        registry.register(Box::new(decode_errors_total.clone()))?;
        registry.register(Box::new(updates_total.clone()))?;
        registry.register(Box::new(buffered_updates.clone()))?;
        registry.register(Box::new(offset_gaps_total.clone()))?;
        registry.register(Box::new(namespace_ready.clone()))?;

        Ok(Self {
            registry,
            lookups_total,
            refresh_total,
            refresh_duration_seconds,
            generation_id,
            generation_entries,
            generation_size_bytes,
            decode_errors_total,
            updates_total,
            buffered_updates,
            offset_gaps_total,
            namespace_ready,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encode every collector in the text exposition format.
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }

    pub fn record_lookup(&self, namespace: &str, result: LookupResult) {
        self.lookups_total
            .with_label_values(&[namespace, result.as_str()])
            .inc();
    }

    /// Record a full load outcome (`published`, `unchanged`, `skipped`,
    /// `failed`).
    pub fn record_refresh(&self, namespace: &str, outcome: &str, duration: Option<Duration>) {
        self.refresh_total
            .with_label_values(&[namespace, outcome])
            .inc();
        if let Some(duration) = duration {
            self.refresh_duration_seconds
                .with_label_values(&[namespace])
                .observe(duration.as_secs_f64());
        }
    }

    pub fn set_generation(&self, info: &GenerationInfo) {
        let ns = info.namespace.as_str();
        self.generation_id
            .with_label_values(&[ns])
            .set(info.id as i64);
        self.generation_entries
            .with_label_values(&[ns])
            .set(info.entries as i64);
        self.generation_size_bytes
            .with_label_values(&[ns])
            .set(info.size_bytes as i64);
        self.namespace_ready.with_label_values(&[ns]).set(1);
    }

    pub fn set_not_ready(&self, namespace: &str) {
        self.namespace_ready.with_label_values(&[namespace]).set(0);
    }

    pub fn record_decode_errors(&self, namespace: &str, path: &str, count: u64) {
        if count > 0 {
            self.decode_errors_total
                .with_label_values(&[namespace, path])
                .inc_by(count);
        }
    }

    pub fn record_update(&self, namespace: &str, outcome: &str) {
        self.updates_total
            .with_label_values(&[namespace, outcome])
            .inc();
    }

    pub fn set_buffered(&self, namespace: &str, buffered: usize) {
        self.buffered_updates
            .with_label_values(&[namespace])
            .set(buffered as i64);
    }

    pub fn record_offset_gap(&self, namespace: &str) {
        self.offset_gaps_total.with_label_values(&[namespace]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_independent_registries() {
        // two instances must not collide
        let a = CacheMetrics::new().unwrap();
        let b = CacheMetrics::new().unwrap();

        a.record_lookup("countries", LookupResult::Hit);
        assert_eq!(
            a.lookups_total.with_label_values(&["countries", "hit"]).get(),
            1
        );
        assert_eq!(
            b.lookups_total.with_label_values(&["countries", "hit"]).get(),
            0
        );
    }

    #[test]
    fn test_encode_text_format() {
        let metrics = CacheMetrics::new().unwrap();
        metrics.record_refresh("countries", "published", Some(Duration::from_millis(250)));
        metrics.record_decode_errors("countries", "load", 3);

        let (content_type, body) = metrics.encode().unwrap();
        let body = String::from_utf8(body).unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(body.contains("nscache_refresh_total"));
        assert!(body.contains("nscache_decode_errors_total"));
    }
}
