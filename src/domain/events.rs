//! Namespace Events
//!
//! Immutable records of significant occurrences in a namespace's life:
//! registration, refresh outcomes, generation publication and disposal,
//! streaming anomalies and shutdown.
//!
//! Events are used for:
//! - Audit logging
//! - Monitoring hooks (surfacing store and source failures)
//! - Test assertions without reaching into manager internals

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event representing a significant occurrence for one namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NamespaceEvent {
    // =========================================================================
    // Lifecycle Events
    // =========================================================================
    /// A namespace was registered with the cache manager.
    NamespaceRegistered {
        namespace: String,
        source_kind: String,
        backend: String,
        timestamp: DateTime<Utc>,
    },

    /// A persisted generation was recovered at startup.
    GenerationRecovered {
        namespace: String,
        generation: u64,
        entries: u64,
        timestamp: DateTime<Utc>,
    },

    /// The namespace was closed during shutdown.
    NamespaceClosed {
        namespace: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Refresh Events
    // =========================================================================
    /// A new generation was atomically published.
    GenerationPublished {
        namespace: String,
        generation: u64,
        previous_generation: Option<u64>,
        entries: u64,
        size_bytes: u64,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A full load completed but produced identical data.
    RefreshUnchanged {
        namespace: String,
        generation: u64,
        timestamp: DateTime<Utc>,
    },

    /// A full load failed; the previous generation (if any) keeps serving.
    RefreshFailed {
        namespace: String,
        kind: String,
        reason: String,
        retryable: bool,
        timestamp: DateTime<Utc>,
    },

    /// A superseded generation was destroyed after readers drained.
    GenerationDisposed {
        namespace: String,
        generation: u64,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Streaming Events
    // =========================================================================
    /// The bounded update buffer overflowed and a full reload was requested.
    UpdateBufferOverflow {
        namespace: String,
        capacity: usize,
        timestamp: DateTime<Utc>,
    },

    /// The consumer found a hole in the update log.
    OffsetGapDetected {
        namespace: String,
        partition: u32,
        expected: u64,
        available: u64,
        timestamp: DateTime<Utc>,
    },
}

impl NamespaceEvent {
    /// Get the event type as a string.
    pub fn event_type(&self) -> &'static str {
        match self {
            NamespaceEvent::NamespaceRegistered { .. } => "NamespaceRegistered",
            NamespaceEvent::GenerationRecovered { .. } => "GenerationRecovered",
            NamespaceEvent::NamespaceClosed { .. } => "NamespaceClosed",
            NamespaceEvent::GenerationPublished { .. } => "GenerationPublished",
            NamespaceEvent::RefreshUnchanged { .. } => "RefreshUnchanged",
            NamespaceEvent::RefreshFailed { .. } => "RefreshFailed",
            NamespaceEvent::GenerationDisposed { .. } => "GenerationDisposed",
            NamespaceEvent::UpdateBufferOverflow { .. } => "UpdateBufferOverflow",
            NamespaceEvent::OffsetGapDetected { .. } => "OffsetGapDetected",
        }
    }

    /// Get the namespace the event belongs to.
    pub fn namespace(&self) -> &str {
        match self {
            NamespaceEvent::NamespaceRegistered { namespace, .. }
            | NamespaceEvent::GenerationRecovered { namespace, .. }
            | NamespaceEvent::NamespaceClosed { namespace, .. }
            | NamespaceEvent::GenerationPublished { namespace, .. }
            | NamespaceEvent::RefreshUnchanged { namespace, .. }
            | NamespaceEvent::RefreshFailed { namespace, .. }
            | NamespaceEvent::GenerationDisposed { namespace, .. }
            | NamespaceEvent::UpdateBufferOverflow { namespace, .. }
            | NamespaceEvent::OffsetGapDetected { namespace, .. } => namespace,
        }
    }

    /// Get the event timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            NamespaceEvent::NamespaceRegistered { timestamp, .. }
            | NamespaceEvent::GenerationRecovered { timestamp, .. }
            | NamespaceEvent::NamespaceClosed { timestamp, .. }
            | NamespaceEvent::GenerationPublished { timestamp, .. }
            | NamespaceEvent::RefreshUnchanged { timestamp, .. }
            | NamespaceEvent::RefreshFailed { timestamp, .. }
            | NamespaceEvent::GenerationDisposed { timestamp, .. }
            | NamespaceEvent::UpdateBufferOverflow { timestamp, .. }
            | NamespaceEvent::OffsetGapDetected { timestamp, .. } => *timestamp,
        }
    }

    /// Whether the event reports a failure worth alerting on.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            NamespaceEvent::RefreshFailed { .. }
                | NamespaceEvent::UpdateBufferOverflow { .. }
                | NamespaceEvent::OffsetGapDetected { .. }
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
