//! Error types for the namespace lookup cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// A single record or row that could not be decoded.
///
/// Decode failures are counted per load and only become fatal once the
/// namespace's error-rate threshold is exceeded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct DecodeError {
    pub reason: String,
}

impl DecodeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Errors that can occur in the lookup cache
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Refresh Errors
    // =========================================================================
    /// Source of truth could not be reached (retryable)
    #[error("Source unreachable for namespace {namespace}: {reason}")]
    SourceUnreachable { namespace: String, reason: String },

    /// A single record failed to decode
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Too many records failed to decode during one load
    #[error(
        "Decode error rate {rate:.3} exceeded threshold {threshold:.3} for namespace {namespace} ({errors}/{total} records)"
    )]
    DecodeErrorRateExceeded {
        namespace: String,
        errors: u64,
        total: u64,
        rate: f64,
        threshold: f64,
    },

    /// A full load is already running for the namespace
    #[error("Refresh already in progress for namespace: {namespace}")]
    RefreshInProgress { namespace: String },

    /// The load was cancelled by shutdown
    #[error("Load cancelled for namespace: {namespace}")]
    Cancelled { namespace: String },

    // =========================================================================
    // Store Errors
    // =========================================================================
    /// Durable store could not be opened or used
    #[error("Store unavailable for namespace {namespace} generation {generation}: {reason}")]
    StoreUnavailable {
        namespace: String,
        generation: u64,
        reason: String,
    },

    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    // =========================================================================
    // Streaming Errors
    // =========================================================================
    /// Requested offset is no longer available in the update log
    #[error(
        "Offset gap detected on {namespace}/{partition}: expected {expected}, next available {available}"
    )]
    OffsetGapDetected {
        namespace: String,
        partition: u32,
        expected: u64,
        available: u64,
    },

    /// Update transport failed
    #[error("Update log error on topic {topic}: {reason}")]
    UpdateLog { topic: String, reason: String },

    // =========================================================================
    // Namespace Errors
    // =========================================================================
    /// Namespace name is structurally invalid
    #[error("Invalid namespace name: {0:?}")]
    InvalidNamespace(String),

    /// Namespace is not registered
    #[error("Namespace not found: {0}")]
    NamespaceNotFound(String),

    /// Namespace is already registered
    #[error("Namespace already registered: {0}")]
    NamespaceExists(String),

    /// Cache manager has been closed
    #[error("Cache manager is closed")]
    Closed,

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a later attempt may succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SourceUnreachable { .. } | Error::Io(_) | Error::UpdateLog { .. }
        )
    }

    /// Stable short label used for metrics and refresh state.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::SourceUnreachable { .. } => "source_unreachable",
            Error::Decode(_) => "decode",
            Error::DecodeErrorRateExceeded { .. } => "decode_rate_exceeded",
            Error::RefreshInProgress { .. } => "refresh_in_progress",
            Error::Cancelled { .. } => "cancelled",
            Error::StoreUnavailable { .. } => "store_unavailable",
            Error::CompressionFailed { .. } | Error::DecompressionFailed { .. } => "compression",
            Error::OffsetGapDetected { .. } => "offset_gap",
            Error::UpdateLog { .. } => "update_log",
            Error::InvalidNamespace(_) => "invalid_namespace",
            Error::NamespaceNotFound(_) => "namespace_not_found",
            Error::NamespaceExists(_) => "namespace_exists",
            Error::Closed => "closed",
            Error::Config(_) | Error::DurationParse(_) | Error::Yaml(_) => "config",
            Error::Serialization(_) => "serialization",
            Error::Metrics(_) => "metrics",
            Error::Internal(_) => "internal",
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let unreachable = Error::SourceUnreachable {
            namespace: "countries".into(),
            reason: "connection refused".into(),
        };
        assert!(unreachable.is_retryable());

        let store = Error::StoreUnavailable {
            namespace: "countries".into(),
            generation: 3,
            reason: "disk full".into(),
        };
        assert!(!store.is_retryable());
        assert!(!Error::Decode(DecodeError::new("bad")).is_retryable());
    }

    #[test]
    fn test_error_kind_labels() {
        assert_eq!(Error::Closed.kind(), "closed");
        assert_eq!(
            Error::InvalidNamespace("a/b".into()).kind(),
            "invalid_namespace"
        );
        assert_eq!(Error::DurationParse("x".into()).kind(), "config");
    }

    #[test]
    fn test_decode_rate_message() {
        let err = Error::DecodeErrorRateExceeded {
            namespace: "countries".into(),
            errors: 6,
            total: 10,
            rate: 0.6,
            threshold: 0.5,
        };
        let msg = err.to_string();
        assert!(msg.contains("0.600"));
        assert!(msg.contains("6/10"));
    }
}
