//! nscache - Versioned Namespace Lookup Cache
//!
//! Serves low-latency key → value resolution for a query engine while the
//! underlying reference data is refreshed out of band, both by scheduled
//! bulk reloads from a relational source and by streamed incremental
//! updates.
//!
//! # Architecture
//!
//! ```text
//!                ┌──────────────┐   bulk rows    ┌──────────────────┐
//!  RowSource ───▶│   Factory    │──────────────▶│  gen N+1 (store)  │
//!                └──────▲───────┘                └─────────┬────────┘
//!                       │ schedule                          │ atomic swap
//!                ┌──────┴───────┐                ┌─────────▼────────┐
//!                │ CacheManager │───────────────▶│  current pointer  │◀── LookupService
//!                └──────▲───────┘                └─────────▲────────┘
//!                       │ deltas                            │
//!  UpdateLog ──▶ PartitionConsumer ─────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Source, transport, decoder and event adapters
//! - [`cache`] - Generations, namespaces, cache manager, refresh scheduler
//! - [`config`] - YAML configuration
//! - [`domain`] - Ports and domain events
//! - [`error`] - Error types
//! - [`factory`] - Full loads per source kind
//! - [`lookup`] - Read facade
//! - [`metrics`] - Prometheus collectors
//! - [`runtime`] - Composition root and task supervision
//! - [`store`] - Generation regions, compression, offset stores
//! - [`streaming`] - Partition consumers

pub mod adapters;
pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod factory;
pub mod lookup;
pub mod metrics;
pub mod runtime;
pub mod store;
pub mod streaming;

// Re-export commonly used types
pub use cache::{
    ApplyOutcome, CacheManager, Generation, GenerationInfo, Namespace, NamespaceState,
    NamespaceStatus, RefreshOutcome,
};
pub use config::{AppConfig, NamespaceConfig, SourceKind, StoreBackend};
pub use error::{Error, Result};
pub use lookup::LookupService;
pub use metrics::CacheMetrics;
pub use runtime::{LookupRuntime, RuntimeBuilder};
pub use store::StoreManager;
