//! Cache Core
//!
//! - **Generations** (`generation.rs`) - immutable snapshots and their metadata
//! - **Namespaces** (`namespace.rs`) - descriptors, lifecycle state, pending deltas
//! - **Manager** (`manager.rs`) - loads, atomic publication, deltas, disposal
//! - **Scheduler** (`scheduler.rs`) - periodic and forced refresh loops

pub mod generation;
pub mod manager;
pub mod namespace;
pub mod scheduler;

pub use generation::{Generation, GenerationInfo};
pub use manager::{ApplyOutcome, CacheManager, RefreshOutcome};
pub use namespace::{Namespace, NamespaceState, NamespaceStatus, RefreshState};
