//! Domain Layer
//!
//! Core abstractions the cache depends on.
//!
//! - **Ports** (`ports.rs`) - Trait abstractions for external collaborators
//! - **Events** (`events.rs`) - Namespace lifecycle events for audit and monitoring
//!
//! # Usage
//!
//! ```ignore
//! use nscache::domain::ports::{RowSource, RowDecoder};
//!
//! async fn count_rows<S: RowSource>(source: &S, query: &SourceQuery) -> Result<usize> {
//!     let rows = source.fetch_rows(query).await?;
//!     Ok(rows.count().await)
//! }
//! ```

pub mod events;
pub mod ports;

pub use events::NamespaceEvent;
pub use ports::{
    DecodedEntry, EventPublisher, LogBatch, OffsetStore, RawRecord, RowDecoder, RowSource,
    SourceQuery, SourceRow, UpdateLog, UpdateRecord,
};
