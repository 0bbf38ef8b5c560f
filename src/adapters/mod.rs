//! Infrastructure Adapters
//!
//! Implementations of the domain ports, following the Port/Adapter
//! (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  RowSource │ UpdateLog │ RowDecoder │ EventPublisher       │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ PostgresRowSource │ InMemoryRowSource │ InMemoryUpdateLog  │ │
//! │  │ FileUpdateLog │ JsonRowDecoder │ LoggingEventPublisher     │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Offset stores live next to the generation store in [`crate::store`].
//!
//! # Usage
//!
//! ```ignore
//! use nscache::adapters::{InMemoryRowSource, JsonRowDecoder};
//! use nscache::domain::ports::SourceRow;
//!
//! let source = InMemoryRowSource::new("reference")
//!     .with_rows(vec![SourceRow::new().with("code", "US").with("name", "United States")]);
//! let decoder = JsonRowDecoder::new("code", vec!["name".to_string()]);
//! ```

pub mod event_publisher;
pub mod file_log;
pub mod json_decoder;
pub mod memory;
pub mod postgres;

pub use event_publisher::{CompositeEventPublisher, InMemoryEventCollector, LoggingEventPublisher};
pub use file_log::FileUpdateLog;
pub use json_decoder::JsonRowDecoder;
pub use memory::{InMemoryRowSource, InMemoryUpdateLog};
pub use postgres::PostgresRowSource;
