//! Domain Ports (Port/Adapter Pattern)
//!
//! Abstractions over the collaborators the cache core depends on but does
//! not implement: the bulk source driver, the streaming transport, the schema
//! decoder, offset persistence and event publishing. Adapters in
//! [`crate::adapters`] and [`crate::store`] provide concrete implementations.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Cache Core                              │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  RowSource │ UpdateLog │ RowDecoder │ OffsetStore   │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  PostgresRowSource │ FileUpdateLog │ JsonRowDecoder │ redb  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use super::events::NamespaceEvent;
use crate::error::{DecodeError, Result};

// =============================================================================
// Value Objects
// =============================================================================

/// One row produced by a bulk source, column name to typed value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceRow {
    fields: BTreeMap<String, serde_json::Value>,
}

impl SourceRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style column insert.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(column.into(), value.into());
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: serde_json::Value) {
        self.fields.insert(column.into(), value);
    }

    pub fn get(&self, column: &str) -> Option<&serde_json::Value> {
        self.fields.get(column)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl FromIterator<(String, serde_json::Value)> for SourceRow {
    fn from_iter<T: IntoIterator<Item = (String, serde_json::Value)>>(iter: T) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Read query handed to a bulk source. The cache never interprets the filter;
/// it is passed through to the driver verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceQuery {
    /// Table name, optionally schema-qualified
    pub table: String,
    /// Columns to select
    pub columns: Vec<String>,
    /// Optional row filter in the source's own dialect
    pub filter: Option<String>,
    /// Column whose maximum identifies the snapshot version
    pub version_column: Option<String>,
}

/// A decoded key/value pair ready to be written into a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEntry {
    pub key: String,
    pub value: Bytes,
}

/// A raw record as delivered by the streaming transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub partition: u32,
    pub offset: u64,
    /// Message key, if the transport carries one
    pub key: Option<String>,
    /// Message payload; `None` is a tombstone
    pub payload: Option<Bytes>,
}

/// A decoded streamed delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRecord {
    pub key: String,
    /// New value, or `None` to delete the key
    pub value: Option<Bytes>,
    pub partition: u32,
    pub offset: u64,
}

impl UpdateRecord {
    pub fn upsert(key: impl Into<String>, value: Bytes, partition: u32, offset: u64) -> Self {
        Self {
            key: key.into(),
            value: Some(value),
            partition,
            offset,
        }
    }

    pub fn tombstone(key: impl Into<String>, partition: u32, offset: u64) -> Self {
        Self {
            key: key.into(),
            value: None,
            partition,
            offset,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Result of one fetch against an update log partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogBatch {
    /// Records in offset order (possibly empty)
    Records(Vec<RawRecord>),
    /// The transport rebalanced; the consumer must resubscribe
    Resubscribe,
}

// =============================================================================
// Port Traits
// =============================================================================

/// Bulk relational source driver.
///
/// Connection lifecycle, pooling and reconnects belong to the implementation.
/// Unreachable sources are reported as [`crate::Error::SourceUnreachable`];
/// rows that cannot be converted are yielded as [`crate::Error::Decode`]
/// items so the load can count them.
#[async_trait]
pub trait RowSource: Send + Sync {
    /// Source name for logging.
    fn name(&self) -> &str;

    /// Stream every row matching the query.
    async fn fetch_rows(&self, query: &SourceQuery)
        -> Result<BoxStream<'static, Result<SourceRow>>>;

    /// Current snapshot version (maximum of `query.version_column`).
    /// Sources without versioning return `None`.
    async fn source_version(&self, query: &SourceQuery) -> Result<Option<String>> {
        let _ = query;
        Ok(None)
    }
}

/// Ordered, replayable, partitioned log of update records.
#[async_trait]
pub trait UpdateLog: Send + Sync {
    /// Topic name
    fn topic(&self) -> &str;

    /// Partitions currently assigned
    async fn partitions(&self) -> Result<Vec<u32>>;

    /// Earliest offset still retained in the partition
    async fn earliest_offset(&self, partition: u32) -> Result<u64>;

    /// Offset the next appended record will receive
    async fn end_offset(&self, partition: u32) -> Result<u64>;

    /// Fetch up to `max_records` starting at `from`, waiting up to `wait`
    /// when nothing is available yet.
    async fn fetch(
        &self,
        partition: u32,
        from: u64,
        max_records: usize,
        wait: Duration,
    ) -> Result<LogBatch>;
}

/// Schema-aware decode function injected per namespace.
pub trait RowDecoder: Send + Sync {
    /// Decode a bulk source row into a key and serialized value.
    fn decode_row(&self, row: &SourceRow) -> std::result::Result<DecodedEntry, DecodeError>;

    /// Decode a streamed record into an update.
    fn decode_record(&self, record: &RawRecord) -> std::result::Result<UpdateRecord, DecodeError>;
}

/// Persistence for per namespace-partition consumer offsets.
///
/// Stored offsets are the last *applied* offset, not the next to read.
pub trait OffsetStore: Send + Sync {
    fn load(&self, namespace: &str, partition: u32) -> Result<Option<u64>>;

    fn commit(&self, namespace: &str, partition: u32, offset: u64) -> Result<()>;

    /// Forget every offset recorded for the namespace.
    fn reset(&self, namespace: &str) -> Result<()>;
}

/// Port for publishing namespace lifecycle events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a namespace event.
    async fn publish(&self, event: NamespaceEvent) -> Result<()>;

    /// Publish multiple events.
    async fn publish_all(&self, events: Vec<NamespaceEvent>) -> Result<()>;
}

// =============================================================================
// Tests
// =============================================================================
