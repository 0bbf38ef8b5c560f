//! Streaming Updates
//!
//! One [`PartitionConsumer`] per (namespace, partition) applies streamed
//! deltas from an [`UpdateLog`](crate::domain::ports::UpdateLog) to the
//! namespace's current generation.

pub mod consumer;

pub use consumer::{ConsumerStats, PartitionConsumer};
