//! Durable Store
//!
//! Region management for cache generations plus consumer offset storage.
//!
//! - **Manager** (`manager.rs`) - open/get/put/delete/seal/recover/destroy
//! - **Backends** (`memory.rs`, `durable.rs`) - concurrent map or redb file
//! - **Compression** (`compression.rs`) - tagged LZ4 value encoding
//! - **Offsets** (`offsets.rs`) - per namespace-partition consumer offsets

pub mod compression;
mod durable;
pub mod manager;
mod memory;
pub mod offsets;
mod region;

pub use compression::{CompressionAlgorithm, CompressionConfig, ValueCodec};
pub use manager::{StoreHandle, StoreManager, WriteOp};
pub use offsets::{InMemoryOffsetStore, RedbOffsetStore};
