//! Region abstraction shared by the store backends

use bytes::Bytes;

use crate::error::Result;

/// Single mutation inside a region write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RegionOp {
    Put(String, Bytes),
    Delete(String),
}

/// Isolated key/value region backing one (namespace, generation).
///
/// Values are opaque, already-encoded bytes.
pub(crate) trait KvRegion: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Apply every op or none of them.
    fn apply(&self, ops: Vec<RegionOp>) -> Result<()>;

    fn scan(&self, f: &mut dyn FnMut(&str, &[u8]) -> Result<()>) -> Result<()>;

    fn len(&self) -> Result<u64>;

    fn size_bytes(&self) -> Result<u64>;

    fn compact(&self) -> Result<()>;

    /// Release the region's resources. Later calls fail with
    /// `StoreUnavailable`.
    fn close(&self) -> Result<()>;
}
