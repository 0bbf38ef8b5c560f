//! Consumer offset stores
//!
//! Offsets live apart from generation data so a full reload never loses the
//! consumer's position.

use std::path::{Path, PathBuf};

use dashmap::DashMap;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::debug;

use crate::domain::ports::OffsetStore;
use crate::error::{Error, Result};

const OFFSETS: TableDefinition<(&str, u32), u64> = TableDefinition::new("offsets");

/// File name of the durable offset store under the store root
pub const OFFSETS_FILE: &str = "offsets.redb";

// =============================================================================
// Durable
// =============================================================================

/// Offset store backed by a redb file.
pub struct RedbOffsetStore {
    path: PathBuf,
    db: Database,
}

impl RedbOffsetStore {
    /// Open (or create) `<root>/offsets.redb`.
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let path = root.join(OFFSETS_FILE);
        let db = Database::create(&path).map_err(offset_error)?;

        let txn = db.begin_write().map_err(offset_error)?;
        {
            let _ = txn.open_table(OFFSETS).map_err(offset_error)?;
        }
        txn.commit().map_err(offset_error)?;

        Ok(Self { path, db })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl OffsetStore for RedbOffsetStore {
    fn load(&self, namespace: &str, partition: u32) -> Result<Option<u64>> {
        let txn = self.db.begin_read().map_err(offset_error)?;
        let table = txn.open_table(OFFSETS).map_err(offset_error)?;
        let offset = table.get((namespace, partition)).map_err(offset_error)?;
        Ok(offset.map(|o| o.value()))
    }

    fn commit(&self, namespace: &str, partition: u32, offset: u64) -> Result<()> {
        let txn = self.db.begin_write().map_err(offset_error)?;
        {
            let mut table = txn.open_table(OFFSETS).map_err(offset_error)?;
            table
                .insert((namespace, partition), offset)
                .map_err(offset_error)?;
        }
        txn.commit().map_err(offset_error)?;
        debug!(namespace, partition, offset, "Committed offset");
        Ok(())
    }

    fn reset(&self, namespace: &str) -> Result<()> {
        let txn = self.db.begin_write().map_err(offset_error)?;
        {
            let mut table = txn.open_table(OFFSETS).map_err(offset_error)?;
            let mut partitions = Vec::new();
            for item in table
                .range((namespace, 0u32)..=(namespace, u32::MAX))
                .map_err(offset_error)?
            {
                let (key, _) = item.map_err(offset_error)?;
                partitions.push(key.value().1);
            }
            for partition in partitions {
                table
                    .remove((namespace, partition))
                    .map_err(offset_error)?;
            }
        }
        txn.commit().map_err(offset_error)
    }
}

fn offset_error(e: impl std::fmt::Display) -> Error {
    Error::Internal(format!("offset store: {}", e))
}

// =============================================================================
// In-Memory
// =============================================================================

/// Offset store that forgets everything on restart.
#[derive(Default)]
pub struct InMemoryOffsetStore {
    offsets: DashMap<(String, u32), u64>,
}

impl InMemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OffsetStore for InMemoryOffsetStore {
    fn load(&self, namespace: &str, partition: u32) -> Result<Option<u64>> {
        Ok(self
            .offsets
            .get(&(namespace.to_string(), partition))
            .map(|o| *o))
    }

    fn commit(&self, namespace: &str, partition: u32, offset: u64) -> Result<()> {
        self.offsets.insert((namespace.to_string(), partition), offset);
        Ok(())
    }

    fn reset(&self, namespace: &str) -> Result<()> {
        self.offsets.retain(|(ns, _), _| ns != namespace);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn OffsetStore) {
        assert_eq!(store.load("countries", 0).unwrap(), None);

        store.commit("countries", 0, 41).unwrap();
        store.commit("countries", 1, 7).unwrap();
        store.commit("advertisers", 0, 99).unwrap();
        store.commit("countries", 0, 42).unwrap();

        assert_eq!(store.load("countries", 0).unwrap(), Some(42));
        assert_eq!(store.load("countries", 1).unwrap(), Some(7));

        store.reset("countries").unwrap();
        assert_eq!(store.load("countries", 0).unwrap(), None);
        assert_eq!(store.load("countries", 1).unwrap(), None);
        assert_eq!(store.load("advertisers", 0).unwrap(), Some(99));
    }

    #[test]
    fn test_in_memory_offsets() {
        exercise(&InMemoryOffsetStore::new());
    }

    #[test]
    fn test_redb_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbOffsetStore::open(dir.path()).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_redb_offsets_persist() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = RedbOffsetStore::open(dir.path()).unwrap();
            store.commit("countries", 2, 1234).unwrap();
        }
        let store = RedbOffsetStore::open(dir.path()).unwrap();
        assert_eq!(store.load("countries", 2).unwrap(), Some(1234));
    }
}
