//! Durable region backend
//!
//! One redb database file per (namespace, generation):
//!
//! ```text
//! <root>/<namespace>/gen-<id>/data.redb
//! ```

use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::RwLock;
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};

use super::region::{KvRegion, RegionOp};
use crate::error::{Error, Result};

const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");

/// Data file name inside a generation directory
pub(crate) const DATA_FILE: &str = "data.redb";

pub(crate) struct RedbRegion {
    namespace: String,
    generation: u64,
    path: PathBuf,
    /// `None` once closed; the write lock is only taken to close or compact
    db: RwLock<Option<Database>>,
}

impl RedbRegion {
    /// Create (or reopen) the region in `dir`, eagerly creating its table.
    pub(crate) fn open(namespace: &str, generation: u64, dir: &Path) -> Result<Self> {
        let unavailable = |reason: String| Error::StoreUnavailable {
            namespace: namespace.to_string(),
            generation,
            reason,
        };

        std::fs::create_dir_all(dir).map_err(|e| unavailable(e.to_string()))?;
        let path = dir.join(DATA_FILE);
        let db = Database::create(&path).map_err(|e| unavailable(e.to_string()))?;

        let txn = db.begin_write().map_err(|e| unavailable(e.to_string()))?;
        {
            let _ = txn
                .open_table(ENTRIES)
                .map_err(|e| unavailable(e.to_string()))?;
        }
        txn.commit().map_err(|e| unavailable(e.to_string()))?;

        Ok(Self {
            namespace: namespace.to_string(),
            generation,
            path,
            db: RwLock::new(Some(db)),
        })
    }

    fn unavailable(&self, reason: impl std::fmt::Display) -> Error {
        Error::StoreUnavailable {
            namespace: self.namespace.clone(),
            generation: self.generation,
            reason: reason.to_string(),
        }
    }

    fn closed(&self) -> Error {
        self.unavailable("region is closed")
    }
}

impl KvRegion for RedbRegion {
    fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(|| self.closed())?;

        let txn = db.begin_read().map_err(|e| self.unavailable(e))?;
        let table = txn.open_table(ENTRIES).map_err(|e| self.unavailable(e))?;
        let value = table.get(key).map_err(|e| self.unavailable(e))?;
        Ok(value.map(|v| Bytes::copy_from_slice(v.value())))
    }

    fn apply(&self, ops: Vec<RegionOp>) -> Result<()> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(|| self.closed())?;

        let txn = db.begin_write().map_err(|e| self.unavailable(e))?;
        {
            let mut table = txn.open_table(ENTRIES).map_err(|e| self.unavailable(e))?;
            for op in &ops {
                match op {
                    RegionOp::Put(key, value) => {
                        table
                            .insert(key.as_str(), value.as_ref())
                            .map_err(|e| self.unavailable(e))?;
                    }
                    RegionOp::Delete(key) => {
                        table
                            .remove(key.as_str())
                            .map_err(|e| self.unavailable(e))?;
                    }
                }
            }
        }
        txn.commit().map_err(|e| self.unavailable(e))
    }

    fn scan(&self, f: &mut dyn FnMut(&str, &[u8]) -> Result<()>) -> Result<()> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(|| self.closed())?;

        let txn = db.begin_read().map_err(|e| self.unavailable(e))?;
        let table = txn.open_table(ENTRIES).map_err(|e| self.unavailable(e))?;
        for item in table.iter().map_err(|e| self.unavailable(e))? {
            let (key, value) = item.map_err(|e| self.unavailable(e))?;
            f(key.value(), value.value())?;
        }
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(|| self.closed())?;

        let txn = db.begin_read().map_err(|e| self.unavailable(e))?;
        let table = txn.open_table(ENTRIES).map_err(|e| self.unavailable(e))?;
        table.len().map_err(|e| self.unavailable(e))
    }

    fn size_bytes(&self) -> Result<u64> {
        let metadata = std::fs::metadata(&self.path).map_err(|e| self.unavailable(e))?;
        Ok(metadata.len())
    }

    fn compact(&self) -> Result<()> {
        let mut guard = self.db.write();
        let db = guard.as_mut().ok_or_else(|| self.closed())?;
        db.compact().map_err(|e| self.unavailable(e))?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        // dropping the Database flushes and releases the file lock
        self.db.write().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redb_region_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let region = RedbRegion::open("countries", 1, dir.path()).unwrap();

        region
            .apply(vec![
                RegionOp::Put("US".into(), Bytes::from_static(b"United States")),
                RegionOp::Put("FR".into(), Bytes::from_static(b"France")),
            ])
            .unwrap();
        assert_eq!(region.len().unwrap(), 2);
        assert_eq!(
            region.get("US").unwrap(),
            Some(Bytes::from_static(b"United States"))
        );

        region.apply(vec![RegionOp::Delete("FR".into())]).unwrap();
        assert!(region.get("FR").unwrap().is_none());
        assert_eq!(region.len().unwrap(), 1);
    }

    #[test]
    fn test_redb_region_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let region = RedbRegion::open("countries", 1, dir.path()).unwrap();
            region
                .apply(vec![RegionOp::Put("DE".into(), Bytes::from_static(b"Germany"))])
                .unwrap();
            region.compact().unwrap();
            region.close().unwrap();
        }

        let region = RedbRegion::open("countries", 1, dir.path()).unwrap();
        assert_eq!(
            region.get("DE").unwrap(),
            Some(Bytes::from_static(b"Germany"))
        );
    }

    #[test]
    fn test_closed_region_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let region = RedbRegion::open("countries", 1, dir.path()).unwrap();
        region.close().unwrap();

        assert!(matches!(
            region.get("US"),
            Err(Error::StoreUnavailable { generation: 1, .. })
        ));
    }
}
