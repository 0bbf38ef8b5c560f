//! In-memory region backend
//!
//! Sharded concurrent map per generation. Nothing survives a restart.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;

use super::region::{KvRegion, RegionOp};
use crate::error::{Error, Result};

pub(crate) struct MemoryRegion {
    namespace: String,
    generation: u64,
    entries: DashMap<String, Bytes>,
    /// Sum of key and stored value lengths
    total_bytes: AtomicU64,
    closed: AtomicBool,
}

impl MemoryRegion {
    pub(crate) fn new(namespace: &str, generation: u64) -> Self {
        Self {
            namespace: namespace.to_string(),
            generation,
            entries: DashMap::new(),
            total_bytes: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::StoreUnavailable {
                namespace: self.namespace.clone(),
                generation: self.generation,
                reason: "region is closed".into(),
            });
        }
        Ok(())
    }

    fn put(&self, key: String, value: Bytes) {
        let key_len = key.len() as u64;
        let value_len = value.len() as u64;
        match self.entries.insert(key, value) {
            Some(old) => {
                // key already counted
                self.total_bytes.fetch_add(value_len, Ordering::Relaxed);
                self.total_bytes
                    .fetch_sub(old.len() as u64, Ordering::Relaxed);
            }
            None => {
                self.total_bytes
                    .fetch_add(key_len + value_len, Ordering::Relaxed);
            }
        }
    }

    fn remove(&self, key: &str) {
        if let Some((k, old)) = self.entries.remove(key) {
            self.total_bytes
                .fetch_sub((k.len() + old.len()) as u64, Ordering::Relaxed);
        }
    }
}

impl KvRegion for MemoryRegion {
    fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn apply(&self, ops: Vec<RegionOp>) -> Result<()> {
        self.ensure_open()?;
        for op in ops {
            match op {
                RegionOp::Put(key, value) => self.put(key, value),
                RegionOp::Delete(key) => self.remove(&key),
            }
        }
        Ok(())
    }

    fn scan(&self, f: &mut dyn FnMut(&str, &[u8]) -> Result<()>) -> Result<()> {
        self.ensure_open()?;
        for entry in self.entries.iter() {
            f(entry.key(), entry.value())?;
        }
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.entries.len() as u64)
    }

    fn size_bytes(&self) -> Result<u64> {
        Ok(self.total_bytes.load(Ordering::Relaxed))
    }

    fn compact(&self) -> Result<()> {
        self.ensure_open()?;
        self.entries.shrink_to_fit();
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
