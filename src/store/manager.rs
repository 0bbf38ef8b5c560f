//! Durable Store Manager
//!
//! Owns every region backing a (namespace, generation) pair. The cache
//! manager only ever holds opaque [`StoreHandle`]s.
//!
//! # On-disk layout
//!
//! ```text
//! <root>/
//! ├── offsets.redb                 consumer offsets (separate from data)
//! └── <namespace>/
//!     ├── CURRENT                  id of the published generation
//!     ├── gen-00000000000000000007/
//!     │   ├── data.redb
//!     │   └── MANIFEST.json        written by seal()
//!     └── gen-00000000000000000008/ (load in progress)
//! ```
//!
//! A generation becomes eligible for recovery only once it is sealed and
//! named by `CURRENT`. Anything else found at startup is a half-written load
//! and is removed.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};

use super::compression::ValueCodec;
use super::durable::RedbRegion;
use super::memory::MemoryRegion;
use super::region::{KvRegion, RegionOp};
use crate::cache::generation::GenerationInfo;
use crate::config::{StoreBackend, StoreConfig};
use crate::error::{Error, Result};

const CURRENT_FILE: &str = "CURRENT";
const MANIFEST_FILE: &str = "MANIFEST.json";
const GENERATION_PREFIX: &str = "gen-";

// =============================================================================
// Handles
// =============================================================================

/// Opaque, cheaply cloneable handle to one open region.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    namespace: String,
    generation: u64,
    backend: StoreBackend,
    dir: Option<PathBuf>,
    region: Box<dyn KvRegion>,
    released: AtomicBool,
    open_regions: Arc<AtomicUsize>,
}

impl HandleInner {
    /// Close the region and give back its slot. Returns false if already
    /// released.
    fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Err(e) = self.region.close() {
            warn!(
                namespace = %self.namespace,
                generation = self.generation,
                "Failed to close region: {}",
                e
            );
        }
        self.open_regions.fetch_sub(1, Ordering::AcqRel);
        true
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        self.release();
    }
}

impl StoreHandle {
    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    pub fn backend(&self) -> StoreBackend {
        self.inner.backend
    }

    pub fn is_closed(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    fn region(&self) -> &dyn KvRegion {
        self.inner.region.as_ref()
    }
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("namespace", &self.inner.namespace)
            .field("generation", &self.inner.generation)
            .field("backend", &self.inner.backend)
            .finish()
    }
}

/// One mutation in a [`StoreManager::write_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put { key: String, value: Bytes },
    Delete { key: String },
}

impl WriteOp {
    pub fn put(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        WriteOp::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        WriteOp::Delete { key: key.into() }
    }
}

// =============================================================================
// Store Manager
// =============================================================================

/// Store manager
pub struct StoreManager {
    root: PathBuf,
    codec: ValueCodec,
    max_open_regions: usize,
    open_regions: Arc<AtomicUsize>,
    /// Highest generation id handed out per namespace
    last_ids: DashMap<String, u64>,
}

impl StoreManager {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            root: config.root_dir.clone(),
            codec: ValueCodec::new(config.compression.clone()),
            max_open_regions: config.max_open_regions,
            open_regions: Arc::new(AtomicUsize::new(0)),
            last_ids: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Regions currently open across all namespaces
    pub fn open_regions(&self) -> usize {
        self.open_regions.load(Ordering::Acquire)
    }

    /// Allocate the next generation id for a namespace.
    pub fn next_generation_id(&self, namespace: &str) -> u64 {
        let mut last = self.last_ids.entry(namespace.to_string()).or_insert(0);
        *last += 1;
        *last
    }

    /// Make sure later ids are strictly greater than `id`.
    fn observe_generation_id(&self, namespace: &str, id: u64) {
        let mut last = self.last_ids.entry(namespace.to_string()).or_insert(0);
        if *last < id {
            *last = id;
        }
    }

    fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.root.join(namespace)
    }

    fn generation_dir(&self, namespace: &str, generation: u64) -> PathBuf {
        self.namespace_dir(namespace)
            .join(format!("{}{:020}", GENERATION_PREFIX, generation))
    }

    fn reserve_slot(&self, namespace: &str, generation: u64) -> Result<()> {
        let reserved = self
            .open_regions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (open < self.max_open_regions).then_some(open + 1)
            });
        reserved.map(|_| ()).map_err(|open| Error::StoreUnavailable {
            namespace: namespace.to_string(),
            generation,
            reason: format!("open region limit reached ({}/{})", open, self.max_open_regions),
        })
    }

    /// Open a fresh, empty region for a new generation.
    ///
    /// Leftovers of an earlier attempt at the same id are discarded so the
    /// target always starts empty.
    #[instrument(skip(self))]
    pub fn open(
        &self,
        namespace: &str,
        generation: u64,
        backend: StoreBackend,
    ) -> Result<StoreHandle> {
        if backend == StoreBackend::Durable {
            let dir = self.generation_dir(namespace, generation);
            if dir.exists() {
                std::fs::remove_dir_all(&dir).map_err(|e| Error::StoreUnavailable {
                    namespace: namespace.to_string(),
                    generation,
                    reason: format!("failed to clear stale region: {}", e),
                })?;
            }
        }
        self.observe_generation_id(namespace, generation);
        let handle = self.open_region(namespace, generation, backend)?;
        debug!(backend = %backend, "Opened region");
        Ok(handle)
    }

    fn open_region(
        &self,
        namespace: &str,
        generation: u64,
        backend: StoreBackend,
    ) -> Result<StoreHandle> {
        self.reserve_slot(namespace, generation)?;

        let opened: Result<(Box<dyn KvRegion>, Option<PathBuf>)> = match backend {
            StoreBackend::Memory => Ok((Box::new(MemoryRegion::new(namespace, generation)), None)),
            StoreBackend::Durable => {
                let dir = self.generation_dir(namespace, generation);
                RedbRegion::open(namespace, generation, &dir)
                    .map(|region| (Box::new(region) as Box<dyn KvRegion>, Some(dir)))
            }
        };

        match opened {
            Ok((region, dir)) => Ok(StoreHandle {
                inner: Arc::new(HandleInner {
                    namespace: namespace.to_string(),
                    generation,
                    backend,
                    dir,
                    region,
                    released: AtomicBool::new(false),
                    open_regions: Arc::clone(&self.open_regions),
                }),
            }),
            Err(e) => {
                self.open_regions.fetch_sub(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    // =========================================================================
    // Data Access
    // =========================================================================

    pub fn get(&self, handle: &StoreHandle, key: &str) -> Result<Option<Bytes>> {
        match handle.region().get(key)? {
            Some(stored) => Ok(Some(self.codec.decode(&stored)?)),
            None => Ok(None),
        }
    }

    pub fn put(&self, handle: &StoreHandle, key: &str, value: &[u8]) -> Result<()> {
        handle
            .region()
            .apply(vec![RegionOp::Put(key.to_string(), self.codec.encode(value))])
    }

    pub fn delete(&self, handle: &StoreHandle, key: &str) -> Result<()> {
        handle.region().apply(vec![RegionOp::Delete(key.to_string())])
    }

    /// Apply a batch of mutations in one transaction.
    pub fn write_batch(&self, handle: &StoreHandle, ops: Vec<WriteOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let ops = ops
            .into_iter()
            .map(|op| match op {
                WriteOp::Put { key, value } => RegionOp::Put(key, self.codec.encode(&value)),
                WriteOp::Delete { key } => RegionOp::Delete(key),
            })
            .collect();
        handle.region().apply(ops)
    }

    /// Visit every entry with its decoded value.
    pub fn scan<F>(&self, handle: &StoreHandle, mut f: F) -> Result<()>
    where
        F: FnMut(&str, Bytes) -> Result<()>,
    {
        handle
            .region()
            .scan(&mut |key, stored| f(key, self.codec.decode(stored)?))
    }

    pub fn entry_count(&self, handle: &StoreHandle) -> Result<u64> {
        handle.region().len()
    }

    /// Region size in bytes (file size for durable regions).
    pub fn snapshot_size(&self, handle: &StoreHandle) -> Result<u64> {
        handle.region().size_bytes()
    }

    pub fn compact(&self, handle: &StoreHandle) -> Result<()> {
        handle.region().compact()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Close a region, keeping any on-disk data.
    pub fn close(&self, handle: &StoreHandle) {
        if handle.inner.release() {
            debug!(
                namespace = %handle.namespace(),
                generation = handle.generation(),
                "Closed region"
            );
        }
    }

    /// Close a region and remove its data.
    ///
    /// Only called once no reader can observe the generation.
    pub fn destroy(&self, handle: &StoreHandle) -> Result<()> {
        self.close(handle);
        if let Some(dir) = &handle.inner.dir {
            if dir.exists() {
                std::fs::remove_dir_all(dir)?;
            }
        }
        debug!(
            namespace = %handle.namespace(),
            generation = handle.generation(),
            "Destroyed region"
        );
        Ok(())
    }

    /// Compact a fully loaded region, record its final size in `info` and
    /// write the manifest.
    pub fn seal(&self, handle: &StoreHandle, info: &mut GenerationInfo) -> Result<()> {
        self.compact(handle)?;
        info.size_bytes = self.snapshot_size(handle)?;
        if let Some(dir) = &handle.inner.dir {
            let manifest = serde_json::to_vec_pretty(info)?;
            write_atomically(&dir.join(MANIFEST_FILE), &manifest)?;
        }
        Ok(())
    }

    /// Record `generation` as the namespace's published generation on disk.
    pub fn publish_current(&self, handle: &StoreHandle) -> Result<()> {
        if handle.backend() != StoreBackend::Durable {
            return Ok(());
        }
        let path = self.namespace_dir(handle.namespace()).join(CURRENT_FILE);
        write_atomically(&path, handle.generation().to_string().as_bytes())
    }

    /// Reopen the namespace's last published generation after a restart.
    ///
    /// Every other generation directory is removed. Returns `None` when no
    /// sealed, published generation exists.
    #[instrument(skip(self))]
    pub fn recover(&self, namespace: &str) -> Result<Option<(StoreHandle, GenerationInfo)>> {
        let ns_dir = self.namespace_dir(namespace);
        if !ns_dir.is_dir() {
            return Ok(None);
        }

        let mut generations = Vec::new();
        for entry in std::fs::read_dir(&ns_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(id) = name
                .to_str()
                .and_then(|n| n.strip_prefix(GENERATION_PREFIX))
                .and_then(|n| n.parse::<u64>().ok())
            else {
                continue;
            };
            self.observe_generation_id(namespace, id);
            generations.push(id);
        }

        let current = match std::fs::read_to_string(ns_dir.join(CURRENT_FILE)) {
            Ok(raw) => raw.trim().parse::<u64>().ok(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let manifest = current.and_then(|id| {
            let path = self.generation_dir(namespace, id).join(MANIFEST_FILE);
            let raw = std::fs::read(&path).ok()?;
            match serde_json::from_slice::<GenerationInfo>(&raw) {
                Ok(info) if info.id == id => Some(info),
                Ok(_) | Err(_) => {
                    warn!(generation = id, "Ignoring unreadable manifest");
                    None
                }
            }
        });

        for id in generations {
            if Some(id) != manifest.as_ref().map(|m| m.id) {
                let dir = self.generation_dir(namespace, id);
                info!(generation = id, "Removing unpublished generation");
                std::fs::remove_dir_all(&dir)?;
            }
        }

        let Some(info) = manifest else {
            return Ok(None);
        };

        let handle = self.open_region(namespace, info.id, StoreBackend::Durable)?;
        info!(generation = info.id, entries = info.entries, "Recovered generation");
        Ok(Some((handle, info)))
    }
}

/// Write a file via temp file + rename so readers never see a torn write.
fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
