//! Cache Generations
//!
//! A generation is one snapshot of a namespace's data. Readers reach it
//! through the namespace's current pointer as an `Arc<Generation>`; the
//! store region is destroyed only once the generation has been retired and
//! the last reader has dropped its reference.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::StoreBackend;
use crate::store::StoreHandle;

/// Generation metadata, persisted as the region manifest when sealed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationInfo {
    pub namespace: String,
    /// Monotonic per namespace
    pub id: u64,
    pub created_at: DateTime<Utc>,
    /// Entries at publish time
    pub entries: u64,
    /// Region size at publish time
    pub size_bytes: u64,
    /// Order-independent content hash
    pub fingerprint: u64,
    /// Source snapshot version, when the source reports one
    #[serde(default)]
    pub source_version: Option<String>,
    /// Per-partition update log offset the generation already reflects
    #[serde(default)]
    pub log_positions: BTreeMap<u32, u64>,
    pub backend: StoreBackend,
}

impl GenerationInfo {
    /// Whether a streamed record is already reflected in this generation.
    pub fn covers(&self, partition: u32, offset: u64) -> bool {
        self.log_positions
            .get(&partition)
            .is_some_and(|position| offset < *position)
    }
}

/// A fully loaded, readable generation.
pub struct Generation {
    info: GenerationInfo,
    handle: StoreHandle,
}

impl Generation {
    pub fn new(info: GenerationInfo, handle: StoreHandle) -> Self {
        Self { info, handle }
    }

    pub fn id(&self) -> u64 {
        self.info.id
    }

    pub fn info(&self) -> &GenerationInfo {
        &self.info
    }

    pub fn handle(&self) -> &StoreHandle {
        &self.handle
    }
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generation")
            .field("namespace", &self.info.namespace)
            .field("id", &self.info.id)
            .field("entries", &self.info.entries)
            .finish()
    }
}

/// A superseded generation awaiting reader drain.
pub(crate) struct RetiredGeneration {
    pub(crate) generation: Arc<Generation>,
    pub(crate) retired_at: DateTime<Utc>,
}

impl RetiredGeneration {
    pub(crate) fn new(generation: Arc<Generation>) -> Self {
        Self {
            generation,
            retired_at: Utc::now(),
        }
    }

    /// No reader other than the retired list still holds the generation.
    pub(crate) fn is_drained(&self) -> bool {
        Arc::strong_count(&self.generation) == 1
    }
}
