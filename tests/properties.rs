//! Property-Based Tests for Generation Contents
//!
//! # Test Properties
//!
//! 1. **Idempotent Deltas**: re-delivering a delta sequence leaves the same
//!    contents as delivering it once
//! 2. **Full Replacement**: after a reload the generation holds exactly the
//!    source rows; keys only in the previous load are gone

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use proptest::prelude::*;
use serde_json::json;
use tempfile::TempDir;
use tokio_test::block_on;

use nscache::adapters::{InMemoryRowSource, JsonRowDecoder};
use nscache::config::{ManagerConfig, StoreConfig};
use nscache::domain::ports::{SourceRow, UpdateRecord};
use nscache::{CacheManager, Namespace, NamespaceConfig, StoreManager};

// =============================================================================
// Helpers
// =============================================================================

type Contents = BTreeMap<String, Bytes>;

fn value(name: &str) -> Bytes {
    Bytes::from(json!({ "name": name }).to_string())
}

fn rows(data: &BTreeMap<String, String>) -> Vec<SourceRow> {
    data.iter()
        .map(|(code, name)| SourceRow::new().with("code", code.as_str()).with("name", name.as_str()))
        .collect()
}

async fn setup(dir: &TempDir, source: &Arc<InMemoryRowSource>) -> Arc<CacheManager> {
    let store = StoreManager::new(&StoreConfig {
        root_dir: dir.path().to_path_buf(),
        ..StoreConfig::default()
    });
    let manager = Arc::new(CacheManager::new(Arc::new(store), ManagerConfig::default()).unwrap());
    let config = NamespaceConfig::bulk("countries", "countries", "code", &["name"]);
    let namespace = Namespace::new(config.clone(), Arc::new(JsonRowDecoder::from_config(&config)))
        .with_row_source(source.clone());
    manager.register(namespace).await.unwrap();
    manager
}

fn contents(manager: &CacheManager) -> Contents {
    let generation = manager.current("countries").unwrap();
    let mut out = Contents::new();
    manager
        .store()
        .scan(generation.handle(), |key, value| {
            out.insert(key.to_string(), value);
            Ok(())
        })
        .unwrap();
    out
}

// =============================================================================
// Property Strategies
// =============================================================================

/// Source rows over a small key space so loads overlap.
fn dataset_strategy() -> impl Strategy<Value = BTreeMap<String, String>> {
    prop::collection::btree_map("K[0-9]", "[a-z]{1,6}", 0..10)
}

/// Deltas: `None` is a tombstone.
fn delta_strategy() -> impl Strategy<Value = Vec<(String, Option<String>)>> {
    prop::collection::vec(("K[0-9]", prop::option::of("[a-z]{1,6}")), 1..30)
}

// =============================================================================
// Delta Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_redelivered_deltas_are_idempotent(
        base in dataset_strategy(),
        deltas in delta_strategy(),
    ) {
        let mut expected: Contents = base.iter().map(|(k, v)| (k.clone(), value(v))).collect();
        for (key, name) in &deltas {
            match name {
                Some(name) => expected.insert(key.clone(), value(name)),
                None => expected.remove(key),
            };
        }

        let (once, twice) = block_on(async {
            let dir = TempDir::new().unwrap();
            let source = Arc::new(InMemoryRowSource::new("reference").with_rows(rows(&base)));
            let manager = setup(&dir, &source).await;
            manager.refresh("countries").await.unwrap();

            let records: Vec<UpdateRecord> = deltas
                .iter()
                .enumerate()
                .map(|(offset, (key, name))| match name {
                    Some(name) => UpdateRecord::upsert(key.clone(), value(name), 0, offset as u64),
                    None => UpdateRecord::tombstone(key.clone(), 0, offset as u64),
                })
                .collect();

            for record in &records {
                manager.apply_update("countries", record.clone()).await.unwrap();
            }
            let once = contents(&manager);
            for record in &records {
                manager.apply_update("countries", record.clone()).await.unwrap();
            }
            (once, contents(&manager))
        });

        prop_assert_eq!(&once, &expected);
        prop_assert_eq!(&twice, &expected);
    }
}

// =============================================================================
// Reload Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_reload_replaces_every_key(
        first in dataset_strategy(),
        second in dataset_strategy(),
    ) {
        let expected: Contents = second.iter().map(|(k, v)| (k.clone(), value(v))).collect();

        let loaded = block_on(async {
            let dir = TempDir::new().unwrap();
            let source = Arc::new(InMemoryRowSource::new("reference").with_rows(rows(&first)));
            let manager = setup(&dir, &source).await;
            manager.refresh("countries").await.unwrap();

            source.set_rows(rows(&second));
            manager.refresh("countries").await.unwrap();
            contents(&manager)
        });

        prop_assert_eq!(loaded, expected);
    }
}
