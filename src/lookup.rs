//! Lookup Service
//!
//! Read-only facade used by the query engine: `(namespace, key) → value`.
//!
//! Every call captures the namespace's current generation once and reads
//! only from it, so a lookup never waits for a refresh and never sees a mix
//! of two generations. A missing key, an unknown namespace and a namespace
//! without a published generation all read as absent; only a structurally
//! invalid namespace name is an error. [`LookupService::is_ready`] tells
//! "absent" and "not loaded yet" apart.

use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use crate::adapters::json_decoder::column_text;
use crate::cache::manager::CacheManager;
use crate::config::validate_namespace_name;
use crate::error::Result;
use crate::metrics::LookupResult;

/// Lookup facade over a [`CacheManager`].
#[derive(Debug, Clone)]
pub struct LookupService {
    manager: Arc<CacheManager>,
}

impl LookupService {
    pub fn new(manager: Arc<CacheManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }

    /// Stored value bytes for `key`.
    pub fn lookup_raw(&self, namespace: &str, key: &str) -> Result<Option<Bytes>> {
        validate_namespace_name(namespace)?;

        let Some(generation) = self.manager.current(namespace) else {
            if self.manager.namespace(namespace).is_ok() {
                self.manager
                    .metrics()
                    .record_lookup(namespace, LookupResult::NotReady);
            }
            return Ok(None);
        };

        let metrics = self.manager.metrics();
        match self.manager.store().get(generation.handle(), key) {
            Ok(Some(value)) => {
                metrics.record_lookup(namespace, LookupResult::Hit);
                Ok(Some(value))
            }
            Ok(None) => {
                metrics.record_lookup(namespace, LookupResult::Miss);
                Ok(None)
            }
            Err(e) => {
                metrics.record_lookup(namespace, LookupResult::Error);
                warn!(namespace, generation = generation.id(), "Lookup failed, treating as absent: {}", e);
                Ok(None)
            }
        }
    }

    /// Default value column for `key`.
    ///
    /// Values that are not JSON objects are returned as UTF-8 text, so
    /// namespaces with a custom decoder still resolve to a string.
    pub fn lookup(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let Some(value) = self.lookup_raw(namespace, key)? else {
            return Ok(None);
        };
        let column = self
            .manager
            .namespace(namespace)
            .ok()
            .and_then(|ns| ns.config().default_column().map(str::to_string));

        match column.map(|c| column_text(&value, &c)) {
            Some(Ok(text)) => Ok(text),
            _ => Ok(std::str::from_utf8(&value).ok().map(str::to_string)),
        }
    }

    /// A specific value column for `key`.
    pub fn lookup_column(&self, namespace: &str, key: &str, column: &str) -> Result<Option<String>> {
        let Some(value) = self.lookup_raw(namespace, key)? else {
            return Ok(None);
        };
        match column_text(&value, column) {
            Ok(text) => Ok(text),
            Err(e) => {
                warn!(namespace, column, "Stored value has no columns: {}", e);
                Ok(None)
            }
        }
    }

    /// Like [`lookup`](Self::lookup) with `missing` substituted for absent.
    pub fn lookup_or(&self, namespace: &str, key: &str, missing: &str) -> Result<String> {
        Ok(self
            .lookup(namespace, key)?
            .unwrap_or_else(|| missing.to_string()))
    }

    /// Whether the namespace serves a published generation.
    pub fn is_ready(&self, namespace: &str) -> bool {
        self.manager.is_ready(namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryRowSource, JsonRowDecoder};
    use crate::cache::Namespace;
    use crate::config::{ManagerConfig, NamespaceConfig, StoreConfig};
    use crate::domain::ports::SourceRow;
    use crate::error::Error;
    use crate::store::StoreManager;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    async fn countries(dir: &TempDir) -> LookupService {
        let store = StoreManager::new(&StoreConfig {
            root_dir: dir.path().to_path_buf(),
            ..StoreConfig::default()
        });
        let manager = Arc::new(CacheManager::new(Arc::new(store), ManagerConfig::default()).unwrap());

        let config = NamespaceConfig::bulk("countries", "countries", "code", &["name", "region"]);
        let source = InMemoryRowSource::new("reference").with_rows(vec![
            SourceRow::new().with("code", "US").with("name", "United States").with("region", "NA"),
            SourceRow::new().with("code", "FR").with("name", "France").with("region", "EU"),
        ]);
        let namespace = Namespace::new(config.clone(), Arc::new(JsonRowDecoder::from_config(&config)))
            .with_row_source(Arc::new(source));
        manager.register(namespace).await.unwrap();

        LookupService::new(manager)
    }

    #[tokio::test]
    async fn test_absent_before_first_load() {
        let dir = TempDir::new().unwrap();
        let lookups = countries(&dir).await;

        assert!(!lookups.is_ready("countries"));
        assert_eq!(lookups.lookup("countries", "US").unwrap(), None);
    }

    #[tokio::test]
    async fn test_lookup_columns() {
        let dir = TempDir::new().unwrap();
        let lookups = countries(&dir).await;
        lookups.manager().refresh("countries").await.unwrap();

        assert!(lookups.is_ready("countries"));
        assert_eq!(
            lookups.lookup("countries", "US").unwrap().as_deref(),
            Some("United States")
        );
        assert_eq!(
            lookups.lookup_column("countries", "FR", "region").unwrap().as_deref(),
            Some("EU")
        );
        assert_eq!(lookups.lookup("countries", "DE").unwrap(), None);
        assert_eq!(lookups.lookup_or("countries", "DE", "??").unwrap(), "??");
        assert!(lookups.lookup_raw("countries", "FR").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unknown_and_invalid_namespaces() {
        let dir = TempDir::new().unwrap();
        let lookups = countries(&dir).await;

        assert_eq!(lookups.lookup("currencies", "USD").unwrap(), None);
        assert_matches!(
            lookups.lookup("../etc", "x"),
            Err(Error::InvalidNamespace(_))
        );
        assert_matches!(lookups.lookup("", "x"), Err(Error::InvalidNamespace(_)));
    }

    #[tokio::test]
    async fn test_lookups_are_counted() {
        let dir = TempDir::new().unwrap();
        let lookups = countries(&dir).await;
        lookups.lookup("countries", "US").unwrap();
        lookups.manager().refresh("countries").await.unwrap();
        lookups.lookup("countries", "US").unwrap();
        lookups.lookup("countries", "DE").unwrap();

        let counter = &lookups.manager().metrics().lookups_total;
        assert_eq!(counter.with_label_values(&["countries", "not_ready"]).get(), 1);
        assert_eq!(counter.with_label_values(&["countries", "hit"]).get(), 1);
        assert_eq!(counter.with_label_values(&["countries", "miss"]).get(), 1);
    }
}
