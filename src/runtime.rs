//! Lookup Runtime
//!
//! Composition root for a running cache: builds the store, the cache
//! manager and the offset store, registers namespaces and supervises the
//! background tasks that keep them fresh.
//!
//! # Tasks
//!
//! ```text
//!                        ┌──────────────────────────┐
//!                        │       LookupRuntime       │
//!                        └────────────┬─────────────┘
//!            ┌────────────────────────┼────────────────────────┐
//!            ▼                        ▼                        ▼
//!   refresh loop (per ns)   consumer (per ns, partition)     reaper
//!   scheduled/forced loads  streamed deltas + checkpoints    retired gens
//! ```
//!
//! All tasks share one cancellation token derived from the manager's, so
//! either [`LookupRuntime::shutdown`] or closing the manager stops them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::{FileUpdateLog, JsonRowDecoder, PostgresRowSource};
use crate::cache::manager::CacheManager;
use crate::cache::namespace::Namespace;
use crate::cache::scheduler::{run_reaper, run_refresh_loop};
use crate::config::{AppConfig, NamespaceConfig, SourceConfig, TransportConfig};
use crate::domain::ports::{EventPublisher, OffsetStore};
use crate::error::{Error, Result};
use crate::lookup::LookupService;
use crate::metrics::CacheMetrics;
use crate::store::{RedbOffsetStore, StoreManager};
use crate::streaming::PartitionConsumer;

/// Builder for [`LookupRuntime`].
pub struct RuntimeBuilder {
    config: AppConfig,
    publisher: Option<Arc<dyn EventPublisher>>,
    offsets: Option<Arc<dyn OffsetStore>>,
    metrics: Option<Arc<CacheMetrics>>,
}

impl RuntimeBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            publisher: None,
            offsets: None,
            metrics: None,
        }
    }

    pub fn publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Offset store; defaults to a redb store under the store root.
    pub fn offset_store(mut self, offsets: Arc<dyn OffsetStore>) -> Self {
        self.offsets = Some(offsets);
        self
    }

    pub fn metrics(mut self, metrics: Arc<CacheMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the runtime. Namespaces from the configuration are not
    /// registered here; see [`LookupRuntime::register_configured`].
    pub fn build(self) -> Result<LookupRuntime> {
        let store = Arc::new(StoreManager::new(&self.config.store));

        let mut manager = CacheManager::new(Arc::clone(&store), self.config.manager.clone())?;
        if let Some(publisher) = self.publisher {
            manager = manager.with_publisher(publisher);
        }
        if let Some(metrics) = self.metrics {
            manager = manager.with_metrics(metrics);
        }

        let offsets = match self.offsets {
            Some(offsets) => offsets,
            None => Arc::new(RedbOffsetStore::open(store.root())?),
        };

        let manager = Arc::new(manager);
        let cancel = manager.cancellation_token().child_token();
        Ok(LookupRuntime {
            manager,
            offsets,
            config: self.config,
            cancel,
            tasks: Mutex::new(JoinSet::new()),
            started: AtomicBool::new(false),
        })
    }
}

/// A running cache and its background tasks.
pub struct LookupRuntime {
    manager: Arc<CacheManager>,
    offsets: Arc<dyn OffsetStore>,
    config: AppConfig,
    cancel: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
    started: AtomicBool,
}

impl LookupRuntime {
    pub fn builder(config: AppConfig) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }

    pub fn offsets(&self) -> &Arc<dyn OffsetStore> {
        &self.offsets
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn lookups(&self) -> LookupService {
        LookupService::new(Arc::clone(&self.manager))
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Register a namespace. Once started, its tasks are spawned right away.
    pub async fn register(&self, namespace: Namespace) -> Result<()> {
        let name = namespace.name().to_string();
        self.manager.register(namespace).await?;
        if self.is_started() {
            self.spawn_namespace(&name).await?;
        }
        Ok(())
    }

    /// Build and register every namespace in the configuration.
    pub async fn register_configured(&self) -> Result<()> {
        for config in self.config.namespaces.clone() {
            let namespace = namespace_from_config(config, &self.config.transport).await?;
            self.register(namespace).await?;
        }
        Ok(())
    }

    /// Spawn refresh loops, consumers and the reaper.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.manager.is_closed() {
            return Err(Error::Closed);
        }

        for name in self.manager.namespace_names() {
            self.spawn_namespace(&name).await?;
        }

        let manager = Arc::clone(&self.manager);
        let interval = self.config.manager.reap_interval;
        let cancel = self.cancel.clone();
        self.tasks
            .lock()
            .spawn(async move { run_reaper(manager, interval, cancel).await });

        info!(namespaces = self.manager.namespace_names().len(), "Lookup runtime started");
        Ok(())
    }

    async fn spawn_namespace(&self, name: &str) -> Result<()> {
        let namespace = self.manager.namespace(name)?;

        {
            let manager = Arc::clone(&self.manager);
            let cancel = self.cancel.clone();
            let ns = name.to_string();
            self.tasks
                .lock()
                .spawn(async move { run_refresh_loop(manager, ns, cancel).await });
        }

        let Some(log) = namespace.update_log().cloned() else {
            return Ok(());
        };
        if namespace.config().update_topic().is_none() {
            return Ok(());
        }

        let partitions = log.partitions().await?;
        debug!(namespace = %name, partitions = ?partitions, "Starting consumers");
        for partition in partitions {
            let consumer = PartitionConsumer::new(
                Arc::clone(&self.manager),
                name,
                partition,
                Arc::clone(&log),
                Arc::clone(&self.offsets),
                self.config.consumer.clone(),
            );
            let cancel = self.cancel.clone();
            self.tasks.lock().spawn(async move {
                consumer.run(cancel).await;
            });
        }
        Ok(())
    }

    /// Stop background tasks, let in-flight loads finish within the grace
    /// period, then close the manager.
    pub async fn shutdown(&self) {
        info!("Shutting down lookup runtime");
        self.cancel.cancel();

        let grace = self.config.manager.shutdown_grace_period;
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        if !drain(&mut tasks, grace).await {
            warn!(remaining = tasks.len(), "Tasks still running after grace period");
        }

        self.manager.close().await;

        if !drain(&mut tasks, Duration::from_secs(1)).await {
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        info!("Lookup runtime stopped");
    }
}

/// Join every task, up to `timeout`. Returns whether all finished.
async fn drain(tasks: &mut JoinSet<()>, timeout: Duration) -> bool {
    let joined = tokio::time::timeout(timeout, async {
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    warn!("Background task panicked: {}", e);
                }
            }
        }
    })
    .await;
    joined.is_ok()
}

/// Build a namespace with the shipped adapters: PostgreSQL for bulk
/// sources, JSON-lines files for update logs, JSON values.
pub async fn namespace_from_config(config: NamespaceConfig, transport: &TransportConfig) -> Result<Namespace> {
    config.validate()?;
    let decoder = Arc::new(JsonRowDecoder::from_config(&config));
    let topic = config.update_topic().map(str::to_string);
    let row_source = match &config.source {
        SourceConfig::BulkRelational {
            connection,
            pool_size,
            ..
        } => {
            let connection = connection.as_deref().ok_or_else(|| {
                Error::Config(format!("namespace {} has no connection string", config.name))
            })?;
            Some(PostgresRowSource::new(config.name.clone(), connection, *pool_size)?)
        }
        SourceConfig::InMemoryStreamed { .. } => None,
    };

    let mut namespace = Namespace::new(config, decoder);
    if let Some(source) = row_source {
        namespace = namespace.with_row_source(Arc::new(source));
    }
    if let Some(topic) = topic {
        let log = FileUpdateLog::open(&transport.log_dir, topic, transport.partitions).await?;
        namespace = namespace.with_update_log(Arc::new(log));
    }
    Ok(namespace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryUpdateLog;
    use crate::config::StoreConfig;
    use crate::store::InMemoryOffsetStore;
    use serde_json::json;
    use tempfile::TempDir;

    fn app_config(dir: &TempDir) -> AppConfig {
        AppConfig {
            store: StoreConfig {
                root_dir: dir.path().join("store"),
                ..StoreConfig::default()
            },
            transport: TransportConfig {
                log_dir: dir.path().join("logs"),
                partitions: 2,
            },
            ..AppConfig::default()
        }
    }

    #[tokio::test]
    async fn test_namespace_from_config_streamed() {
        let dir = TempDir::new().unwrap();
        let config = app_config(&dir);
        let ns = NamespaceConfig::streamed("currencies", "currencies", "code", &["name"]);

        let namespace = namespace_from_config(ns, &config.transport).await.unwrap();
        let log = namespace.update_log().unwrap();
        assert_eq!(log.topic(), "currencies");
        assert_eq!(log.partitions().await.unwrap(), vec![0, 1]);
        assert!(namespace.row_source().is_none());
    }

    #[tokio::test]
    async fn test_namespace_from_config_requires_connection() {
        let dir = TempDir::new().unwrap();
        let config = app_config(&dir);
        let ns = NamespaceConfig::bulk("countries", "countries", "code", &["name"]);
        assert!(namespace_from_config(ns, &config.transport).await.is_err());
    }

    #[tokio::test]
    async fn test_start_streams_and_shuts_down() {
        let dir = TempDir::new().unwrap();
        let runtime = LookupRuntime::builder(app_config(&dir))
            .offset_store(Arc::new(InMemoryOffsetStore::new()))
            .build()
            .unwrap();

        let log = Arc::new(InMemoryUpdateLog::new("currencies", 1));
        log.append_json(0, "EUR", &json!({"name": "Euro"})).unwrap();

        let config = NamespaceConfig::streamed("currencies", "currencies", "code", &["name"]);
        let namespace = Namespace::new(config.clone(), Arc::new(JsonRowDecoder::from_config(&config)))
            .with_update_log(log.clone());
        runtime.register(namespace).await.unwrap();
        runtime.start().await.unwrap();

        let lookups = runtime.lookups();
        let mut ready = false;
        for _ in 0..200 {
            if lookups.lookup("currencies", "EUR").unwrap().is_some() {
                ready = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ready);

        log.append_json(0, "GBP", &json!({"name": "Pound"})).unwrap();
        let mut streamed = None;
        for _ in 0..200 {
            streamed = lookups.lookup("currencies", "GBP").unwrap();
            if streamed.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(streamed.as_deref(), Some("Pound"));

        runtime.shutdown().await;
        assert!(runtime.manager().is_closed());
        assert!(!lookups.is_ready("currencies"));
    }
}
