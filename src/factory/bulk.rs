//! Bulk relational factory
//!
//! Streams a full snapshot from a [`RowSource`](crate::domain::ports::RowSource),
//! decodes every row and writes it into the target in batches. When the
//! namespace names a version column and the source still reports the version
//! of the published generation, no rows are read at all.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info, instrument};

use super::{CacheFactory, DecodeTracker, LoadContext, LoadResult};
use crate::config::SourceKind;
use crate::error::{Error, Result};
use crate::store::WriteOp;

/// Factory for [`SourceKind::BulkRelational`] namespaces.
#[derive(Debug, Default, Clone, Copy)]
pub struct BulkRelationalFactory;

#[async_trait]
impl CacheFactory for BulkRelationalFactory {
    fn kind(&self) -> SourceKind {
        SourceKind::BulkRelational
    }

    #[instrument(skip(self, ctx), fields(namespace = %ctx.namespace_name(), generation = ctx.target.generation()))]
    async fn load_full(&self, ctx: &LoadContext) -> Result<LoadResult> {
        let namespace = &ctx.namespace;
        let name = namespace.name();

        let source = namespace
            .row_source()
            .ok_or_else(|| Error::Config(format!("namespace {} has no row source", name)))?;
        let query = namespace
            .config()
            .bulk_query()
            .ok_or_else(|| Error::Config(format!("namespace {} is not a bulk namespace", name)))?;

        let source_version = match &query.version_column {
            Some(_) => source.source_version(&query).await?,
            None => None,
        };

        if let (Some(version), Some(previous)) = (&source_version, &ctx.previous) {
            if previous.source_version.as_ref() == Some(version) {
                info!(version = %version, "Source version unchanged, skipping full read");
                return Ok(LoadResult::unchanged(previous));
            }
        }

        debug!(source = source.name(), table = %query.table, "Starting bulk read");
        let mut rows = source.fetch_rows(&query).await?;
        let mut tracker = DecodeTracker::new(name, namespace.config().max_decode_error_rate);
        let mut batch = Vec::with_capacity(ctx.write_batch_size);

        loop {
            let next = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(ctx.cancelled()),
                next = rows.next() => next,
            };
            let Some(item) = next else {
                break;
            };

            match item {
                Ok(row) => match namespace.decoder().decode_row(&row) {
                    Ok(entry) => {
                        tracker.record_ok();
                        batch.push(WriteOp::Put {
                            key: entry.key,
                            value: entry.value,
                        });
                    }
                    Err(e) => tracker.record_error(&e),
                },
                Err(Error::Decode(e)) => tracker.record_error(&e),
                Err(e) => return Err(e),
            }

            if batch.len() >= ctx.write_batch_size {
                ctx.write(std::mem::replace(
                    &mut batch,
                    Vec::with_capacity(ctx.write_batch_size),
                ))
                .await?;
            }
        }
        ctx.write(batch).await?;

        tracker.finish()?;
        let result = ctx
            .summarize(&tracker, source_version, BTreeMap::new())
            .await?;

        info!(
            rows = result.rows_written,
            entries = result.entries,
            decode_errors = result.decode_errors,
            changed = result.changed,
            "Bulk load complete"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryRowSource, JsonRowDecoder};
    use crate::cache::generation::GenerationInfo;
    use crate::cache::namespace::Namespace;
    use crate::config::{NamespaceConfig, SourceConfig, StoreBackend, StoreConfig};
    use crate::domain::ports::SourceRow;
    use crate::factory::LoadContext;
    use crate::store::StoreManager;
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn setup(source: Arc<InMemoryRowSource>, versioned: bool) -> (Arc<StoreManager>, Arc<Namespace>) {
        let mut config = NamespaceConfig::bulk("countries", "countries", "code", &["name"]);
        if versioned {
            if let SourceConfig::BulkRelational { version_column, .. } = &mut config.source {
                *version_column = Some("updated_at".to_string());
            }
        }
        let decoder = Arc::new(JsonRowDecoder::from_config(&config));
        let namespace = Namespace::new(config, decoder).with_row_source(source);
        (
            Arc::new(StoreManager::new(&StoreConfig::default())),
            Arc::new(namespace),
        )
    }

    fn context(store: &Arc<StoreManager>, namespace: &Arc<Namespace>, previous: Option<GenerationInfo>) -> LoadContext {
        let generation = store.next_generation_id(namespace.name());
        LoadContext {
            namespace: Arc::clone(namespace),
            store: Arc::clone(store),
            target: store
                .open(namespace.name(), generation, StoreBackend::Memory)
                .unwrap(),
            previous,
            write_batch_size: 2,
            cancel: CancellationToken::new(),
        }
    }

    fn info_from(ctx: &LoadContext, result: &LoadResult) -> GenerationInfo {
        GenerationInfo {
            namespace: ctx.namespace_name().to_string(),
            id: ctx.target.generation(),
            created_at: chrono::Utc::now(),
            entries: result.entries,
            size_bytes: 0,
            fingerprint: result.fingerprint,
            source_version: result.source_version.clone(),
            log_positions: result.log_positions.clone(),
            backend: StoreBackend::Memory,
        }
    }

    fn countries() -> Vec<SourceRow> {
        vec![
            SourceRow::new().with("code", "US").with("name", "United States"),
            SourceRow::new().with("code", "FR").with("name", "France"),
            SourceRow::new().with("code", "DE").with("name", "Germany"),
        ]
    }

    #[tokio::test]
    async fn test_load_writes_every_row() {
        let source = Arc::new(InMemoryRowSource::new("ref").with_rows(countries()));
        let (store, namespace) = setup(source, false);
        let ctx = context(&store, &namespace, None);

        let result = BulkRelationalFactory.load_full(&ctx).await.unwrap();
        assert!(result.changed);
        assert_eq!(result.entries, 3);
        assert_eq!(result.rows_written, 3);
        assert!(store.get(&ctx.target, "FR").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_identical_content_is_unchanged() {
        let source = Arc::new(InMemoryRowSource::new("ref").with_rows(countries()));
        let (store, namespace) = setup(Arc::clone(&source), false);

        let first = context(&store, &namespace, None);
        let loaded = BulkRelationalFactory.load_full(&first).await.unwrap();
        let previous = info_from(&first, &loaded);

        let second = context(&store, &namespace, Some(previous));
        let reloaded = BulkRelationalFactory.load_full(&second).await.unwrap();
        assert!(!reloaded.changed);
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_same_version_skips_read() {
        let source = Arc::new(InMemoryRowSource::new("ref").with_rows(countries()));
        source.set_version(Some("2024-01-01"));
        let (store, namespace) = setup(Arc::clone(&source), true);

        let first = context(&store, &namespace, None);
        let loaded = BulkRelationalFactory.load_full(&first).await.unwrap();
        assert_eq!(loaded.source_version.as_deref(), Some("2024-01-01"));
        let previous = info_from(&first, &loaded);

        let second = context(&store, &namespace, Some(previous.clone()));
        let skipped = BulkRelationalFactory.load_full(&second).await.unwrap();
        assert!(!skipped.changed);
        assert_eq!(skipped.entries, 3);
        assert_eq!(source.fetch_count(), 1);

        source.set_version(Some("2024-02-01"));
        let third = context(&store, &namespace, Some(previous));
        let reread = BulkRelationalFactory.load_full(&third).await.unwrap();
        assert_eq!(source.fetch_count(), 2);
        assert_eq!(reread.source_version.as_deref(), Some("2024-02-01"));
    }

    #[tokio::test]
    async fn test_decode_error_rate_fails_load() {
        let source = Arc::new(InMemoryRowSource::new("ref").with_rows(vec![
            SourceRow::new().with("code", "US").with("name", "United States"),
            SourceRow::new().with("name", "no key"),
        ]));
        source.push_undecodable("broken row");
        let (store, namespace) = setup(source, false);

        let ctx = context(&store, &namespace, None);
        assert_matches!(
            BulkRelationalFactory.load_full(&ctx).await,
            Err(Error::DecodeErrorRateExceeded { errors: 2, total: 3, .. })
        );
    }

    #[tokio::test]
    async fn test_unreachable_source() {
        let source = Arc::new(InMemoryRowSource::new("ref"));
        source.fail_with("connection refused");
        let (store, namespace) = setup(source, false);

        let ctx = context(&store, &namespace, None);
        let err = BulkRelationalFactory.load_full(&ctx).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_cancelled_load() {
        let source = Arc::new(InMemoryRowSource::new("ref").with_rows(countries()));
        let (store, namespace) = setup(source, false);

        let ctx = context(&store, &namespace, None);
        ctx.cancel.cancel();
        assert_matches!(
            BulkRelationalFactory.load_full(&ctx).await,
            Err(Error::Cancelled { .. })
        );
    }
}
