//! In-memory streamed factory
//!
//! Bootstraps a namespace by reading its compacted update log from the
//! earliest retained offset up to the end offset observed when the load
//! started. Live streaming takes over from those positions once the
//! generation is published.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::{CacheFactory, DecodeTracker, LoadContext, LoadResult};
use crate::config::SourceKind;
use crate::domain::ports::LogBatch;
use crate::error::{Error, Result};
use crate::store::WriteOp;

/// Resubscribe events tolerated per partition before the load gives up
const DEFAULT_MAX_RESUBSCRIBES: u32 = 3;

/// Factory for [`SourceKind::InMemoryStreamed`] namespaces.
#[derive(Debug, Clone, Copy)]
pub struct InMemoryStreamedFactory {
    max_resubscribes: u32,
}

impl Default for InMemoryStreamedFactory {
    fn default() -> Self {
        Self {
            max_resubscribes: DEFAULT_MAX_RESUBSCRIBES,
        }
    }
}

#[async_trait]
impl CacheFactory for InMemoryStreamedFactory {
    fn kind(&self) -> SourceKind {
        SourceKind::InMemoryStreamed
    }

    #[instrument(skip(self, ctx), fields(namespace = %ctx.namespace_name(), generation = ctx.target.generation()))]
    async fn load_full(&self, ctx: &LoadContext) -> Result<LoadResult> {
        let namespace = &ctx.namespace;
        let name = namespace.name();
        let log = namespace
            .update_log()
            .ok_or_else(|| Error::Config(format!("namespace {} has no update log", name)))?;

        let mut tracker = DecodeTracker::new(name, namespace.config().max_decode_error_rate);
        let mut positions = BTreeMap::new();

        for partition in log.partitions().await? {
            let end = log.end_offset(partition).await?;
            let mut next = log.earliest_offset(partition).await?;
            let mut resubscribes = 0;

            debug!(partition, from = next, to = end, "Bootstrapping partition");

            while next < end {
                let batch = tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => return Err(ctx.cancelled()),
                    batch = log.fetch(partition, next, ctx.write_batch_size, Duration::ZERO) => batch?,
                };

                let records = match batch {
                    LogBatch::Records(records) => records,
                    LogBatch::Resubscribe => {
                        resubscribes += 1;
                        if resubscribes > self.max_resubscribes {
                            return Err(Error::SourceUnreachable {
                                namespace: name.to_string(),
                                reason: format!(
                                    "partition {} kept rebalancing during bootstrap",
                                    partition
                                ),
                            });
                        }
                        warn!(partition, attempt = resubscribes, "Resubscribing during bootstrap");
                        next = next.max(log.earliest_offset(partition).await?);
                        continue;
                    }
                };

                if records.is_empty() {
                    // retention moved past `next` or the log was truncated
                    let earliest = log.earliest_offset(partition).await?;
                    if earliest <= next {
                        break;
                    }
                    next = earliest;
                    continue;
                }

                let mut ops = Vec::with_capacity(records.len());
                for record in records.iter().filter(|r| r.offset >= next && r.offset < end) {
                    match namespace.decoder().decode_record(record) {
                        Ok(update) => {
                            tracker.record_ok();
                            ops.push(match update.value {
                                Some(value) => WriteOp::Put {
                                    key: update.key,
                                    value,
                                },
                                None => WriteOp::Delete { key: update.key },
                            });
                        }
                        Err(e) => tracker.record_error(&e),
                    }
                }
                if let Some(last) = records.last() {
                    next = next.max(last.offset + 1);
                }
                ctx.write(ops).await?;
            }

            positions.insert(partition, end);
        }

        tracker.finish()?;
        let result = ctx.summarize(&tracker, None, positions).await?;

        info!(
            records = result.records_seen,
            entries = result.entries,
            decode_errors = result.decode_errors,
            changed = result.changed,
            "Bootstrap complete"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryUpdateLog, JsonRowDecoder};
    use crate::cache::namespace::Namespace;
    use crate::config::{NamespaceConfig, StoreBackend, StoreConfig};
    use crate::store::StoreManager;
    use serde_json::json;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn context(log: Arc<InMemoryUpdateLog>) -> LoadContext {
        let config = NamespaceConfig::streamed("currencies", "currencies", "code", &["name"]);
        let decoder = Arc::new(JsonRowDecoder::from_config(&config));
        let namespace = Arc::new(Namespace::new(config, decoder).with_update_log(log));
        let store = Arc::new(StoreManager::new(&StoreConfig::default()));
        let target = store.open("currencies", 1, StoreBackend::Memory).unwrap();
        LoadContext {
            namespace,
            store,
            target,
            previous: None,
            write_batch_size: 2,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_bootstrap_applies_log_in_order() {
        let log = Arc::new(InMemoryUpdateLog::new("currencies", 2));
        log.append_json(0, "EUR", &json!({"name": "Euro"})).unwrap();
        log.append_json(0, "GBP", &json!({"name": "Pound"})).unwrap();
        log.tombstone(0, "GBP").unwrap();
        log.append_json(1, "USD", &json!({"name": "Dollar"})).unwrap();

        let ctx = context(Arc::clone(&log));
        let result = InMemoryStreamedFactory::default().load_full(&ctx).await.unwrap();

        assert_eq!(result.entries, 2);
        assert_eq!(result.records_seen, 4);
        assert_eq!(result.log_positions.get(&0), Some(&3));
        assert_eq!(result.log_positions.get(&1), Some(&1));
        assert!(ctx.store.get(&ctx.target, "GBP").unwrap().is_none());
        assert!(ctx.store.get(&ctx.target, "USD").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_bootstrap_starts_at_retained_offset() {
        let log = Arc::new(InMemoryUpdateLog::new("currencies", 1));
        log.append_json(0, "OLD", &json!({"name": "Gone"})).unwrap();
        log.append_json(0, "EUR", &json!({"name": "Euro"})).unwrap();
        log.truncate_before(0, 1).unwrap();

        let ctx = context(Arc::clone(&log));
        let result = InMemoryStreamedFactory::default().load_full(&ctx).await.unwrap();
        assert_eq!(result.entries, 1);
        assert!(ctx.store.get(&ctx.target, "OLD").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bootstrap_survives_one_rebalance() {
        let log = Arc::new(InMemoryUpdateLog::new("currencies", 1));
        log.append_json(0, "EUR", &json!({"name": "Euro"})).unwrap();
        log.trigger_resubscribe(0);

        let ctx = context(Arc::clone(&log));
        let result = InMemoryStreamedFactory::default().load_full(&ctx).await.unwrap();
        assert_eq!(result.entries, 1);
    }

    #[tokio::test]
    async fn test_empty_log_publishes_empty_generation() {
        let log = Arc::new(InMemoryUpdateLog::new("currencies", 1));
        let ctx = context(log);
        let result = InMemoryStreamedFactory::default().load_full(&ctx).await.unwrap();
        assert_eq!(result.entries, 0);
        assert!(result.changed);
        assert_eq!(result.log_positions.get(&0), Some(&0));
    }
}
