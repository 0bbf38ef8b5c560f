//! Refresh Scheduler
//!
//! One background loop per namespace drives full loads:
//!
//! - the first load starts immediately unless a generation was recovered;
//! - afterwards a load runs every `refresh_period` (zero means load once);
//! - a forced refresh or a reload request cuts the wait short;
//! - retryable failures back off exponentially, capped by
//!   `max_retry_backoff` and the refresh period.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::manager::{CacheManager, RefreshOutcome};
use crate::config::ManagerConfig;
use crate::error::Error;

/// Delay before the next attempt after `failures` consecutive failures.
pub fn retry_delay(config: &ManagerConfig, period: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    let delay = config
        .retry_backoff
        .saturating_mul(1u32 << exponent)
        .min(config.max_retry_backoff);
    if period.is_zero() {
        delay
    } else {
        delay.min(period)
    }
}

/// Drive scheduled and forced loads for one namespace until cancelled.
#[instrument(skip(manager, cancel))]
pub async fn run_refresh_loop(manager: Arc<CacheManager>, namespace: String, cancel: CancellationToken) {
    let entry = match manager.entry(&namespace) {
        Ok(entry) => entry,
        Err(e) => {
            warn!("Refresh loop not started: {}", e);
            return;
        }
    };
    let period = entry.namespace.config().refresh_period;
    let periodic = (!period.is_zero()).then_some(period);

    // None = wait for a forced refresh only
    let mut next: Option<Duration> = if entry.current().is_some() {
        periodic
    } else {
        Some(Duration::ZERO)
    };
    let mut failures: u32 = 0;

    info!(period = ?period, "Refresh loop started");

    loop {
        let forced = match next {
            Some(delay) => tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = entry.force.notified() => true,
                _ = tokio::time::sleep(delay) => false,
            },
            None => tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = entry.force.notified() => true,
            },
        };
        if forced {
            debug!("Forced refresh");
        }
        entry.take_reload_request();

        next = match manager.refresh(&namespace).await {
            Ok(RefreshOutcome::Published { .. }) | Ok(RefreshOutcome::Unchanged { .. }) => {
                failures = 0;
                periodic
            }
            Ok(RefreshOutcome::Skipped) => periodic,
            Err(Error::Closed) | Err(Error::Cancelled { .. }) => break,
            Err(e) => {
                failures += 1;
                if e.is_retryable() || entry.current().is_none() {
                    let delay = retry_delay(manager.config(), period, failures);
                    debug!(failures, delay = ?delay, "Retrying after failure");
                    Some(delay)
                } else {
                    periodic
                }
            }
        };

        if entry.reload_requested() {
            next = Some(Duration::ZERO);
        }
    }

    info!("Refresh loop stopped");
}

/// Periodically destroy retired generations that readers have released.
pub async fn run_reaper(manager: Arc<CacheManager>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let reaped = manager.reap_retired().await;
                if reaped > 0 {
                    debug!(reaped, "Disposed retired generations");
                }
            }
        }
    }
}
