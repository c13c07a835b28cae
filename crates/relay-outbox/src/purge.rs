//! Idempotency retention purge.
//!
//! Drops dedup keys older than the configured window. The window should
//! cover the broker's retention plus a safety margin, so a purged key can
//! no longer be redelivered.

use chrono::Utc;
use relay_common::IdempotencyStore;
use relay_config::IdempotencyConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct IdempotencyPurger {
    store: Arc<dyn IdempotencyStore>,
    config: IdempotencyConfig,
    interval: Duration,
}

impl IdempotencyPurger {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: IdempotencyConfig) -> Self {
        // Scanning more often than a tenth of the window buys nothing.
        let interval = (config.retention_window() / 10).max(Duration::from_secs(60));
        Self {
            store,
            config,
            interval,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            retention_seconds = self.config.retention_window_seconds,
            interval_secs = self.interval.as_secs(),
            "idempotency purger started"
        );

        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = self.purge_once().await {
                        warn!(error = %e, "idempotency purge failed");
                    }
                }
            }
        }

        info!("idempotency purger stopped");
    }

    pub async fn purge_once(&self) -> Result<u64, relay_common::StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.retention_window())
                .unwrap_or_else(|_| chrono::Duration::days(1));
        let purged = self.store.purge_older_than(cutoff).await?;
        if purged > 0 {
            debug!(purged, "idempotency keys purged");
        }
        Ok(purged)
    }
}
