//! Background health monitor: probes every pool account on a fixed interval
//! and feeds the results to the pool's hysteresis.

use crate::backend::PrimaryStore;
use crate::pool::AccountPool;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct HealthMonitor {
    pool: Arc<AccountPool>,
    store: Arc<dyn PrimaryStore>,
    interval: Duration,
    probe_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(
        pool: Arc<AccountPool>,
        store: Arc<dyn PrimaryStore>,
        interval: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            store,
            interval,
            probe_timeout,
        }
    }

    /// Probe every account once, concurrently
    pub async fn probe_all(&self) {
        let probes = self.pool.endpoints().into_iter().map(|endpoint| async move {
            let healthy = match tokio::time::timeout(self.probe_timeout, self.store.probe(&endpoint)).await
            {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    debug!("Probe of {} failed: {}", endpoint.account_id, e);
                    false
                }
                Err(_) => {
                    debug!("Probe of {} timed out", endpoint.account_id);
                    false
                }
            };
            self.pool.record_probe(&endpoint.account_id, healthy);
        });
        join_all(probes).await;
    }

    /// Probe on every tick until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("Health monitor started (interval {:?})", self.interval);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => self.probe_all().await,
            }
        }
        info!("Health monitor stopped");
    }
}
