//! Dispatch loop: turns ready queue rows into worker tasks.
//!
//! Sleeps on a wakeable signal with a periodic poll fallback, claims at
//! most as many jobs as there are free worker slots, and runs stale-lease
//! reclaim on a sub-interval of the lease timeout.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::engine::service::Service;
use crate::engine::worker::WorkerPool;
use crate::monitor::metrics::MetricsCollector;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub batch_size: i64,
    pub poll_interval: Duration,
    pub stale_lease: Duration,
    pub drain_grace: Duration,
}

impl DispatcherConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.batch_size,
            poll_interval: config.poll_interval,
            stale_lease: config.stale_lease,
            drain_grace: config.grace_shutdown,
        }
    }
}

pub struct Dispatcher {
    store: Arc<dyn Store>,
    pool: Arc<WorkerPool>,
    metrics: Arc<MetricsCollector>,
    wake: Arc<Notify>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        pool: Arc<WorkerPool>,
        metrics: Arc<MetricsCollector>,
        wake: Arc<Notify>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            pool,
            metrics,
            wake,
            config,
        }
    }
}

#[async_trait]
impl Service for Dispatcher {
    fn name(&self) -> &'static str {
        "dispatcher"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let worker_id = self.pool.worker_id().to_string();
        info!(
            worker_id = %worker_id,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "dispatcher starting"
        );

        let reclaim_interval = (self.config.stale_lease / 2).max(Duration::from_secs(1));
        let mut last_reclaim = Instant::now();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if last_reclaim.elapsed() >= reclaim_interval {
                match self
                    .store
                    .reclaim_stale(Utc::now(), self.config.stale_lease)
                    .await
                {
                    Ok(reclaimed) if !reclaimed.is_empty() => {
                        warn!(count = reclaimed.len(), "reclaimed stale leases");
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "stale lease reclaim failed"),
                }
                last_reclaim = Instant::now();
            }

            // Never claim more than the pool can start right now.
            let slots = self.pool.available_slots();
            if slots == 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
                continue;
            }

            let limit = self.config.batch_size.min(slots as i64);
            let jobs = match self.store.claim_batch(Utc::now(), limit, &worker_id).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(error = %e, "failed to claim batch");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                    continue;
                }
            };

            if jobs.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.wake.notified() => {}
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            debug!(count = jobs.len(), "claimed batch");
            self.metrics.record_batch(jobs.len());

            for job in jobs {
                self.pool.dispatch(job).await;
            }
        }

        // Drain in-flight sends before giving the slot back to the host.
        self.pool.drain(self.config.drain_grace).await;
        info!(worker_id = %worker_id, "dispatcher stopped");
        Ok(())
    }
}
