//! Long-running service contract and host.
//!
//! Every background loop (dispatcher, scheduler, health monitor, alert
//! evaluator) implements [`Service`]; the [`ServiceHost`] spawns them,
//! translates Ctrl-C into cancellation, and drains within a grace period.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[async_trait]
pub trait Service: Send + 'static {
    fn name(&self) -> &'static str;

    /// Run until the shutdown token is cancelled.
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

pub struct ServiceHost {
    services: Vec<Box<dyn Service>>,
    shutdown: CancellationToken,
}

impl Default for ServiceHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceHost {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_service(mut self, service: impl Service) -> Self {
        self.services.push(Box::new(service));
        self
    }

    /// Token shared by every hosted service; cancel it to stop the host.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run all services until Ctrl-C (or an external cancel), then drain
    /// within `grace`. Services still running after the grace period are
    /// aborted; any work they held is recovered via stale-lease reclaim on
    /// the next start.
    pub async fn run_until_shutdown(self, grace: Duration) -> Result<()> {
        let shutdown = self.shutdown.clone();

        let mut handles = Vec::with_capacity(self.services.len());
        for service in self.services {
            let name = service.name();
            let token = shutdown.clone();
            info!(service = name, "starting service");
            handles.push((
                name,
                tokio::spawn(async move {
                    if let Err(e) = service.run(token).await {
                        error!(service = name, error = %e, "service exited with error");
                    }
                }),
            ));
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
            }
            _ = shutdown.cancelled() => {}
        }
        shutdown.cancel();

        let drain = async {
            for (_, handle) in handles.iter_mut() {
                let _ = handle.await;
            }
        };

        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!(
                grace_sec = grace.as_secs(),
                "grace period elapsed, abandoning remaining services"
            );
            for (name, handle) in &handles {
                if !handle.is_finished() {
                    warn!(service = name, "aborting service");
                    handle.abort();
                }
            }
        }

        info!("all services stopped");
        Ok(())
    }
}
