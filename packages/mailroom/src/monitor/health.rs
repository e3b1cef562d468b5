//! Health monitor: periodic probes plus the ServiceStatus heartbeat row.
//!
//! One service, two duties on the same tick: probe the store, the SMTP
//! backend, and the local process, then upsert the per-instance heartbeat.
//! The latest probe result is published for the alert evaluator. Probe and
//! heartbeat failures are logged and never abort the tick.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use sysinfo::System;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::email::SmtpSender;
use crate::engine::service::Service;
use crate::engine::worker::WorkerPool;
use crate::monitor::metrics::MetricsCollector;
use crate::store::{HealthLevel, ServiceStatus, Store};

/// Latest probe result, shared with the alert evaluator.
pub type SharedHealth = Arc<RwLock<Option<SystemHealth>>>;

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub level: HealthLevel,
    pub latency_ms: u64,
    pub detail: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProcessProbe {
    pub level: HealthLevel,
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

#[derive(Debug, Clone)]
pub struct SystemHealth {
    pub overall: HealthLevel,
    pub store: ProbeResult,
    pub smtp: ProbeResult,
    pub process: ProcessProbe,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub interval: Duration,
    pub service_name: String,
    pub machine_name: String,
    pub batch_size: i32,
    pub store_warn_after: Duration,
    pub smtp_warn_after: Duration,
    pub cpu_warning_percent: f64,
    pub cpu_critical_percent: f64,
    pub memory_warning_mb: f64,
    pub memory_critical_mb: f64,
}

impl HealthSettings {
    pub fn from_config(config: &Config, machine_name: &str) -> Self {
        Self {
            interval: config.heartbeat_interval,
            service_name: "mailroom-dispatch".to_string(),
            machine_name: machine_name.to_string(),
            batch_size: config.batch_size as i32,
            store_warn_after: Duration::from_secs(5),
            smtp_warn_after: Duration::from_secs(10),
            cpu_warning_percent: config.cpu_warning_percent,
            cpu_critical_percent: config.cpu_critical_percent,
            memory_warning_mb: config.memory_warning_mb,
            memory_critical_mb: config.memory_critical_mb,
        }
    }
}

pub struct HealthMonitor {
    store: Arc<dyn Store>,
    smtp: Arc<dyn SmtpSender>,
    metrics: Arc<MetricsCollector>,
    pool: Arc<WorkerPool>,
    latest: SharedHealth,
    sys: Mutex<System>,
    settings: HealthSettings,
    started_at: DateTime<Utc>,
    last_error: Mutex<Option<String>>,
}

impl HealthMonitor {
    pub fn new(
        store: Arc<dyn Store>,
        smtp: Arc<dyn SmtpSender>,
        metrics: Arc<MetricsCollector>,
        pool: Arc<WorkerPool>,
        settings: HealthSettings,
    ) -> Self {
        Self {
            store,
            smtp,
            metrics,
            pool,
            latest: Arc::new(RwLock::new(None)),
            sys: Mutex::new(System::new()),
            settings,
            started_at: Utc::now(),
            last_error: Mutex::new(None),
        }
    }

    /// Handle the alert evaluator reads the latest probe through.
    pub fn shared_health(&self) -> SharedHealth {
        Arc::clone(&self.latest)
    }

    /// Run every probe once and classify the overall level as the worst.
    pub async fn probe(&self) -> SystemHealth {
        let store = self.probe_store().await;
        let smtp = self.probe_smtp().await;
        let process = self.probe_process();

        let overall = store
            .level
            .max(smtp.level)
            .max(process.level);

        SystemHealth {
            overall,
            store,
            smtp,
            process,
            checked_at: Utc::now(),
        }
    }

    async fn probe_store(&self) -> ProbeResult {
        let start = Instant::now();
        let outcome = async {
            self.store.ping().await?;
            self.store.count_jobs().await
        }
        .await;
        let elapsed = start.elapsed();

        match outcome {
            Ok(_) => ProbeResult {
                level: classify_latency(elapsed, self.settings.store_warn_after),
                latency_ms: elapsed.as_millis() as u64,
                detail: None,
            },
            Err(e) => {
                self.note_error(format!("store probe failed: {e}"));
                ProbeResult {
                    level: HealthLevel::Critical,
                    latency_ms: elapsed.as_millis() as u64,
                    detail: Some(e.to_string()),
                }
            }
        }
    }

    async fn probe_smtp(&self) -> ProbeResult {
        let start = Instant::now();
        let reachable = self.smtp.test_connection().await;
        let elapsed = start.elapsed();

        if reachable {
            ProbeResult {
                level: classify_latency(elapsed, self.settings.smtp_warn_after),
                latency_ms: elapsed.as_millis() as u64,
                detail: None,
            }
        } else {
            self.note_error("smtp connection test failed".to_string());
            ProbeResult {
                level: HealthLevel::Critical,
                latency_ms: elapsed.as_millis() as u64,
                detail: Some("connection test failed".to_string()),
            }
        }
    }

    fn probe_process(&self) -> ProcessProbe {
        let mut sys = self.sys.lock().unwrap_or_else(|e| e.into_inner());
        sys.refresh_memory();
        sys.refresh_cpu();

        let (cpu_percent, memory_mb) = match sysinfo::get_current_pid() {
            Ok(pid) => {
                sys.refresh_process(pid);
                match sys.process(pid) {
                    Some(process) => (
                        process.cpu_usage() as f64,
                        process.memory() as f64 / (1024.0 * 1024.0),
                    ),
                    None => (0.0, 0.0),
                }
            }
            Err(_) => (0.0, 0.0),
        };

        ProcessProbe {
            level: classify_process(
                cpu_percent,
                memory_mb,
                self.settings.cpu_warning_percent,
                self.settings.cpu_critical_percent,
                self.settings.memory_warning_mb,
                self.settings.memory_critical_mb,
            ),
            cpu_percent,
            memory_mb,
        }
    }

    /// Upsert the per-instance ServiceStatus row.
    pub async fn heartbeat(&self, health: &SystemHealth) -> Result<()> {
        let now = Utc::now();
        let stats = self.store.queue_stats(now).await?;
        let snapshot = self.metrics.snapshot(now);

        let status = ServiceStatus {
            service_name: self.settings.service_name.clone(),
            machine_name: self.settings.machine_name.clone(),
            status: health.overall,
            last_heartbeat: now,
            queue_depth: stats.depth(),
            emails_per_hour: snapshot.emails_last_hour as f64,
            error_rate: snapshot.failure_rate(),
            avg_processing_ms: snapshot.avg_processing_ms,
            cpu_percent: health.process.cpu_percent,
            memory_mb: health.process.memory_mb,
            active_workers: self.pool.active_workers() as i32,
            max_workers: self.pool.max_workers() as i32,
            batch_size: self.settings.batch_size,
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: self.started_at,
            total_processed: snapshot.counters.emails_sent as i64,
            total_failed: snapshot.counters.emails_failed as i64,
            uptime_sec: (now - self.started_at).num_seconds(),
            last_error: self.last_error.lock().unwrap_or_else(|e| e.into_inner()).clone(),
        };

        self.store.upsert_service_status(status).await
    }

    /// Probe, publish, heartbeat. Used by the service loop and by tests.
    pub async fn tick(&self) {
        let health = self.probe().await;
        debug!(
            overall = ?health.overall,
            store_ms = health.store.latency_ms,
            smtp_ms = health.smtp.latency_ms,
            cpu = health.process.cpu_percent,
            "health probes complete"
        );
        self.metrics.record_health_check();

        if let Err(e) = self.heartbeat(&health).await {
            error!(error = %e, "failed to write heartbeat");
        }

        *self.latest.write().unwrap_or_else(|e| e.into_inner()) = Some(health);
    }

    fn note_error(&self, message: String) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(message);
    }
}

fn classify_latency(elapsed: Duration, warn_after: Duration) -> HealthLevel {
    if elapsed > warn_after {
        HealthLevel::Warning
    } else {
        HealthLevel::Healthy
    }
}

fn classify_process(
    cpu: f64,
    memory_mb: f64,
    cpu_warn: f64,
    cpu_crit: f64,
    mem_warn: f64,
    mem_crit: f64,
) -> HealthLevel {
    if cpu >= cpu_crit || memory_mb >= mem_crit {
        HealthLevel::Critical
    } else if cpu >= cpu_warn || memory_mb >= mem_warn {
        HealthLevel::Warning
    } else {
        HealthLevel::Healthy
    }
}

#[async_trait]
impl Service for HealthMonitor {
    fn name(&self) -> &'static str {
        "health-monitor"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(
            interval_sec = self.settings.interval.as_secs(),
            machine = %self.settings.machine_name,
            "health monitor starting"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.interval) => {}
            }
            self.tick().await;
        }

        info!("health monitor stopped");
        Ok(())
    }
}
