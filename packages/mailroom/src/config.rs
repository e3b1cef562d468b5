use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,

    pub worker_count: usize,
    pub batch_size: i64,
    pub poll_interval: Duration,
    pub max_retries: i32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub stale_lease: Duration,
    pub max_attachment_bytes: u64,
    pub heartbeat_interval: Duration,
    pub scheduler_interval: Duration,
    pub alert_eval_interval: Duration,
    pub history_retention_days: i64,
    pub grace_shutdown: Duration,
    pub job_timeout: Duration,

    pub smtp: SmtpConfig,

    /// Probe thresholds for the health monitor.
    pub cpu_warning_percent: f64,
    pub cpu_critical_percent: f64,
    pub memory_warning_mb: f64,
    pub memory_critical_mb: f64,
}

/// SMTP server connection settings
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub use_tls: bool,
    pub from_address: String,
    pub send_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            worker_count: parse_var("WORKER_COUNT", 8)?,
            batch_size: parse_var("BATCH_SIZE", 50)?,
            poll_interval: Duration::from_secs(parse_var("POLL_INTERVAL_SEC", 5)?),
            max_retries: parse_var("MAX_RETRIES", 5)?,
            retry_base: Duration::from_secs(parse_var("RETRY_BASE_SEC", 30)?),
            retry_max: Duration::from_secs(parse_var("RETRY_MAX_SEC", 3600)?),
            stale_lease: Duration::from_secs(parse_var("STALE_LEASE_SEC", 600)?),
            max_attachment_bytes: parse_var::<u64>("MAX_ATTACHMENT_MB", 25)? * 1024 * 1024,
            heartbeat_interval: Duration::from_secs(parse_var("HEARTBEAT_SEC", 30)?),
            scheduler_interval: Duration::from_secs(parse_var("SCHEDULER_INTERVAL_SEC", 30)?),
            alert_eval_interval: Duration::from_secs(parse_var("ALERT_EVAL_SEC", 120)?),
            history_retention_days: parse_var("HISTORY_RETENTION_DAYS", 7)?,
            grace_shutdown: Duration::from_secs(parse_var("GRACE_SHUTDOWN_SEC", 30)?),
            job_timeout: Duration::from_secs(parse_var("JOB_TIMEOUT_SEC", 120)?),
            smtp: SmtpConfig::from_env()?,
            cpu_warning_percent: parse_var("CPU_WARNING_PERCENT", 75.0)?,
            cpu_critical_percent: parse_var("CPU_CRITICAL_PERCENT", 90.0)?,
            memory_warning_mb: parse_var("MEMORY_WARNING_MB", 1024.0)?,
            memory_critical_mb: parse_var("MEMORY_CRITICAL_MB", 2048.0)?,
        })
    }
}

impl SmtpConfig {
    /// Load SMTP settings from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: env::var("SMTP_HOST").context("SMTP_HOST must be set")?,
            port: parse_var("SMTP_PORT", 587)?,
            username: env::var("SMTP_USERNAME").unwrap_or_default(),
            password: env::var("SMTP_PASSWORD").unwrap_or_default(),
            use_tls: parse_var("SMTP_USE_TLS", true)?,
            from_address: env::var("SMTP_FROM_ADDRESS")
                .context("SMTP_FROM_ADDRESS must be set")?,
            send_timeout: Duration::from_secs(parse_var("SMTP_SEND_TIMEOUT_SEC", 30)?),
        })
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{name} is invalid: {e}")),
        Err(_) => Ok(default),
    }
}
