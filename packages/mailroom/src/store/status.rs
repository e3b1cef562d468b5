//! Per-instance heartbeat row, upserted by the health monitor.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

/// Health classification. Discriminants are stable; `Ord` follows severity
/// so `max` picks the worst probe result.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    sqlx::Type,
    Default,
)]
#[repr(i16)]
pub enum HealthLevel {
    #[default]
    Healthy = 0,
    Warning = 1,
    Critical = 2,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub service_name: String,
    pub machine_name: String,
    pub status: HealthLevel,
    pub last_heartbeat: DateTime<Utc>,
    pub queue_depth: i64,
    pub emails_per_hour: f64,
    pub error_rate: f64,
    pub avg_processing_ms: f64,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub active_workers: i32,
    pub max_workers: i32,
    pub batch_size: i32,
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub total_processed: i64,
    pub total_failed: i64,
    pub uptime_sec: i64,
    pub last_error: Option<String>,
}

impl ServiceStatus {
    pub async fn upsert(&self, db: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO service_status (
                service_name, machine_name, status, last_heartbeat, queue_depth,
                emails_per_hour, error_rate, avg_processing_ms, cpu_percent, memory_mb,
                active_workers, max_workers, batch_size, version, started_at,
                total_processed, total_failed, uptime_sec, last_error
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            ON CONFLICT (service_name, machine_name) DO UPDATE SET
                status = EXCLUDED.status,
                last_heartbeat = EXCLUDED.last_heartbeat,
                queue_depth = EXCLUDED.queue_depth,
                emails_per_hour = EXCLUDED.emails_per_hour,
                error_rate = EXCLUDED.error_rate,
                avg_processing_ms = EXCLUDED.avg_processing_ms,
                cpu_percent = EXCLUDED.cpu_percent,
                memory_mb = EXCLUDED.memory_mb,
                active_workers = EXCLUDED.active_workers,
                max_workers = EXCLUDED.max_workers,
                batch_size = EXCLUDED.batch_size,
                version = EXCLUDED.version,
                started_at = EXCLUDED.started_at,
                total_processed = EXCLUDED.total_processed,
                total_failed = EXCLUDED.total_failed,
                uptime_sec = EXCLUDED.uptime_sec,
                last_error = EXCLUDED.last_error
            "#,
        )
        .bind(&self.service_name)
        .bind(&self.machine_name)
        .bind(self.status)
        .bind(self.last_heartbeat)
        .bind(self.queue_depth)
        .bind(self.emails_per_hour)
        .bind(self.error_rate)
        .bind(self.avg_processing_ms)
        .bind(self.cpu_percent)
        .bind(self.memory_mb)
        .bind(self.active_workers)
        .bind(self.max_workers)
        .bind(self.batch_size)
        .bind(&self.version)
        .bind(self.started_at)
        .bind(self.total_processed)
        .bind(self.total_failed)
        .bind(self.uptime_sec)
        .bind(&self.last_error)
        .execute(db)
        .await?;

        Ok(())
    }
}
