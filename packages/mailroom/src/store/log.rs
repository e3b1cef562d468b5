//! Per-step diagnostic rows written by the worker pipeline.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use typed_builder::TypedBuilder;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct ProcessingLog {
    #[builder(default = Uuid::now_v7())]
    pub id: Uuid,
    pub level: LogLevel,
    pub category: String,
    pub message: String,
    #[builder(default, setter(strip_option))]
    pub exception: Option<String>,
    #[builder(default, setter(strip_option))]
    pub queue_id: Option<Uuid>,
    #[builder(default, setter(strip_option))]
    pub worker_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub step: Option<String>,
    #[builder(default, setter(strip_option))]
    pub correlation_id: Option<Uuid>,
    pub machine_name: String,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
}

impl ProcessingLog {
    pub async fn insert(&self, db: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO processing_logs (
                id, level, category, message, exception, queue_id,
                worker_id, step, correlation_id, machine_name, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(self.id)
        .bind(self.level.as_str())
        .bind(&self.category)
        .bind(&self.message)
        .bind(&self.exception)
        .bind(self.queue_id)
        .bind(&self.worker_id)
        .bind(&self.step)
        .bind(self.correlation_id)
        .bind(&self.machine_name)
        .bind(self.created_at)
        .execute(db)
        .await?;

        Ok(())
    }
}
