//! Scheduled email plans: deferred one-shots and recurring sends.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::collections::HashMap;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::job::JobPriority;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct ScheduledEmail {
    #[builder(default = Uuid::now_v7())]
    pub id: Uuid,
    pub name: String,
    #[builder(default, setter(strip_option))]
    pub template_id: Option<Uuid>,
    #[builder(default, setter(strip_option))]
    pub template_data: Option<serde_json::Value>,
    pub to_addresses: String,
    #[builder(default, setter(strip_option))]
    pub cc_addresses: Option<String>,
    #[builder(default, setter(strip_option))]
    pub bcc_addresses: Option<String>,
    pub subject: String,
    pub body: String,
    #[builder(default = false)]
    pub is_html: bool,
    #[builder(default)]
    pub priority: JobPriority,

    #[builder(default = Utc::now())]
    pub start_date: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub end_date: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub next_run_time: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub cron_expression: Option<String>,
    #[builder(default, setter(strip_option))]
    pub interval_minutes: Option<i32>,
    #[builder(default = false)]
    pub is_recurring: bool,
    #[builder(default = true)]
    pub is_active: bool,

    #[builder(default = 0)]
    pub execution_count: i32,
    #[builder(default, setter(strip_option))]
    pub max_executions: Option<i32>,
    #[builder(default, setter(strip_option))]
    pub last_executed_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub last_execution_status: Option<String>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl ScheduledEmail {
    /// A recurring plan must carry exactly one recurrence source.
    pub fn recurrence_is_valid(&self) -> bool {
        if !self.is_recurring {
            return true;
        }
        self.cron_expression.is_some() != self.interval_minutes.is_some()
    }

    /// Template data must be the flat string-to-string map rendering
    /// consumes; anything else would queue jobs that can only fail.
    pub fn template_data_is_valid(&self) -> bool {
        match &self.template_data {
            None => true,
            Some(value) => {
                serde_json::from_value::<HashMap<String, String>>(value.clone()).is_ok()
            }
        }
    }

    pub async fn find_by_id(id: Uuid, db: &PgPool) -> Result<Option<Self>> {
        let schedule = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, name, template_id, template_data, to_addresses, cc_addresses, bcc_addresses,
                   subject, body, is_html, priority, start_date, end_date, next_run_time,
                   cron_expression, interval_minutes, is_recurring, is_active,
                   execution_count, max_executions, last_executed_at, last_execution_status,
                   created_at, updated_at
            FROM scheduled_emails
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(db)
        .await?;

        Ok(schedule)
    }

    pub async fn insert(&self, db: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_emails (
                id, name, template_id, template_data, to_addresses, cc_addresses, bcc_addresses,
                subject, body, is_html, priority, start_date, end_date, next_run_time,
                cron_expression, interval_minutes, is_recurring, is_active,
                execution_count, max_executions, last_executed_at, last_execution_status,
                created_at, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7,
                $8, $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18,
                $19, $20, $21, $22,
                $23, $24
            )
            "#,
        )
        .bind(self.id)
        .bind(&self.name)
        .bind(self.template_id)
        .bind(&self.template_data)
        .bind(&self.to_addresses)
        .bind(&self.cc_addresses)
        .bind(&self.bcc_addresses)
        .bind(&self.subject)
        .bind(&self.body)
        .bind(self.is_html)
        .bind(self.priority)
        .bind(self.start_date)
        .bind(self.end_date)
        .bind(self.next_run_time)
        .bind(&self.cron_expression)
        .bind(self.interval_minutes)
        .bind(self.is_recurring)
        .bind(self.is_active)
        .bind(self.execution_count)
        .bind(self.max_executions)
        .bind(self.last_executed_at)
        .bind(&self.last_execution_status)
        .bind(self.created_at)
        .bind(self.updated_at)
        .execute(db)
        .await?;

        Ok(())
    }

    /// Fetch plans due at `now`. SKIP LOCKED keeps concurrent schedulers off
    /// each other's rows; the optimistic guard in [`Self::apply_run`] is what
    /// makes firing exactly-once.
    pub async fn find_due(now: DateTime<Utc>, limit: i64, db: &PgPool) -> Result<Vec<Self>> {
        let schedules = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, name, template_id, template_data, to_addresses, cc_addresses, bcc_addresses,
                   subject, body, is_html, priority, start_date, end_date, next_run_time,
                   cron_expression, interval_minutes, is_recurring, is_active,
                   execution_count, max_executions, last_executed_at, last_execution_status,
                   created_at, updated_at
            FROM scheduled_emails
            WHERE is_active
              AND next_run_time IS NOT NULL
              AND next_run_time <= $1
              AND start_date <= $1
            ORDER BY next_run_time ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(db)
        .await?;

        Ok(schedules)
    }

    /// Persist the post-run mutation inside a transaction, guarded on the
    /// execution count observed at claim time. Returns false when another
    /// scheduler already fired this occurrence.
    pub async fn apply_run(
        &self,
        prev_execution_count: i32,
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_emails
            SET next_run_time = $2,
                is_active = $3,
                execution_count = $4,
                last_executed_at = $5,
                last_execution_status = $6,
                updated_at = NOW()
            WHERE id = $1 AND execution_count = $7
            "#,
        )
        .bind(self.id)
        .bind(self.next_run_time)
        .bind(self.is_active)
        .bind(self.execution_count)
        .bind(self.last_executed_at)
        .bind(&self.last_execution_status)
        .bind(prev_execution_count)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn deactivate(id: Uuid, db: &PgPool) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_emails
            SET is_active = FALSE,
                updated_at = NOW()
            WHERE id = $1 AND is_active
            "#,
        )
        .bind(id)
        .execute(db)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
