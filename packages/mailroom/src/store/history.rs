//! Append-only delivery history: the audit source of truth for every job
//! that reached a terminal Sent or Failed state.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::job::{JobStatus, QueueJob};

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct EmailHistory {
    #[builder(default = Uuid::now_v7())]
    pub id: Uuid,
    pub queue_id: Uuid,
    pub to_addresses: String,
    #[builder(default, setter(strip_option))]
    pub cc_addresses: Option<String>,
    #[builder(default, setter(strip_option))]
    pub bcc_addresses: Option<String>,
    pub subject: String,
    pub final_body: String,
    pub status: JobStatus,
    #[builder(default, setter(strip_option))]
    pub sent_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub template_id: Option<Uuid>,
    #[builder(default = 0)]
    pub attachment_count: i32,
    #[builder(default = 0)]
    pub retry_count: i32,
    #[builder(default, setter(strip_option))]
    pub error_details: Option<String>,
    #[builder(default, setter(strip_option))]
    pub processed_by: Option<String>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub archived_at: Option<DateTime<Utc>>,
}

impl EmailHistory {
    /// Terminal row for a delivered job.
    pub fn for_sent(
        job: &QueueJob,
        subject: String,
        final_body: String,
        sent_at: DateTime<Utc>,
        attachment_count: i32,
        worker_id: &str,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            queue_id: job.id,
            to_addresses: job.to_addresses.clone(),
            cc_addresses: job.cc_addresses.clone(),
            bcc_addresses: job.bcc_addresses.clone(),
            subject,
            final_body,
            status: JobStatus::Sent,
            sent_at: Some(sent_at),
            template_id: job.template_id,
            attachment_count,
            retry_count: job.retry_count,
            error_details: None,
            processed_by: Some(worker_id.to_string()),
            created_at: Utc::now(),
            archived_at: None,
        }
    }

    /// Terminal row for a permanently failed job.
    pub fn for_failed(job: &QueueJob, error: &str, worker_id: &str) -> Self {
        Self {
            id: Uuid::now_v7(),
            queue_id: job.id,
            to_addresses: job.to_addresses.clone(),
            cc_addresses: job.cc_addresses.clone(),
            bcc_addresses: job.bcc_addresses.clone(),
            subject: job.subject.clone(),
            final_body: job.body.clone(),
            status: JobStatus::Failed,
            sent_at: None,
            template_id: job.template_id,
            attachment_count: 0,
            retry_count: job.retry_count,
            error_details: Some(error.to_string()),
            processed_by: Some(worker_id.to_string()),
            created_at: Utc::now(),
            archived_at: None,
        }
    }

    pub async fn insert(&self, db: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO email_history (
                id, queue_id, to_addresses, cc_addresses, bcc_addresses,
                subject, final_body, status, sent_at, template_id,
                attachment_count, retry_count, error_details, processed_by,
                created_at, archived_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(self.id)
        .bind(self.queue_id)
        .bind(&self.to_addresses)
        .bind(&self.cc_addresses)
        .bind(&self.bcc_addresses)
        .bind(&self.subject)
        .bind(&self.final_body)
        .bind(self.status)
        .bind(self.sent_at)
        .bind(self.template_id)
        .bind(self.attachment_count)
        .bind(self.retry_count)
        .bind(&self.error_details)
        .bind(&self.processed_by)
        .bind(self.created_at)
        .bind(self.archived_at)
        .execute(db)
        .await?;

        Ok(())
    }

    pub async fn find_by_queue_id(queue_id: Uuid, db: &PgPool) -> Result<Vec<Self>> {
        let rows = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, queue_id, to_addresses, cc_addresses, bcc_addresses,
                   subject, final_body, status, sent_at, template_id,
                   attachment_count, retry_count, error_details, processed_by,
                   created_at, archived_at
            FROM email_history
            WHERE queue_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(queue_id)
        .fetch_all(db)
        .await?;

        Ok(rows)
    }

    /// Stamp `archived_at` on history rows older than the cutoff. Archived
    /// rows stay queryable through the same interface.
    pub async fn archive_before(
        cutoff: DateTime<Utc>,
        archived_at: DateTime<Utc>,
        db: &PgPool,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE email_history
            SET archived_at = $2
            WHERE created_at < $1
              AND archived_at IS NULL
            "#,
        )
        .bind(cutoff)
        .bind(archived_at)
        .execute(db)
        .await?;

        Ok(result.rows_affected())
    }
}
