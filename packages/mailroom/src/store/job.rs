//! Queue job model: one enqueued send request with its full lifecycle state.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgExecutor;
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::pagination::{PageRequest, PagedResult};

// ============================================================================
// Enums
// ============================================================================

/// Job lifecycle status. Discriminants are the stable wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[repr(i16)]
pub enum JobStatus {
    #[default]
    Queued = 0,
    Processing = 1,
    Sent = 2,
    Failed = 3,
    Cancelled = 4,
}

impl JobStatus {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(JobStatus::Queued),
            1 => Some(JobStatus::Processing),
            2 => Some(JobStatus::Sent),
            3 => Some(JobStatus::Failed),
            4 => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Sent | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// Dispatch priority. Discriminants are the stable wire values; ordering
/// follows urgency (Critical sorts last in `Ord`, first in dispatch).
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
pub enum JobPriority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl JobPriority {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            1 => Some(JobPriority::Low),
            2 => Some(JobPriority::Normal),
            3 => Some(JobPriority::High),
            4 => Some(JobPriority::Critical),
            _ => None,
        }
    }
}

// ============================================================================
// Job model
// ============================================================================

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct QueueJob {
    #[builder(default = Uuid::now_v7())]
    pub id: Uuid,

    #[builder(default)]
    pub priority: JobPriority,
    #[builder(default)]
    pub status: JobStatus,

    // Recipients: comma-separated address lists; `to_addresses` is non-empty.
    pub to_addresses: String,
    #[builder(default, setter(strip_option))]
    pub cc_addresses: Option<String>,
    #[builder(default, setter(strip_option))]
    pub bcc_addresses: Option<String>,

    pub subject: String,
    pub body: String,
    #[builder(default = false)]
    pub is_html: bool,

    // Template rendering inputs; `template_data` is an opaque JSON blob
    // decoded lazily by the worker.
    #[builder(default, setter(strip_option))]
    pub template_id: Option<Uuid>,
    #[builder(default, setter(strip_option))]
    pub template_data: Option<serde_json::Value>,
    #[builder(default = false)]
    pub requires_template_processing: bool,

    // Serialized attachment list, same lazy-decode treatment.
    #[builder(default, setter(strip_option))]
    pub attachments: Option<serde_json::Value>,

    #[builder(default = 0)]
    pub retry_count: i32,
    #[builder(default, setter(strip_option))]
    pub last_error: Option<String>,
    #[builder(default, setter(strip_option))]
    pub processed_by: Option<String>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub processing_started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub processed_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub sent_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[builder(default = false)]
    pub is_scheduled: bool,

    #[builder(default, setter(strip_option))]
    pub created_by: Option<String>,
    #[builder(default, setter(strip_option))]
    pub request_source: Option<String>,
}

impl QueueJob {
    /// Whether the job carries any serialized attachments.
    pub fn has_attachments(&self) -> bool {
        match &self.attachments {
            Some(serde_json::Value::Array(items)) => !items.is_empty(),
            Some(_) => true,
            None => false,
        }
    }

    /// A job is ready for dispatch when queued and not deferred to the future.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Queued {
            return false;
        }
        match (self.is_scheduled, self.scheduled_for) {
            (true, Some(at)) => at <= now,
            (true, None) => false,
            (false, _) => true,
        }
    }

    // ------------------------------------------------------------------
    // SQL
    // ------------------------------------------------------------------

    pub async fn find_by_id(id: Uuid, db: &PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, priority, status, to_addresses, cc_addresses, bcc_addresses,
                   subject, body, is_html, template_id, template_data, requires_template_processing,
                   attachments, retry_count, last_error, processed_by,
                   created_at, updated_at, processing_started_at, processed_at, sent_at,
                   scheduled_for, is_scheduled, created_by, request_source
            FROM email_queue
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(db)
        .await?;

        Ok(job)
    }

    /// Insert the job. Duplicate ids are idempotent no-ops; returns whether
    /// a new row was written.
    pub async fn insert<'e>(&self, db: impl PgExecutor<'e>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO email_queue (
                id, priority, status, to_addresses, cc_addresses, bcc_addresses,
                subject, body, is_html, template_id, template_data, requires_template_processing,
                attachments, retry_count, last_error, processed_by,
                created_at, updated_at, processing_started_at, processed_at, sent_at,
                scheduled_for, is_scheduled, created_by, request_source
            )
            VALUES (
                $1, $2, $3, $4, $5, $6,
                $7, $8, $9, $10, $11, $12,
                $13, $14, $15, $16,
                $17, $18, $19, $20, $21,
                $22, $23, $24, $25
            )
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(self.id)
        .bind(self.priority)
        .bind(self.status)
        .bind(&self.to_addresses)
        .bind(&self.cc_addresses)
        .bind(&self.bcc_addresses)
        .bind(&self.subject)
        .bind(&self.body)
        .bind(self.is_html)
        .bind(self.template_id)
        .bind(&self.template_data)
        .bind(self.requires_template_processing)
        .bind(&self.attachments)
        .bind(self.retry_count)
        .bind(&self.last_error)
        .bind(&self.processed_by)
        .bind(self.created_at)
        .bind(self.updated_at)
        .bind(self.processing_started_at)
        .bind(self.processed_at)
        .bind(self.sent_at)
        .bind(self.scheduled_for)
        .bind(self.is_scheduled)
        .bind(&self.created_by)
        .bind(&self.request_source)
        .execute(db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Claim up to `limit` ready jobs atomically using FOR UPDATE SKIP LOCKED,
    /// leasing each to `worker_id`.
    pub async fn claim_batch(
        now: DateTime<Utc>,
        limit: i64,
        worker_id: &str,
        db: &PgPool,
    ) -> Result<Vec<Self>> {
        let jobs = sqlx::query_as::<_, Self>(
            r#"
            WITH ready AS (
                SELECT id
                FROM email_queue
                WHERE status = 0
                  AND (NOT is_scheduled OR scheduled_for <= $1)
                ORDER BY priority DESC, created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE email_queue
            SET status = 1,
                processed_by = $3,
                processing_started_at = $1,
                updated_at = $1
            WHERE id IN (SELECT id FROM ready)
            RETURNING id, priority, status, to_addresses, cc_addresses, bcc_addresses,
                      subject, body, is_html, template_id, template_data, requires_template_processing,
                      attachments, retry_count, last_error, processed_by,
                      created_at, updated_at, processing_started_at, processed_at, sent_at,
                      scheduled_for, is_scheduled, created_by, request_source
            "#,
        )
        .bind(now)
        .bind(limit)
        .bind(worker_id)
        .fetch_all(db)
        .await?;

        // The UPDATE does not preserve the CTE ordering.
        let mut jobs = jobs;
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        Ok(jobs)
    }

    /// Return stale leases to the queue, bumping the retry counter.
    pub async fn reclaim_stale(
        now: DateTime<Utc>,
        cutoff: DateTime<Utc>,
        db: &PgPool,
    ) -> Result<Vec<Self>> {
        let jobs = sqlx::query_as::<_, Self>(
            r#"
            UPDATE email_queue
            SET status = 0,
                retry_count = retry_count + 1,
                processed_by = NULL,
                processing_started_at = NULL,
                updated_at = $1
            WHERE status = 1
              AND processing_started_at < $2
            RETURNING id, priority, status, to_addresses, cc_addresses, bcc_addresses,
                      subject, body, is_html, template_id, template_data, requires_template_processing,
                      attachments, retry_count, last_error, processed_by,
                      created_at, updated_at, processing_started_at, processed_at, sent_at,
                      scheduled_for, is_scheduled, created_by, request_source
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .fetch_all(db)
        .await?;

        Ok(jobs)
    }

    /// Requeue a processing job for a delayed retry attempt.
    pub async fn requeue_with_backoff(
        id: Uuid,
        attempt: i32,
        error: &str,
        run_at: DateTime<Utc>,
        db: &PgPool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE email_queue
            SET status = 0,
                retry_count = $2,
                last_error = $3,
                scheduled_for = $4,
                is_scheduled = TRUE,
                processed_by = NULL,
                processing_started_at = NULL,
                processed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 1
            "#,
        )
        .bind(id)
        .bind(attempt)
        .bind(error)
        .bind(run_at)
        .execute(db)
        .await?;

        Ok(())
    }

    pub async fn mark_sent(id: Uuid, sent_at: DateTime<Utc>, db: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE email_queue
            SET status = 2,
                sent_at = $2,
                processed_at = $2,
                updated_at = $2
            WHERE id = $1 AND status = 1
            "#,
        )
        .bind(id)
        .bind(sent_at)
        .execute(db)
        .await?;

        Ok(())
    }

    pub async fn mark_failed(id: Uuid, error: &str, db: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE email_queue
            SET status = 3,
                last_error = $2,
                processed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(db)
        .await?;

        Ok(())
    }

    /// Cancel a queued job. Returns false when the job is already leased or
    /// terminal.
    pub async fn cancel(id: Uuid, db: &PgPool) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE email_queue
            SET status = 4,
                updated_at = NOW()
            WHERE id = $1 AND status = 0
            "#,
        )
        .bind(id)
        .execute(db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list(
        filter: &JobFilter,
        page: PageRequest,
        db: &PgPool,
    ) -> Result<PagedResult<Self>> {
        let total = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM email_queue
            WHERE ($1::SMALLINT IS NULL OR status = $1)
              AND ($2::SMALLINT IS NULL OR priority = $2)
              AND ($3::TEXT IS NULL OR to_addresses ILIKE '%' || $3 || '%')
              AND ($4::TIMESTAMPTZ IS NULL OR created_at >= $4)
              AND ($5::TIMESTAMPTZ IS NULL OR created_at < $5)
            "#,
        )
        .bind(filter.status.map(JobStatus::as_i16))
        .bind(filter.priority.map(JobPriority::as_i16))
        .bind(&filter.recipient_contains)
        .bind(filter.created_after)
        .bind(filter.created_before)
        .fetch_one(db)
        .await?;

        let jobs = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, priority, status, to_addresses, cc_addresses, bcc_addresses,
                   subject, body, is_html, template_id, template_data, requires_template_processing,
                   attachments, retry_count, last_error, processed_by,
                   created_at, updated_at, processing_started_at, processed_at, sent_at,
                   scheduled_for, is_scheduled, created_by, request_source
            FROM email_queue
            WHERE ($1::SMALLINT IS NULL OR status = $1)
              AND ($2::SMALLINT IS NULL OR priority = $2)
              AND ($3::TEXT IS NULL OR to_addresses ILIKE '%' || $3 || '%')
              AND ($4::TIMESTAMPTZ IS NULL OR created_at >= $4)
              AND ($5::TIMESTAMPTZ IS NULL OR created_at < $5)
            ORDER BY created_at DESC
            LIMIT $6 OFFSET $7
            "#,
        )
        .bind(filter.status.map(JobStatus::as_i16))
        .bind(filter.priority.map(JobPriority::as_i16))
        .bind(&filter.recipient_contains)
        .bind(filter.created_after)
        .bind(filter.created_before)
        .bind(page.page_size)
        .bind(page.offset())
        .fetch_all(db)
        .await?;

        Ok(PagedResult::new(jobs, page, total))
    }

    /// Delete terminal rows older than the cutoff; history remains the audit
    /// record.
    pub async fn purge_terminal_before(cutoff: DateTime<Utc>, db: &PgPool) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM email_queue q
            WHERE q.status IN (2, 3, 4)
              AND q.updated_at < $1
              AND (q.status = 4 OR EXISTS (
                  SELECT 1 FROM email_history h WHERE h.queue_id = q.id
              ))
            "#,
        )
        .bind(cutoff)
        .execute(db)
        .await?;

        Ok(result.rows_affected())
    }
}

// ============================================================================
// Filters and aggregates
// ============================================================================

/// Listing filter; all fields are optional conjuncts.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub priority: Option<JobPriority>,
    pub recipient_contains: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

/// Aggregate queue counters used by the health surface and heartbeats.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub queued: i64,
    pub processing: i64,
    pub sent: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub scheduled: i64,
    pub oldest_queued_minutes: Option<f64>,
    pub avg_processing_minutes: Option<f64>,
}

impl QueueStats {
    /// Backlog currently owed to workers.
    pub fn depth(&self) -> i64 {
        self.queued + self.processing
    }

    pub async fn collect(now: DateTime<Utc>, db: &PgPool) -> Result<Self> {
        let row = sqlx::query_as::<_, (i64, i64, i64, i64, i64, i64, Option<f64>, Option<f64>)>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 0),
                COUNT(*) FILTER (WHERE status = 1),
                COUNT(*) FILTER (WHERE status = 2),
                COUNT(*) FILTER (WHERE status = 3),
                COUNT(*) FILTER (WHERE status = 4),
                COUNT(*) FILTER (WHERE status = 0 AND is_scheduled AND scheduled_for > $1),
                (EXTRACT(EPOCH FROM ($1 - MIN(created_at) FILTER (
                    WHERE status = 0 AND (NOT is_scheduled OR scheduled_for <= $1)
                ))) / 60.0)::DOUBLE PRECISION,
                (AVG(EXTRACT(EPOCH FROM (processed_at - processing_started_at)) / 60.0) FILTER (
                    WHERE processed_at IS NOT NULL
                      AND processing_started_at IS NOT NULL
                      AND processed_at > $1 - INTERVAL '24 hours'
                ))::DOUBLE PRECISION
            FROM email_queue
            "#,
        )
        .bind(now)
        .fetch_one(db)
        .await?;

        Ok(Self {
            queued: row.0,
            processing: row.1,
            sent: row.2,
            failed: row.3,
            cancelled: row.4,
            scheduled: row.5,
            oldest_queued_minutes: row.6,
            avg_processing_minutes: row.7,
        })
    }
}
