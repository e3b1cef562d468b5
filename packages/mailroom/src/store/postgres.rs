//! PostgreSQL-backed store implementation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use super::{
    CancelOutcome, EmailHistory, EmailTemplate, InsertOutcome, JobFilter, ProcessingLog,
    QueueJob, QueueStats, ScheduledEmail, ServiceStatus, Store, TemplateUpdate,
};
use crate::common::pagination::{PageRequest, PagedResult};

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn insert_job(&self, job: QueueJob) -> Result<InsertOutcome> {
        let inserted = job.insert(&self.pool).await?;
        Ok(if inserted {
            InsertOutcome::Inserted(job.id)
        } else {
            InsertOutcome::Duplicate(job.id)
        })
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<QueueJob>> {
        QueueJob::find_by_id(id, &self.pool).await
    }

    async fn claim_batch(
        &self,
        now: DateTime<Utc>,
        batch_size: i64,
        worker_id: &str,
    ) -> Result<Vec<QueueJob>> {
        QueueJob::claim_batch(now, batch_size, worker_id, &self.pool).await
    }

    async fn reclaim_stale(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<Vec<QueueJob>> {
        let cutoff = now
            - chrono::Duration::from_std(stale_after)
                .context("stale lease duration out of range")?;
        QueueJob::reclaim_stale(now, cutoff, &self.pool).await
    }

    async fn requeue_with_backoff(
        &self,
        id: Uuid,
        attempt: i32,
        error: &str,
        run_at: DateTime<Utc>,
    ) -> Result<()> {
        QueueJob::requeue_with_backoff(id, attempt, error, run_at, &self.pool).await
    }

    async fn mark_sent(&self, id: Uuid, sent_at: DateTime<Utc>) -> Result<()> {
        QueueJob::mark_sent(id, sent_at, &self.pool).await
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()> {
        QueueJob::mark_failed(id, error, &self.pool).await
    }

    async fn cancel_job(&self, id: Uuid) -> Result<CancelOutcome> {
        if QueueJob::cancel(id, &self.pool).await? {
            return Ok(CancelOutcome::Cancelled);
        }

        match QueueJob::find_by_id(id, &self.pool).await? {
            Some(_) => Ok(CancelOutcome::Conflict),
            None => Ok(CancelOutcome::NotFound),
        }
    }

    async fn list_jobs(
        &self,
        filter: &JobFilter,
        page: PageRequest,
    ) -> Result<PagedResult<QueueJob>> {
        QueueJob::list(filter, page, &self.pool).await
    }

    async fn queue_stats(&self, now: DateTime<Utc>) -> Result<QueueStats> {
        QueueStats::collect(now, &self.pool).await
    }

    async fn purge_terminal_jobs(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        QueueJob::purge_terminal_before(cutoff, &self.pool).await
    }

    async fn get_template(&self, id: Uuid) -> Result<Option<EmailTemplate>> {
        EmailTemplate::find_by_id(id, &self.pool).await
    }

    async fn create_template(&self, template: EmailTemplate) -> Result<()> {
        template.insert(&self.pool).await
    }

    async fn update_template(&self, id: Uuid, update: TemplateUpdate) -> Result<EmailTemplate> {
        EmailTemplate::apply_update(id, &update, &self.pool).await
    }

    async fn deactivate_template(&self, id: Uuid) -> Result<bool> {
        EmailTemplate::deactivate(id, &self.pool).await
    }

    async fn delete_template(&self, id: Uuid) -> Result<()> {
        EmailTemplate::delete(id, &self.pool).await
    }

    async fn insert_schedule(&self, schedule: ScheduledEmail) -> Result<()> {
        schedule.insert(&self.pool).await
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<ScheduledEmail>> {
        ScheduledEmail::find_by_id(id, &self.pool).await
    }

    async fn due_schedules(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduledEmail>> {
        ScheduledEmail::find_due(now, limit, &self.pool).await
    }

    async fn complete_schedule_run(
        &self,
        updated: &ScheduledEmail,
        prev_execution_count: i32,
        job: QueueJob,
    ) -> Result<Option<Uuid>> {
        let mut tx = self.pool.begin().await?;

        if !updated.apply_run(prev_execution_count, &mut tx).await? {
            tx.rollback().await?;
            return Ok(None);
        }

        let job_id = job.id;
        job.insert(&mut *tx).await?;
        tx.commit().await?;

        Ok(Some(job_id))
    }

    async fn deactivate_schedule(&self, id: Uuid) -> Result<bool> {
        ScheduledEmail::deactivate(id, &self.pool).await
    }

    async fn append_history(&self, entry: EmailHistory) -> Result<()> {
        entry.insert(&self.pool).await
    }

    async fn history_for_job(&self, queue_id: Uuid) -> Result<Vec<EmailHistory>> {
        EmailHistory::find_by_queue_id(queue_id, &self.pool).await
    }

    async fn archive_history_before(
        &self,
        cutoff: DateTime<Utc>,
        archived_at: DateTime<Utc>,
    ) -> Result<u64> {
        EmailHistory::archive_before(cutoff, archived_at, &self.pool).await
    }

    async fn append_log(&self, entry: ProcessingLog) -> Result<()> {
        entry.insert(&self.pool).await
    }

    async fn upsert_service_status(&self, status: ServiceStatus) -> Result<()> {
        status.upsert(&self.pool).await
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn count_jobs(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM email_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
