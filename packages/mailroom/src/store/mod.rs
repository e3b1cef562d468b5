//! Durable store for queue items, templates, schedules, history, and
//! instance heartbeats.
//!
//! All persistent state is owned here; the engine loops only touch it
//! through the [`Store`] trait. Two implementations exist:
//! - [`PostgresStore`]: production, inline SQL, `FOR UPDATE SKIP LOCKED`
//!   claims, transactional schedule firing.
//! - [`MemoryStore`]: same semantics in memory, used by the integration
//!   tests to exercise every engine loop without a database.

mod history;
mod job;
mod log;
mod memory;
mod postgres;
mod schedule;
mod status;
mod template;

pub use history::EmailHistory;
pub use job::{JobFilter, JobPriority, JobStatus, QueueJob, QueueStats};
pub use log::{LogLevel, ProcessingLog};
pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use schedule::ScheduledEmail;
pub use status::{HealthLevel, ServiceStatus};
pub use template::{EmailTemplate, TemplateUpdate};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::common::pagination::{PageRequest, PagedResult};

/// Result of an idempotent job insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new row was written.
    Inserted(Uuid),
    /// A row with this id already existed; nothing was written.
    Duplicate(Uuid),
}

impl InsertOutcome {
    pub fn job_id(&self) -> Uuid {
        match self {
            InsertOutcome::Inserted(id) | InsertOutcome::Duplicate(id) => *id,
        }
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self, InsertOutcome::Inserted(_))
    }
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// The job is leased or already terminal.
    Conflict,
    NotFound,
}

/// Thread-safe repository over all persistent entities.
#[async_trait]
pub trait Store: Send + Sync {
    // ------------------------------------------------------------------
    // Queue jobs
    // ------------------------------------------------------------------

    /// Insert a job; duplicate ids are idempotent no-ops.
    async fn insert_job(&self, job: QueueJob) -> Result<InsertOutcome>;

    async fn get_job(&self, id: Uuid) -> Result<Option<QueueJob>>;

    /// Atomically claim up to `batch_size` ready jobs for `worker_id`,
    /// ordered by priority DESC, created_at ASC.
    async fn claim_batch(
        &self,
        now: DateTime<Utc>,
        batch_size: i64,
        worker_id: &str,
    ) -> Result<Vec<QueueJob>>;

    /// Return leases older than `stale_after` to the queue, incrementing
    /// each job's retry counter.
    async fn reclaim_stale(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<Vec<QueueJob>>;

    /// Requeue a leased job for a delayed retry attempt.
    async fn requeue_with_backoff(
        &self,
        id: Uuid,
        attempt: i32,
        error: &str,
        run_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn mark_sent(&self, id: Uuid, sent_at: DateTime<Utc>) -> Result<()>;

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()>;

    /// Cancel a queued job; leased and terminal jobs conflict.
    async fn cancel_job(&self, id: Uuid) -> Result<CancelOutcome>;

    async fn list_jobs(
        &self,
        filter: &JobFilter,
        page: PageRequest,
    ) -> Result<PagedResult<QueueJob>>;

    async fn queue_stats(&self, now: DateTime<Utc>) -> Result<QueueStats>;

    /// Delete terminal queue rows older than the cutoff whose history exists.
    async fn purge_terminal_jobs(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    // ------------------------------------------------------------------
    // Templates
    // ------------------------------------------------------------------

    async fn get_template(&self, id: Uuid) -> Result<Option<EmailTemplate>>;

    async fn create_template(&self, template: EmailTemplate) -> Result<()>;

    /// Apply an edit; the stored version is bumped.
    async fn update_template(&self, id: Uuid, update: TemplateUpdate) -> Result<EmailTemplate>;

    async fn deactivate_template(&self, id: Uuid) -> Result<bool>;

    /// Delete a template; refused for system templates.
    async fn delete_template(&self, id: Uuid) -> Result<()>;

    // ------------------------------------------------------------------
    // Scheduled emails
    // ------------------------------------------------------------------

    async fn insert_schedule(&self, schedule: ScheduledEmail) -> Result<()>;

    async fn get_schedule(&self, id: Uuid) -> Result<Option<ScheduledEmail>>;

    /// Active plans with `next_run_time <= now`.
    async fn due_schedules(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduledEmail>>;

    /// Atomically persist a fired occurrence: the schedule mutation and the
    /// new queue job commit together. Guarded on the execution count seen at
    /// claim time; returns `None` when another scheduler won the race.
    async fn complete_schedule_run(
        &self,
        updated: &ScheduledEmail,
        prev_execution_count: i32,
        job: QueueJob,
    ) -> Result<Option<Uuid>>;

    async fn deactivate_schedule(&self, id: Uuid) -> Result<bool>;

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    async fn append_history(&self, entry: EmailHistory) -> Result<()>;

    async fn history_for_job(&self, queue_id: Uuid) -> Result<Vec<EmailHistory>>;

    async fn archive_history_before(
        &self,
        cutoff: DateTime<Utc>,
        archived_at: DateTime<Utc>,
    ) -> Result<u64>;

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    async fn append_log(&self, entry: ProcessingLog) -> Result<()>;

    async fn upsert_service_status(&self, status: ServiceStatus) -> Result<()>;

    /// Cheap connectivity check for the health probe.
    async fn ping(&self) -> Result<()>;

    /// Counting query paired with `ping` in the store probe.
    async fn count_jobs(&self) -> Result<i64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_outcome_helpers() {
        let id = Uuid::now_v7();
        assert!(InsertOutcome::Inserted(id).is_inserted());
        assert!(!InsertOutcome::Duplicate(id).is_inserted());
        assert_eq!(InsertOutcome::Duplicate(id).job_id(), id);
    }
}
