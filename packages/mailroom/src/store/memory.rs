//! In-memory store with the same semantics as the PostgreSQL implementation.
//!
//! Backs the integration tests so the full engine (dispatcher, workers,
//! scheduler, monitors) can run without a database. State lives behind a
//! single mutex; every operation is a short critical section.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use super::{
    CancelOutcome, EmailHistory, EmailTemplate, InsertOutcome, JobFilter, JobStatus,
    ProcessingLog, QueueJob, QueueStats, ScheduledEmail, ServiceStatus, Store, TemplateUpdate,
};
use crate::common::pagination::{PageRequest, PagedResult};

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, QueueJob>,
    templates: HashMap<Uuid, EmailTemplate>,
    schedules: HashMap<Uuid, ScheduledEmail>,
    history: Vec<EmailHistory>,
    logs: Vec<ProcessingLog>,
    statuses: HashMap<(String, String), ServiceStatus>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of all queue jobs, for test assertions.
    pub fn jobs(&self) -> Vec<QueueJob> {
        self.lock().jobs.values().cloned().collect()
    }

    /// Snapshot of the history table, for test assertions.
    pub fn history(&self) -> Vec<EmailHistory> {
        self.lock().history.clone()
    }

    /// Snapshot of the processing log, for test assertions.
    pub fn logs(&self) -> Vec<ProcessingLog> {
        self.lock().logs.clone()
    }

    /// Snapshot of heartbeat rows, for test assertions.
    pub fn service_statuses(&self) -> Vec<ServiceStatus> {
        self.lock().statuses.values().cloned().collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_job(&self, job: QueueJob) -> Result<InsertOutcome> {
        let mut inner = self.lock();
        let id = job.id;
        if inner.jobs.contains_key(&id) {
            return Ok(InsertOutcome::Duplicate(id));
        }
        inner.jobs.insert(id, job);
        Ok(InsertOutcome::Inserted(id))
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<QueueJob>> {
        Ok(self.lock().jobs.get(&id).cloned())
    }

    async fn claim_batch(
        &self,
        now: DateTime<Utc>,
        batch_size: i64,
        worker_id: &str,
    ) -> Result<Vec<QueueJob>> {
        let mut inner = self.lock();

        let mut ready: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|j| j.is_ready(now))
            .map(|j| j.id)
            .collect();

        ready.sort_by(|a, b| {
            let ja = &inner.jobs[a];
            let jb = &inner.jobs[b];
            jb.priority
                .cmp(&ja.priority)
                .then_with(|| ja.created_at.cmp(&jb.created_at))
        });
        ready.truncate(batch_size.max(0) as usize);

        let mut claimed = Vec::with_capacity(ready.len());
        for id in ready {
            if let Some(job) = inner.jobs.get_mut(&id) {
                job.status = JobStatus::Processing;
                job.processed_by = Some(worker_id.to_string());
                job.processing_started_at = Some(now);
                job.updated_at = now;
                claimed.push(job.clone());
            }
        }

        Ok(claimed)
    }

    async fn reclaim_stale(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<Vec<QueueJob>> {
        let cutoff = now - chrono::Duration::from_std(stale_after)?;
        let mut inner = self.lock();

        let mut reclaimed = Vec::new();
        for job in inner.jobs.values_mut() {
            let stale = job.status == JobStatus::Processing
                && job.processing_started_at.map_or(false, |t| t < cutoff);
            if stale {
                job.status = JobStatus::Queued;
                job.retry_count += 1;
                job.processed_by = None;
                job.processing_started_at = None;
                job.updated_at = now;
                reclaimed.push(job.clone());
            }
        }

        Ok(reclaimed)
    }

    async fn requeue_with_backoff(
        &self,
        id: Uuid,
        attempt: i32,
        error: &str,
        run_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.lock();
        if let Some(job) = inner.jobs.get_mut(&id) {
            if job.status == JobStatus::Processing {
                job.status = JobStatus::Queued;
                job.retry_count = attempt;
                job.last_error = Some(error.to_string());
                job.scheduled_for = Some(run_at);
                job.is_scheduled = true;
                job.processed_by = None;
                job.processing_started_at = None;
                job.processed_at = Some(Utc::now());
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn mark_sent(&self, id: Uuid, sent_at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock();
        if let Some(job) = inner.jobs.get_mut(&id) {
            if job.status == JobStatus::Processing {
                job.status = JobStatus::Sent;
                job.sent_at = Some(sent_at);
                job.processed_at = Some(sent_at);
                job.updated_at = sent_at;
            }
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()> {
        let mut inner = self.lock();
        if let Some(job) = inner.jobs.get_mut(&id) {
            if job.status == JobStatus::Processing {
                job.status = JobStatus::Failed;
                job.last_error = Some(error.to_string());
                job.processed_at = Some(Utc::now());
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn cancel_job(&self, id: Uuid) -> Result<CancelOutcome> {
        let mut inner = self.lock();
        match inner.jobs.get_mut(&id) {
            None => Ok(CancelOutcome::NotFound),
            Some(job) if job.status == JobStatus::Queued => {
                job.status = JobStatus::Cancelled;
                job.updated_at = Utc::now();
                Ok(CancelOutcome::Cancelled)
            }
            Some(_) => Ok(CancelOutcome::Conflict),
        }
    }

    async fn list_jobs(
        &self,
        filter: &JobFilter,
        page: PageRequest,
    ) -> Result<PagedResult<QueueJob>> {
        let inner = self.lock();

        let mut matched: Vec<QueueJob> = inner
            .jobs
            .values()
            .filter(|j| filter.status.map_or(true, |s| j.status == s))
            .filter(|j| filter.priority.map_or(true, |p| j.priority == p))
            .filter(|j| {
                filter
                    .recipient_contains
                    .as_ref()
                    .map_or(true, |needle| {
                        j.to_addresses
                            .to_lowercase()
                            .contains(&needle.to_lowercase())
                    })
            })
            .filter(|j| filter.created_after.map_or(true, |t| j.created_at >= t))
            .filter(|j| filter.created_before.map_or(true, |t| j.created_at < t))
            .cloned()
            .collect();

        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matched.len() as i64;
        let items: Vec<QueueJob> = matched
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.page_size as usize)
            .collect();

        Ok(PagedResult::new(items, page, total))
    }

    async fn queue_stats(&self, now: DateTime<Utc>) -> Result<QueueStats> {
        let inner = self.lock();
        let mut stats = QueueStats::default();
        let mut oldest_ready: Option<DateTime<Utc>> = None;
        let mut processing_minutes = Vec::new();

        for job in inner.jobs.values() {
            match job.status {
                JobStatus::Queued => {
                    stats.queued += 1;
                    if job.is_ready(now) {
                        oldest_ready = Some(match oldest_ready {
                            Some(existing) => existing.min(job.created_at),
                            None => job.created_at,
                        });
                    } else {
                        stats.scheduled += 1;
                    }
                }
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Sent => stats.sent += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }

            if let (Some(started), Some(finished)) =
                (job.processing_started_at, job.processed_at)
            {
                if finished > now - chrono::Duration::hours(24) {
                    processing_minutes
                        .push((finished - started).num_milliseconds() as f64 / 60_000.0);
                }
            }
        }

        stats.oldest_queued_minutes =
            oldest_ready.map(|t| (now - t).num_milliseconds() as f64 / 60_000.0);
        if !processing_minutes.is_empty() {
            stats.avg_processing_minutes =
                Some(processing_minutes.iter().sum::<f64>() / processing_minutes.len() as f64);
        }

        Ok(stats)
    }

    async fn purge_terminal_jobs(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock();
        let with_history: std::collections::HashSet<Uuid> =
            inner.history.iter().map(|h| h.queue_id).collect();

        let doomed: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|j| j.status.is_terminal() && j.updated_at < cutoff)
            .filter(|j| j.status == JobStatus::Cancelled || with_history.contains(&j.id))
            .map(|j| j.id)
            .collect();

        for id in &doomed {
            inner.jobs.remove(id);
        }

        Ok(doomed.len() as u64)
    }

    async fn get_template(&self, id: Uuid) -> Result<Option<EmailTemplate>> {
        Ok(self.lock().templates.get(&id).cloned())
    }

    async fn create_template(&self, template: EmailTemplate) -> Result<()> {
        self.lock().templates.insert(template.id, template);
        Ok(())
    }

    async fn update_template(&self, id: Uuid, update: TemplateUpdate) -> Result<EmailTemplate> {
        let mut inner = self.lock();
        let template = match inner.templates.get_mut(&id) {
            Some(t) => t,
            None => bail!("template {id} not found"),
        };

        if let Some(subject) = update.subject_template {
            template.subject_template = subject;
        }
        if let Some(body) = update.body_template {
            template.body_template = body;
        }
        if let Some(category) = update.category {
            template.category = Some(category);
        }
        template.version += 1;
        template.updated_at = Utc::now();

        Ok(template.clone())
    }

    async fn deactivate_template(&self, id: Uuid) -> Result<bool> {
        let mut inner = self.lock();
        match inner.templates.get_mut(&id) {
            Some(t) if t.is_active => {
                t.is_active = false;
                t.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_template(&self, id: Uuid) -> Result<()> {
        let mut inner = self.lock();
        match inner.templates.get(&id) {
            None => bail!("template {id} not found"),
            Some(t) if t.is_system => {
                bail!("template {id} is a system template and cannot be deleted")
            }
            Some(_) => {
                inner.templates.remove(&id);
                Ok(())
            }
        }
    }

    async fn insert_schedule(&self, schedule: ScheduledEmail) -> Result<()> {
        self.lock().schedules.insert(schedule.id, schedule);
        Ok(())
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<ScheduledEmail>> {
        Ok(self.lock().schedules.get(&id).cloned())
    }

    async fn due_schedules(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduledEmail>> {
        let inner = self.lock();
        let mut due: Vec<ScheduledEmail> = inner
            .schedules
            .values()
            .filter(|s| s.is_active && s.start_date <= now)
            .filter(|s| s.next_run_time.map_or(false, |t| t <= now))
            .cloned()
            .collect();

        due.sort_by_key(|s| s.next_run_time);
        due.truncate(limit.max(0) as usize);

        Ok(due)
    }

    async fn complete_schedule_run(
        &self,
        updated: &ScheduledEmail,
        prev_execution_count: i32,
        job: QueueJob,
    ) -> Result<Option<Uuid>> {
        let mut inner = self.lock();

        let lost_race = match inner.schedules.get(&updated.id) {
            Some(current) => current.execution_count != prev_execution_count,
            None => true,
        };
        if lost_race {
            return Ok(None);
        }

        inner.schedules.insert(updated.id, updated.clone());
        let job_id = job.id;
        inner.jobs.insert(job_id, job);

        Ok(Some(job_id))
    }

    async fn deactivate_schedule(&self, id: Uuid) -> Result<bool> {
        let mut inner = self.lock();
        match inner.schedules.get_mut(&id) {
            Some(s) if s.is_active => {
                s.is_active = false;
                s.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn append_history(&self, entry: EmailHistory) -> Result<()> {
        self.lock().history.push(entry);
        Ok(())
    }

    async fn history_for_job(&self, queue_id: Uuid) -> Result<Vec<EmailHistory>> {
        let mut rows: Vec<EmailHistory> = self
            .lock()
            .history
            .iter()
            .filter(|h| h.queue_id == queue_id)
            .cloned()
            .collect();
        rows.sort_by_key(|h| h.created_at);
        Ok(rows)
    }

    async fn archive_history_before(
        &self,
        cutoff: DateTime<Utc>,
        archived_at: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.lock();
        let mut stamped = 0;
        for entry in inner.history.iter_mut() {
            if entry.created_at < cutoff && entry.archived_at.is_none() {
                entry.archived_at = Some(archived_at);
                stamped += 1;
            }
        }
        Ok(stamped)
    }

    async fn append_log(&self, entry: ProcessingLog) -> Result<()> {
        self.lock().logs.push(entry);
        Ok(())
    }

    async fn upsert_service_status(&self, status: ServiceStatus) -> Result<()> {
        let key = (status.service_name.clone(), status.machine_name.clone());
        self.lock().statuses.insert(key, status);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn count_jobs(&self) -> Result<i64> {
        Ok(self.lock().jobs.len() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JobPriority;

    fn job(priority: JobPriority, created_offset_ms: i64) -> QueueJob {
        let mut j = QueueJob::builder()
            .to_addresses("a@example.com")
            .subject("s")
            .body("b")
            .priority(priority)
            .build();
        j.created_at = Utc::now() - chrono::Duration::milliseconds(1000 - created_offset_ms);
        j
    }

    #[tokio::test]
    async fn duplicate_insert_is_a_no_op() {
        let store = MemoryStore::new();
        let j = job(JobPriority::Normal, 0);
        let first = store.insert_job(j.clone()).await.unwrap();
        let second = store.insert_job(j).await.unwrap();
        assert!(first.is_inserted());
        assert!(!second.is_inserted());
        assert_eq!(store.jobs().len(), 1);
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_age() {
        let store = MemoryStore::new();
        store.insert_job(job(JobPriority::Normal, 0)).await.unwrap();
        store.insert_job(job(JobPriority::Normal, 10)).await.unwrap();
        store.insert_job(job(JobPriority::Critical, 20)).await.unwrap();

        let claimed = store.claim_batch(Utc::now(), 10, "w1").await.unwrap();
        assert_eq!(claimed.len(), 3);
        assert_eq!(claimed[0].priority, JobPriority::Critical);
        assert!(claimed[1].created_at <= claimed[2].created_at);
        for j in &claimed {
            assert_eq!(j.status, JobStatus::Processing);
            assert_eq!(j.processed_by.as_deref(), Some("w1"));
        }
    }

    #[tokio::test]
    async fn claimed_jobs_are_not_reclaimed_while_fresh() {
        let store = MemoryStore::new();
        store.insert_job(job(JobPriority::Normal, 0)).await.unwrap();
        store.claim_batch(Utc::now(), 1, "w1").await.unwrap();

        let reclaimed = store
            .reclaim_stale(Utc::now(), Duration::from_secs(600))
            .await
            .unwrap();
        assert!(reclaimed.is_empty());
    }

    #[tokio::test]
    async fn stale_lease_returns_to_queue_with_bumped_retry() {
        let store = MemoryStore::new();
        store.insert_job(job(JobPriority::Normal, 0)).await.unwrap();
        let claimed = store.claim_batch(Utc::now(), 1, "w1").await.unwrap();
        let id = claimed[0].id;

        let later = Utc::now() + chrono::Duration::seconds(700);
        let reclaimed = store
            .reclaim_stale(later, Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, id);
        assert_eq!(reclaimed[0].status, JobStatus::Queued);
        assert_eq!(reclaimed[0].retry_count, 1);
        assert!(reclaimed[0].processed_by.is_none());
    }

    #[tokio::test]
    async fn cancel_conflicts_once_leased() {
        let store = MemoryStore::new();
        let j = job(JobPriority::Normal, 0);
        let id = j.id;
        store.insert_job(j).await.unwrap();
        store.claim_batch(Utc::now(), 1, "w1").await.unwrap();

        assert_eq!(store.cancel_job(id).await.unwrap(), CancelOutcome::Conflict);
        assert_eq!(
            store.cancel_job(Uuid::now_v7()).await.unwrap(),
            CancelOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn schedule_race_loses_cleanly() {
        let store = MemoryStore::new();
        let schedule = ScheduledEmail::builder()
            .name("digest")
            .to_addresses("a@example.com")
            .subject("s")
            .body("b")
            .next_run_time(Utc::now())
            .build();
        store.insert_schedule(schedule.clone()).await.unwrap();

        let mut fired = schedule.clone();
        fired.execution_count = 1;
        fired.is_active = false;

        let won = store
            .complete_schedule_run(&fired, 0, job(JobPriority::Normal, 0))
            .await
            .unwrap();
        assert!(won.is_some());

        // Second scheduler saw execution_count 0 but the row moved on.
        let lost = store
            .complete_schedule_run(&fired, 0, job(JobPriority::Normal, 0))
            .await
            .unwrap();
        assert!(lost.is_none());
    }
}
