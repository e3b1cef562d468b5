//! Scheduled maintenance tasks using tokio-cron-scheduler.
//!
//! Two cron-driven jobs run alongside the engine loops:
//! - daily purge of terminal queue rows past the retention window whose
//!   history row exists,
//! - monthly `archived_at` stamping of old history rows.
//!
//! Archived history stays queryable through the same store interface.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::store::Store;

/// History rows older than this many days get `archived_at` stamped.
const ARCHIVE_AFTER_DAYS: i64 = 90;

/// Start the maintenance scheduler. The returned handle is shut down by the
/// daemon after the service host drains.
pub async fn start_archiver(store: Arc<dyn Store>, retention_days: i64) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    // Daily purge at 03:15 UTC.
    let purge_store = Arc::clone(&store);
    let purge_job = Job::new_async("0 15 3 * * *", move |_uuid, _lock| {
        let store = Arc::clone(&purge_store);
        Box::pin(async move {
            if let Err(e) = run_daily_purge(store.as_ref(), retention_days).await {
                error!(error = %e, "daily purge failed");
            }
        })
    })?;
    scheduler.add(purge_job).await?;

    // Monthly archive pass on the 1st at 04:30 UTC.
    let archive_store = Arc::clone(&store);
    let archive_job = Job::new_async("0 30 4 1 * *", move |_uuid, _lock| {
        let store = Arc::clone(&archive_store);
        Box::pin(async move {
            if let Err(e) = run_monthly_archive(store.as_ref()).await {
                error!(error = %e, "monthly archive failed");
            }
        })
    })?;
    scheduler.add(archive_job).await?;

    scheduler.start().await?;
    info!(
        retention_days,
        "maintenance tasks started (daily purge, monthly archive)"
    );

    Ok(scheduler)
}

/// Remove terminal queue rows older than the retention window. History is
/// the audit record; rows without a history entry are kept.
pub async fn run_daily_purge(store: &dyn Store, retention_days: i64) -> Result<u64> {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days);
    let purged = store.purge_terminal_jobs(cutoff).await?;

    if purged > 0 {
        info!(purged, "purged terminal queue rows past retention");
    }

    Ok(purged)
}

/// Stamp `archived_at` on history rows older than the archive window.
pub async fn run_monthly_archive(store: &dyn Store) -> Result<u64> {
    let now = Utc::now();
    let cutoff = now - chrono::Duration::days(ARCHIVE_AFTER_DAYS);
    let archived = store.archive_history_before(cutoff, now).await?;

    if archived > 0 {
        info!(archived, "stamped old history rows as archived");
    }

    Ok(archived)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        EmailHistory, JobStatus, MemoryStore, QueueJob,
    };

    fn terminal_job(age_days: i64) -> QueueJob {
        let mut job = QueueJob::builder()
            .to_addresses("a@example.com")
            .subject("s")
            .body("b")
            .build();
        job.status = JobStatus::Sent;
        job.updated_at = Utc::now() - chrono::Duration::days(age_days);
        job
    }

    #[tokio::test]
    async fn purge_removes_only_old_terminal_rows_with_history() {
        let store = MemoryStore::new();

        let old = terminal_job(10);
        let old_id = old.id;
        let recent = terminal_job(1);
        let no_history = terminal_job(10);

        store.insert_job(old.clone()).await.unwrap();
        store.insert_job(recent).await.unwrap();
        store.insert_job(no_history.clone()).await.unwrap();
        store
            .append_history(EmailHistory::for_sent(
                &old,
                "s".into(),
                "b".into(),
                Utc::now(),
                0,
                "worker-test",
            ))
            .await
            .unwrap();

        let purged = run_daily_purge(&store, 7).await.unwrap();
        assert_eq!(purged, 1);
        assert!(store.get_job(old_id).await.unwrap().is_none());
        assert!(store.get_job(no_history.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn archive_stamps_old_history_once() {
        let store = MemoryStore::new();
        let job = terminal_job(0);

        let mut old_row =
            EmailHistory::for_sent(&job, "s".into(), "b".into(), Utc::now(), 0, "w");
        old_row.created_at = Utc::now() - chrono::Duration::days(120);
        let fresh_row = EmailHistory::for_sent(&job, "s".into(), "b".into(), Utc::now(), 0, "w");

        store.append_history(old_row).await.unwrap();
        store.append_history(fresh_row).await.unwrap();

        assert_eq!(run_monthly_archive(&store).await.unwrap(), 1);
        // Second pass finds nothing new.
        assert_eq!(run_monthly_archive(&store).await.unwrap(), 0);

        let archived: Vec<_> = store
            .history()
            .into_iter()
            .filter(|h| h.archived_at.is_some())
            .collect();
        assert_eq!(archived.len(), 1);
    }
}
