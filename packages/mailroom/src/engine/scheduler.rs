//! Scheduler loop: promotes due scheduled-email plans into queue jobs.
//!
//! Each tick claims active plans whose `next_run_time` has passed, builds a
//! queue job from the plan, advances or retires the plan, and commits both
//! in one store transaction. The optimistic guard on the plan's execution
//! count makes each occurrence fire exactly once across concurrent
//! schedulers.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::service::Service;
use crate::store::{QueueJob, ScheduledEmail, Store};

const DUE_BATCH: i64 = 100;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    wake: Arc<Notify>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, wake: Arc<Notify>, config: SchedulerConfig) -> Self {
        Self {
            store,
            wake,
            config,
        }
    }

    /// Fire every due plan once. Returns how many jobs were created.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.store.due_schedules(now, DUE_BATCH).await?;
        if due.is_empty() {
            return Ok(0);
        }

        let mut fired = 0;
        for schedule in due {
            match self.fire_one(&schedule, now).await {
                Ok(true) => fired += 1,
                Ok(false) => {
                    debug!(schedule_id = %schedule.id, "occurrence already fired elsewhere");
                }
                Err(e) => {
                    error!(schedule_id = %schedule.id, error = %e, "failed to fire schedule");
                }
            }
        }

        if fired > 0 {
            info!(count = fired, "promoted scheduled emails to the queue");
            self.wake.notify_one();
        }

        Ok(fired)
    }

    async fn fire_one(&self, schedule: &ScheduledEmail, now: DateTime<Utc>) -> Result<bool> {
        let job = build_job(schedule, now);
        let updated = advance_schedule(schedule, now)?;

        let result = self
            .store
            .complete_schedule_run(&updated, schedule.execution_count, job)
            .await?;

        Ok(result.is_some())
    }
}

/// Build the queue job one occurrence produces.
pub fn build_job(schedule: &ScheduledEmail, now: DateTime<Utc>) -> QueueJob {
    let mut job = QueueJob::builder()
        .to_addresses(schedule.to_addresses.clone())
        .subject(schedule.subject.clone())
        .body(schedule.body.clone())
        .is_html(schedule.is_html)
        .priority(schedule.priority)
        .created_by(format!("schedule:{}", schedule.name))
        .request_source("scheduler".to_string())
        .build();

    job.cc_addresses = schedule.cc_addresses.clone();
    job.bcc_addresses = schedule.bcc_addresses.clone();
    job.template_id = schedule.template_id;
    job.template_data = schedule.template_data.clone();
    job.requires_template_processing = schedule.template_id.is_some();
    job.created_at = now;
    job.updated_at = now;

    job
}

/// Compute the plan's post-run state: bumped counters, next occurrence, and
/// deactivation when the plan is exhausted.
pub fn advance_schedule(schedule: &ScheduledEmail, now: DateTime<Utc>) -> Result<ScheduledEmail> {
    let mut updated = schedule.clone();
    updated.execution_count += 1;
    updated.last_executed_at = Some(now);
    updated.last_execution_status = Some("queued".to_string());
    updated.updated_at = now;

    updated.next_run_time = if updated.is_recurring {
        next_occurrence(&updated, now)?
    } else {
        None
    };

    let exhausted = !updated.is_recurring
        || updated
            .max_executions
            .map_or(false, |max| updated.execution_count >= max)
        || match (updated.next_run_time, updated.end_date) {
            (Some(next), Some(end)) => next > end,
            (None, _) => true,
            _ => false,
        };
    if exhausted {
        updated.is_active = false;
    }

    Ok(updated)
}

/// Next occurrence after `after`, from the cron expression or the fixed
/// interval. Cron is 5-field UTC; a seconds field is accepted as-is.
pub fn next_occurrence(
    schedule: &ScheduledEmail,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    if let Some(expr) = &schedule.cron_expression {
        let parsed = cron::Schedule::from_str(&normalize_cron(expr))
            .with_context(|| format!("invalid cron expression '{expr}'"))?;
        return Ok(parsed.after(&after).next());
    }

    if let Some(minutes) = schedule.interval_minutes {
        return Ok(Some(after + chrono::Duration::minutes(minutes.max(1) as i64)));
    }

    Ok(None)
}

/// First occurrence for a newly created plan without an explicit
/// `next_run_time`.
pub fn initial_next_run_time(
    schedule: &ScheduledEmail,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    if schedule.cron_expression.is_some() {
        let after = schedule.start_date.max(now);
        return next_occurrence(schedule, after);
    }
    Ok(Some(schedule.start_date))
}

fn normalize_cron(expr: &str) -> String {
    // The cron crate wants a seconds field; standard 5-field input gets one.
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

#[async_trait]
impl Service for Scheduler {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(
            tick_sec = self.config.tick_interval.as_secs(),
            "scheduler starting"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.tick_interval) => {}
            }

            if let Err(e) = self.tick(Utc::now()).await {
                error!(error = %e, "scheduler tick failed");
            }
        }

        info!("scheduler stopped");
        Ok(())
    }
}
