//! Job execution pipeline: compose → send → record.
//!
//! Every claimed job ends in exactly one store transition per attempt. No
//! error escapes [`JobWorker::execute`]; store failures leave the lease in
//! place so stale-lease reclaim can recover the job.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::common::backoff::{backoff_delay, with_jitter};
use crate::config::Config;
use crate::email::{
    assemble_message, specs_from_json, AttachmentProcessor, EmailContent, SendOutcome,
    SmtpSender, TemplateEngine, TemplateError,
};
use crate::monitor::MetricsCollector;
use crate::store::{
    EmailHistory, JobStatus, LogLevel, ProcessingLog, QueueJob, Store,
};

/// Per-process execution settings shared by all workers.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub worker_id: String,
    pub machine_name: String,
    pub from_address: String,
    pub max_retries: i32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub job_timeout: Duration,
    pub render_timeout: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &Config, machine_name: &str) -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            machine_name: machine_name.to_string(),
            from_address: config.smtp.from_address.clone(),
            max_retries: config.max_retries,
            retry_base: config.retry_base,
            retry_max: config.retry_max,
            job_timeout: config.job_timeout,
            render_timeout: Duration::from_secs(1),
        }
    }
}

/// What one execution attempt produced, before it is recorded.
enum AttemptOutcome {
    Sent {
        subject: String,
        body: String,
        attachment_count: i32,
    },
    Retry(String),
    Permanent(String),
    /// The store itself failed mid-attempt; leave the lease for reclaim.
    StoreError(anyhow::Error),
}

pub struct JobWorker {
    store: Arc<dyn Store>,
    smtp: Arc<dyn SmtpSender>,
    templates: Arc<TemplateEngine>,
    attachments: AttachmentProcessor,
    metrics: Arc<MetricsCollector>,
    settings: WorkerSettings,
}

impl JobWorker {
    pub fn new(
        store: Arc<dyn Store>,
        smtp: Arc<dyn SmtpSender>,
        templates: Arc<TemplateEngine>,
        attachments: AttachmentProcessor,
        metrics: Arc<MetricsCollector>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            smtp,
            templates,
            attachments,
            metrics,
            settings,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.settings.worker_id
    }

    /// Process one claimed job to its next state transition.
    pub async fn execute(&self, job: QueueJob) {
        let started = Instant::now();
        let job_id = job.id;

        debug!(job_id = %job_id, priority = ?job.priority, attempt = job.retry_count + 1, "executing job");
        self.log(&job, LogLevel::Info, "start", "processing started", None)
            .await;

        let outcome = match tokio::time::timeout(
            self.settings.job_timeout,
            self.attempt(&job),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => AttemptOutcome::Retry(format!(
                "job exceeded wall clock of {}s",
                self.settings.job_timeout.as_secs()
            )),
        };

        let duration = started.elapsed();
        match outcome {
            AttemptOutcome::Sent {
                subject,
                body,
                attachment_count,
            } => {
                let sent_at = Utc::now();
                if let Err(e) = self.store.mark_sent(job_id, sent_at).await {
                    // Leave Processing; reclaim will retry the whole attempt.
                    error!(job_id = %job_id, error = %e, "failed to mark job as sent");
                    return;
                }

                let history = EmailHistory::for_sent(
                    &job,
                    subject,
                    body,
                    sent_at,
                    attachment_count,
                    &self.settings.worker_id,
                );
                self.append_history(history).await;

                self.metrics
                    .record_email_sent(duration, job.priority, job.template_id);
                self.log(&job, LogLevel::Info, "sent", "delivered via smtp", None)
                    .await;
                info!(job_id = %job_id, duration_ms = duration.as_millis() as u64, "email sent");
            }
            AttemptOutcome::Retry(reason) => {
                self.on_retry(&job, &reason, duration).await;
            }
            AttemptOutcome::Permanent(reason) => {
                self.fail_permanently(&job, &reason, duration).await;
            }
            AttemptOutcome::StoreError(e) => {
                error!(job_id = %job_id, error = %e, "store error during execution, leaving lease for reclaim");
            }
        }
    }

    /// Compose and send; never touches the job's final state.
    async fn attempt(&self, job: &QueueJob) -> AttemptOutcome {
        // Render.
        let (subject, body) = if job.requires_template_processing {
            let template_id = match job.template_id {
                Some(id) => id,
                None => {
                    return AttemptOutcome::Permanent(
                        "template processing requested without a template id".to_string(),
                    )
                }
            };
            let data: HashMap<String, String> = match &job.template_data {
                Some(value) => match serde_json::from_value(value.clone()) {
                    Ok(data) => data,
                    Err(e) => {
                        return AttemptOutcome::Permanent(format!(
                            "invalid template data: {e}"
                        ))
                    }
                },
                None => HashMap::new(),
            };

            let render = tokio::time::timeout(
                self.settings.render_timeout,
                self.templates.render(template_id, &data),
            );
            match render.await {
                Ok(Ok(rendered)) => {
                    self.metrics.record_template_processed();
                    (rendered.subject, rendered.body)
                }
                Ok(Err(TemplateError::NotFound(id))) => {
                    return AttemptOutcome::Permanent(format!("template {id} not found"))
                }
                Ok(Err(TemplateError::Inactive(id))) => {
                    return AttemptOutcome::Permanent(format!("template {id} is not active"))
                }
                Ok(Err(TemplateError::Store(e))) => return AttemptOutcome::StoreError(e),
                Err(_) => {
                    return AttemptOutcome::Retry("template rendering timed out".to_string())
                }
            }
        } else {
            (job.subject.clone(), job.body.clone())
        };

        // Attachments.
        let processed = if let Some(raw) = &job.attachments {
            let specs = match specs_from_json(raw) {
                Ok(specs) => specs,
                Err(e) => {
                    return AttemptOutcome::Permanent(format!(
                        "unreadable attachment payload: {e}"
                    ))
                }
            };
            let outcome = self.attachments.process(&specs).await;
            if !outcome.is_valid() {
                return AttemptOutcome::Permanent(format!(
                    "invalid attachments: {}",
                    outcome.validation_errors.join("; ")
                ));
            }
            outcome.processed
        } else {
            Vec::new()
        };

        // Assemble.
        let content = EmailContent {
            from: &self.settings.from_address,
            to: &job.to_addresses,
            cc: job.cc_addresses.as_deref(),
            bcc: job.bcc_addresses.as_deref(),
            subject: &subject,
            body: &body,
            is_html: job.is_html,
        };
        let message = match assemble_message(&content, &processed) {
            Ok(message) => message,
            Err(e) => return AttemptOutcome::Permanent(e.to_string()),
        };

        // Send.
        match self.smtp.send(message).await {
            SendOutcome::Sent => AttemptOutcome::Sent {
                subject,
                body,
                attachment_count: processed.len() as i32,
            },
            SendOutcome::RetryableFailure(reason) => AttemptOutcome::Retry(reason),
            SendOutcome::PermanentFailure(reason) => AttemptOutcome::Permanent(reason),
        }
    }

    /// Schedule a delayed retry, or fail permanently once attempts run out.
    async fn on_retry(&self, job: &QueueJob, reason: &str, duration: Duration) {
        let attempt = job.retry_count + 1;

        if attempt > self.settings.max_retries {
            let final_reason = format!(
                "retries exhausted after {} attempts: {reason}",
                self.settings.max_retries
            );
            self.fail_permanently(job, &final_reason, duration).await;
            return;
        }

        let delay = with_jitter(
            backoff_delay(attempt, self.settings.retry_base, self.settings.retry_max),
            0.2,
        );
        let run_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1));

        if let Err(e) = self
            .store
            .requeue_with_backoff(job.id, attempt, reason, run_at)
            .await
        {
            error!(job_id = %job.id, error = %e, "failed to requeue job, leaving lease for reclaim");
            return;
        }

        self.log(
            job,
            LogLevel::Warning,
            "retry",
            &format!("attempt {attempt} scheduled for {run_at}"),
            Some(reason),
        )
        .await;
        warn!(
            job_id = %job.id,
            attempt,
            delay_sec = delay.as_secs(),
            reason,
            "send failed, retry scheduled"
        );
    }

    async fn fail_permanently(&self, job: &QueueJob, reason: &str, duration: Duration) {
        if let Err(e) = self.store.mark_failed(job.id, reason).await {
            error!(job_id = %job.id, error = %e, "failed to mark job as failed");
            return;
        }

        let history = EmailHistory::for_failed(job, reason, &self.settings.worker_id);
        self.append_history(history).await;

        self.metrics
            .record_email_failed(duration, job.priority, job.template_id);
        self.log(job, LogLevel::Error, "failed", "permanently failed", Some(reason))
            .await;
        warn!(job_id = %job.id, reason, "email permanently failed");
    }

    async fn append_history(&self, history: EmailHistory) {
        if let Err(e) = self.store.append_history(history).await {
            error!(error = %e, "failed to append history row");
        }
    }

    /// Diagnostic row; failures are logged and swallowed.
    async fn log(
        &self,
        job: &QueueJob,
        level: LogLevel,
        step: &str,
        message: &str,
        exception: Option<&str>,
    ) {
        let mut entry = ProcessingLog::builder()
            .level(level)
            .category("worker")
            .message(message.to_string())
            .queue_id(job.id)
            .worker_id(self.settings.worker_id.clone())
            .step(step.to_string())
            .machine_name(self.settings.machine_name.clone())
            .build();
        entry.exception = exception.map(str::to_string);

        if let Err(e) = self.store.append_log(entry).await {
            warn!(error = %e, "failed to append processing log");
        }
    }
}

// ============================================================================
// Worker pool
// ============================================================================

/// Bounded pool of cooperative workers. Each dispatched job holds one
/// semaphore permit for its lifetime.
pub struct WorkerPool {
    worker: Arc<JobWorker>,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    max_workers: usize,
}

impl WorkerPool {
    pub fn new(worker: Arc<JobWorker>, size: usize) -> Self {
        let size = size.max(1);
        Self {
            worker,
            semaphore: Arc::new(Semaphore::new(size)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_workers: size,
        }
    }

    pub fn worker_id(&self) -> &str {
        self.worker.worker_id()
    }

    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn active_workers(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Hand a claimed job to a worker slot. Blocks briefly only when the
    /// dispatcher over-claims relative to free slots.
    pub async fn dispatch(&self, job: QueueJob) {
        let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let worker = Arc::clone(&self.worker);
        let gauge = Arc::clone(&self.in_flight);
        gauge.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            worker.execute(job).await;
            gauge.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
        });
    }

    /// Wait for in-flight jobs to finish, up to `grace`. Jobs still running
    /// afterwards are abandoned to stale-lease reclaim.
    pub async fn drain(&self, grace: Duration) {
        let start = Instant::now();
        while self.active_workers() > 0 && start.elapsed() < grace {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let leftover = self.active_workers();
        if leftover > 0 {
            warn!(count = leftover, "abandoning in-flight jobs after grace period");
        }
    }
}
