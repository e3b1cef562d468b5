//! Inbound facade for producers: submit, inspect, cancel, and the queue
//! health surface.
//!
//! Validation happens here, before anything is written: malformed
//! recipients, empty required fields, bad base64, and oversized attachments
//! never enter the queue. Status and priority cross this boundary as their
//! stable integer wire values.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::pagination::{PageRequest, PagedResult};
use crate::email::{parse_address_list, AttachmentProcessor, AttachmentSpec, TemplateEngine};
use crate::engine::worker::WorkerPool;
use crate::store::{
    CancelOutcome, EmailTemplate, JobFilter, JobPriority, JobStatus, QueueJob, ScheduledEmail,
    Store, TemplateUpdate,
};

use crate::engine::scheduler::initial_next_run_time;

/// A validated send request, as handed over by the submission API.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobDescriptor {
    /// Client-supplied id makes resubmission idempotent.
    #[builder(default, setter(strip_option))]
    pub queue_id: Option<Uuid>,
    pub to: String,
    #[builder(default, setter(strip_option))]
    pub cc: Option<String>,
    #[builder(default, setter(strip_option))]
    pub bcc: Option<String>,
    #[builder(default)]
    pub subject: String,
    #[builder(default)]
    pub body: String,
    #[builder(default = false)]
    pub is_html: bool,
    #[builder(default)]
    pub priority: JobPriority,
    #[builder(default, setter(strip_option))]
    pub template_id: Option<Uuid>,
    #[builder(default, setter(strip_option))]
    pub template_data: Option<HashMap<String, String>>,
    #[builder(default)]
    pub attachments: Vec<AttachmentSpec>,
    #[builder(default, setter(strip_option))]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub created_by: Option<String>,
    #[builder(default, setter(strip_option))]
    pub request_source: Option<String>,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("recipient list is empty")]
    NoRecipients,
    #[error("invalid email address: {0}")]
    InvalidAddress(String),
    #[error("subject is required without a template")]
    MissingSubject,
    #[error("body is required without a template")]
    MissingBody,
    #[error("scheduled_for must be in the future")]
    ScheduledInPast,
    #[error("invalid attachments: {0}")]
    InvalidAttachments(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitReceipt {
    pub queue_id: Uuid,
    pub status: i16,
    /// True when an identical id was already queued and nothing was written.
    pub duplicate: bool,
}

/// Wire view of one job; status and priority are the stable integers.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub queue_id: Uuid,
    pub status: i16,
    pub priority: i16,
    pub to: String,
    pub cc: Option<String>,
    pub bcc: Option<String>,
    pub subject: String,
    pub is_html: bool,
    pub template_id: Option<Uuid>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub processed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub is_scheduled: bool,
    pub sent_at: Option<DateTime<Utc>>,
}

impl From<QueueJob> for JobView {
    fn from(job: QueueJob) -> Self {
        Self {
            queue_id: job.id,
            status: job.status.as_i16(),
            priority: job.priority.as_i16(),
            to: job.to_addresses,
            cc: job.cc_addresses,
            bcc: job.bcc_addresses,
            subject: job.subject,
            is_html: job.is_html,
            template_id: job.template_id,
            retry_count: job.retry_count,
            last_error: job.last_error,
            processed_by: job.processed_by,
            created_at: job.created_at,
            updated_at: job.updated_at,
            scheduled_for: job.scheduled_for,
            is_scheduled: job.is_scheduled,
            sent_at: job.sent_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub active: usize,
    pub max: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub depth: i64,
    pub queued: i64,
    pub processing: i64,
    pub failed: i64,
    pub scheduled: i64,
    pub avg_processing_minutes: Option<f64>,
    pub oldest_queued_minutes: Option<f64>,
    pub worker_status: WorkerStatus,
}

pub struct QueueService {
    store: Arc<dyn Store>,
    templates: Arc<TemplateEngine>,
    attachments: AttachmentProcessor,
    pool: Arc<WorkerPool>,
    wake: Arc<Notify>,
}

impl QueueService {
    pub fn new(
        store: Arc<dyn Store>,
        templates: Arc<TemplateEngine>,
        attachments: AttachmentProcessor,
        pool: Arc<WorkerPool>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            templates,
            attachments,
            pool,
            wake,
        }
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    /// Validate and enqueue one send request. Duplicate queue ids return
    /// the existing row's receipt without writing.
    pub async fn submit(&self, descriptor: JobDescriptor) -> Result<SubmitReceipt, SubmitError> {
        let to = parse_address_list(&descriptor.to)
            .map_err(|e| SubmitError::InvalidAddress(e.to_string()))?;
        if to.is_empty() {
            return Err(SubmitError::NoRecipients);
        }
        for list in [&descriptor.cc, &descriptor.bcc].into_iter().flatten() {
            parse_address_list(list).map_err(|e| SubmitError::InvalidAddress(e.to_string()))?;
        }

        if descriptor.template_id.is_none() {
            if descriptor.subject.trim().is_empty() {
                return Err(SubmitError::MissingSubject);
            }
            if descriptor.body.trim().is_empty() {
                return Err(SubmitError::MissingBody);
            }
        }

        let now = Utc::now();
        if let Some(at) = descriptor.scheduled_for {
            if at <= now {
                return Err(SubmitError::ScheduledInPast);
            }
        }

        // Decode, size-check, and normalize attachments up front; a bad one
        // never reaches the queue.
        let attachments = if descriptor.attachments.is_empty() {
            None
        } else {
            let outcome = self.attachments.process(&descriptor.attachments).await;
            if !outcome.is_valid() {
                return Err(SubmitError::InvalidAttachments(
                    outcome.validation_errors.join("; "),
                ));
            }
            let normalized: Vec<AttachmentSpec> =
                outcome.processed.iter().map(|a| a.to_spec()).collect();
            Some(
                serde_json::to_value(normalized)
                    .context("failed to serialize attachments")?,
            )
        };

        let template_data = descriptor
            .template_data
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .context("failed to serialize template data")?;

        let mut job = QueueJob::builder()
            .id(descriptor.queue_id.unwrap_or_else(Uuid::now_v7))
            .priority(descriptor.priority)
            .to_addresses(descriptor.to)
            .subject(descriptor.subject)
            .body(descriptor.body)
            .is_html(descriptor.is_html)
            .build();
        job.cc_addresses = descriptor.cc;
        job.bcc_addresses = descriptor.bcc;
        job.template_id = descriptor.template_id;
        job.template_data = template_data;
        job.requires_template_processing = descriptor.template_id.is_some();
        job.attachments = attachments;
        job.scheduled_for = descriptor.scheduled_for;
        job.is_scheduled = descriptor.scheduled_for.is_some();
        job.created_by = descriptor.created_by;
        job.request_source = descriptor.request_source;

        let outcome = self.store.insert_job(job).await?;
        let duplicate = !outcome.is_inserted();

        if !duplicate {
            debug!(queue_id = %outcome.job_id(), "job accepted");
            // Nudge the dispatcher instead of waiting out its poll interval.
            self.wake.notify_one();
        }

        Ok(SubmitReceipt {
            queue_id: outcome.job_id(),
            status: JobStatus::Queued.as_i16(),
            duplicate,
        })
    }

    pub async fn get_status(&self, queue_id: Uuid) -> Result<Option<JobView>> {
        Ok(self.store.get_job(queue_id).await?.map(JobView::from))
    }

    pub async fn list(
        &self,
        filter: JobFilter,
        page: i64,
        page_size: i64,
    ) -> Result<PagedResult<JobView>> {
        let request = PageRequest::new(page, page_size);
        let jobs = self.store.list_jobs(&filter, request).await?;
        Ok(jobs.map(JobView::from))
    }

    /// Cancel a queued job. Jobs already leased or terminal conflict.
    pub async fn cancel(&self, queue_id: Uuid) -> Result<CancelOutcome> {
        self.store.cancel_job(queue_id).await
    }

    pub async fn queue_health(&self) -> Result<QueueHealth> {
        let stats = self.store.queue_stats(Utc::now()).await?;
        Ok(QueueHealth {
            depth: stats.depth(),
            queued: stats.queued,
            processing: stats.processing,
            failed: stats.failed,
            scheduled: stats.scheduled,
            avg_processing_minutes: stats.avg_processing_minutes,
            oldest_queued_minutes: stats.oldest_queued_minutes,
            worker_status: WorkerStatus {
                active: self.pool.active_workers(),
                max: self.pool.max_workers(),
            },
        })
    }

    // ------------------------------------------------------------------
    // Scheduled emails
    // ------------------------------------------------------------------

    /// Register a deferred or recurring plan. A missing `next_run_time` is
    /// derived from the start date and recurrence source.
    pub async fn create_schedule(&self, mut schedule: ScheduledEmail) -> Result<Uuid> {
        if !schedule.recurrence_is_valid() {
            bail!("a recurring schedule needs exactly one of cron_expression / interval_minutes");
        }
        if !schedule.template_data_is_valid() {
            bail!("template data must be a flat map of string values");
        }
        parse_address_list(&schedule.to_addresses)
            .map_err(|e| anyhow::anyhow!("invalid recipients: {e}"))?;

        if schedule.next_run_time.is_none() {
            schedule.next_run_time = initial_next_run_time(&schedule, Utc::now())?;
        }

        let id = schedule.id;
        self.store.insert_schedule(schedule).await?;
        Ok(id)
    }

    pub async fn cancel_schedule(&self, id: Uuid) -> Result<bool> {
        self.store.deactivate_schedule(id).await
    }

    // ------------------------------------------------------------------
    // Templates
    // ------------------------------------------------------------------

    pub async fn create_template(&self, template: EmailTemplate) -> Result<Uuid> {
        let id = template.id;
        self.store.create_template(template).await?;
        Ok(id)
    }

    /// Edit a template. The stored version bumps and the render cache entry
    /// is dropped so the next render sees the edit.
    pub async fn update_template(
        &self,
        id: Uuid,
        update: TemplateUpdate,
    ) -> Result<EmailTemplate> {
        let template = self.store.update_template(id, update).await?;
        self.templates.invalidate(id);
        Ok(template)
    }

    pub async fn deactivate_template(&self, id: Uuid) -> Result<bool> {
        let deactivated = self.store.deactivate_template(id).await?;
        if deactivated {
            self.templates.invalidate(id);
        }
        Ok(deactivated)
    }

    /// Delete a template; system templates are refused by the store.
    pub async fn delete_template(&self, id: Uuid) -> Result<()> {
        self.store.delete_template(id).await?;
        self.templates.invalidate(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::{MockSmtpSender, SmtpSender};
    use crate::engine::worker::{JobWorker, WorkerSettings};
    use crate::monitor::MetricsCollector;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn service() -> (QueueService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let store_dyn: Arc<dyn Store> = Arc::clone(&store) as Arc<dyn Store>;
        let templates = Arc::new(TemplateEngine::new(Arc::clone(&store_dyn)));
        let worker = Arc::new(JobWorker::new(
            Arc::clone(&store_dyn),
            Arc::new(MockSmtpSender::new()) as Arc<dyn SmtpSender>,
            Arc::clone(&templates),
            AttachmentProcessor::new(1024),
            Arc::new(MetricsCollector::new()),
            WorkerSettings {
                worker_id: "worker-test".to_string(),
                machine_name: "host-test".to_string(),
                from_address: "noreply@example.com".to_string(),
                max_retries: 5,
                retry_base: Duration::from_secs(30),
                retry_max: Duration::from_secs(3600),
                job_timeout: Duration::from_secs(120),
                render_timeout: Duration::from_secs(1),
            },
        ));
        let pool = Arc::new(WorkerPool::new(worker, 4));

        (
            QueueService::new(
                store_dyn,
                templates,
                AttachmentProcessor::new(1024),
                pool,
                Arc::new(Notify::new()),
            ),
            store,
        )
    }

    fn descriptor() -> JobDescriptor {
        JobDescriptor::builder()
            .to("a@example.com")
            .subject("Hi")
            .body("Hello")
            .build()
    }

    #[tokio::test]
    async fn submit_accepts_a_valid_descriptor() {
        let (service, store) = service();
        let receipt = service.submit(descriptor()).await.unwrap();

        assert_eq!(receipt.status, 0);
        assert!(!receipt.duplicate);

        let jobs = store.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn submit_rejects_bad_recipients() {
        let (service, _) = service();

        let mut d = descriptor();
        d.to = "not-an-address".to_string();
        assert!(matches!(
            service.submit(d).await,
            Err(SubmitError::InvalidAddress(_))
        ));

        let mut d = descriptor();
        d.to = " , ".to_string();
        assert!(matches!(
            service.submit(d).await,
            Err(SubmitError::NoRecipients)
        ));
    }

    #[tokio::test]
    async fn submit_requires_subject_and_body_without_template() {
        let (service, _) = service();

        let mut d = descriptor();
        d.subject = "  ".to_string();
        assert!(matches!(
            service.submit(d).await,
            Err(SubmitError::MissingSubject)
        ));

        let mut d = descriptor();
        d.body = String::new();
        assert!(matches!(
            service.submit(d).await,
            Err(SubmitError::MissingBody)
        ));
    }

    #[tokio::test]
    async fn submit_rejects_past_schedules() {
        let (service, _) = service();
        let mut d = descriptor();
        d.scheduled_for = Some(Utc::now() - chrono::Duration::minutes(1));
        assert!(matches!(
            service.submit(d).await,
            Err(SubmitError::ScheduledInPast)
        ));
    }

    #[tokio::test]
    async fn scheduled_submission_defers_dispatch() {
        let (service, store) = service();
        let mut d = descriptor();
        d.scheduled_for = Some(Utc::now() + chrono::Duration::minutes(5));
        service.submit(d).await.unwrap();

        let jobs = store.jobs();
        assert!(jobs[0].is_scheduled);
        assert!(!jobs[0].is_ready(Utc::now()));
    }

    #[tokio::test]
    async fn resubmission_with_the_same_id_is_idempotent() {
        let (service, store) = service();
        let id = Uuid::now_v7();

        let mut d = descriptor();
        d.queue_id = Some(id);
        let first = service.submit(d.clone()).await.unwrap();
        let second = service.submit(d).await.unwrap();

        assert_eq!(first.queue_id, id);
        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(store.jobs().len(), 1);
    }

    #[tokio::test]
    async fn oversized_attachments_never_enter_the_queue() {
        let (service, store) = service();
        let mut d = descriptor();
        d.attachments = vec![AttachmentSpec {
            filename: "big.bin".to_string(),
            content_type: None,
            base64_content: Some(base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                vec![0u8; 2048],
            )),
            file_path: None,
            inline: false,
            content_id: None,
        }];

        assert!(matches!(
            service.submit(d).await,
            Err(SubmitError::InvalidAttachments(_))
        ));
        assert!(store.jobs().is_empty());
    }

    #[tokio::test]
    async fn cancel_follows_the_state_machine() {
        let (service, store) = service();
        let receipt = service.submit(descriptor()).await.unwrap();

        assert_eq!(
            service.cancel(receipt.queue_id).await.unwrap(),
            CancelOutcome::Cancelled
        );
        // Terminal now: a second cancel conflicts.
        assert_eq!(
            service.cancel(receipt.queue_id).await.unwrap(),
            CancelOutcome::Conflict
        );

        let view = service.get_status(receipt.queue_id).await.unwrap().unwrap();
        assert_eq!(view.status, 4);
        assert_eq!(store.jobs()[0].status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn queue_health_reports_counts_and_workers() {
        let (service, _) = service();
        service.submit(descriptor()).await.unwrap();

        let health = service.queue_health().await.unwrap();
        assert_eq!(health.queued, 1);
        assert_eq!(health.depth, 1);
        assert_eq!(health.worker_status.max, 4);
        assert_eq!(health.worker_status.active, 0);
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let (service, _) = service();
        service.submit(descriptor()).await.unwrap();

        let queued = service
            .list(
                JobFilter {
                    status: Some(JobStatus::Queued),
                    ..Default::default()
                },
                1,
                10,
            )
            .await
            .unwrap();
        assert_eq!(queued.total, 1);

        let sent = service
            .list(
                JobFilter {
                    status: Some(JobStatus::Sent),
                    ..Default::default()
                },
                1,
                10,
            )
            .await
            .unwrap();
        assert_eq!(sent.total, 0);
    }

    #[tokio::test]
    async fn recurring_schedule_requires_one_source() {
        let (service, _) = service();
        let mut plan = ScheduledEmail::builder()
            .name("digest")
            .to_addresses("a@example.com")
            .subject("s")
            .body("b")
            .build();
        plan.is_recurring = true;

        assert!(service.create_schedule(plan).await.is_err());
    }

    #[tokio::test]
    async fn schedule_rejects_non_string_template_data() {
        let (service, store) = service();
        let mut plan = ScheduledEmail::builder()
            .name("digest")
            .to_addresses("a@example.com")
            .subject("s")
            .body("b")
            .build();
        plan.template_data = Some(serde_json::json!({"count": 5}));

        assert!(service.create_schedule(plan).await.is_err());
        assert!(store.jobs().is_empty());
    }

    #[tokio::test]
    async fn schedule_creation_derives_next_run_time() {
        let (service, store) = service();
        let start = Utc::now() + chrono::Duration::minutes(10);
        let plan = ScheduledEmail::builder()
            .name("one-shot")
            .to_addresses("a@example.com")
            .subject("s")
            .body("b")
            .start_date(start)
            .build();

        let id = service.create_schedule(plan).await.unwrap();
        let stored = store.get_schedule(id).await.unwrap().unwrap();
        assert_eq!(stored.next_run_time, Some(start));
    }

    #[tokio::test]
    async fn template_update_invalidates_the_render_cache() {
        let (service, _store) = service();
        let template = EmailTemplate::builder()
            .name("welcome")
            .subject_template("v1 {{name}}")
            .body_template("b")
            .build();
        let id = service.create_template(template).await.unwrap();

        let rendered = service
            .templates
            .render(id, &HashMap::new())
            .await
            .unwrap();
        assert!(rendered.subject.starts_with("v1"));

        service
            .update_template(
                id,
                TemplateUpdate {
                    subject_template: Some("v2 {{name}}".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let rendered = service
            .templates
            .render(id, &HashMap::new())
            .await
            .unwrap();
        assert!(rendered.subject.starts_with("v2"));
    }

    #[tokio::test]
    async fn system_templates_cannot_be_deleted() {
        let (service, _) = service();
        let mut template = EmailTemplate::builder()
            .name("base-layout")
            .subject_template("s")
            .body_template("b")
            .build();
        template.is_system = true;

        let id = service.create_template(template).await.unwrap();
        assert!(service.delete_template(id).await.is_err());
    }
}
