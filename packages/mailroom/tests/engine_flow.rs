//! End-to-end engine scenarios on the in-memory store: the real dispatcher,
//! worker pool, and scheduler loops run against a scripted SMTP backend.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use mailroom_core::email::{
    AttachmentProcessor, MockSmtpSender, SendOutcome, SmtpSender, TemplateEngine,
};
use mailroom_core::engine::service::Service;
use mailroom_core::engine::{
    Dispatcher, DispatcherConfig, JobWorker, Scheduler, SchedulerConfig, WorkerPool,
    WorkerSettings,
};
use mailroom_core::monitor::MetricsCollector;
use mailroom_core::queue::{JobDescriptor, QueueService};
use mailroom_core::store::{
    EmailTemplate, JobPriority, JobStatus, MemoryStore, ScheduledEmail, Store,
};

struct Harness {
    store: Arc<MemoryStore>,
    smtp: Arc<MockSmtpSender>,
    queue: QueueService,
    scheduler: Arc<Scheduler>,
    metrics: Arc<MetricsCollector>,
    dispatcher: Option<Dispatcher>,
    shutdown: CancellationToken,
}

impl Harness {
    /// Build the engine with fast timings suited to tests: 50 ms polls,
    /// 200 ms retry base, 1 s stale leases. The dispatcher is not running
    /// yet; call [`Harness::spawn_dispatcher`].
    fn build(worker_count: usize) -> Self {
        let store = Arc::new(MemoryStore::new());
        let store_dyn: Arc<dyn Store> = Arc::clone(&store) as Arc<dyn Store>;
        let smtp = Arc::new(MockSmtpSender::new());
        let metrics = Arc::new(MetricsCollector::new());
        let templates = Arc::new(TemplateEngine::new(Arc::clone(&store_dyn)));
        let wake = Arc::new(Notify::new());

        let worker = Arc::new(JobWorker::new(
            Arc::clone(&store_dyn),
            Arc::clone(&smtp) as Arc<dyn SmtpSender>,
            Arc::clone(&templates),
            AttachmentProcessor::new(25 * 1024 * 1024),
            Arc::clone(&metrics),
            WorkerSettings {
                worker_id: "worker-itest".to_string(),
                machine_name: "host-itest".to_string(),
                from_address: "noreply@example.com".to_string(),
                max_retries: 5,
                retry_base: Duration::from_millis(200),
                retry_max: Duration::from_secs(2),
                job_timeout: Duration::from_secs(30),
                render_timeout: Duration::from_secs(1),
            },
        ));
        let pool = Arc::new(WorkerPool::new(worker, worker_count));

        let queue = QueueService::new(
            Arc::clone(&store_dyn),
            Arc::clone(&templates),
            AttachmentProcessor::new(25 * 1024 * 1024),
            Arc::clone(&pool),
            Arc::clone(&wake),
        );

        let dispatcher = Dispatcher::new(
            Arc::clone(&store_dyn),
            pool,
            Arc::clone(&metrics),
            Arc::clone(&wake),
            DispatcherConfig {
                batch_size: 10,
                poll_interval: Duration::from_millis(50),
                stale_lease: Duration::from_secs(1),
                drain_grace: Duration::from_secs(5),
            },
        );

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store_dyn),
            wake,
            SchedulerConfig {
                tick_interval: Duration::from_millis(100),
            },
        ));

        Self {
            store,
            smtp,
            queue,
            scheduler,
            metrics,
            dispatcher: Some(dispatcher),
            shutdown: CancellationToken::new(),
        }
    }

    /// Build and immediately start the dispatch loop.
    fn start(worker_count: usize) -> Self {
        let mut harness = Self::build(worker_count);
        harness.spawn_dispatcher();
        harness
    }

    fn spawn_dispatcher(&mut self) {
        let dispatcher = self.dispatcher.take().expect("dispatcher already spawned");
        tokio::spawn(Box::new(dispatcher).run(self.shutdown.clone()));
    }

    async fn wait_for_status(&self, id: Uuid, status: JobStatus) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(job) = self.store.get_job(id).await.unwrap() {
                if job.status == status {
                    return;
                }
            }
            if tokio::time::Instant::now() > deadline {
                let job = self.store.get_job(id).await.unwrap();
                panic!("job {id} never reached {status:?}; current: {job:?}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn descriptor(to: &str) -> JobDescriptor {
    JobDescriptor::builder()
        .to(to)
        .subject("Hi")
        .body("Hello")
        .build()
}

#[tokio::test(flavor = "multi_thread")]
async fn immediate_send_reaches_sent_with_history() {
    let harness = Harness::start(4);

    let receipt = harness.queue.submit(descriptor("a@x.io")).await.unwrap();
    harness.wait_for_status(receipt.queue_id, JobStatus::Sent).await;

    let job = harness
        .store
        .get_job(receipt.queue_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.retry_count, 0);
    assert!(job.sent_at.is_some());

    let history = harness
        .store
        .history_for_job(receipt.queue_id)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, JobStatus::Sent);
    assert_eq!(history[0].retry_count, 0);

    assert_eq!(harness.metrics.counters().emails_sent, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_failures_retry_until_success() {
    let harness = Harness::start(4);
    harness
        .smtp
        .fail_next(2, SendOutcome::RetryableFailure("421 try again".into()));

    let receipt = harness.queue.submit(descriptor("a@x.io")).await.unwrap();
    harness.wait_for_status(receipt.queue_id, JobStatus::Sent).await;

    let job = harness
        .store
        .get_job(receipt.queue_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.retry_count, 2);
    assert_eq!(harness.smtp.attempt_count(), 3);

    // Only the terminal outcome lands in history.
    let history = harness
        .store
        .history_for_job(receipt.queue_id)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, JobStatus::Sent);
}

#[tokio::test(flavor = "multi_thread")]
async fn permanent_failure_is_terminal_without_retries() {
    let harness = Harness::start(4);
    harness.smtp.push_outcome(SendOutcome::PermanentFailure(
        "550 invalid recipient".into(),
    ));

    let receipt = harness.queue.submit(descriptor("a@x.io")).await.unwrap();
    harness
        .wait_for_status(receipt.queue_id, JobStatus::Failed)
        .await;

    let job = harness
        .store
        .get_job(receipt.queue_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.retry_count, 0);
    assert!(job.last_error.as_deref().unwrap().contains("550"));
    assert_eq!(harness.smtp.attempt_count(), 1);

    let history = harness
        .store
        .history_for_job(receipt.queue_id)
        .await
        .unwrap();
    assert_eq!(history[0].status, JobStatus::Failed);
}

#[tokio::test(flavor = "multi_thread")]
async fn scheduled_job_waits_for_its_time() {
    let harness = Harness::start(4);
    let fire_at = Utc::now() + chrono::Duration::milliseconds(500);

    let mut d = descriptor("a@x.io");
    d.scheduled_for = Some(fire_at);
    let receipt = harness.queue.submit(d).await.unwrap();

    // Well before the scheduled time, nothing has picked it up.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let job = harness
        .store
        .get_job(receipt.queue_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(harness.smtp.attempt_count(), 0);

    harness.wait_for_status(receipt.queue_id, JobStatus::Sent).await;
    let job = harness
        .store
        .get_job(receipt.queue_id)
        .await
        .unwrap()
        .unwrap();
    assert!(job.sent_at.unwrap() >= fire_at);
}

#[tokio::test(flavor = "multi_thread")]
async fn critical_jobs_jump_the_queue() {
    // Stage the backlog before the dispatcher runs, with one worker so the
    // claim order is the send order.
    let mut harness = Harness::build(1);
    for i in 0..5 {
        harness
            .queue
            .submit(descriptor(&format!("normal{i}@x.io")))
            .await
            .unwrap();
    }
    let mut critical = descriptor("critical@x.io");
    critical.priority = JobPriority::Critical;
    let receipt = harness.queue.submit(critical).await.unwrap();

    harness.spawn_dispatcher();
    harness.wait_for_status(receipt.queue_id, JobStatus::Sent).await;

    let attempts = harness.smtp.attempts();
    assert_eq!(attempts[0].recipients, vec!["critical@x.io".to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_lease_is_reclaimed_and_redelivered() {
    let mut harness = Harness::build(4);

    // A worker that died mid-send: claimed in the past, never finished.
    let receipt = harness.queue.submit(descriptor("a@x.io")).await.unwrap();
    let stale_start = Utc::now() - chrono::Duration::seconds(30);
    let claimed = harness
        .store
        .claim_batch(stale_start, 1, "dead-worker")
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, receipt.queue_id);

    // The dispatcher's reclaim tick returns it to the queue and a live
    // worker delivers it.
    harness.spawn_dispatcher();
    harness.wait_for_status(receipt.queue_id, JobStatus::Sent).await;

    let job = harness
        .store
        .get_job(receipt.queue_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.retry_count, 1);
    assert_eq!(job.processed_by.as_deref(), Some("worker-itest"));
}

#[tokio::test(flavor = "multi_thread")]
async fn template_jobs_render_before_sending() {
    let harness = Harness::start(4);

    let template = EmailTemplate::builder()
        .name("welcome")
        .subject_template("Hello {{name}}")
        .body_template("Welcome {{name}} to {{site}}")
        .build();
    let template_id = harness.queue.create_template(template).await.unwrap();

    let mut d = descriptor("ada@x.io");
    d.subject = String::new();
    d.body = String::new();
    d.template_id = Some(template_id);
    d.template_data = Some(
        [("name".to_string(), "Ada".to_string())]
            .into_iter()
            .collect(),
    );
    let receipt = harness.queue.submit(d).await.unwrap();

    harness.wait_for_status(receipt.queue_id, JobStatus::Sent).await;

    let history = harness
        .store
        .history_for_job(receipt.queue_id)
        .await
        .unwrap();
    assert_eq!(history[0].subject, "Hello Ada");
    // The unknown placeholder survives literally.
    assert_eq!(history[0].final_body, "Welcome Ada to {{site}}");
}

#[tokio::test(flavor = "multi_thread")]
async fn scheduler_promotes_due_plans_into_the_queue() {
    let harness = Harness::start(4);

    let plan = ScheduledEmail::builder()
        .name("reminder")
        .to_addresses("a@x.io")
        .subject("Reminder")
        .body("It is time")
        .next_run_time(Utc::now() - chrono::Duration::seconds(1))
        .build();
    let plan_id = plan.id;
    harness.queue.create_schedule(plan).await.unwrap();

    assert_eq!(harness.scheduler.tick(Utc::now()).await.unwrap(), 1);

    let jobs = harness.store.jobs();
    assert_eq!(jobs.len(), 1);
    let job_id = jobs[0].id;
    harness.wait_for_status(job_id, JobStatus::Sent).await;

    let plan = harness.store.get_schedule(plan_id).await.unwrap().unwrap();
    assert_eq!(plan.execution_count, 1);
    assert!(!plan.is_active);
}

#[tokio::test(flavor = "multi_thread")]
async fn every_accepted_job_reaches_a_terminal_state() {
    let harness = Harness::start(8);
    harness
        .smtp
        .push_outcome(SendOutcome::PermanentFailure("550 bad".into()));
    harness
        .smtp
        .push_outcome(SendOutcome::RetryableFailure("421 busy".into()));

    let mut ids = Vec::new();
    for i in 0..10 {
        let receipt = harness
            .queue
            .submit(descriptor(&format!("user{i}@x.io")))
            .await
            .unwrap();
        ids.push(receipt.queue_id);
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let jobs = harness.store.jobs();
        if jobs.iter().all(|j| j.status.is_terminal()) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "jobs stuck: {:?}",
            jobs.iter().map(|j| (j.id, j.status)).collect::<Vec<_>>()
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // History exists for every Sent/Failed terminal, and retries stay
    // within the configured bound.
    for job in harness.store.jobs() {
        if matches!(job.status, JobStatus::Sent | JobStatus::Failed) {
            let history = harness.store.history_for_job(job.id).await.unwrap();
            assert_eq!(history.len(), 1, "missing history for {}", job.id);
        }
        assert!(job.retry_count <= 5);
    }
}
