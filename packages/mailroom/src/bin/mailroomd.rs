// Main entry point for the dispatch engine daemon

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mailroom_core::config::Config;
use mailroom_core::email::{
    AttachmentProcessor, LettreSmtpSender, SmtpSender, TemplateEngine,
};
use mailroom_core::engine::{
    start_archiver, Dispatcher, DispatcherConfig, JobWorker, Scheduler, SchedulerConfig,
    ServiceHost, WorkerPool, WorkerSettings,
};
use mailroom_core::monitor::{
    AlertEvaluator, AlertManager, HealthMonitor, HealthSettings, LogNotifier, MetricsCollector,
};
use mailroom_core::store::{PostgresStore, Store};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,mailroom_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Mailroom dispatch engine");

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(std::time::Duration::from_secs(10))
        .after_connect(|conn, _meta| {
            // Store operations are bounded; slow statements surface as
            // retryable errors instead of wedging a worker.
            Box::pin(async move {
                sqlx::query("SET statement_timeout = '10s'")
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    let machine_name =
        sysinfo::System::host_name().unwrap_or_else(|| "unknown-host".to_string());

    let store: Arc<dyn Store> = Arc::new(PostgresStore::new(pool));
    let smtp: Arc<dyn SmtpSender> = Arc::new(
        LettreSmtpSender::new(&config.smtp).context("Failed to build SMTP transport")?,
    );
    let metrics = Arc::new(MetricsCollector::new());
    let templates = Arc::new(TemplateEngine::new(Arc::clone(&store)));
    let wake = Arc::new(Notify::new());

    let worker = Arc::new(JobWorker::new(
        Arc::clone(&store),
        Arc::clone(&smtp),
        Arc::clone(&templates),
        AttachmentProcessor::new(config.max_attachment_bytes),
        Arc::clone(&metrics),
        WorkerSettings::from_config(&config, &machine_name),
    ));
    let worker_pool = Arc::new(WorkerPool::new(worker, config.worker_count));

    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        Arc::clone(&worker_pool),
        Arc::clone(&metrics),
        Arc::clone(&wake),
        DispatcherConfig::from_config(&config),
    );
    let scheduler = Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&wake),
        SchedulerConfig {
            tick_interval: config.scheduler_interval,
        },
    );
    let health = HealthMonitor::new(
        Arc::clone(&store),
        Arc::clone(&smtp),
        Arc::clone(&metrics),
        Arc::clone(&worker_pool),
        HealthSettings::from_config(&config, &machine_name),
    );
    let alerts = AlertEvaluator::new(
        Arc::new(AlertManager::new(Arc::new(LogNotifier))),
        Arc::clone(&store),
        Arc::clone(&metrics),
        health.shared_health(),
        config.alert_eval_interval,
    );

    let mut archiver = start_archiver(Arc::clone(&store), config.history_retention_days)
        .await
        .context("Failed to start maintenance tasks")?;

    tracing::info!(
        workers = config.worker_count,
        batch_size = config.batch_size,
        machine = %machine_name,
        "Engine ready"
    );

    ServiceHost::new()
        .with_service(dispatcher)
        .with_service(scheduler)
        .with_service(health)
        .with_service(alerts)
        .run_until_shutdown(config.grace_shutdown)
        .await?;

    archiver
        .shutdown()
        .await
        .context("Failed to stop maintenance tasks")?;

    tracing::info!("Engine stopped");
    Ok(())
}
