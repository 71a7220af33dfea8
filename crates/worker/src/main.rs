//! Deskbell Background Worker
//!
//! Handles scheduled jobs including:
//! - Retry drain for failed events and notifications (every minute)
//! - Read notification retention sweep (daily at 3:00 AM UTC)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use deskbell_engine::{DrainReport, Engine, EngineConfig, PgStore};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_MAX_CONNECTIONS: u32 = 5;

fn init_logging() {
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

/// Connect to the database and bring the schema up to date
async fn create_store() -> anyhow::Result<PgStore> {
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_CONNECTIONS);

    let store = PgStore::connect(&database_url, max_connections).await?;
    info!(max_connections = max_connections, "Database pool created");

    store.migrate().await?;
    info!("Database migrations applied");
    Ok(store)
}

fn log_drain(report: &DrainReport) {
    let counts = [("events", &report.events), ("notifications", &report.notifications)];
    for (kind, counts) in counts {
        if counts.errors > 0 {
            error!(kind = kind, errors = counts.errors, "Retry drain hit errors");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    init_logging();

    info!("Starting Deskbell Worker v{}", env!("CARGO_PKG_VERSION"));

    let config = EngineConfig::from_env()?;
    let retention = config.notification_retention;
    let store = Arc::new(create_store().await?);
    let engine = Engine::from_config(store, config)?;

    // Pick up anything left over from before a restart
    match engine.scheduler.drain_retry_queue().await {
        Ok(report) => log_drain(&report),
        Err(e) => error!(error = %e, "Startup retry drain failed"),
    }

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Retry drain (every minute)
    // Overlapping runs are safe: every row is claimed before it is processed
    let drain_scheduler = engine.scheduler.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let drain = drain_scheduler.clone();
            Box::pin(async move {
                match drain.drain_retry_queue().await {
                    Ok(report) => log_drain(&report),
                    Err(e) => error!(error = %e, "Retry drain failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Retry drain (every minute)");

    // Job 2: Purge read notifications past retention (daily at 3:00 AM UTC)
    let retention_service = engine.notifications.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let service = retention_service.clone();
            Box::pin(async move {
                info!("Running notification retention sweep");
                let cutoff = time::OffsetDateTime::now_utc() - retention;
                match service.purge_read(cutoff).await {
                    Ok(purged) => info!(purged = purged, "Notification retention sweep complete"),
                    Err(e) => error!(error = %e, "Notification retention sweep failed"),
                }
            })
        })?)
        .await?;
    info!(
        retention_days = retention.whole_days(),
        "Scheduled: Notification retention sweep (daily at 3:00 AM UTC)"
    );

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Deskbell Worker started successfully with {} scheduled jobs", 3);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
