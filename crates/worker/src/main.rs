//! Recoup background worker
//!
//! Runs the batch scan loop:
//! - Retry scan every 6 hours: executes due pending retry attempts
//! - Dunning scan hourly: sends due dunning sequence steps
//! - Heartbeat every 5 minutes
//!
//! Each scan fans due work out through a bounded semaphore. Individual jobs
//! are wrapped in exponential backoff that fires only for transport-level
//! errors; declines and precondition failures are handled inside the
//! executors and must not be redelivered.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tokio::sync::Semaphore;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{error, info};

use recoup_recovery::{DunningOutcome, RecoveryError, RecoveryService};

const SCAN_BATCH_SIZE: i64 = 100;
const SCAN_CONCURRENCY: usize = 5;

async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

/// Backoff for transport-level job failures: 3 tries total.
fn job_backoff() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(500).map(jitter).take(2)
}

async fn run_retry_scan(service: Arc<RecoveryService>) {
    let due = match service.retry_scheduler.find_due(SCAN_BATCH_SIZE).await {
        Ok(due) => due,
        Err(e) => {
            error!(error = %e, "Retry scan failed to load due attempts");
            return;
        }
    };
    if due.is_empty() {
        info!("Retry scan found no due attempts");
        return;
    }
    info!(due = due.len(), "Retry scan starting");

    let semaphore = Arc::new(Semaphore::new(SCAN_CONCURRENCY));
    let mut handles = Vec::with_capacity(due.len());
    for (case_id, attempt_id) in due {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };
        let executor = service.retry_executor.clone();
        handles.push(tokio::spawn(async move {
            let _permit = permit;
            let result = RetryIf::spawn(
                job_backoff(),
                || executor.execute(case_id, attempt_id),
                RecoveryError::is_transient,
            )
            .await;
            match result {
                Ok(outcome) => {
                    info!(
                        case_id = %case_id,
                        attempt_id = %attempt_id,
                        recovered = outcome.recovered,
                        attempt_number = outcome.attempt_number,
                        "Retry attempt executed"
                    );
                    (outcome.recovered, false)
                }
                Err(e) => {
                    error!(
                        case_id = %case_id,
                        attempt_id = %attempt_id,
                        error = %e,
                        "Retry attempt failed"
                    );
                    (false, true)
                }
            }
        }));
    }

    let mut recovered = 0usize;
    let mut errors = 0usize;
    let total = handles.len();
    for handle in handles {
        match handle.await {
            Ok((was_recovered, was_error)) => {
                if was_recovered {
                    recovered += 1;
                }
                if was_error {
                    errors += 1;
                }
            }
            Err(e) => {
                error!(error = %e, "Retry job panicked");
                errors += 1;
            }
        }
    }
    info!(
        total = total,
        recovered = recovered,
        errors = errors,
        "Retry scan complete"
    );
}

async fn run_dunning_scan(service: Arc<RecoveryService>) {
    let due = match service.dunning_scheduler.find_due(SCAN_BATCH_SIZE).await {
        Ok(due) => due,
        Err(e) => {
            error!(error = %e, "Dunning scan failed to load due steps");
            return;
        }
    };
    if due.is_empty() {
        info!("Dunning scan found no due steps");
        return;
    }
    info!(due = due.len(), "Dunning scan starting");

    let semaphore = Arc::new(Semaphore::new(SCAN_CONCURRENCY));
    let mut handles = Vec::with_capacity(due.len());
    for work in due {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };
        let executor = service.dunning_executor.clone();
        handles.push(tokio::spawn(async move {
            let _permit = permit;
            // Only transport errors that escape the executor (send failures
            // are recorded, not raised) get job-level redelivery.
            let result = RetryIf::spawn(
                job_backoff(),
                || executor.send(work.case_id, work.template_id),
                RecoveryError::is_transient,
            )
            .await;
            match result {
                Ok(DunningOutcome::Sent { .. }) => (1usize, 0usize, 0usize),
                Ok(DunningOutcome::SendFailed { record_id }) => {
                    error!(
                        case_id = %work.case_id,
                        template_id = %work.template_id,
                        record_id = %record_id,
                        "Dunning email send failed"
                    );
                    (0, 1, 0)
                }
                Ok(DunningOutcome::Skipped) => (0, 0, 1),
                Err(e) => {
                    error!(
                        case_id = %work.case_id,
                        template_id = %work.template_id,
                        error = %e,
                        "Dunning step failed"
                    );
                    (0, 1, 0)
                }
            }
        }));
    }

    let mut sent = 0usize;
    let mut failed = 0usize;
    let mut skipped = 0usize;
    for handle in handles {
        match handle.await {
            Ok((s, f, k)) => {
                sent += s;
                failed += f;
                skipped += k;
            }
            Err(e) => {
                error!(error = %e, "Dunning job panicked");
                failed += 1;
            }
        }
    }
    info!(
        sent = sent,
        failed = failed,
        skipped = skipped,
        "Dunning scan complete"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    dotenvy::dotenv().ok();

    info!("Starting Recoup worker");

    let pool = create_db_pool().await?;
    let service = Arc::new(RecoveryService::from_env(pool)?);

    let scheduler = JobScheduler::new().await?;

    // Job 1: Retry scan every 6 hours (0:00, 6:00, 12:00, 18:00 UTC)
    let retry_service = service.clone();
    scheduler
        .add(Job::new_async("0 0 */6 * * *", move |_uuid, _l| {
            let service = retry_service.clone();
            Box::pin(async move {
                info!("Running scheduled retry scan");
                run_retry_scan(service).await;
            })
        })?)
        .await?;
    info!("Scheduled: Retry scan (every 6 hours)");

    // Job 2: Dunning scan hourly
    let dunning_service = service.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let service = dunning_service.clone();
            Box::pin(async move {
                info!("Running scheduled dunning scan");
                run_dunning_scan(service).await;
            })
        })?)
        .await?;
    info!("Scheduled: Dunning scan (hourly)");

    // Job 3: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Recoup worker started with 3 scheduled jobs");

    // The scheduler runs jobs in background tasks.
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
