//! Civitas Background Worker
//!
//! Handles scheduled jobs including:
//! - Applying due billing changes (every 5 minutes)
//! - Dunning and renewal reminder sweep (every 10 minutes)
//! - Renewal reminder scheduling (daily at 6:00 AM UTC)
//! - Billing invariant checks (daily at 5:00 AM UTC)

use std::sync::Arc;
use std::time::Duration;

use civitas_billing::{BillingService, InvariantChecker, ViolationSeverity};
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Create a database connection pool
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment before the filter reads RUST_LOG
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Civitas Worker");

    let pool = create_db_pool().await?;
    let billing = Arc::new(BillingService::from_env(pool.clone())?);
    let checker = Arc::new(InvariantChecker::new(pool.clone()));

    let scheduler = JobScheduler::new().await?;

    // Job 1: Apply scheduled changes whose effective date has passed
    // Deferred changes land on the first of the month; polling keeps the lag small
    let changes_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let billing = changes_billing.clone();
            Box::pin(async move {
                match billing.changes.apply_due_changes().await {
                    Ok(report) if report.due > 0 => info!(
                        due = report.due,
                        applied = report.applied,
                        already_applied = report.already_applied,
                        failed = report.failed,
                        "Due billing changes processed"
                    ),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Failed to load due billing changes"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Apply due billing changes (every 5 minutes)");

    // Job 2: Send due reminders
    // A failed delivery stays pending and is retried by the next run
    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */10 * * * *", move |_uuid, _l| {
            let billing = sweep_billing.clone();
            Box::pin(async move {
                match billing.reminders.run().await {
                    Ok(report) if report.failed > 0 => warn!(
                        sent = report.sent,
                        failed = report.failed,
                        "Reminder sweep finished with failures"
                    ),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Reminder sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Reminder sweep (every 10 minutes)");

    // Job 3: Schedule J-60/J-30/J-15 renewal reminders
    let renewal_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 6 * * *", move |_uuid, _l| {
            let billing = renewal_billing.clone();
            Box::pin(async move {
                info!("Running renewal reminder scheduling");
                match billing.renewals.schedule_renewal_reminders().await {
                    Ok(report) => info!(
                        checked = report.checked,
                        created = report.created,
                        "Renewal reminder scheduling complete"
                    ),
                    Err(e) => error!(error = %e, "Renewal reminder scheduling failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Renewal reminders (daily at 6:00 AM UTC)");

    // Job 4: Billing invariant checks
    let invariant_checker = checker.clone();
    scheduler
        .add(Job::new_async("0 0 5 * * *", move |_uuid, _l| {
            let checker = invariant_checker.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                match checker.run_all_checks().await {
                    Ok(summary) if summary.healthy => info!(
                        checks_run = summary.checks_run,
                        "All billing invariants hold"
                    ),
                    Ok(summary) => {
                        for violation in &summary.violations {
                            if violation.severity == ViolationSeverity::Critical {
                                error!(
                                    invariant = %violation.invariant,
                                    tenant_ids = ?violation.tenant_ids,
                                    "{}",
                                    violation.description
                                );
                            } else {
                                warn!(
                                    invariant = %violation.invariant,
                                    severity = %violation.severity,
                                    tenant_ids = ?violation.tenant_ids,
                                    "{}",
                                    violation.description
                                );
                            }
                        }
                        warn!(
                            checks_failed = summary.checks_failed,
                            violations = summary.violations.len(),
                            "Billing invariant violations found"
                        );
                    }
                    Err(e) => error!(error = %e, "Billing invariant checks failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (daily at 5:00 AM UTC)");

    // Job 5: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("30 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Civitas Worker started successfully with {} scheduled jobs", 5);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
