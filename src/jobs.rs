use crate::errors::AuthoraError;
use crate::storage;
use chrono::Utc;
use sea_orm::DatabaseConnection;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// Initialize and start the background sweeps.
pub async fn init_scheduler(
    db: DatabaseConnection,
    session_idle_timeout_secs: i64,
) -> Result<JobScheduler, AuthoraError> {
    let sched = JobScheduler::new()
        .await
        .map_err(|e| AuthoraError::Other(format!("Failed to create job scheduler: {}", e)))?;

    let db_clone = db.clone();

    // Mark overdue device codes expired - runs every 5 minutes
    let expire_codes_job = Job::new_async("0 */5 * * * *", move |_uuid, _l| {
        let db = db_clone.clone();
        Box::pin(async move {
            match storage::expire_overdue_device_codes(&db, Utc::now().timestamp()).await {
                Ok(count) if count > 0 => info!("Marked {} device codes expired", count),
                Ok(_) => {}
                Err(e) => error!("Failed to expire device codes: {}", e),
            }
        })
    })
    .map_err(|e| AuthoraError::Other(format!("Failed to create device code job: {}", e)))?;

    sched
        .add(expire_codes_job)
        .await
        .map_err(|e| AuthoraError::Other(format!("Failed to add device code job: {}", e)))?;

    let db_clone = db.clone();

    // Drop device codes a day past expiry and expired access tokens - hourly
    let cleanup_job = Job::new_async("0 15 * * * *", move |_uuid, _l| {
        let db = db_clone.clone();
        Box::pin(async move {
            let now = Utc::now().timestamp();
            match storage::cleanup_expired_device_codes(&db, now).await {
                Ok(count) if count > 0 => info!("Cleaned up {} old device codes", count),
                Ok(_) => {}
                Err(e) => error!("Failed to clean up device codes: {}", e),
            }
            match storage::cleanup_expired_access_tokens(&db, now).await {
                Ok(count) if count > 0 => info!("Cleaned up {} expired access tokens", count),
                Ok(_) => {}
                Err(e) => error!("Failed to clean up access tokens: {}", e),
            }
        })
    })
    .map_err(|e| AuthoraError::Other(format!("Failed to create cleanup job: {}", e)))?;

    sched
        .add(cleanup_job)
        .await
        .map_err(|e| AuthoraError::Other(format!("Failed to add cleanup job: {}", e)))?;

    let db_clone = db.clone();

    // Delete idle sessions - runs every 10 minutes
    let sessions_job = Job::new_async("0 */10 * * * *", move |_uuid, _l| {
        let db = db_clone.clone();
        Box::pin(async move {
            let now = Utc::now().timestamp();
            match storage::cleanup_idle_sessions(&db, session_idle_timeout_secs, now).await {
                Ok(count) if count > 0 => info!("Cleaned up {} idle sessions", count),
                Ok(_) => {}
                Err(e) => error!("Failed to clean up idle sessions: {}", e),
            }
        })
    })
    .map_err(|e| AuthoraError::Other(format!("Failed to create session job: {}", e)))?;

    sched
        .add(sessions_job)
        .await
        .map_err(|e| AuthoraError::Other(format!("Failed to add session job: {}", e)))?;

    sched
        .start()
        .await
        .map_err(|e| AuthoraError::Other(format!("Failed to start job scheduler: {}", e)))?;

    info!("Job scheduler started with 3 jobs");

    Ok(sched)
}
