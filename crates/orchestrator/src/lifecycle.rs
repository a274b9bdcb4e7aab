use chrono::{DateTime, Duration, Utc};
use crawlhub_core::bus::topics;
use crawlhub_core::events::event_types;
use crawlhub_core::repository::{jobs, outbox, quota};
use crawlhub_core::{AppError, CrawlJob, EngineConfig, JobStatus};
use serde_json::json;
use sqlx::PgConnection;
use tracing::info;

/// Legal state transitions. Everything else is rejected before any write.
pub fn transition_allowed(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    matches!(
        (from, to),
        (Pending, Assigned)
            | (Assigned, Running)
            | (Assigned, Failed)
            | (Running, Completed)
            | (Running, Failed)
            | (Failed, Pending)
            | (Pending, Cancelled)
            | (Assigned, Cancelled)
            | (Running, Cancelled)
    )
}

/// Retry delay before attempt `n` (the retry counter after increment):
/// exponential base in minutes, capped, plus a constant floor that absorbs
/// agent cold-start.
pub fn retry_backoff(cfg: &EngineConfig, attempt: i32) -> Duration {
    let exp = (cfg.retry_base_minutes as i64)
        .saturating_pow(attempt.max(1) as u32)
        .min(cfg.retry_cap_minutes);
    Duration::minutes(cfg.retry_floor_minutes + exp)
}

pub fn next_retry_at(cfg: &EngineConfig, attempt: i32, now: DateTime<Utc>) -> DateTime<Utc> {
    now + retry_backoff(cfg, attempt)
}

fn submission_payload(job: &CrawlJob) -> serde_json::Value {
    json!({
        "job_id": job.id,
        "user_id": job.user_id,
        "urls": job.urls,
        "prompt": job.prompt,
        "worker_kind": job.worker_kind,
        "navigation_plan": job.navigation_plan,
        "max_pages": job.max_pages,
    })
}

fn state_payload(job: &CrawlJob, extra: serde_json::Value) -> serde_json::Value {
    let mut payload = json!({
        "job_id": job.id,
        "user_id": job.user_id,
        "retry_count": job.retry_count,
    });
    if let (Some(map), Some(extra)) = (payload.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            map.insert(k.clone(), v.clone());
        }
    }
    payload
}

/// Pending → Assigned. The outbox row goes to `crawl.request` so pull-based
/// workers can start from the bus alone.
pub async fn record_assigned(
    conn: &mut PgConnection,
    cfg: &EngineConfig,
    job: &CrawlJob,
    agent_id: uuid::Uuid,
) -> Result<(), AppError> {
    jobs::mark_assigned(conn, job.id, job.version, agent_id).await?;
    outbox::enqueue(
        conn,
        topics::CRAWL_REQUEST,
        event_types::JOB_ASSIGNED,
        job.id,
        {
            let mut payload = submission_payload(job);
            payload["agent_id"] = json!(agent_id);
            payload
        },
        cfg.outbox_max_retries,
    )
    .await?;
    Ok(())
}

pub async fn record_submitted(
    conn: &mut PgConnection,
    cfg: &EngineConfig,
    job: &CrawlJob,
) -> Result<(), AppError> {
    outbox::enqueue(
        conn,
        topics::CRAWL_EVENTS,
        event_types::JOB_SUBMITTED,
        job.id,
        state_payload(job, json!({ "urls": job.urls.len(), "priority": job.priority })),
        cfg.outbox_max_retries,
    )
    .await?;
    Ok(())
}

/// Assigned → Running, driven by the first progress event.
pub async fn record_started(
    conn: &mut PgConnection,
    cfg: &EngineConfig,
    job: &CrawlJob,
) -> Result<(), AppError> {
    outbox::enqueue(
        conn,
        topics::CRAWL_EVENTS,
        event_types::JOB_STARTED,
        job.id,
        state_payload(job, json!({ "agent_id": job.assigned_agent_id })),
        cfg.outbox_max_retries,
    )
    .await?;
    Ok(())
}

pub struct TerminalCounts {
    pub processed: i32,
    pub successful: i32,
    pub failed: i32,
    pub total_bytes: i64,
}

pub async fn record_completed(
    conn: &mut PgConnection,
    cfg: &EngineConfig,
    job: &CrawlJob,
    seq: i64,
    counts: &TerminalCounts,
) -> Result<(), AppError> {
    jobs::mark_completed(
        conn,
        job.id,
        job.version,
        seq,
        counts.processed,
        counts.successful,
        counts.failed,
        counts.total_bytes,
    )
    .await?;
    outbox::enqueue(
        conn,
        topics::CRAWL_EVENTS,
        event_types::JOB_COMPLETED,
        job.id,
        state_payload(
            job,
            json!({
                "urls_processed": counts.processed,
                "urls_successful": counts.successful,
                "urls_failed": counts.failed,
                "total_bytes": counts.total_bytes,
            }),
        ),
        cfg.outbox_max_retries,
    )
    .await?;
    info!(job_id = %job.id, "job completed");
    Ok(())
}

/// Assigned/Running → Failed. Schedules the next retry while attempts
/// remain; an exhausted job gives back its unprocessed units.
pub async fn record_failed(
    conn: &mut PgConnection,
    cfg: &EngineConfig,
    job: &CrawlJob,
    error: &str,
    processed_hint: Option<i32>,
) -> Result<(), AppError> {
    let retries_left = job.retry_count < job.max_retries;
    let retry_at = if retries_left {
        Some(next_retry_at(cfg, job.retry_count + 1, Utc::now()))
    } else {
        None
    };

    jobs::mark_failed(conn, job.id, job.version, error, retry_at).await?;

    if !retries_left {
        let processed = processed_hint.unwrap_or(job.urls_processed) as i64;
        let unprocessed = (job.urls.len() as i64 - processed).max(0);
        quota::refund(conn, job.id, unprocessed).await?;
    }

    outbox::enqueue(
        conn,
        topics::CRAWL_EVENTS,
        event_types::JOB_FAILED,
        job.id,
        state_payload(
            job,
            json!({ "error": error, "next_retry_at": retry_at, "final": !retries_left }),
        ),
        cfg.outbox_max_retries,
    )
    .await?;
    Ok(())
}

/// Pending/Assigned/Running → Cancelled, refunding whatever was never
/// handed to a worker.
pub async fn record_cancelled(
    conn: &mut PgConnection,
    cfg: &EngineConfig,
    job: &CrawlJob,
    processed_hint: Option<i32>,
) -> Result<(), AppError> {
    jobs::mark_cancelled(conn, job.id, job.version).await?;

    let processed = processed_hint.unwrap_or(job.urls_processed) as i64;
    let unprocessed = (job.urls.len() as i64 - processed).max(0);
    quota::refund(conn, job.id, unprocessed).await?;

    outbox::enqueue(
        conn,
        topics::CRAWL_EVENTS,
        event_types::JOB_CANCELLED,
        job.id,
        state_payload(job, json!({ "refunded_units": unprocessed })),
        cfg.outbox_max_retries,
    )
    .await?;
    info!(job_id = %job.id, refunded = unprocessed, "job cancelled");
    Ok(())
}

/// Failed → Pending (scheduler) or orphaned Assigned/Running → Pending
/// (health loop); both requeue paths share the outbox row.
pub async fn record_requeued(
    conn: &mut PgConnection,
    cfg: &EngineConfig,
    job: &CrawlJob,
    reason: &str,
) -> Result<(), AppError> {
    outbox::enqueue(
        conn,
        topics::CRAWL_EVENTS,
        event_types::JOB_RETRIED,
        job.id,
        state_payload(job, json!({ "reason": reason })),
        cfg.outbox_max_retries,
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> EngineConfig {
        EngineConfig {
            dispatch_interval_secs: 10,
            scheduler_interval_secs: 30,
            health_interval_secs: 120,
            agent_timeout_secs: 600,
            job_timeout_secs: 1800,
            dispatch_batch_size: 20,
            outbox_batch_size: 50,
            outbox_max_retries: 3,
            job_max_retries: 3,
            retry_base_minutes: 2,
            retry_cap_minutes: 128,
            retry_floor_minutes: 5,
            cancel_grace_secs: 30,
            autoscale_window_secs: 300,
            agent_hourly_cost: 0.5,
        }
    }

    #[test]
    fn guards_match_the_state_machine() {
        use JobStatus::*;
        assert!(transition_allowed(Pending, Assigned));
        assert!(transition_allowed(Assigned, Running));
        assert!(transition_allowed(Running, Completed));
        assert!(transition_allowed(Running, Failed));
        assert!(transition_allowed(Failed, Pending));
        assert!(transition_allowed(Running, Cancelled));

        assert!(!transition_allowed(Pending, Running));
        assert!(!transition_allowed(Completed, Failed));
        assert!(!transition_allowed(Cancelled, Running));
        assert!(!transition_allowed(Cancelled, Completed));
        assert!(!transition_allowed(Failed, Completed));
    }

    #[test]
    fn first_retry_is_floor_plus_base() {
        // retryCount=1 -> 5 + 2^1 minutes
        assert_eq!(retry_backoff(&cfg(), 1), Duration::minutes(7));
        assert_eq!(retry_backoff(&cfg(), 2), Duration::minutes(9));
        assert_eq!(retry_backoff(&cfg(), 3), Duration::minutes(13));
    }

    #[test]
    fn backoff_is_capped() {
        // 2^10 = 1024 minutes, capped at 128, plus the 5 minute floor
        assert_eq!(retry_backoff(&cfg(), 10), Duration::minutes(133));
        // Attempt numbers below 1 are clamped rather than collapsing to 1 minute
        assert_eq!(retry_backoff(&cfg(), 0), Duration::minutes(7));
    }
}
