use crate::models::*;
use crate::AppError;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

/// Maps a zero-row optimistic update to a `Conflict` the caller can retry.
fn ensure_updated(rows: u64, what: &str) -> Result<(), AppError> {
    if rows == 0 {
        return Err(AppError::Conflict(format!(
            "stale write rejected for {}",
            what
        )));
    }
    Ok(())
}

pub async fn insert(conn: &mut PgConnection, new: &NewCrawlJob) -> Result<CrawlJob, AppError> {
    let job = sqlx::query_as::<_, CrawlJob>(
        r#"
        INSERT INTO crawl_jobs (
            user_id, assignment_id, group_id, conversation_id, urls, prompt,
            max_pages, worker_kind, priority, access_level, template_id,
            extraction_strategy, navigation_plan, max_retries
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        RETURNING *
        "#,
    )
    .bind(new.user_id)
    .bind(new.assignment_id)
    .bind(new.group_id)
    .bind(new.conversation_id)
    .bind(&new.urls)
    .bind(&new.prompt)
    .bind(new.max_pages)
    .bind(new.worker_kind)
    .bind(new.priority)
    .bind(new.access_level)
    .bind(new.template_id)
    .bind(&new.extraction_strategy)
    .bind(&new.navigation_plan)
    .bind(new.max_retries)
    .fetch_one(&mut *conn)
    .await?;

    Ok(job)
}

pub async fn get(conn: &mut PgConnection, job_id: Uuid) -> Result<Option<CrawlJob>, AppError> {
    let job = sqlx::query_as::<_, CrawlJob>(
        "SELECT * FROM crawl_jobs WHERE id = $1 AND deleted_at IS NULL",
    )
    .bind(job_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(job)
}

/// Row-locked read for state transitions; every mutation re-reads under the
/// lock so concurrent writers serialize per job.
pub async fn get_for_update(
    conn: &mut PgConnection,
    job_id: Uuid,
) -> Result<Option<CrawlJob>, AppError> {
    let job = sqlx::query_as::<_, CrawlJob>(
        "SELECT * FROM crawl_jobs WHERE id = $1 AND deleted_at IS NULL FOR UPDATE",
    )
    .bind(job_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(job)
}

pub async fn list_by_user(
    conn: &mut PgConnection,
    user_id: Uuid,
    limit: i64,
    offset: i64,
) -> Result<Vec<CrawlJob>, AppError> {
    let jobs = sqlx::query_as::<_, CrawlJob>(
        r#"
        SELECT * FROM crawl_jobs
        WHERE user_id = $1 AND deleted_at IS NULL
        ORDER BY created_at DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(&mut *conn)
    .await?;

    Ok(jobs)
}

/// Claim a dispatch batch. SKIP LOCKED keeps concurrent dispatcher ticks
/// from double-assigning the same job.
pub async fn claim_due_pending(
    conn: &mut PgConnection,
    limit: i64,
) -> Result<Vec<CrawlJob>, AppError> {
    let jobs = sqlx::query_as::<_, CrawlJob>(
        r#"
        SELECT * FROM crawl_jobs
        WHERE status = 'pending' AND deleted_at IS NULL
        ORDER BY priority DESC, created_at ASC
        LIMIT $1
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;

    Ok(jobs)
}

pub async fn mark_assigned(
    conn: &mut PgConnection,
    job_id: Uuid,
    version: i32,
    agent_id: Uuid,
) -> Result<(), AppError> {
    let rows = sqlx::query(
        r#"
        UPDATE crawl_jobs
        SET status = 'assigned', assigned_agent_id = $3,
            updated_at = NOW(), version = version + 1
        WHERE id = $1 AND version = $2 AND status = 'pending'
        "#,
    )
    .bind(job_id)
    .bind(version)
    .bind(agent_id)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    ensure_updated(rows, "job assignment")
}

/// Advance the dedup cursor and counters for one progress event. The first
/// progress event also promotes assigned → running and stamps `started_at`.
pub async fn apply_progress(
    conn: &mut PgConnection,
    job_id: Uuid,
    version: i32,
    seq: i64,
    processed: i32,
    successful: i32,
    failed: i32,
) -> Result<(), AppError> {
    let rows = sqlx::query(
        r#"
        UPDATE crawl_jobs
        SET status = 'running', started_at = COALESCE(started_at, NOW()),
            last_seen_seq = $3, urls_processed = $4, urls_successful = $5,
            urls_failed = $6, updated_at = NOW(), version = version + 1
        WHERE id = $1 AND version = $2 AND status IN ('assigned', 'running')
        "#,
    )
    .bind(job_id)
    .bind(version)
    .bind(seq)
    .bind(processed)
    .bind(successful)
    .bind(failed)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    ensure_updated(rows, "job progress")
}

/// Freeze aggregates and stamp the single terminal timestamp for a
/// completed job.
#[allow(clippy::too_many_arguments)]
pub async fn mark_completed(
    conn: &mut PgConnection,
    job_id: Uuid,
    version: i32,
    seq: i64,
    processed: i32,
    successful: i32,
    failed: i32,
    total_bytes: i64,
) -> Result<(), AppError> {
    let rows = sqlx::query(
        r#"
        UPDATE crawl_jobs
        SET status = 'completed', completed_at = NOW(), last_seen_seq = $3,
            urls_processed = $4, urls_successful = $5, urls_failed = $6,
            total_bytes = $7, assigned_agent_id = NULL,
            updated_at = NOW(), version = version + 1
        WHERE id = $1 AND version = $2 AND status IN ('assigned', 'running')
        "#,
    )
    .bind(job_id)
    .bind(version)
    .bind(seq)
    .bind(processed)
    .bind(successful)
    .bind(failed)
    .bind(total_bytes)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    ensure_updated(rows, "job completion")
}

/// Move an assigned/running job to failed. `next_retry_at` is set only when
/// retries remain; an exhausted job keeps it NULL and stays failed for good.
pub async fn mark_failed(
    conn: &mut PgConnection,
    job_id: Uuid,
    version: i32,
    error: &str,
    next_retry_at: Option<DateTime<Utc>>,
) -> Result<(), AppError> {
    let rows = sqlx::query(
        r#"
        UPDATE crawl_jobs
        SET status = 'failed', failed_at = NOW(), error_message = $3,
            next_retry_at = $4, assigned_agent_id = NULL,
            updated_at = NOW(), version = version + 1
        WHERE id = $1 AND version = $2 AND status IN ('assigned', 'running')
        "#,
    )
    .bind(job_id)
    .bind(version)
    .bind(error)
    .bind(next_retry_at)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    ensure_updated(rows, "job failure")
}

pub async fn mark_cancelled(
    conn: &mut PgConnection,
    job_id: Uuid,
    version: i32,
) -> Result<(), AppError> {
    let rows = sqlx::query(
        r#"
        UPDATE crawl_jobs
        SET status = 'cancelled', cancelled_at = NOW(), next_retry_at = NULL,
            assigned_agent_id = NULL, updated_at = NOW(), version = version + 1
        WHERE id = $1 AND version = $2 AND status IN ('pending', 'assigned', 'running')
        "#,
    )
    .bind(job_id)
    .bind(version)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    ensure_updated(rows, "job cancellation")
}

pub async fn set_cancel_requested(
    conn: &mut PgConnection,
    job_id: Uuid,
    version: i32,
) -> Result<(), AppError> {
    let rows = sqlx::query(
        r#"
        UPDATE crawl_jobs
        SET cancel_requested_at = NOW(), updated_at = NOW(), version = version + 1
        WHERE id = $1 AND version = $2 AND status = 'running'
        "#,
    )
    .bind(job_id)
    .bind(version)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    ensure_updated(rows, "cancel request")
}

/// Requeue failed jobs whose backoff has elapsed. Returns the jobs moved
/// back to pending so the caller can pair each with an outbox row.
pub async fn requeue_failed_due(conn: &mut PgConnection) -> Result<Vec<CrawlJob>, AppError> {
    let jobs = sqlx::query_as::<_, CrawlJob>(
        r#"
        UPDATE crawl_jobs
        SET status = 'pending', retry_count = retry_count + 1,
            next_retry_at = NULL, failed_at = NULL, error_message = NULL,
            updated_at = NOW(), version = version + 1
        WHERE status = 'failed' AND deleted_at IS NULL
          AND next_retry_at IS NOT NULL AND next_retry_at <= NOW()
          AND retry_count < max_retries
        RETURNING *
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    Ok(jobs)
}

/// Jobs stuck in assigned/running without any progress since the horizon.
pub async fn claim_timed_out(
    conn: &mut PgConnection,
    horizon_secs: i64,
) -> Result<Vec<CrawlJob>, AppError> {
    let jobs = sqlx::query_as::<_, CrawlJob>(
        r#"
        SELECT * FROM crawl_jobs
        WHERE status IN ('assigned', 'running') AND deleted_at IS NULL
          AND updated_at < NOW() - ($1 * interval '1 second')
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(horizon_secs)
    .fetch_all(&mut *conn)
    .await?;

    Ok(jobs)
}

/// Jobs bound to the given agents in a live state; claimed row-locked so the
/// health loop can repatriate them.
pub async fn claim_bound_to_agents(
    conn: &mut PgConnection,
    agent_ids: &[Uuid],
) -> Result<Vec<CrawlJob>, AppError> {
    let jobs = sqlx::query_as::<_, CrawlJob>(
        r#"
        SELECT * FROM crawl_jobs
        WHERE status IN ('assigned', 'running') AND deleted_at IS NULL
          AND assigned_agent_id = ANY($1)
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(agent_ids)
    .fetch_all(&mut *conn)
    .await?;

    Ok(jobs)
}

/// Put an orphaned job back on the queue, charging one retry.
pub async fn requeue_orphan(
    conn: &mut PgConnection,
    job_id: Uuid,
    version: i32,
) -> Result<(), AppError> {
    let rows = sqlx::query(
        r#"
        UPDATE crawl_jobs
        SET status = 'pending', retry_count = retry_count + 1,
            assigned_agent_id = NULL, next_retry_at = NULL,
            updated_at = NOW(), version = version + 1
        WHERE id = $1 AND version = $2 AND status IN ('assigned', 'running')
          AND retry_count < max_retries
        "#,
    )
    .bind(job_id)
    .bind(version)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    ensure_updated(rows, "job requeue")
}

// Crawl results are insert-only; rows exist only once the job has run.

pub async fn insert_result(
    conn: &mut PgConnection,
    new: &NewCrawlResult,
) -> Result<CrawlResult, AppError> {
    let result = sqlx::query_as::<_, CrawlResult>(
        r#"
        INSERT INTO crawl_results (job_id, url, success, http_status, content_size, content_hash, extracted, error)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING *
        "#,
    )
    .bind(new.job_id)
    .bind(&new.url)
    .bind(new.success)
    .bind(new.http_status)
    .bind(new.content_size)
    .bind(&new.content_hash)
    .bind(&new.extracted)
    .bind(&new.error)
    .fetch_one(&mut *conn)
    .await?;

    Ok(result)
}

pub async fn results_for_job(
    conn: &mut PgConnection,
    job_id: Uuid,
    limit: i64,
) -> Result<Vec<CrawlResult>, AppError> {
    let results = sqlx::query_as::<_, CrawlResult>(
        "SELECT * FROM crawl_results WHERE job_id = $1 ORDER BY created_at ASC LIMIT $2",
    )
    .bind(job_id)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;

    Ok(results)
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ResultCounts {
    pub total: i64,
    pub successful: i64,
    pub failed: i64,
    pub total_bytes: i64,
}

pub async fn result_counts(
    conn: &mut PgConnection,
    job_id: Uuid,
) -> Result<ResultCounts, AppError> {
    let counts = sqlx::query_as::<_, ResultCounts>(
        r#"
        SELECT COUNT(*) AS total,
               COUNT(*) FILTER (WHERE success) AS successful,
               COUNT(*) FILTER (WHERE NOT success) AS failed,
               COALESCE(SUM(content_size), 0)::BIGINT AS total_bytes
        FROM crawl_results WHERE job_id = $1
        "#,
    )
    .bind(job_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(counts)
}
