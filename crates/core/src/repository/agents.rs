use crate::models::*;
use crate::AppError;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

/// Register a worker instance, or revive a known one. Re-registering clears
/// any pending drain.
pub async fn register(conn: &mut PgConnection, reg: &RegisterAgent) -> Result<Agent, AppError> {
    let agent = sqlx::query_as::<_, Agent>(
        r#"
        INSERT INTO agents (instance_id, owner_user_id, worker_kind, endpoint, max_concurrent, auto_scaled)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (instance_id) DO UPDATE
        SET owner_user_id = EXCLUDED.owner_user_id,
            worker_kind = EXCLUDED.worker_kind,
            endpoint = EXCLUDED.endpoint,
            max_concurrent = EXCLUDED.max_concurrent,
            auto_scaled = EXCLUDED.auto_scaled,
            status = 'available',
            scheduled_for_removal_at = NULL,
            health_message = NULL,
            last_heartbeat = NOW(),
            updated_at = NOW()
        RETURNING *
        "#,
    )
    .bind(&reg.instance_id)
    .bind(reg.owner_user_id)
    .bind(reg.worker_kind)
    .bind(&reg.endpoint)
    .bind(reg.max_concurrent)
    .bind(reg.auto_scaled)
    .fetch_one(&mut *conn)
    .await?;

    Ok(agent)
}

pub async fn deregister(conn: &mut PgConnection, agent_id: Uuid) -> Result<(), AppError> {
    sqlx::query("UPDATE agents SET status = 'retired', updated_at = NOW() WHERE id = $1")
        .bind(agent_id)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

pub async fn get(conn: &mut PgConnection, agent_id: Uuid) -> Result<Option<Agent>, AppError> {
    let agent = sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE id = $1")
        .bind(agent_id)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(agent)
}

/// Record a heartbeat. A recovered agent comes back as available; draining
/// and retired agents keep their status.
pub async fn heartbeat(
    conn: &mut PgConnection,
    instance_id: &str,
    health_message: Option<&str>,
) -> Result<Option<Agent>, AppError> {
    let agent = sqlx::query_as::<_, Agent>(
        r#"
        UPDATE agents
        SET last_heartbeat = NOW(),
            health_message = $2,
            status = CASE WHEN status = 'unhealthy' THEN 'available'::agent_status ELSE status END,
            updated_at = NOW()
        WHERE instance_id = $1 AND status != 'retired'
        RETURNING *
        "#,
    )
    .bind(instance_id)
    .bind(health_message)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(agent)
}

/// Lowest load ratio wins; ties go to the least-recently assigned. Universal
/// agents match every kind. SKIP LOCKED so concurrent dispatches pick
/// different agents.
pub async fn pick_for_update(
    conn: &mut PgConnection,
    kind: WorkerKind,
) -> Result<Option<Agent>, AppError> {
    let agent = sqlx::query_as::<_, Agent>(
        r#"
        SELECT * FROM agents
        WHERE status = 'available'
          AND (worker_kind = $1 OR worker_kind = 'universal')
          AND current_job_count < max_concurrent
        ORDER BY current_job_count::float8 / GREATEST(max_concurrent, 1),
                 last_assigned_at ASC NULLS FIRST
        LIMIT 1
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(kind)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(agent)
}

/// Capacity is enforced here, inside the same transaction that assigns.
pub async fn reserve_slot(conn: &mut PgConnection, agent_id: Uuid) -> Result<(), AppError> {
    let rows = sqlx::query(
        r#"
        UPDATE agents
        SET current_job_count = current_job_count + 1,
            last_assigned_at = NOW(),
            status = CASE WHEN current_job_count + 1 >= max_concurrent
                          THEN 'busy'::agent_status ELSE status END,
            updated_at = NOW()
        WHERE id = $1 AND status = 'available' AND current_job_count < max_concurrent
        "#,
    )
    .bind(agent_id)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if rows == 0 {
        return Err(AppError::Conflict(format!(
            "agent {} no longer has a free slot",
            agent_id
        )));
    }
    Ok(())
}

/// Release a slot when a job leaves the agent, crediting its outcome
/// counters. `succeeded: None` releases without judging the job (requeues).
pub async fn release_slot(
    conn: &mut PgConnection,
    agent_id: Uuid,
    succeeded: Option<bool>,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE agents
        SET current_job_count = GREATEST(current_job_count - 1, 0),
            jobs_succeeded = jobs_succeeded + CASE WHEN $2 THEN 1 ELSE 0 END,
            jobs_failed = jobs_failed + CASE WHEN $3 THEN 1 ELSE 0 END,
            status = CASE WHEN status = 'busy' THEN 'available'::agent_status ELSE status END,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(agent_id)
    .bind(succeeded == Some(true))
    .bind(succeeded == Some(false))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Sweep agents whose heartbeat fell outside the window. Returns the newly
/// unhealthy agents so the caller can repatriate their jobs.
pub async fn mark_stale_unhealthy(
    conn: &mut PgConnection,
    window_secs: i64,
) -> Result<Vec<Agent>, AppError> {
    let agents = sqlx::query_as::<_, Agent>(
        r#"
        UPDATE agents
        SET status = 'unhealthy', health_message = 'heartbeat timeout', updated_at = NOW()
        WHERE status IN ('available', 'busy', 'draining')
          AND last_heartbeat < NOW() - ($1 * interval '1 second')
        RETURNING *
        "#,
    )
    .bind(window_secs)
    .fetch_all(&mut *conn)
    .await?;

    Ok(agents)
}

pub async fn mark_draining(
    conn: &mut PgConnection,
    agent_id: Uuid,
    remove_at: DateTime<Utc>,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE agents
        SET status = 'draining', scheduled_for_removal_at = $2, updated_at = NOW()
        WHERE id = $1 AND status IN ('available', 'busy')
        "#,
    )
    .bind(agent_id)
    .bind(remove_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Retire drained agents once their last job has left and the scheduled
/// removal time has passed.
pub async fn retire_drained(conn: &mut PgConnection) -> Result<Vec<Agent>, AppError> {
    let agents = sqlx::query_as::<_, Agent>(
        r#"
        UPDATE agents
        SET status = 'retired', updated_at = NOW()
        WHERE status = 'draining' AND current_job_count = 0
          AND scheduled_for_removal_at IS NOT NULL AND scheduled_for_removal_at <= NOW()
        RETURNING *
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    Ok(agents)
}

/// Drain candidate: the least-loaded auto-scaled agent of the fleet.
pub async fn least_loaded_auto_scaled(
    conn: &mut PgConnection,
    owner_user_id: Uuid,
    kind: WorkerKind,
) -> Result<Option<Agent>, AppError> {
    let agent = sqlx::query_as::<_, Agent>(
        r#"
        SELECT * FROM agents
        WHERE owner_user_id = $1 AND worker_kind = $2 AND auto_scaled
          AND status IN ('available', 'busy')
        ORDER BY current_job_count ASC
        LIMIT 1
        "#,
    )
    .bind(owner_user_id)
    .bind(kind)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(agent)
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FleetStats {
    pub live_agents: i64,
    pub auto_scaled_agents: i64,
    pub jobs_in_flight: i64,
    pub total_capacity: i64,
}

impl FleetStats {
    pub fn load(&self) -> f64 {
        if self.total_capacity <= 0 {
            return 0.0;
        }
        self.jobs_in_flight as f64 / self.total_capacity as f64
    }
}

/// Aggregate load for one (owner, kind) fleet; the auto-scaler samples this.
pub async fn fleet_stats(
    conn: &mut PgConnection,
    owner_user_id: Uuid,
    kind: WorkerKind,
) -> Result<FleetStats, AppError> {
    let stats = sqlx::query_as::<_, FleetStats>(
        r#"
        SELECT COUNT(*) AS live_agents,
               COUNT(*) FILTER (WHERE auto_scaled) AS auto_scaled_agents,
               COALESCE(SUM(current_job_count), 0) AS jobs_in_flight,
               COALESCE(SUM(max_concurrent), 0) AS total_capacity
        FROM agents
        WHERE owner_user_id = $1 AND worker_kind = $2
          AND status IN ('available', 'busy')
        "#,
    )
    .bind(owner_user_id)
    .bind(kind)
    .fetch_one(&mut *conn)
    .await?;

    Ok(stats)
}

/// Live slots for one kind, counting universal agents; admission consults
/// this before accepting work nothing could ever run.
pub async fn live_capacity_for_kind(
    conn: &mut PgConnection,
    kind: WorkerKind,
) -> Result<i64, AppError> {
    let (capacity,): (i64,) = sqlx::query_as(
        r#"
        SELECT COALESCE(SUM(max_concurrent), 0) FROM agents
        WHERE status IN ('available', 'busy')
          AND (worker_kind = $1 OR worker_kind = 'universal')
        "#,
    )
    .bind(kind)
    .fetch_one(&mut *conn)
    .await?;

    Ok(capacity)
}
