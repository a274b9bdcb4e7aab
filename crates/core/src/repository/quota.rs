use crate::models::QuotaSnapshot;
use crate::AppError;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

pub async fn get_snapshot(
    conn: &mut PgConnection,
    user_id: Uuid,
) -> Result<Option<QuotaSnapshot>, AppError> {
    let snapshot =
        sqlx::query_as::<_, QuotaSnapshot>("SELECT * FROM quota_snapshots WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await?;

    Ok(snapshot)
}

/// Create the snapshot row if the user has never been seen. The default
/// source is replaced on the first upstream sync.
pub async fn ensure_snapshot(
    conn: &mut PgConnection,
    user_id: Uuid,
    default_limit: i64,
) -> Result<QuotaSnapshot, AppError> {
    let snapshot = sqlx::query_as::<_, QuotaSnapshot>(
        r#"
        INSERT INTO quota_snapshots (user_id, quota_limit, source)
        VALUES ($1, $2, 'default')
        ON CONFLICT (user_id) DO UPDATE SET updated_at = quota_snapshots.updated_at
        RETURNING *
        "#,
    )
    .bind(user_id)
    .bind(default_limit)
    .fetch_one(&mut *conn)
    .await?;

    Ok(snapshot)
}

/// Reconcile the local snapshot with the upstream limit. The limit never
/// drops below what is already used, keeping the ledger constraint intact.
pub async fn apply_upstream(
    conn: &mut PgConnection,
    user_id: Uuid,
    limit: i64,
    reset_at: Option<DateTime<Utc>>,
) -> Result<QuotaSnapshot, AppError> {
    let snapshot = sqlx::query_as::<_, QuotaSnapshot>(
        r#"
        INSERT INTO quota_snapshots (user_id, quota_limit, reset_at, synced_at, source)
        VALUES ($1, $2, $3, NOW(), 'upstream')
        ON CONFLICT (user_id) DO UPDATE
        SET quota_limit = GREATEST($2, quota_snapshots.quota_used),
            reset_at = $3,
            synced_at = NOW(),
            source = 'upstream',
            updated_at = NOW()
        RETURNING *
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .bind(reset_at)
    .fetch_one(&mut *conn)
    .await?;

    Ok(snapshot)
}

pub async fn set_override(
    conn: &mut PgConnection,
    user_id: Uuid,
    limit: i64,
) -> Result<QuotaSnapshot, AppError> {
    let snapshot = sqlx::query_as::<_, QuotaSnapshot>(
        r#"
        INSERT INTO quota_snapshots (user_id, quota_limit, source, override_active)
        VALUES ($1, $2, 'override', TRUE)
        ON CONFLICT (user_id) DO UPDATE
        SET quota_limit = GREATEST($2, quota_snapshots.quota_used),
            source = 'override',
            override_active = TRUE,
            updated_at = NOW()
        RETURNING *
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .fetch_one(&mut *conn)
    .await?;

    Ok(snapshot)
}

pub async fn clear_override(conn: &mut PgConnection, user_id: Uuid) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE quota_snapshots SET override_active = FALSE, updated_at = NOW() WHERE user_id = $1",
    )
    .bind(user_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Outcome of a reservation attempt inside the admission transaction.
#[derive(Debug)]
pub enum ReserveOutcome {
    Reserved(QuotaSnapshot),
    /// The reservation key was already present; the debit happened earlier.
    AlreadyReserved,
}

/// Atomic compare-and-decrement, idempotent on the job id. The conditional
/// UPDATE is the admission gate: zero rows means insufficient units.
pub async fn reserve(
    conn: &mut PgConnection,
    user_id: Uuid,
    job_id: Uuid,
    units: i64,
) -> Result<ReserveOutcome, AppError> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO quota_reservations (job_id, user_id, units)
        VALUES ($1, $2, $3)
        ON CONFLICT (job_id) DO NOTHING
        "#,
    )
    .bind(job_id)
    .bind(user_id)
    .bind(units)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if inserted == 0 {
        return Ok(ReserveOutcome::AlreadyReserved);
    }

    let snapshot = sqlx::query_as::<_, QuotaSnapshot>(
        r#"
        UPDATE quota_snapshots
        SET quota_used = quota_used + $2, updated_at = NOW()
        WHERE user_id = $1 AND quota_used + $2 <= quota_limit
        RETURNING *
        "#,
    )
    .bind(user_id)
    .bind(units)
    .fetch_optional(&mut *conn)
    .await?;

    match snapshot {
        Some(snapshot) => Ok(ReserveOutcome::Reserved(snapshot)),
        None => {
            let current = get_snapshot(conn, user_id).await?;
            let (limit, used, reset_at) = current
                .map(|s| (s.quota_limit, s.quota_used, s.reset_at))
                .unwrap_or((0, 0, None));
            Err(AppError::QuotaExceeded {
                limit,
                used,
                reset_at,
            })
        }
    }
}

/// Return units to the user, capped at what the reservation still holds so
/// a refund can never overshoot the original debit.
pub async fn refund(
    conn: &mut PgConnection,
    job_id: Uuid,
    units: i64,
) -> Result<i64, AppError> {
    if units <= 0 {
        return Ok(0);
    }

    let reservation: Option<(Uuid, i64, i64)> = sqlx::query_as(
        "SELECT user_id, units, refunded_units FROM quota_reservations WHERE job_id = $1 FOR UPDATE",
    )
    .bind(job_id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some((user_id, reserved, already_refunded)) = reservation else {
        return Ok(0);
    };

    let credited = units.min(reserved - already_refunded);
    if credited <= 0 {
        return Ok(0);
    }

    sqlx::query(
        "UPDATE quota_reservations SET refunded_units = refunded_units + $2 WHERE job_id = $1",
    )
    .bind(job_id)
    .bind(credited)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        UPDATE quota_snapshots
        SET quota_used = GREATEST(quota_used - $2, 0), updated_at = NOW()
        WHERE user_id = $1
        "#,
    )
    .bind(user_id)
    .bind(credited)
    .execute(&mut *conn)
    .await?;

    Ok(credited)
}
