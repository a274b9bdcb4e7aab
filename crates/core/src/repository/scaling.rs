use crate::models::ScalingPolicy;
use crate::AppError;
use sqlx::PgConnection;
use uuid::Uuid;

pub async fn enabled_policies(conn: &mut PgConnection) -> Result<Vec<ScalingPolicy>, AppError> {
    let policies = sqlx::query_as::<_, ScalingPolicy>(
        "SELECT * FROM scaling_policies WHERE auto_scaling_enabled ORDER BY user_id, worker_kind",
    )
    .fetch_all(&mut *conn)
    .await?;

    Ok(policies)
}

pub async fn touch_scale_up(conn: &mut PgConnection, policy_id: Uuid) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE scaling_policies SET last_scale_up_at = NOW(), updated_at = NOW() WHERE id = $1",
    )
    .bind(policy_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn touch_scale_down(conn: &mut PgConnection, policy_id: Uuid) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE scaling_policies SET last_scale_down_at = NOW(), updated_at = NOW() WHERE id = $1",
    )
    .bind(policy_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}
