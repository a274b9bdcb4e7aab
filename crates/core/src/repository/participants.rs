use crate::models::{Participant, ParticipantRole};
use crate::AppError;
use sqlx::PgConnection;
use uuid::Uuid;

pub async fn insert(
    conn: &mut PgConnection,
    job_id: Uuid,
    user_id: Uuid,
    role: ParticipantRole,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO participants (job_id, user_id, role)
        VALUES ($1, $2, $3)
        ON CONFLICT (job_id, user_id) DO NOTHING
        "#,
    )
    .bind(job_id)
    .bind(user_id)
    .bind(role)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn role_for(
    conn: &mut PgConnection,
    job_id: Uuid,
    user_id: Uuid,
) -> Result<Option<ParticipantRole>, AppError> {
    let role: Option<(ParticipantRole,)> =
        sqlx::query_as("SELECT role FROM participants WHERE job_id = $1 AND user_id = $2")
            .bind(job_id)
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await?;

    Ok(role.map(|(r,)| r))
}

pub async fn list_for_job(
    conn: &mut PgConnection,
    job_id: Uuid,
) -> Result<Vec<Participant>, AppError> {
    let participants = sqlx::query_as::<_, Participant>(
        "SELECT * FROM participants WHERE job_id = $1 ORDER BY created_at ASC",
    )
    .bind(job_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(participants)
}

pub async fn touch_viewed(
    conn: &mut PgConnection,
    job_id: Uuid,
    user_id: Uuid,
) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE participants SET last_viewed_at = NOW() WHERE job_id = $1 AND user_id = $2",
    )
    .bind(job_id)
    .bind(user_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}
