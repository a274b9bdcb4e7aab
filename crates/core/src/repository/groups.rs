use crate::models::GroupMember;
use crate::AppError;
use sqlx::PgConnection;
use uuid::Uuid;

pub async fn members_of(
    conn: &mut PgConnection,
    group_id: Uuid,
) -> Result<Vec<GroupMember>, AppError> {
    let members = sqlx::query_as::<_, GroupMember>(
        "SELECT * FROM group_members WHERE group_id = $1 ORDER BY joined_at ASC",
    )
    .bind(group_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(members)
}

pub async fn upsert_member(
    conn: &mut PgConnection,
    group_id: Uuid,
    user_id: Uuid,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO group_members (group_id, user_id)
        VALUES ($1, $2)
        ON CONFLICT (group_id, user_id) DO NOTHING
        "#,
    )
    .bind(group_id)
    .bind(user_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn remove_member(
    conn: &mut PgConnection,
    group_id: Uuid,
    user_id: Uuid,
) -> Result<(), AppError> {
    sqlx::query("DELETE FROM group_members WHERE group_id = $1 AND user_id = $2")
        .bind(group_id)
        .bind(user_id)
        .execute(&mut *conn)
        .await?;

    Ok(())
}
