use crate::models::OutboxMessage;
use crate::AppError;
use sqlx::PgConnection;
use uuid::Uuid;

/// Enqueue an event in the same transaction as the state change it
/// describes; the bridge publishes it after commit.
pub async fn enqueue(
    conn: &mut PgConnection,
    topic: &str,
    event_type: &str,
    entity_id: Uuid,
    payload: serde_json::Value,
    max_retries: i32,
) -> Result<OutboxMessage, AppError> {
    let message = sqlx::query_as::<_, OutboxMessage>(
        r#"
        INSERT INTO outbox_messages (topic, event_type, entity_id, payload, max_retries)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING *
        "#,
    )
    .bind(topic)
    .bind(event_type)
    .bind(entity_id)
    .bind(payload)
    .bind(max_retries)
    .fetch_one(&mut *conn)
    .await?;

    Ok(message)
}

/// Claim a publishable batch, oldest first so per-entity order is kept.
pub async fn claim_due(
    conn: &mut PgConnection,
    batch_size: i64,
) -> Result<Vec<OutboxMessage>, AppError> {
    let messages = sqlx::query_as::<_, OutboxMessage>(
        r#"
        SELECT * FROM outbox_messages
        WHERE processed_at IS NULL AND dead_at IS NULL
          AND (next_retry_at IS NULL OR next_retry_at <= NOW())
        ORDER BY occurred_at ASC
        LIMIT $1
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(batch_size)
    .fetch_all(&mut *conn)
    .await?;

    Ok(messages)
}

pub async fn mark_processed(conn: &mut PgConnection, id: Uuid) -> Result<(), AppError> {
    sqlx::query("UPDATE outbox_messages SET processed_at = NOW() WHERE id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

/// Record a publish failure; the row dead-letters once retries run out.
pub async fn mark_failed(
    conn: &mut PgConnection,
    id: Uuid,
    error: &str,
    backoff_secs: i64,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE outbox_messages
        SET retry_count = retry_count + 1,
            last_error = $2,
            next_retry_at = NOW() + ($3 * interval '1 second'),
            dead_at = CASE WHEN retry_count + 1 >= max_retries THEN NOW() ELSE NULL END
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(error)
    .bind(backoff_secs)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Drop processed rows older than the retention horizon.
pub async fn prune_processed(
    conn: &mut PgConnection,
    retention_secs: i64,
) -> Result<u64, AppError> {
    let rows = sqlx::query(
        "DELETE FROM outbox_messages WHERE processed_at IS NOT NULL AND processed_at < NOW() - ($1 * interval '1 second')",
    )
    .bind(retention_secs)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    Ok(rows)
}
