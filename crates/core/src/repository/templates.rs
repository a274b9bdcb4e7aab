use crate::models::{NavigationStrategy, Template};
use crate::AppError;
use sqlx::PgConnection;
use uuid::Uuid;

/// Active templates, newest version of each name first, so the first domain
/// match is the one admission attaches.
pub async fn active_templates(conn: &mut PgConnection) -> Result<Vec<Template>, AppError> {
    let templates = sqlx::query_as::<_, Template>(
        "SELECT * FROM templates WHERE active ORDER BY name ASC, version DESC",
    )
    .fetch_all(&mut *conn)
    .await?;

    Ok(templates)
}

pub async fn get_template(
    conn: &mut PgConnection,
    template_id: Uuid,
) -> Result<Option<Template>, AppError> {
    let template =
        sqlx::query_as::<_, Template>("SELECT * FROM templates WHERE id = $1 AND active")
            .bind(template_id)
            .fetch_optional(&mut *conn)
            .await?;

    Ok(template)
}

pub async fn get_navigation_strategy(
    conn: &mut PgConnection,
    strategy_id: Uuid,
) -> Result<Option<NavigationStrategy>, AppError> {
    let strategy = sqlx::query_as::<_, NavigationStrategy>(
        "SELECT * FROM navigation_strategies WHERE id = $1 AND active",
    )
    .bind(strategy_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(strategy)
}
