use crate::bus::BusError;
use crate::cache::CacheError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Event bus error: {0}")]
    Bus(#[from] BusError),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unauthenticated")]
    Unauthenticated,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Quota exceeded: {used}/{limit} units used")]
    QuotaExceeded {
        limit: i64,
        used: i64,
        reset_at: Option<DateTime<Utc>>,
    },

    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("No crawl capacity: {0}")]
    CapacityExhausted(String),

    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Too many requests")]
    TooManyRequests,

    #[error("Internal error [{correlation_id}]: {message}")]
    Internal {
        correlation_id: Uuid,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Wrap an unexpected failure with a correlation id that links the log
    /// line, the database row and the bus message it appears in.
    pub fn internal(message: impl Into<String>) -> Self {
        let correlation_id = Uuid::new_v4();
        let message = message.into();
        tracing::error!(%correlation_id, "internal error: {}", message);
        AppError::Internal {
            correlation_id,
            message,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::QuotaExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
            AppError::PolicyViolation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            AppError::CapacityExhausted(_) | AppError::WorkerUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Database(_) => "database_error",
            AppError::Migration(_) => "migration_error",
            AppError::Cache(_) => "cache_error",
            AppError::Bus(_) => "bus_error",
            AppError::Http(_) => "http_error",
            AppError::Json(_) => "json_error",
            AppError::Config(_) => "config_error",
            AppError::Unauthenticated => "unauthenticated",
            AppError::Forbidden(_) => "forbidden",
            AppError::NotFound(_) => "not_found",
            AppError::QuotaExceeded { .. } => "quota_exceeded",
            AppError::PolicyViolation(_) => "policy_violation",
            AppError::CapacityExhausted(_) => "capacity_exhausted",
            AppError::WorkerUnavailable(_) => "worker_unavailable",
            AppError::Timeout(_) => "timeout",
            AppError::Conflict(_) => "conflict",
            AppError::TooManyRequests => "too_many_requests",
            AppError::Internal { .. } => "internal_error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let request_id = match &self {
            AppError::Internal { correlation_id, .. } => *correlation_id,
            _ => Uuid::new_v4(),
        };

        let details = match &self {
            AppError::QuotaExceeded {
                limit,
                used,
                reset_at,
            } => json!({ "limit": limit, "used": used, "reset_at": reset_at }),
            _ => json!({}),
        };

        let body = Json(json!({
            "error": self.error_code(),
            "message": self.to_string(),
            "details": details,
            "request_id": request_id
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_exceeded_maps_to_payment_required() {
        let err = AppError::QuotaExceeded {
            limit: 5,
            used: 5,
            reset_at: None,
        };
        assert_eq!(err.status_code(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(err.error_code(), "quota_exceeded");
    }

    #[test]
    fn conflict_maps_to_409() {
        let err = AppError::Conflict("stale job version".into());
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }
}
