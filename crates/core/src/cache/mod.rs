use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub mod redis_cache;

pub use redis_cache::RedisCache;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Write-through cache mirror. Never authoritative for admission decisions
/// that commit quota; the durable store wins on any disagreement.
#[async_trait]
pub trait CacheLayer: Send + Sync + Clone {
    async fn get<T>(&self, key: &str) -> Result<Option<T>, CacheError>
    where
        T: serde::de::DeserializeOwned + Send;

    async fn set<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<(), CacheError>
    where
        T: serde::Serialize + Send + Sync;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Increment a numeric value; used for windowed rate-limit counters.
    async fn incr(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64, CacheError>;
}

/// Cache key utilities for consistent naming
pub struct CacheKeys;

impl CacheKeys {
    pub fn quota_snapshot(user_id: uuid::Uuid) -> String {
        format!("quota:user:{}", user_id)
    }

    pub fn job_summary(job_id: uuid::Uuid) -> String {
        format!("job:summary:{}", job_id)
    }

    /// One-minute submission windows per user.
    pub fn submission_rate(user_id: uuid::Uuid) -> String {
        let window = chrono::Utc::now().timestamp() / 60;
        format!("rate:submit:{}:{}", user_id, window)
    }

    /// Digest helper for keys built from variable-length input.
    pub fn digest(input: &str) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(input.trim().to_lowercase());
        format!("{:x}", hasher.finalize())[..16].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_and_short() {
        let a = CacheKeys::digest("https://example.test/path");
        let b = CacheKeys::digest("  HTTPS://EXAMPLE.TEST/PATH  ");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }
}
