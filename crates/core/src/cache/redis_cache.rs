use super::{CacheError, CacheLayer};
use crate::CacheConfig;
use async_trait::async_trait;
use bb8_redis::{bb8, redis::AsyncCommands, RedisConnectionManager};
use std::time::Duration;
use tracing::{debug, warn};

pub type RedisPool = bb8::Pool<RedisConnectionManager>;

/// Redis implementation of the CacheLayer trait
#[derive(Clone)]
pub struct RedisCache {
    pool: RedisPool,
    default_ttl: Duration,
}

impl RedisCache {
    pub async fn new(config: &CacheConfig) -> Result<Self, CacheError> {
        let manager = RedisConnectionManager::new(config.redis_url.clone())
            .map_err(|e| CacheError::Pool(format!("Failed to create Redis manager: {}", e)))?;

        let pool = bb8::Pool::builder()
            .max_size(config.max_connections)
            .connection_timeout(Duration::from_secs(config.connection_timeout))
            .build(manager)
            .await
            .map_err(|e| CacheError::Pool(format!("Failed to create connection pool: {}", e)))?;

        // Test the connection
        {
            let mut conn = pool
                .get()
                .await
                .map_err(|e| CacheError::Pool(format!("Failed to get connection: {}", e)))?;
            let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        }

        debug!(
            "Redis cache initialized with {} max connections",
            config.max_connections
        );

        Ok(Self {
            pool,
            default_ttl: Duration::from_secs(config.default_ttl),
        })
    }

    fn make_key(&self, key: &str) -> String {
        format!("crawlhub:{}", key)
    }
}

#[async_trait]
impl CacheLayer for RedisCache {
    async fn get<T>(&self, key: &str) -> Result<Option<T>, CacheError>
    where
        T: serde::de::DeserializeOwned + Send,
    {
        let cache_key = self.make_key(key);

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CacheError::Pool(format!("Failed to get connection: {}", e)))?;

        let data: Option<String> = conn.get(&cache_key).await?;

        match data {
            Some(json) => match serde_json::from_str::<T>(&json) {
                Ok(value) => {
                    debug!("Cache HIT for key: {}", key);
                    Ok(Some(value))
                }
                Err(e) => {
                    warn!("Cache deserialization error for key {}: {}", key, e);
                    // Drop the corrupted entry so the durable store repopulates it
                    let _: () = conn.del(&cache_key).await.unwrap_or(());
                    Err(CacheError::Serialization(e))
                }
            },
            None => {
                debug!("Cache MISS for key: {}", key);
                Ok(None)
            }
        }
    }

    async fn set<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<(), CacheError>
    where
        T: serde::Serialize + Send + Sync,
    {
        let cache_key = self.make_key(key);

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CacheError::Pool(format!("Failed to get connection: {}", e)))?;

        let json = serde_json::to_string(value)?;
        let ttl_seconds = ttl.unwrap_or(self.default_ttl).as_secs();

        let _: () = conn.set_ex(&cache_key, json, ttl_seconds).await?;

        debug!("Cache SET for key: {} with TTL {}s", key, ttl_seconds);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let cache_key = self.make_key(key);

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CacheError::Pool(format!("Failed to get connection: {}", e)))?;

        let deleted: i32 = conn.del(&cache_key).await?;
        if deleted > 0 {
            debug!("Cache DELETE for key: {}", key);
        }

        Ok(())
    }

    async fn incr(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64, CacheError> {
        let cache_key = self.make_key(key);

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CacheError::Pool(format!("Failed to get connection: {}", e)))?;

        let result: i64 = conn.incr(&cache_key, delta).await?;

        if result == delta {
            // New key: attach the window's expiry
            let ttl_seconds = ttl.unwrap_or(self.default_ttl).as_secs();
            let _: () = conn.expire(&cache_key, ttl_seconds as i64).await?;
        }

        Ok(result)
    }
}
