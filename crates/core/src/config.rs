use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub bus: BusConfig,
    pub engine: EngineConfig,
    pub quota: QuotaConfig,
    pub worker: WorkerClientConfig,
    pub policy: PolicyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout: u64,
    pub idle_timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub redis_url: String,
    pub max_connections: u32,
    pub connection_timeout: u64,
    pub default_ttl: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub redis_url: String,
}

/// Tick intervals and retry knobs for every background loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub dispatch_interval_secs: u64,
    pub scheduler_interval_secs: u64,
    pub health_interval_secs: u64,
    pub agent_timeout_secs: i64,
    pub job_timeout_secs: i64,
    pub dispatch_batch_size: i64,
    pub outbox_batch_size: i64,
    pub outbox_max_retries: i32,
    pub job_max_retries: i32,
    pub retry_base_minutes: u32,
    pub retry_cap_minutes: i64,
    pub retry_floor_minutes: i64,
    pub cancel_grace_secs: u64,
    pub autoscale_window_secs: u64,
    pub agent_hourly_cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub user_service_url: String,
    pub user_service_timeout: u64,
    pub cache_ttl_secs: u64,
    pub default_limit: i64,
    pub submissions_per_minute: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerClientConfig {
    pub request_timeout: u64,
    pub sync_crawl_deadline_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub blocked_domains: Vec<String>,
    pub restricted_domains: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, crate::AppError> {
        Ok(Self {
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .map_err(|_| crate::AppError::Config("DATABASE_URL is required".to_string()))?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 50),
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", 5),
                connect_timeout: parse_env("DATABASE_CONNECT_TIMEOUT", 30),
                idle_timeout: parse_env("DATABASE_IDLE_TIMEOUT", 600),
            },
            cache: CacheConfig {
                redis_url: env::var("APP_REDIS_URL")
                    .map_err(|_| crate::AppError::Config("APP_REDIS_URL is required".to_string()))?,
                max_connections: parse_env("REDIS_MAX_CONNECTIONS", 50),
                connection_timeout: parse_env("REDIS_CONNECTION_TIMEOUT", 5),
                default_ttl: parse_env("CACHE_TTL_DEFAULT", 3600),
            },
            bus: BusConfig {
                // The bus shares the cache instance unless pointed elsewhere.
                redis_url: env::var("BUS_REDIS_URL")
                    .or_else(|_| env::var("APP_REDIS_URL"))
                    .map_err(|_| crate::AppError::Config("BUS_REDIS_URL is required".to_string()))?,
            },
            engine: EngineConfig {
                dispatch_interval_secs: parse_env("DISPATCH_INTERVAL", 10),
                scheduler_interval_secs: parse_env("SCHEDULER_INTERVAL", 30),
                health_interval_secs: parse_env("HEALTH_INTERVAL", 120),
                agent_timeout_secs: parse_env("AGENT_TIMEOUT", 600),
                job_timeout_secs: parse_env("JOB_TIMEOUT", 1800),
                dispatch_batch_size: parse_env("DISPATCH_BATCH_SIZE", 20),
                outbox_batch_size: parse_env("OUTBOX_BATCH_SIZE", 50),
                outbox_max_retries: parse_env("OUTBOX_MAX_RETRIES", 3),
                job_max_retries: parse_env("JOB_MAX_RETRIES", 3),
                retry_base_minutes: parse_env("RETRY_BASE_MINUTES", 2),
                retry_cap_minutes: parse_env("RETRY_CAP_MINUTES", 128),
                retry_floor_minutes: parse_env("RETRY_FLOOR_MINUTES", 5),
                cancel_grace_secs: parse_env("CANCEL_GRACE_SECS", 30),
                autoscale_window_secs: parse_env("AUTOSCALE_WINDOW_SECS", 300),
                agent_hourly_cost: parse_env("AGENT_HOURLY_COST", 0.50),
            },
            quota: QuotaConfig {
                user_service_url: env::var("USER_SERVICE_URL")
                    .unwrap_or_else(|_| "http://localhost:8090".to_string()),
                user_service_timeout: parse_env("USER_SERVICE_TIMEOUT", 10),
                cache_ttl_secs: parse_env("QUOTA_CACHE_TTL", 3600),
                default_limit: parse_env("QUOTA_DEFAULT_LIMIT", 100),
                submissions_per_minute: parse_env("SUBMISSIONS_PER_MINUTE", 30),
            },
            worker: WorkerClientConfig {
                request_timeout: parse_env("WORKER_REQUEST_TIMEOUT", 30),
                sync_crawl_deadline_secs: parse_env("SYNC_CRAWL_DEADLINE", 120),
            },
            policy: PolicyConfig {
                blocked_domains: parse_domain_list("POLICY_BLOCKED_DOMAINS"),
                restricted_domains: parse_domain_list("POLICY_RESTRICTED_DOMAINS"),
            },
        })
    }
}

fn parse_env<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_domain_list(key: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_falls_back_to_default() {
        assert_eq!(parse_env("CRAWLHUB_TEST_UNSET_VAR", 42u64), 42);
    }

    #[test]
    fn domain_list_splits_and_normalizes() {
        std::env::set_var("CRAWLHUB_TEST_DOMAINS", "Evil.test, bad.example ,");
        let parsed = parse_domain_list("CRAWLHUB_TEST_DOMAINS");
        assert_eq!(parsed, vec!["evil.test".to_string(), "bad.example".to_string()]);
    }
}
