use chrono::{DateTime, Duration as ChronoDuration, Utc};
use crawlhub_core::cache::{CacheKeys, CacheLayer};
use crawlhub_core::repository::quota;
use crawlhub_core::{AppError, QuotaConfig, QuotaSnapshot};
use serde::Deserialize;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Shape of the authoritative quota record served by the user service.
#[derive(Debug, Deserialize)]
struct UpstreamQuota {
    limit: i64,
    reset_at: Option<DateTime<Utc>>,
}

/// Per-user ledger of remaining crawl units. Reads are cache-accelerated;
/// every write goes to Postgres first and the mirror is refreshed only
/// after the transaction commits.
#[derive(Clone)]
pub struct QuotaLedger<C: CacheLayer> {
    db: PgPool,
    cache: Arc<C>,
    http: reqwest::Client,
    cfg: QuotaConfig,
}

impl<C: CacheLayer> QuotaLedger<C> {
    pub fn new(db: PgPool, cache: Arc<C>, cfg: QuotaConfig) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.user_service_timeout))
            .build()?;
        Ok(Self {
            db,
            cache,
            http,
            cfg,
        })
    }

    fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cfg.cache_ttl_secs)
    }

    /// Current snapshot for the user, creating the row on first contact and
    /// lazily resyncing from upstream once it goes stale.
    pub async fn snapshot(&self, user_id: Uuid) -> Result<QuotaSnapshot, AppError> {
        let key = CacheKeys::quota_snapshot(user_id);
        match self.cache.get::<QuotaSnapshot>(&key).await {
            Ok(Some(snapshot)) if !self.is_stale(&snapshot) => return Ok(snapshot),
            Ok(_) => {}
            Err(e) => warn!("Quota cache read failed for {}: {}", user_id, e),
        }

        let mut conn = self.db.acquire().await?;
        let mut snapshot =
            quota::ensure_snapshot(&mut conn, user_id, self.cfg.default_limit).await?;
        drop(conn);

        if self.is_stale(&snapshot) {
            match self.sync_from_upstream(user_id).await {
                Ok(fresh) => snapshot = fresh,
                Err(e) => warn!("Quota upstream sync failed for {}: {}", user_id, e),
            }
        }

        self.mirror(&snapshot).await;
        Ok(snapshot)
    }

    fn is_stale(&self, snapshot: &QuotaSnapshot) -> bool {
        if snapshot.override_active {
            // Overrides are sticky until cleared; never resynced over.
            return false;
        }
        let horizon = Utc::now() - ChronoDuration::seconds(self.cfg.cache_ttl_secs as i64);
        snapshot.synced_at.map(|t| t < horizon).unwrap_or(true)
    }

    /// Does the user have at least `units` remaining right now?
    pub async fn has_quota(&self, user_id: Uuid, units: i64) -> Result<bool, AppError> {
        let snapshot = self.snapshot(user_id).await?;
        Ok(snapshot.remaining() >= units)
    }

    /// Pull the authoritative limit and reset date from the user service and
    /// reconcile the local row, honoring the sticky override flag.
    pub async fn sync_from_upstream(&self, user_id: Uuid) -> Result<QuotaSnapshot, AppError> {
        let mut conn = self.db.acquire().await?;
        if let Some(existing) = quota::get_snapshot(&mut conn, user_id).await? {
            if existing.override_active {
                debug!("Quota override active for {}, skipping upstream sync", user_id);
                return Ok(existing);
            }
        }

        let url = format!(
            "{}/internal/users/{}/crawl-quota",
            self.cfg.user_service_url.trim_end_matches('/'),
            user_id
        );
        let upstream: UpstreamQuota = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let snapshot =
            quota::apply_upstream(&mut conn, user_id, upstream.limit, upstream.reset_at).await?;
        drop(conn);

        self.mirror(&snapshot).await;
        debug!(
            "Quota synced for {}: {}/{}",
            user_id, snapshot.quota_used, snapshot.quota_limit
        );
        Ok(snapshot)
    }

    /// Refund units to a job's reservation outside any caller transaction.
    pub async fn refund(&self, user_id: Uuid, job_id: Uuid, units: i64, reason: &str) -> Result<i64, AppError> {
        let mut tx = self.db.begin().await?;
        let credited = quota::refund(&mut tx, job_id, units).await?;
        tx.commit().await?;

        if credited > 0 {
            debug!(
                "Refunded {} quota units to {} for job {} ({})",
                credited, user_id, job_id, reason
            );
            self.invalidate(user_id).await;
        }
        Ok(credited)
    }

    /// Write-through mirror update; errors are logged and swallowed because
    /// the durable store already holds the truth.
    pub async fn mirror(&self, snapshot: &QuotaSnapshot) {
        let key = CacheKeys::quota_snapshot(snapshot.user_id);
        if let Err(e) = self
            .cache
            .set(&key, snapshot, Some(self.cache_ttl()))
            .await
        {
            warn!("Quota cache write failed for {}: {}", snapshot.user_id, e);
        }
    }

    pub async fn invalidate(&self, user_id: Uuid) {
        let key = CacheKeys::quota_snapshot(user_id);
        if let Err(e) = self.cache.delete(&key).await {
            warn!("Quota cache invalidation failed for {}: {}", user_id, e);
        }
    }

    /// Clear a sticky override and pull fresh upstream numbers.
    pub async fn clear_override(&self, user_id: Uuid) -> Result<QuotaSnapshot, AppError> {
        let mut conn = self.db.acquire().await?;
        quota::clear_override(&mut conn, user_id).await?;
        drop(conn);
        self.invalidate(user_id).await;
        self.sync_from_upstream(user_id).await
    }
}
