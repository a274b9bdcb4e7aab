use crawlhub_core::cache::{CacheKeys, CacheLayer};
use crawlhub_core::repository::{agents, groups, jobs, participants, quota, templates};
use crawlhub_core::{
    AccessLevel, AppError, CrawlJob, EngineConfig, Identity, JobPriority, NewCrawlJob,
    ParticipantRole, QuotaConfig, RequestedWorkerKind, SubmitJobRequest, Template, WorkerKind,
};
use regex::Regex;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

use crate::lifecycle;
use crate::policy::{self, DomainPolicy, DomainVerdict};
use crate::pool::AgentPool;
use crate::quota::QuotaLedger;

/// Policy & admission gate: everything that must hold before a job row and
/// its quota debit are committed together.
#[derive(Clone)]
pub struct AdmissionService<C: CacheLayer> {
    db: PgPool,
    cache: Arc<C>,
    ledger: Arc<QuotaLedger<C>>,
    pool: Arc<AgentPool>,
    domain_policy: DomainPolicy,
    engine_cfg: EngineConfig,
    quota_cfg: QuotaConfig,
}

impl<C: CacheLayer> AdmissionService<C> {
    pub fn new(
        db: PgPool,
        cache: Arc<C>,
        ledger: Arc<QuotaLedger<C>>,
        pool: Arc<AgentPool>,
        domain_policy: DomainPolicy,
        engine_cfg: EngineConfig,
        quota_cfg: QuotaConfig,
    ) -> Self {
        Self {
            db,
            cache,
            ledger,
            pool,
            domain_policy,
            engine_cfg,
            quota_cfg,
        }
    }

    /// Admit a submission or return a structured rejection. On success a
    /// Pending job, its participants, the quota debit and the submission
    /// outbox row have all committed in one transaction.
    pub async fn admit(
        &self,
        identity: &Identity,
        request: SubmitJobRequest,
    ) -> Result<CrawlJob, AppError> {
        self.check_submission_rate(identity).await?;

        if request.urls.is_empty() {
            return Err(AppError::PolicyViolation(
                "at least one URL is required".to_string(),
            ));
        }
        if request.prompt.trim().is_empty() {
            return Err(AppError::PolicyViolation("prompt is required".to_string()));
        }

        let urls = self.normalize_and_screen(identity, &request.urls)?;
        let worker_kind = self.elect_kind(identity, &request, &urls)?;
        let template = self.match_template(&request, &urls).await?;
        let navigation_plan = self.resolve_navigation_plan(&request).await?;
        self.check_capacity(identity, worker_kind).await?;

        let units = urls.len() as i64;
        // Fast-path read so the common rejection carries limit/used detail
        // without opening the write transaction.
        let snapshot = self.ledger.snapshot(identity.user_id).await?;
        if snapshot.remaining() < units {
            return Err(AppError::QuotaExceeded {
                limit: snapshot.quota_limit,
                used: snapshot.quota_used,
                reset_at: snapshot.reset_at,
            });
        }

        let access_level = request.access_level.unwrap_or(AccessLevel::Private);
        let new_job = NewCrawlJob {
            user_id: identity.user_id,
            assignment_id: request.assignment_id,
            group_id: request.group_id,
            conversation_id: request.conversation_id,
            urls: urls.iter().map(|u| u.to_string()).collect(),
            prompt: request.prompt.clone(),
            max_pages: request.max_pages,
            worker_kind,
            priority: request.priority.unwrap_or(JobPriority::Normal),
            access_level,
            template_id: template.as_ref().map(|t| t.id),
            extraction_strategy: template.map(|t| t.extraction),
            navigation_plan,
            max_retries: self.engine_cfg.job_max_retries,
        };

        let mut tx = self.db.begin().await?;
        let job = jobs::insert(&mut tx, &new_job).await?;

        quota::ensure_snapshot(&mut tx, identity.user_id, self.quota_cfg.default_limit).await?;
        let reserved = quota::reserve(&mut tx, identity.user_id, job.id, units).await?;

        participants::insert(&mut tx, job.id, identity.user_id, ParticipantRole::Owner).await?;
        if matches!(access_level, AccessLevel::Group | AccessLevel::Assignment) {
            if let Some(group_id) = job.group_id {
                for member in groups::members_of(&mut tx, group_id).await? {
                    if member.user_id != identity.user_id {
                        participants::insert(
                            &mut tx,
                            job.id,
                            member.user_id,
                            ParticipantRole::Collaborator,
                        )
                        .await?;
                    }
                }
            }
        }

        lifecycle::record_submitted(&mut tx, &self.engine_cfg, &job).await?;
        tx.commit().await?;

        // Mirror the committed debit; the cache is never written first.
        if let crawlhub_core::repository::quota::ReserveOutcome::Reserved(snapshot) = reserved {
            self.ledger.mirror(&snapshot).await;
        }

        info!(
            job_id = %job.id,
            user_id = %identity.user_id,
            urls = units,
            kind = ?worker_kind,
            "job admitted"
        );
        Ok(job)
    }

    async fn check_submission_rate(&self, identity: &Identity) -> Result<(), AppError> {
        let key = CacheKeys::submission_rate(identity.user_id);
        match self
            .cache
            .incr(&key, 1, Some(Duration::from_secs(120)))
            .await
        {
            Ok(count) if count > self.quota_cfg.submissions_per_minute => {
                Err(AppError::TooManyRequests)
            }
            Ok(_) => Ok(()),
            Err(e) => {
                // A broken cache must not block admission; the quota ledger
                // still gates the durable path.
                warn!("submission rate check unavailable: {}", e);
                Ok(())
            }
        }
    }

    fn normalize_and_screen(
        &self,
        identity: &Identity,
        raw_urls: &[String],
    ) -> Result<Vec<Url>, AppError> {
        let mut urls = Vec::with_capacity(raw_urls.len());
        for raw in raw_urls {
            let url = policy::normalize_url(raw)?;
            let host = url.host_str().unwrap_or_default();
            match self.domain_policy.verdict(host) {
                DomainVerdict::Allow => {}
                DomainVerdict::Block => {
                    return Err(AppError::PolicyViolation(format!(
                        "domain '{}' is blocked",
                        host
                    )));
                }
                DomainVerdict::Restricted(required) => {
                    if identity.tier < required && !identity.is_admin() {
                        return Err(AppError::PolicyViolation(format!(
                            "domain '{}' requires the {:?} tier",
                            host, required
                        )));
                    }
                }
            }
            urls.push(url);
        }
        Ok(urls)
    }

    fn elect_kind(
        &self,
        _identity: &Identity,
        request: &SubmitJobRequest,
        urls: &[Url],
    ) -> Result<WorkerKind, AppError> {
        let kind = match request.worker_kind {
            Some(RequestedWorkerKind::HttpClient) => WorkerKind::HttpClient,
            Some(RequestedWorkerKind::HeadlessBrowser) => WorkerKind::HeadlessBrowser,
            Some(RequestedWorkerKind::MobileBridge) => WorkerKind::MobileBridge,
            Some(RequestedWorkerKind::Intelligent) => WorkerKind::Intelligent,
            Some(RequestedWorkerKind::Auto) | None => policy::elect_worker_kind(urls),
        };
        Ok(kind)
    }

    /// Attach the newest active template whose domain pattern matches one of
    /// the job's hosts, unless the caller pinned one explicitly.
    async fn match_template(
        &self,
        request: &SubmitJobRequest,
        urls: &[Url],
    ) -> Result<Option<Template>, AppError> {
        let mut conn = self.db.acquire().await?;

        if let Some(template_id) = request.template_id {
            let template = templates::get_template(&mut conn, template_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("template {}", template_id)))?;
            return Ok(Some(template));
        }

        let candidates = templates::active_templates(&mut conn).await?;
        for template in candidates {
            let pattern = match Regex::new(&template.domain_pattern) {
                Ok(pattern) => pattern,
                Err(e) => {
                    warn!(template = %template.name, "invalid domain pattern: {}", e);
                    continue;
                }
            };
            let matched = urls
                .iter()
                .filter_map(|u| u.host_str())
                .any(|host| pattern.is_match(host));
            if matched {
                return Ok(Some(template));
            }
        }
        Ok(None)
    }

    /// Copy the referenced navigation strategy's plan onto the job, so the
    /// worker never needs a second lookup.
    async fn resolve_navigation_plan(
        &self,
        request: &SubmitJobRequest,
    ) -> Result<Option<serde_json::Value>, AppError> {
        let Some(strategy_id) = request.navigation_strategy_id else {
            return Ok(None);
        };
        let mut conn = self.db.acquire().await?;
        let strategy = templates::get_navigation_strategy(&mut conn, strategy_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("navigation strategy {}", strategy_id)))?;
        Ok(Some(strategy.plan))
    }

    /// Reject up front when nothing could ever run the job: zero live slots
    /// for the kind and the auto-scaler paused for cost.
    async fn check_capacity(&self, identity: &Identity, kind: WorkerKind) -> Result<(), AppError> {
        let mut conn = self.db.acquire().await?;
        let capacity = agents::live_capacity_for_kind(&mut conn, kind).await?;
        drop(conn);

        if capacity == 0 && self.pool.is_paused(identity.user_id, kind).await {
            return Err(AppError::CapacityExhausted(format!(
                "no live {:?} agents and scaling is paused",
                kind
            )));
        }
        Ok(())
    }
}
