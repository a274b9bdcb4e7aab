use crawlhub_core::bus::{topics, BusMessage, EventBus};
use crawlhub_core::cache::CacheLayer;
use crawlhub_core::events::{
    ClassroomEvent, ProgressEvent, ResultEvent, TerminalNotice, UserEvent, WorkerOutcome,
};
use crawlhub_core::repository::{agents, groups, jobs};
use crawlhub_core::{AppError, CrawlJob, EngineConfig, JobStatus, NewCrawlResult};
use sqlx::PgPool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::fanout::ProgressFanout;
use crate::lifecycle::{self, TerminalCounts};
use crate::quota::QuotaLedger;

/// Stale or duplicate deliveries are detected against the job's stored
/// cursor; redelivering any `(job_id, seq)` must leave state unchanged.
pub fn is_duplicate(last_seen_seq: i64, seq: i64) -> bool {
    seq <= last_seen_seq
}

/// Shared consumer for worker progress/result topics plus the classroom and
/// user event streams that feed the authorization mirror and quota sync.
pub struct BusConsumer<C: CacheLayer> {
    db: PgPool,
    cfg: EngineConfig,
    bus: Arc<dyn EventBus>,
    fanout: Arc<ProgressFanout>,
    quota: Arc<QuotaLedger<C>>,
}

impl<C: CacheLayer + 'static> BusConsumer<C> {
    pub fn new(
        db: PgPool,
        cfg: EngineConfig,
        bus: Arc<dyn EventBus>,
        fanout: Arc<ProgressFanout>,
        quota: Arc<QuotaLedger<C>>,
    ) -> Self {
        Self {
            db,
            cfg,
            bus,
            fanout,
            quota,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), AppError> {
        let mut progress = self.bus.subscribe(topics::CRAWL_PROGRESS).await?;
        let mut results = self.bus.subscribe(topics::CRAWL_RESULT).await?;
        let mut classroom = self.bus.subscribe(topics::CLASSROOM_EVENTS).await?;
        let mut users = self.bus.subscribe(topics::USER_EVENTS).await?;
        info!("bus consumer started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(message) = progress.recv() => {
                    if let Err(e) = self.on_progress(message).await {
                        error!("progress event failed: {}", e);
                    }
                }
                Some(message) = results.recv() => {
                    if let Err(e) = self.on_result(message).await {
                        error!("result event failed: {}", e);
                    }
                }
                Some(message) = classroom.recv() => {
                    if let Err(e) = self.on_classroom(message).await {
                        error!("classroom event failed: {}", e);
                    }
                }
                Some(message) = users.recv() => {
                    if let Err(e) = self.on_user(message).await {
                        error!("user event failed: {}", e);
                    }
                }
                else => break,
            }
        }

        info!("bus consumer stopped");
        Ok(())
    }

    async fn on_progress(&self, message: BusMessage) -> Result<(), AppError> {
        let event: ProgressEvent = match serde_json::from_value(message.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("dropping malformed progress event: {}", e);
                return Ok(());
            }
        };

        let mut tx = self.db.begin().await?;
        let Some(job) = jobs::get_for_update(&mut tx, event.job_id).await? else {
            debug!(job_id = %event.job_id, "progress for unknown job ignored");
            return Ok(());
        };

        if !matches!(job.status, JobStatus::Assigned | JobStatus::Running) {
            debug!(job_id = %job.id, status = ?job.status, "progress for settled job ignored");
            return Ok(());
        }
        if is_duplicate(job.last_seen_seq, event.seq) {
            debug!(job_id = %job.id, seq = event.seq, "duplicate progress ignored");
            return Ok(());
        }

        let was_assigned = job.status == JobStatus::Assigned;
        jobs::apply_progress(
            &mut tx,
            job.id,
            job.version,
            event.seq,
            event.urls_processed,
            event.urls_successful,
            event.urls_failed,
        )
        .await?;
        if was_assigned {
            lifecycle::record_started(&mut tx, &self.cfg, &job).await?;
        }
        tx.commit().await?;

        self.fanout.publish_progress(&event).await;
        Ok(())
    }

    async fn on_result(&self, message: BusMessage) -> Result<(), AppError> {
        let event: ResultEvent = match serde_json::from_value(message.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("dropping malformed result event: {}", e);
                return Ok(());
            }
        };

        let mut tx = self.db.begin().await?;
        let Some(job) = jobs::get_for_update(&mut tx, event.job_id).await? else {
            debug!(job_id = %event.job_id, "result for unknown job ignored");
            return Ok(());
        };

        // Cancellation finality and general settledness: only a live
        // assigned/running job can take a terminal event.
        if !matches!(job.status, JobStatus::Assigned | JobStatus::Running) {
            debug!(job_id = %job.id, status = ?job.status, "terminal event for settled job ignored");
            return Ok(());
        }
        if is_duplicate(job.last_seen_seq, event.seq) {
            debug!(job_id = %job.id, seq = event.seq, "duplicate terminal event ignored");
            return Ok(());
        }

        // Results are persisted first; the terminal push happens only after
        // this transaction commits.
        let mut counts = TerminalCounts {
            processed: 0,
            successful: 0,
            failed: 0,
            total_bytes: 0,
        };
        for result in &event.results {
            jobs::insert_result(
                &mut tx,
                &NewCrawlResult {
                    job_id: job.id,
                    url: result.url.clone(),
                    success: result.success,
                    http_status: result.http_status,
                    content_size: result.content_size,
                    content_hash: result.content_hash.clone(),
                    extracted: result.extracted.clone(),
                    error: result.error.clone(),
                },
            )
            .await?;
            counts.processed += 1;
            if result.success {
                counts.successful += 1;
            } else {
                counts.failed += 1;
            }
            counts.total_bytes += result.content_size.unwrap_or(0);
        }

        let agent_id = job.assigned_agent_id;
        let outcome = if event.outcome == WorkerOutcome::Cancelled {
            WorkerOutcome::Cancelled
        } else {
            resolve_outcome(&job, event.outcome)
        };

        let status = match outcome {
            WorkerOutcome::Completed => {
                lifecycle::record_completed(&mut tx, &self.cfg, &job, event.seq, &counts).await?;
                if let Some(agent_id) = agent_id {
                    agents::release_slot(&mut tx, agent_id, Some(true)).await?;
                }
                JobStatus::Completed
            }
            WorkerOutcome::Failed => {
                let error = event.error.as_deref().unwrap_or("worker reported failure");
                lifecycle::record_failed(&mut tx, &self.cfg, &job, error, Some(counts.processed))
                    .await?;
                if let Some(agent_id) = agent_id {
                    agents::release_slot(&mut tx, agent_id, Some(false)).await?;
                }
                JobStatus::Failed
            }
            WorkerOutcome::Cancelled => {
                lifecycle::record_cancelled(&mut tx, &self.cfg, &job, Some(counts.processed))
                    .await?;
                if let Some(agent_id) = agent_id {
                    agents::release_slot(&mut tx, agent_id, None).await?;
                }
                JobStatus::Cancelled
            }
        };
        tx.commit().await?;

        self.quota.invalidate(job.user_id).await;
        self.fanout
            .publish_terminal(&TerminalNotice {
                job_id: job.id,
                status,
                urls_processed: counts.processed,
                urls_successful: counts.successful,
                urls_failed: counts.failed,
                total_bytes: counts.total_bytes,
                error: event.error.clone(),
            })
            .await;
        Ok(())
    }

    async fn on_classroom(&self, message: BusMessage) -> Result<(), AppError> {
        let event: ClassroomEvent = match serde_json::from_value(message.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("dropping malformed classroom event: {}", e);
                return Ok(());
            }
        };

        let mut conn = self.db.acquire().await?;
        match event {
            ClassroomEvent::MemberAdded { group_id, user_id } => {
                groups::upsert_member(&mut conn, group_id, user_id).await?;
                debug!(%group_id, %user_id, "group member added");
            }
            ClassroomEvent::MemberRemoved { group_id, user_id } => {
                groups::remove_member(&mut conn, group_id, user_id).await?;
                debug!(%group_id, %user_id, "group member removed");
            }
        }
        Ok(())
    }

    async fn on_user(&self, message: BusMessage) -> Result<(), AppError> {
        let event: UserEvent = match serde_json::from_value(message.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("dropping malformed user event: {}", e);
                return Ok(());
            }
        };

        match event {
            UserEvent::PlanChanged { user_id } => {
                if let Err(e) = self.quota.sync_from_upstream(user_id).await {
                    warn!(%user_id, "quota resync after plan change failed: {}", e);
                }
            }
            UserEvent::QuotaOverrideCleared { user_id } => {
                if let Err(e) = self.quota.clear_override(user_id).await {
                    warn!(%user_id, "quota override clear failed: {}", e);
                }
            }
        }
        Ok(())
    }
}

/// What a terminal event resolves to, given the job's cancel intent. Pulled
/// out for testability.
pub fn resolve_outcome(job: &CrawlJob, reported: WorkerOutcome) -> WorkerOutcome {
    if job.cancel_requested_at.is_some() {
        WorkerOutcome::Cancelled
    } else {
        reported
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crawlhub_core::{AccessLevel, JobPriority, WorkerKind};
    use uuid::Uuid;

    fn job(cancel_requested: bool) -> CrawlJob {
        let now = Utc::now();
        CrawlJob {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            assignment_id: None,
            group_id: None,
            conversation_id: None,
            urls: vec!["https://a.test/x".to_string()],
            prompt: "extract title".to_string(),
            max_pages: None,
            worker_kind: WorkerKind::HttpClient,
            priority: JobPriority::Normal,
            status: JobStatus::Running,
            access_level: AccessLevel::Private,
            assigned_agent_id: Some(Uuid::new_v4()),
            template_id: None,
            extraction_strategy: None,
            navigation_plan: None,
            retry_count: 0,
            max_retries: 3,
            next_retry_at: None,
            cancel_requested_at: cancel_requested.then(Utc::now),
            last_seen_seq: 5,
            urls_processed: 0,
            urls_successful: 0,
            urls_failed: 0,
            total_bytes: 0,
            error_message: None,
            created_at: now,
            started_at: Some(now),
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
            updated_at: now,
            version: 3,
            deleted_at: None,
        }
    }

    #[test]
    fn duplicate_and_stale_sequences_are_ignored() {
        assert!(is_duplicate(5, 5));
        assert!(is_duplicate(5, 3));
        assert!(!is_duplicate(5, 6));
    }

    #[test]
    fn cancel_intent_overrides_the_reported_outcome() {
        assert_eq!(
            resolve_outcome(&job(true), WorkerOutcome::Completed),
            WorkerOutcome::Cancelled
        );
        assert_eq!(
            resolve_outcome(&job(false), WorkerOutcome::Completed),
            WorkerOutcome::Completed
        );
    }
}
