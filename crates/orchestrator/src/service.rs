use crawlhub_core::cache::CacheLayer;
use crawlhub_core::events::TerminalNotice;
use crawlhub_core::repository::{agents, jobs, participants};
use crawlhub_core::{
    AppError, CrawlJob, EngineConfig, Identity, JobStatus, JobWithResults, ParticipantRole,
    ResultsSummary, SubmitJobRequest,
};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::admission::AdmissionService;
use crate::fanout::{ProgressFanout, PushStream};
use crate::lifecycle;
use crate::worker_client::CrawlWorkerClient;

const RESULTS_PAGE: i64 = 100;

/// Ingress facade consumed by the HTTP/WS front door. Authorization is
/// participant-based; the identity arrives already authenticated.
#[derive(Clone)]
pub struct JobService<C: CacheLayer> {
    db: PgPool,
    cfg: EngineConfig,
    admission: Arc<AdmissionService<C>>,
    worker: Arc<CrawlWorkerClient>,
    fanout: Arc<ProgressFanout>,
}

impl<C: CacheLayer + 'static> JobService<C> {
    pub fn new(
        db: PgPool,
        cfg: EngineConfig,
        admission: Arc<AdmissionService<C>>,
        worker: Arc<CrawlWorkerClient>,
        fanout: Arc<ProgressFanout>,
    ) -> Self {
        Self {
            db,
            cfg,
            admission,
            worker,
            fanout,
        }
    }

    pub async fn submit_job(
        &self,
        identity: &Identity,
        request: SubmitJobRequest,
    ) -> Result<CrawlJob, AppError> {
        self.admission.admit(identity, request).await
    }

    pub async fn get_job(
        &self,
        identity: &Identity,
        job_id: Uuid,
    ) -> Result<JobWithResults, AppError> {
        let mut conn = self.db.acquire().await?;
        let job = self.authorized_job(&mut conn, identity, job_id).await?;

        let counts = jobs::result_counts(&mut conn, job_id).await?;
        let results = jobs::results_for_job(&mut conn, job_id, RESULTS_PAGE).await?;
        participants::touch_viewed(&mut conn, job_id, identity.user_id).await?;

        Ok(JobWithResults {
            job,
            results: ResultsSummary {
                total: counts.total,
                successful: counts.successful,
                failed: counts.failed,
                total_bytes: counts.total_bytes,
                results,
            },
        })
    }

    pub async fn list_jobs(
        &self,
        identity: &Identity,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<CrawlJob>, AppError> {
        let mut conn = self.db.acquire().await?;
        jobs::list_by_user(&mut conn, identity.user_id, limit.clamp(1, 200), offset.max(0)).await
    }

    /// Cancel a job. Pending/Assigned jobs finalize immediately; a Running
    /// job gets the intent recorded, the worker notified, and a grace-period
    /// task that force-finalizes if no terminal event lands in time.
    pub async fn cancel_job(&self, identity: &Identity, job_id: Uuid) -> Result<(), AppError> {
        let mut tx = self.db.begin().await?;

        let Some(job) = jobs::get_for_update(&mut tx, job_id).await? else {
            return Err(AppError::NotFound(format!("job {}", job_id)));
        };
        self.require_cancel_rights(&mut tx, identity, &job).await?;

        match job.status {
            JobStatus::Pending => {
                lifecycle::record_cancelled(&mut tx, &self.cfg, &job, None).await?;
                tx.commit().await?;
                self.push_cancelled_notice(&job).await;
            }
            JobStatus::Assigned => {
                lifecycle::record_cancelled(&mut tx, &self.cfg, &job, None).await?;
                if let Some(agent_id) = job.assigned_agent_id {
                    agents::release_slot(&mut tx, agent_id, None).await?;
                }
                tx.commit().await?;
                self.push_cancelled_notice(&job).await;
            }
            JobStatus::Running => {
                jobs::set_cancel_requested(&mut tx, job.id, job.version).await?;
                tx.commit().await?;

                if let Some(agent_id) = job.assigned_agent_id {
                    let mut conn = self.db.acquire().await?;
                    if let Some(agent) = agents::get(&mut conn, agent_id).await? {
                        drop(conn);
                        self.worker.cancel(&agent, job.id).await;
                    }
                }
                self.spawn_force_finalize(job.id);
            }
            _ => {
                return Err(AppError::Conflict(format!(
                    "job {} is already settled",
                    job_id
                )));
            }
        }

        info!(%job_id, user_id = %identity.user_id, "cancellation accepted");
        Ok(())
    }

    /// Register interest in a job's progress stream.
    pub async fn subscribe(
        &self,
        identity: &Identity,
        job_id: Uuid,
    ) -> Result<PushStream, AppError> {
        let mut conn = self.db.acquire().await?;
        self.authorized_job(&mut conn, identity, job_id).await?;
        drop(conn);

        Ok(self.fanout.subscribe(job_id, identity.user_id).await)
    }

    async fn authorized_job(
        &self,
        conn: &mut sqlx::PgConnection,
        identity: &Identity,
        job_id: Uuid,
    ) -> Result<CrawlJob, AppError> {
        let Some(job) = jobs::get(conn, job_id).await? else {
            return Err(AppError::NotFound(format!("job {}", job_id)));
        };
        if identity.is_admin() {
            return Ok(job);
        }
        let role = participants::role_for(conn, job_id, identity.user_id).await?;
        if role.is_none() {
            return Err(AppError::NotFound(format!("job {}", job_id)));
        }
        Ok(job)
    }

    async fn require_cancel_rights(
        &self,
        conn: &mut sqlx::PgConnection,
        identity: &Identity,
        job: &CrawlJob,
    ) -> Result<(), AppError> {
        if identity.is_admin() {
            return Ok(());
        }
        match participants::role_for(conn, job.id, identity.user_id).await? {
            Some(ParticipantRole::Owner) | Some(ParticipantRole::Collaborator) => Ok(()),
            Some(ParticipantRole::Viewer) => Err(AppError::Forbidden(
                "viewers cannot cancel a job".to_string(),
            )),
            None => Err(AppError::NotFound(format!("job {}", job.id))),
        }
    }

    async fn push_cancelled_notice(&self, job: &CrawlJob) {
        self.fanout
            .publish_terminal(&TerminalNotice {
                job_id: job.id,
                status: JobStatus::Cancelled,
                urls_processed: job.urls_processed,
                urls_successful: job.urls_successful,
                urls_failed: job.urls_failed,
                total_bytes: job.total_bytes,
                error: None,
            })
            .await;
    }

    /// After the grace period, a Running job that produced no terminal
    /// event is force-finalized as Cancelled.
    fn spawn_force_finalize(&self, job_id: Uuid) {
        let db = self.db.clone();
        let cfg = self.cfg.clone();
        let fanout = Arc::clone(&self.fanout);
        let grace = Duration::from_secs(cfg.cancel_grace_secs);

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;

            let result: Result<Option<TerminalNotice>, AppError> = async {
                let mut tx = db.begin().await?;
                let Some(job) = jobs::get_for_update(&mut tx, job_id).await? else {
                    return Ok(None);
                };
                if !matches!(job.status, JobStatus::Assigned | JobStatus::Running) {
                    // The worker's terminal event won the race.
                    return Ok(None);
                }

                lifecycle::record_cancelled(&mut tx, &cfg, &job, None).await?;
                if let Some(agent_id) = job.assigned_agent_id {
                    agents::release_slot(&mut tx, agent_id, None).await?;
                }
                tx.commit().await?;

                Ok(Some(TerminalNotice {
                    job_id: job.id,
                    status: JobStatus::Cancelled,
                    urls_processed: job.urls_processed,
                    urls_successful: job.urls_successful,
                    urls_failed: job.urls_failed,
                    total_bytes: job.total_bytes,
                    error: None,
                }))
            }
            .await;

            match result {
                Ok(Some(notice)) => {
                    info!(%job_id, "cancellation force-finalized after grace period");
                    fanout.publish_terminal(&notice).await;
                }
                Ok(None) => {}
                Err(e) => warn!(%job_id, "force-finalize failed: {}", e),
            }
        });
    }
}
