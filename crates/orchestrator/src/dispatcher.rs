use crawlhub_core::repository::{agents, jobs};
use crawlhub_core::{Agent, AppError, CrawlJob, EngineConfig};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::lifecycle;
use crate::pool::AgentPool;
use crate::worker_client::CrawlWorkerClient;

/// Background loop that drains the pending queue: claim a batch, bind each
/// job to an agent in one transaction, then hand the batch off over HTTP.
#[derive(Clone)]
pub struct Dispatcher {
    db: PgPool,
    cfg: EngineConfig,
    pool: Arc<AgentPool>,
    worker: Arc<CrawlWorkerClient>,
}

impl Dispatcher {
    pub fn new(
        db: PgPool,
        cfg: EngineConfig,
        pool: Arc<AgentPool>,
        worker: Arc<CrawlWorkerClient>,
    ) -> Self {
        Self {
            db,
            cfg,
            pool,
            worker,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval(Duration::from_secs(self.cfg.dispatch_interval_secs));
        info!("dispatcher started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("dispatch tick failed: {}", e);
                    }
                }
            }
        }
        info!("dispatcher stopped");
    }

    async fn tick(&self) -> Result<(), AppError> {
        let handoffs = self.assign_batch().await?;
        for (job, agent) in handoffs {
            if let Err(e) = self.worker.submit(&agent, &job).await {
                warn!(job_id = %job.id, "hand-off refused: {}", e);
                self.fail_handoff(&job, &agent, &e.to_string()).await?;
            }
        }
        Ok(())
    }

    /// Claim due pending jobs and bind each to an agent. Slot reservation
    /// and the status flip commit atomically; the HTTP hand-off happens
    /// after commit so a slow worker cannot hold row locks.
    async fn assign_batch(&self) -> Result<Vec<(CrawlJob, Agent)>, AppError> {
        let mut tx = self.db.begin().await?;
        let batch = jobs::claim_due_pending(&mut tx, self.cfg.dispatch_batch_size).await?;

        let mut handoffs = Vec::new();
        for job in batch {
            if self.pool.is_paused(job.user_id, job.worker_kind).await {
                debug!(job_id = %job.id, "dispatch paused for kind, job stays pending");
                continue;
            }

            match self.pool.pick(&mut tx, job.worker_kind).await? {
                Some(agent) => {
                    lifecycle::record_assigned(&mut tx, &self.cfg, &job, agent.id).await?;
                    handoffs.push((job, agent));
                }
                None => {
                    debug!(job_id = %job.id, kind = ?job.worker_kind, "no capacity, job stays pending");
                }
            }
        }

        tx.commit().await?;
        Ok(handoffs)
    }

    /// A refused hand-off walks the job through Assigned → Failed with the
    /// normal retry policy and releases the reserved slot.
    async fn fail_handoff(&self, job: &CrawlJob, agent: &Agent, error: &str) -> Result<(), AppError> {
        let mut tx = self.db.begin().await?;

        let Some(current) = jobs::get_for_update(&mut tx, job.id).await? else {
            return Ok(());
        };
        if current.status != crawlhub_core::JobStatus::Assigned {
            // Something else already moved the job on; leave it alone.
            tx.commit().await?;
            return Ok(());
        }

        lifecycle::record_failed(&mut tx, &self.cfg, &current, error, None).await?;
        agents::release_slot(&mut tx, agent.id, Some(false)).await?;

        tx.commit().await?;
        Ok(())
    }
}
