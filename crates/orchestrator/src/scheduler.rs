use crawlhub_core::repository::{agents, jobs, outbox};
use crawlhub_core::{AppError, EngineConfig};
use sqlx::PgPool;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::lifecycle;

// Processed outbox rows are kept for a day before pruning.
const OUTBOX_RETENTION_SECS: i64 = 86_400;

/// Periodic retry/timeout sweep: requeue failed jobs whose backoff elapsed,
/// force-fail jobs that stopped making progress, prune the outbox.
#[derive(Clone)]
pub struct Scheduler {
    db: PgPool,
    cfg: EngineConfig,
}

impl Scheduler {
    pub fn new(db: PgPool, cfg: EngineConfig) -> Self {
        Self { db, cfg }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval(Duration::from_secs(self.cfg.scheduler_interval_secs));
        info!("scheduler started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("scheduler tick failed: {}", e);
                    }
                }
            }
        }
        info!("scheduler stopped");
    }

    pub async fn tick(&self) -> Result<(), AppError> {
        self.requeue_due_retries().await?;
        self.expire_stuck_jobs().await?;
        self.prune_outbox().await?;
        Ok(())
    }

    async fn requeue_due_retries(&self) -> Result<(), AppError> {
        let mut tx = self.db.begin().await?;
        let requeued = jobs::requeue_failed_due(&mut tx).await?;
        for job in &requeued {
            lifecycle::record_requeued(&mut tx, &self.cfg, job, "retry backoff elapsed").await?;
        }
        tx.commit().await?;

        if !requeued.is_empty() {
            info!(count = requeued.len(), "failed jobs requeued for retry");
        }
        Ok(())
    }

    /// A job in Assigned/Running with no progress inside the horizon is
    /// treated as timed out: forced to Failed and charged a retry.
    async fn expire_stuck_jobs(&self) -> Result<(), AppError> {
        let mut tx = self.db.begin().await?;
        let stuck = jobs::claim_timed_out(&mut tx, self.cfg.job_timeout_secs).await?;

        for job in &stuck {
            warn!(job_id = %job.id, status = ?job.status, "job timed out without progress");
            lifecycle::record_failed(&mut tx, &self.cfg, job, "job timeout", None).await?;
            if let Some(agent_id) = job.assigned_agent_id {
                agents::release_slot(&mut tx, agent_id, Some(false)).await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn prune_outbox(&self) -> Result<(), AppError> {
        let mut conn = self.db.acquire().await?;
        let pruned = outbox::prune_processed(&mut conn, OUTBOX_RETENTION_SECS).await?;
        if pruned > 0 {
            info!(count = pruned, "processed outbox rows pruned");
        }
        Ok(())
    }
}
