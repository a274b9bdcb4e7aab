use chrono::Utc;
use crawlhub_core::bus::topics;
use crawlhub_core::events::event_types;
use crawlhub_core::repository::{agents, jobs, outbox};
use crawlhub_core::{Agent, AppError, EngineConfig, RegisterAgent, WorkerKind};
use serde_json::json;
use sqlx::{PgConnection, PgPool};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::lifecycle;

/// Owns the set of live crawler agents: registration, heartbeats, target
/// selection and the health sweep that repatriates orphaned jobs.
#[derive(Clone)]
pub struct AgentPool {
    db: PgPool,
    cfg: EngineConfig,
    /// (owner, kind) fleets the auto-scaler has paused for cost; the
    /// dispatcher refuses hand-offs for these.
    paused: Arc<RwLock<HashSet<(Uuid, WorkerKind)>>>,
}

impl AgentPool {
    pub fn new(db: PgPool, cfg: EngineConfig) -> Self {
        Self {
            db,
            cfg,
            paused: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub async fn register(&self, reg: RegisterAgent) -> Result<Agent, AppError> {
        let mut conn = self.db.acquire().await?;
        let agent = agents::register(&mut conn, &reg).await?;
        info!(agent_id = %agent.id, instance = %agent.instance_id, kind = ?agent.worker_kind, "agent registered");
        Ok(agent)
    }

    pub async fn deregister(&self, agent_id: Uuid) -> Result<(), AppError> {
        let mut conn = self.db.acquire().await?;
        agents::deregister(&mut conn, agent_id).await?;
        info!(%agent_id, "agent deregistered");
        Ok(())
    }

    pub async fn heartbeat(
        &self,
        instance_id: &str,
        health_message: Option<&str>,
    ) -> Result<Option<Agent>, AppError> {
        let mut conn = self.db.acquire().await?;
        agents::heartbeat(&mut conn, instance_id, health_message).await
    }

    /// Pick a target and reserve one of its slots inside the caller's
    /// transaction, so capacity and assignment commit together.
    pub async fn pick(
        &self,
        conn: &mut PgConnection,
        kind: WorkerKind,
    ) -> Result<Option<Agent>, AppError> {
        let Some(agent) = agents::pick_for_update(conn, kind).await? else {
            return Ok(None);
        };
        agents::reserve_slot(conn, agent.id).await?;
        Ok(Some(agent))
    }

    pub async fn pause(&self, owner: Uuid, kind: WorkerKind) {
        self.paused.write().await.insert((owner, kind));
    }

    pub async fn resume(&self, owner: Uuid, kind: WorkerKind) {
        self.paused.write().await.remove(&(owner, kind));
    }

    pub async fn is_paused(&self, owner: Uuid, kind: WorkerKind) -> bool {
        self.paused.read().await.contains(&(owner, kind))
    }

    /// Health sweep: mark stale agents unhealthy, requeue their jobs, and
    /// retire drained agents whose removal time has come.
    pub async fn tick(&self) -> Result<(), AppError> {
        let mut tx = self.db.begin().await?;

        let stale = agents::mark_stale_unhealthy(&mut tx, self.cfg.agent_timeout_secs).await?;
        if !stale.is_empty() {
            let ids: Vec<Uuid> = stale.iter().map(|a| a.id).collect();
            warn!(count = stale.len(), "agents went unhealthy (heartbeat timeout)");

            let orphans = jobs::claim_bound_to_agents(&mut tx, &ids).await?;
            for job in orphans {
                let agent_id = job.assigned_agent_id;
                if job.retry_count < job.max_retries {
                    jobs::requeue_orphan(&mut tx, job.id, job.version).await?;
                    lifecycle::record_requeued(&mut tx, &self.cfg, &job, "agent heartbeat lost")
                        .await?;
                } else {
                    lifecycle::record_failed(
                        &mut tx,
                        &self.cfg,
                        &job,
                        "agent heartbeat lost, retries exhausted",
                        None,
                    )
                    .await?;
                }
                if let Some(agent_id) = agent_id {
                    agents::release_slot(&mut tx, agent_id, None).await?;
                }
            }
        }

        let retired = agents::retire_drained(&mut tx).await?;
        for agent in &retired {
            outbox::enqueue(
                &mut tx,
                topics::AGENT_EVENTS,
                event_types::AGENT_RETIRED,
                agent.id,
                json!({
                    "agent_id": agent.id,
                    "instance_id": agent.instance_id,
                    "worker_kind": agent.worker_kind,
                }),
                self.cfg.outbox_max_retries,
            )
            .await?;
            info!(agent_id = %agent.id, "drained agent retired");
        }

        tx.commit().await?;
        Ok(())
    }

    /// Begin draining an agent; it stops receiving work immediately and is
    /// retired by a later tick once empty.
    pub async fn drain(&self, conn: &mut PgConnection, agent: &Agent) -> Result<(), AppError> {
        agents::mark_draining(conn, agent.id, Utc::now()).await?;
        outbox::enqueue(
            conn,
            topics::AGENT_EVENTS,
            event_types::AGENT_DRAIN,
            agent.id,
            json!({
                "agent_id": agent.id,
                "instance_id": agent.instance_id,
                "worker_kind": agent.worker_kind,
                "current_job_count": agent.current_job_count,
            }),
            self.cfg.outbox_max_retries,
        )
        .await?;
        Ok(())
    }
}
