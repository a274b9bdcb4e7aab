use chrono::{DateTime, Duration as ChronoDuration, Utc};
use crawlhub_core::bus::topics;
use crawlhub_core::events::event_types;
use crawlhub_core::repository::{agents, outbox, scaling};
use crawlhub_core::{AppError, EngineConfig, ScalingPolicy, WorkerKind};
use serde_json::json;
use sqlx::PgPool;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::pool::AgentPool;

type FleetKey = (Uuid, WorkerKind);

/// Sliding-window auto-scaler. Samples fleet load each tick, averages over
/// the window, and emits scale decisions as outbox events for the external
/// orchestrator to act on.
pub struct AutoScaler {
    db: PgPool,
    cfg: EngineConfig,
    pool: Arc<AgentPool>,
    windows: Mutex<HashMap<FleetKey, VecDeque<(DateTime<Utc>, f64)>>>,
}

/// Has the cooldown elapsed since the last scale event?
pub fn cooldown_elapsed(
    last: Option<DateTime<Utc>>,
    cooldown_secs: i64,
    now: DateTime<Utc>,
) -> bool {
    match last {
        None => true,
        Some(last) => now - last >= ChronoDuration::seconds(cooldown_secs),
    }
}

/// Average of the samples inside the window, or None with no samples.
pub fn window_average(
    samples: &VecDeque<(DateTime<Utc>, f64)>,
    window_secs: i64,
    now: DateTime<Utc>,
) -> Option<f64> {
    let horizon = now - ChronoDuration::seconds(window_secs);
    let live: Vec<f64> = samples
        .iter()
        .filter(|(t, _)| *t >= horizon)
        .map(|(_, v)| *v)
        .collect();
    if live.is_empty() {
        return None;
    }
    Some(live.iter().sum::<f64>() / live.len() as f64)
}

impl AutoScaler {
    pub fn new(db: PgPool, cfg: EngineConfig, pool: Arc<AgentPool>) -> Self {
        Self {
            db,
            cfg,
            pool,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = interval(Duration::from_secs(self.cfg.scheduler_interval_secs));
        info!("auto-scaler started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("auto-scaler tick failed: {}", e);
                    }
                }
            }
        }
        info!("auto-scaler stopped");
    }

    pub async fn tick(&self) -> Result<(), AppError> {
        let mut conn = self.db.acquire().await?;
        let policies = scaling::enabled_policies(&mut conn).await?;
        drop(conn);

        for policy in policies {
            if let Err(e) = self.evaluate(&policy).await {
                warn!(
                    user = %policy.user_id,
                    kind = ?policy.worker_kind,
                    "scaling evaluation failed: {}",
                    e
                );
            }
        }
        Ok(())
    }

    async fn evaluate(&self, policy: &ScalingPolicy) -> Result<(), AppError> {
        let key: FleetKey = (policy.user_id, policy.worker_kind);
        let now = Utc::now();

        let mut conn = self.db.acquire().await?;
        let stats = agents::fleet_stats(&mut conn, policy.user_id, policy.worker_kind).await?;
        drop(conn);

        let load = {
            let mut windows = self.windows.lock().await;
            let samples = windows.entry(key).or_default();
            samples.push_back((now, stats.load()));
            let horizon = now - ChronoDuration::seconds(self.cfg.autoscale_window_secs as i64);
            while samples.front().map(|(t, _)| *t < horizon).unwrap_or(false) {
                samples.pop_front();
            }
            window_average(samples, self.cfg.autoscale_window_secs as i64, now)
        };
        let Some(load) = load else { return Ok(()) };

        // Cost gate first: over budget means no growth and no dispatch.
        let hourly_cost = stats.auto_scaled_agents as f64 * self.cfg.agent_hourly_cost;
        if hourly_cost > policy.max_hourly_cost && policy.pause_when_limit_reached {
            warn!(
                user = %policy.user_id,
                kind = ?policy.worker_kind,
                cost = hourly_cost,
                "hourly cost limit reached, pausing fleet"
            );
            self.pool.pause(policy.user_id, policy.worker_kind).await;
            return Ok(());
        }
        self.pool.resume(policy.user_id, policy.worker_kind).await;

        if load >= policy.scale_up_threshold
            && stats.live_agents < policy.max_agents as i64
            && cooldown_elapsed(policy.last_scale_up_at, policy.scale_up_cooldown_secs, now)
        {
            self.request_scale_up(policy, load, stats.live_agents).await?;
        } else if load <= policy.scale_down_threshold
            && stats.live_agents > policy.min_agents as i64
            && cooldown_elapsed(policy.last_scale_down_at, policy.scale_down_cooldown_secs, now)
        {
            self.drain_one(policy, load).await?;
        } else {
            debug!(
                user = %policy.user_id,
                kind = ?policy.worker_kind,
                load,
                agents = stats.live_agents,
                "fleet within thresholds"
            );
        }

        Ok(())
    }

    /// Ask the external orchestrator for one more agent; the cooldown
    /// timestamp suppresses further requests until the window reopens.
    async fn request_scale_up(
        &self,
        policy: &ScalingPolicy,
        load: f64,
        current: i64,
    ) -> Result<(), AppError> {
        let mut tx = self.db.begin().await?;
        outbox::enqueue(
            &mut tx,
            topics::AGENT_EVENTS,
            event_types::AGENT_SCALE_UP,
            policy.id,
            json!({
                "user_id": policy.user_id,
                "worker_kind": policy.worker_kind,
                "current_agents": current,
                "requested_agents": current + 1,
                "observed_load": load,
            }),
            self.cfg.outbox_max_retries,
        )
        .await?;
        scaling::touch_scale_up(&mut tx, policy.id).await?;
        tx.commit().await?;

        info!(
            user = %policy.user_id,
            kind = ?policy.worker_kind,
            load,
            "scale-up requested"
        );
        Ok(())
    }

    async fn drain_one(&self, policy: &ScalingPolicy, load: f64) -> Result<(), AppError> {
        let mut tx = self.db.begin().await?;
        let Some(candidate) =
            agents::least_loaded_auto_scaled(&mut tx, policy.user_id, policy.worker_kind).await?
        else {
            tx.commit().await?;
            return Ok(());
        };

        self.pool.drain(&mut tx, &candidate).await?;
        scaling::touch_scale_down(&mut tx, policy.id).await?;
        tx.commit().await?;

        info!(
            user = %policy.user_id,
            kind = ?policy.worker_kind,
            agent = %candidate.instance_id,
            load,
            "agent draining for scale-down"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_blocks_until_elapsed() {
        let now = Utc::now();
        assert!(cooldown_elapsed(None, 300, now));
        assert!(!cooldown_elapsed(
            Some(now - ChronoDuration::seconds(100)),
            300,
            now
        ));
        assert!(cooldown_elapsed(
            Some(now - ChronoDuration::seconds(301)),
            300,
            now
        ));
    }

    #[test]
    fn window_average_ignores_expired_samples() {
        let now = Utc::now();
        let mut samples = VecDeque::new();
        samples.push_back((now - ChronoDuration::seconds(600), 1.0));
        samples.push_back((now - ChronoDuration::seconds(60), 0.5));
        samples.push_back((now, 0.7));

        let avg = window_average(&samples, 300, now).unwrap();
        assert!((avg - 0.6).abs() < 1e-9);
        assert_eq!(window_average(&VecDeque::new(), 300, now), None);
    }
}
