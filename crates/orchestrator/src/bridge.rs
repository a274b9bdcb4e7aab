use crawlhub_core::bus::EventBus;
use crawlhub_core::events::EventEnvelope;
use crawlhub_core::repository::outbox;
use crawlhub_core::{AppError, EngineConfig, OutboxMessage};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// Short poll keeps publication latency low without hammering the table.
const POLL_INTERVAL: Duration = Duration::from_secs(2);
// Base backoff for a failed publish, doubled per retry.
const PUBLISH_BACKOFF_SECS: i64 = 30;

/// Bridges committed outbox rows onto the event bus: at-least-once, keyed by
/// entity so per-entity order is preserved, dead-lettered when retries run
/// out.
#[derive(Clone)]
pub struct OutboxBridge {
    db: PgPool,
    bus: Arc<dyn EventBus>,
    cfg: EngineConfig,
}

impl OutboxBridge {
    pub fn new(db: PgPool, bus: Arc<dyn EventBus>, cfg: EngineConfig) -> Self {
        Self { db, bus, cfg }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval(POLL_INTERVAL);
        info!("outbox bridge started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("outbox tick failed: {}", e);
                    }
                }
            }
        }
        info!("outbox bridge stopped");
    }

    pub async fn tick(&self) -> Result<usize, AppError> {
        let mut tx = self.db.begin().await?;
        let batch = outbox::claim_due(&mut tx, self.cfg.outbox_batch_size).await?;
        if batch.is_empty() {
            tx.commit().await?;
            return Ok(0);
        }

        let mut published = 0;
        for message in &batch {
            match self.publish(message).await {
                Ok(()) => {
                    outbox::mark_processed(&mut tx, message.id).await?;
                    published += 1;
                }
                Err(e) => {
                    let backoff =
                        PUBLISH_BACKOFF_SECS.saturating_mul(1 << message.retry_count.min(16));
                    warn!(
                        message_id = %message.id,
                        event_type = %message.event_type,
                        retry = message.retry_count,
                        "publish failed, backing off {}s: {}",
                        backoff,
                        e
                    );
                    outbox::mark_failed(&mut tx, message.id, &e.to_string(), backoff).await?;
                    if message.retry_count + 1 >= message.max_retries {
                        error!(
                            message_id = %message.id,
                            event_type = %message.event_type,
                            "outbox message dead-lettered"
                        );
                    }
                }
            }
        }

        tx.commit().await?;
        debug!(published, total = batch.len(), "outbox batch flushed");
        Ok(published)
    }

    async fn publish(&self, message: &OutboxMessage) -> Result<(), AppError> {
        let envelope = EventEnvelope {
            event_id: message.id,
            event_type: message.event_type.clone(),
            entity_id: message.entity_id,
            occurred_at: message.occurred_at,
            data: message.payload.clone(),
        };
        let payload = serde_json::to_value(&envelope)?;
        self.bus
            .publish(&message.topic, &message.entity_id.to_string(), &payload)
            .await?;
        Ok(())
    }
}
