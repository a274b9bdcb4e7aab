use super::{BusError, BusMessage, BusSubscription, EventBus};
use crate::BusConfig;
use async_trait::async_trait;
use bb8_redis::{bb8, RedisConnectionManager};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

type RedisPool = bb8::Pool<RedisConnectionManager>;

/// Redis pub/sub implementation of the event bus. Publishes go through a
/// pooled connection; each subscription owns a dedicated pub/sub connection
/// feeding an in-process channel.
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    pool: RedisPool,
}

impl RedisBus {
    pub async fn new(config: &BusConfig) -> Result<Self, BusError> {
        let client = redis::Client::open(config.redis_url.as_str())?;

        let manager = RedisConnectionManager::new(config.redis_url.clone())
            .map_err(|e| BusError::Pool(format!("Failed to create Redis manager: {}", e)))?;
        let pool = bb8::Pool::builder()
            .max_size(8)
            .build(manager)
            .await
            .map_err(|e| BusError::Pool(format!("Failed to create connection pool: {}", e)))?;

        // Test the connection
        {
            let mut conn = pool
                .get()
                .await
                .map_err(|e| BusError::Pool(format!("Failed to get connection: {}", e)))?;
            let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        }

        debug!("Redis event bus initialized");
        Ok(Self { client, pool })
    }
}

#[async_trait]
impl EventBus for RedisBus {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: &serde_json::Value,
    ) -> Result<(), BusError> {
        let message = BusMessage {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: payload.clone(),
        };
        let wire = serde_json::to_string(&message)?;

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| BusError::Pool(format!("Failed to get connection: {}", e)))?;

        let _: i64 = redis::cmd("PUBLISH")
            .arg(topic)
            .arg(wire)
            .query_async(&mut *conn)
            .await?;

        debug!("Published {} message keyed by {}", topic, key);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BusSubscription, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;

        let (tx, rx) = mpsc::channel(256);
        let topic = topic.to_string();

        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let raw: String = match msg.get_payload() {
                    Ok(raw) => raw,
                    Err(e) => {
                        warn!("Dropping undecodable {} message: {}", topic, e);
                        continue;
                    }
                };
                match serde_json::from_str::<BusMessage>(&raw) {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            // Subscriber dropped; tear down the pub/sub task.
                            break;
                        }
                    }
                    Err(e) => warn!("Dropping malformed {} message: {}", topic, e),
                }
            }
            debug!("Subscription to {} closed", topic);
        });

        Ok(BusSubscription::new(rx))
    }
}
