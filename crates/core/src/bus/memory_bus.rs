use super::{BusError, BusMessage, BusSubscription, EventBus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::warn;

/// In-process event bus used by tests and the synchronous crawl path.
/// Topics are lazily created broadcast channels; a publish with no
/// subscribers is dropped, matching fire-and-forget pub/sub semantics.
#[derive(Clone, Default)]
pub struct MemoryBus {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<BusMessage>>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    async fn sender(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        {
            let channels = self.channels.read().await;
            if let Some(sender) = channels.get(topic) {
                return sender.clone();
            }
        }
        let mut channels = self.channels.write().await;
        channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

#[async_trait]
impl EventBus for MemoryBus {
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
        // A send error only means nobody is listening.
        let _ = self.sender(topic).await.send(message);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BusSubscription, BusError> {
        let mut source = self.sender(topic).await.subscribe();
        let (tx, rx) = mpsc::channel(256);
        let topic = topic.to_string();

        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Subscriber lagged on {}, skipped {} messages", topic, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(BusSubscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn delivers_to_subscriber_in_order() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("crawl.progress").await.unwrap();

        bus.publish("crawl.progress", "job-1", &json!({"seq": 1}))
            .await
            .unwrap();
        bus.publish("crawl.progress", "job-1", &json!({"seq": 2}))
            .await
            .unwrap();

        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        assert_eq!(first.payload["seq"], 1);
        assert_eq!(second.payload["seq"], 2);
        assert_eq!(first.key, "job-1");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let bus = MemoryBus::new();
        bus.publish("crawl.result", "job-2", &json!({"ok": true}))
            .await
            .unwrap();

        // A later subscriber must not see messages published before it joined.
        let mut sub = bus.subscribe("crawl.result").await.unwrap();
        bus.publish("crawl.result", "job-2", &json!({"seq": 9}))
            .await
            .unwrap();
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.payload["seq"], 9);
    }
}
