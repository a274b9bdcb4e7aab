use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod memory_bus;
pub mod redis_bus;

pub use memory_bus::MemoryBus;
pub use redis_bus::RedisBus;

/// Logical topic names shared with the worker fleet and sibling services.
pub mod topics {
    pub const CRAWL_PROGRESS: &str = "crawl.progress";
    pub const CRAWL_RESULT: &str = "crawl.result";
    pub const CRAWL_REQUEST: &str = "crawl.request";
    pub const CRAWL_EVENTS: &str = "crawl.events";
    pub const AGENT_EVENTS: &str = "agent.events";
    pub const CLASSROOM_EVENTS: &str = "classroom.events";
    pub const USER_EVENTS: &str = "user.events";
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Bus subscription closed")]
    Closed,
}

/// One delivered bus message. Ordering is guaranteed per key only.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BusMessage {
    pub topic: String,
    pub key: String,
    pub payload: serde_json::Value,
}

/// Receiving half of a topic subscription.
pub struct BusSubscription {
    receiver: mpsc::Receiver<BusMessage>,
}

impl BusSubscription {
    pub fn new(receiver: mpsc::Receiver<BusMessage>) -> Self {
        Self { receiver }
    }

    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }
}

/// Message-bus seam. Producers key messages by entity identifier so that
/// per-entity ordering survives whatever transport backs the trait.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: &serde_json::Value,
    ) -> Result<(), BusError>;

    async fn subscribe(&self, topic: &str) -> Result<BusSubscription, BusError>;
}
