use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Client;
use thiserror::Error;

use crate::protocol::ServerMessage;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Receives chat and transcript envelopes after they were relayed.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn append(&self, room_id: &str, event: &ServerMessage) -> Result<(), SinkError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn append(&self, _room_id: &str, _event: &ServerMessage) -> Result<(), SinkError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemorySink {
    events: tokio::sync::Mutex<Vec<(String, ServerMessage)>>,
}

impl InMemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn events(&self) -> Vec<(String, ServerMessage)> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventSink for InMemorySink {
    async fn append(&self, room_id: &str, event: &ServerMessage) -> Result<(), SinkError> {
        self.events
            .lock()
            .await
            .push((room_id.to_string(), event.clone()));
        Ok(())
    }
}

/// Appends events as JSON to `consult:room:{id}:events`, refreshing the
/// list's TTL on every write.
#[derive(Clone)]
pub struct RedisSink {
    redis: ConnectionManager,
    ttl_seconds: u64,
}

impl RedisSink {
    pub async fn new(redis_url: &str, ttl_seconds: u64) -> Result<Self, SinkError> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis, ttl_seconds })
    }
}

pub fn events_key(room_id: &str) -> String {
    format!("consult:room:{}:events", room_id)
}

#[async_trait]
impl EventSink for RedisSink {
    async fn append(&self, room_id: &str, event: &ServerMessage) -> Result<(), SinkError> {
        let mut conn = self.redis.clone();
        let key = events_key(room_id);
        let serialized = serde_json::to_string(event)?;
        redis::pipe()
            .cmd("RPUSH")
            .arg(&key)
            .arg(&serialized)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl_seconds)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}
