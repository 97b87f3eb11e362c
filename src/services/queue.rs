use async_trait::async_trait;
use redis::AsyncCommands;

use crate::models::dispatch::ProcessJobRequest;

const QUEUE_KEY: &str = "tryon:dispatch";
const PROCESSING_KEY: &str = "tryon:dispatch:processing";

/// A popped queue entry. `request` is `None` when the payload could not be
/// decoded, in which case no job id is known.
#[derive(Debug)]
pub struct QueuedDispatch {
    raw: String,
    pub request: Option<ProcessJobRequest>,
}

/// Where the API hands dispatch requests to the worker.
#[async_trait]
pub trait DispatchSink: Send + Sync {
    async fn enqueue(&self, request: &ProcessJobRequest) -> Result<(), QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;

    /// Number of requests waiting.
    async fn queue_depth(&self) -> Result<u64, QueueError>;
}

/// Redis-backed dispatch queue. Entries are moved to a processing list
/// while a worker handles them; there is no retry.
pub struct DispatchQueue {
    client: redis::Client,
}

impl DispatchQueue {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self { client })
    }

    /// Pop the oldest request, moving it to the processing list.
    pub async fn dequeue(&self) -> Result<Option<QueuedDispatch>, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let result: Option<String> = conn
            .rpoplpush(QUEUE_KEY, PROCESSING_KEY)
            .await
            .map_err(QueueError::Redis)?;

        Ok(result.map(|raw| {
            let request = serde_json::from_str(&raw).ok();
            QueuedDispatch { raw, request }
        }))
    }

    /// Remove a handled entry from the processing list.
    pub async fn complete(&self, entry: &QueuedDispatch) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, &entry.raw)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

#[async_trait]
impl DispatchSink for DispatchQueue {
    async fn enqueue(&self, request: &ProcessJobRequest) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let payload = serde_json::to_string(request).map_err(QueueError::Serialize)?;
        conn.lpush::<_, _, ()>(QUEUE_KEY, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Check Redis connectivity (for health checks).
    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn queue_depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let depth: u64 = conn.llen(QUEUE_KEY).await.map_err(QueueError::Redis)?;
        Ok(depth)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
