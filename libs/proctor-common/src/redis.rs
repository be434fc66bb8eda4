use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};
use tokio::sync::Mutex;
use tracing::info;

use crate::queue::{Broker, QueueError};

/// Redis key layout - defines only naming, not runtime logic.
/// Keeps callers and workers agreeing on where messages live.

pub const JOBS_KEY: &str = "proctor:jobs";
pub const PROCESSING_PREFIX: &str = "proctor:jobs:processing";
pub const DEAD_LETTER_KEY: &str = "proctor:jobs:dead";
pub const RESULTS_KEY: &str = "proctor:results";

/// In-flight list owned by one consumer
pub fn processing_key(consumer: &str) -> String {
    format!("{}:{}", PROCESSING_PREFIX, consumer)
}

/// Redis-backed broker using the reliable-queue pattern.
///
/// `BLMOVE` hands a job to the consumer's processing list atomically, so a crash
/// between fetch and ack leaves the payload recoverable instead of lost.
/// Blocking commands run on their own connection: a multiplexed connection
/// stuck in `BLMOVE` would otherwise stall acks and result publishing.
pub struct RedisBroker {
    conn: ConnectionManager,
    blocking: Mutex<ConnectionManager>,
    processing: String,
}

impl RedisBroker {
    pub async fn connect(redis_url: &str, consumer: &str) -> RedisResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        let blocking = ConnectionManager::new(client).await?;

        info!(consumer = consumer, "Connected to Redis broker");

        Ok(Self {
            conn,
            blocking: Mutex::new(blocking),
            processing: processing_key(consumer),
        })
    }

    pub async fn dead_letter_count(&self) -> RedisResult<usize> {
        let mut conn = self.conn.clone();
        conn.llen(DEAD_LETTER_KEY).await
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish_job(&self, payload: String) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = conn.rpush(JOBS_KEY, payload).await?;
        Ok(())
    }

    async fn fetch_job(&self, timeout: Duration) -> Result<Option<String>, QueueError> {
        let mut conn = self.blocking.lock().await;
        let payload: Option<String> = redis::cmd("BLMOVE")
            .arg(JOBS_KEY)
            .arg(&self.processing)
            .arg("LEFT")
            .arg("RIGHT")
            .arg(timeout.as_secs_f64())
            .query_async(&mut *conn)
            .await?;
        Ok(payload)
    }

    async fn ack_job(&self, payload: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.lrem(&self.processing, 1, payload).await?;
        Ok(())
    }

    async fn reject_job(&self, payload: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .lrem(&self.processing, 1, payload)
            .ignore()
            .rpush(DEAD_LETTER_KEY, payload)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn recover_jobs(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let mut recovered = 0;
        loop {
            // RIGHT -> LEFT keeps the original order at the head of the queue
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(&self.processing)
                .arg(JOBS_KEY)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await?;
            match moved {
                Some(_) => recovered += 1,
                None => break,
            }
        }
        if recovered > 0 {
            info!(recovered, processing = %self.processing, "Requeued unacknowledged jobs");
        }
        Ok(recovered)
    }

    async fn publish_result(&self, payload: String) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = conn.rpush(RESULTS_KEY, payload).await?;
        Ok(())
    }

    async fn pop_result(&self, timeout: Duration) -> Result<Option<String>, QueueError> {
        let mut conn = self.blocking.lock().await;
        let popped: Option<(String, String)> = conn.blpop(RESULTS_KEY, timeout.as_secs_f64()).await?;
        Ok(popped.map(|(_key, payload)| payload))
    }
}
