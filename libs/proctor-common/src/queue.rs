//! Job and result transport.
//!
//! Two logical queues sit on a [`Broker`]: jobs flow from callers to the worker
//! pool with manual acknowledgement, results flow back best-effort. Delivery of
//! jobs is at-least-once: a job is acknowledged only after its result has been
//! published, so a crash in between causes redelivery and callers dedupe by job ID.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::types::{ExecutionResult, Job};

/// How long a single blocking fetch waits before re-checking for shutdown.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("transport closed")]
    Closed,
}

/// Message broker primitives the transport is built on.
///
/// Jobs use a reliable-queue pattern: `fetch_job` moves a payload into the
/// consumer's in-flight set where it stays until `ack_job` or `reject_job`.
/// Results are popped, which acknowledges them implicitly.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish_job(&self, payload: String) -> Result<(), QueueError>;

    /// Wait up to `timeout` for the next job payload.
    async fn fetch_job(&self, timeout: Duration) -> Result<Option<String>, QueueError>;

    async fn ack_job(&self, payload: &str) -> Result<(), QueueError>;

    /// Drop an in-flight payload into the dead-letter queue. Never redelivered.
    async fn reject_job(&self, payload: &str) -> Result<(), QueueError>;

    /// Return everything left in flight by a previous run of this consumer to the
    /// jobs queue. Returns how many payloads were requeued.
    async fn recover_jobs(&self) -> Result<usize, QueueError>;

    async fn publish_result(&self, payload: String) -> Result<(), QueueError>;

    async fn pop_result(&self, timeout: Duration) -> Result<Option<String>, QueueError>;
}

/// Caller-side handle for enqueuing jobs.
#[derive(Clone)]
pub struct JobPublisher {
    broker: Arc<dyn Broker>,
}

impl JobPublisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    pub async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        let payload = serde_json::to_string(job)?;
        self.broker.publish_job(payload).await?;
        debug!(job_id = %job.id, language = %job.language, "Job enqueued");
        Ok(())
    }
}

/// Pool-side handle for publishing results.
#[derive(Clone)]
pub struct ResultPublisher {
    broker: Arc<dyn Broker>,
}

impl ResultPublisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    pub async fn publish(&self, result: &ExecutionResult) -> Result<(), QueueError> {
        let payload = serde_json::to_string(result)?;
        self.broker.publish_result(payload).await
    }
}

/// A decoded job held on behalf of one consumer until acknowledged.
///
/// Holds one prefetch permit. Dropping a delivery without acking releases the
/// permit but leaves the payload in flight, so broker recovery redelivers it.
pub struct Delivery {
    job: Job,
    payload: String,
    broker: Arc<dyn Broker>,
    _permit: OwnedSemaphorePermit,
}

impl Delivery {
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub async fn ack(self) -> Result<(), QueueError> {
        self.broker.ack_job(&self.payload).await
    }

    pub async fn reject(self) -> Result<(), QueueError> {
        self.broker.reject_job(&self.payload).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery").field("job_id", &self.job.id).finish()
    }
}

/// Pulls jobs from the broker with a bounded window of unacknowledged deliveries.
pub struct JobConsumer {
    broker: Arc<dyn Broker>,
    window: Arc<Semaphore>,
    poll_interval: Duration,
}

impl JobConsumer {
    /// `window` is the maximum number of unacknowledged deliveries this consumer
    /// may hold at once (prefetch × workers for a pool).
    pub fn new(broker: Arc<dyn Broker>, window: usize) -> Self {
        Self {
            broker,
            window: Arc::new(Semaphore::new(window.max(1))),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub async fn recover(&self) -> Result<usize, QueueError> {
        self.broker.recover_jobs().await
    }

    /// Wait for the next well-formed job.
    ///
    /// Malformed payloads are dead-lettered and skipped. Returns `Ok(None)` once
    /// `shutdown` fires; a fetch already in progress is allowed to finish its poll.
    pub async fn next(&self, shutdown: &CancellationToken) -> Result<Option<Delivery>, QueueError> {
        let permit = tokio::select! {
            _ = shutdown.cancelled() => return Ok(None),
            permit = self.window.clone().acquire_owned() => permit.map_err(|_| QueueError::Closed)?,
        };

        loop {
            if shutdown.is_cancelled() {
                return Ok(None);
            }

            let Some(payload) = self.broker.fetch_job(self.poll_interval).await? else {
                continue;
            };

            match serde_json::from_str::<Job>(&payload) {
                Ok(job) => {
                    return Ok(Some(Delivery {
                        job,
                        payload,
                        broker: self.broker.clone(),
                        _permit: permit,
                    }));
                }
                Err(e) => {
                    warn!(error = %e, payload_bytes = payload.len(), "Malformed job payload, dead-lettering");
                    self.broker.reject_job(&payload).await?;
                }
            }
        }
    }
}

type Callback = Arc<dyn Fn(ExecutionResult) + Send + Sync>;

enum Subscriber {
    Callback(Callback),
    Once(oneshot::Sender<ExecutionResult>),
}

/// Caller-side dispatcher matching published results to subscribers by job ID.
///
/// Results nobody subscribed to are dropped.
pub struct ResultConsumer {
    broker: Arc<dyn Broker>,
    subscribers: Mutex<HashMap<Uuid, Subscriber>>,
    poll_interval: Duration,
}

impl ResultConsumer {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            subscribers: Mutex::new(HashMap::new()),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Invoke `callback` for every result published for `job_id` until unsubscribed.
    pub fn subscribe<F>(&self, job_id: Uuid, callback: F)
    where
        F: Fn(ExecutionResult) + Send + Sync + 'static,
    {
        self.lock().insert(job_id, Subscriber::Callback(Arc::new(callback)));
    }

    /// Receive the next result for `job_id`; the subscription ends with it.
    pub fn subscribe_once(&self, job_id: Uuid) -> oneshot::Receiver<ExecutionResult> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(job_id, Subscriber::Once(tx));
        rx
    }

    pub fn unsubscribe(&self, job_id: &Uuid) {
        self.lock().remove(job_id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Route one result. Returns whether a subscriber received it.
    pub fn dispatch(&self, result: ExecutionResult) -> bool {
        let callback = {
            let mut subscribers = self.lock();
            match subscribers.remove(&result.job_id) {
                None => None,
                Some(Subscriber::Callback(cb)) => {
                    subscribers.insert(result.job_id, Subscriber::Callback(cb.clone()));
                    Some(cb)
                }
                Some(Subscriber::Once(tx)) => {
                    drop(subscribers);
                    return tx.send(result).is_ok();
                }
            }
        };

        match callback {
            Some(cb) => {
                cb(result);
                true
            }
            None => {
                debug!(job_id = %result.job_id, "No subscriber for result, dropping");
                false
            }
        }
    }

    /// Pop and dispatch results until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        while !shutdown.is_cancelled() {
            let popped = tokio::select! {
                _ = shutdown.cancelled() => break,
                popped = self.broker.pop_result(self.poll_interval) => popped,
            };

            match popped {
                Ok(Some(payload)) => match serde_json::from_str::<ExecutionResult>(&payload) {
                    Ok(result) => {
                        self.dispatch(result);
                    }
                    Err(e) => warn!(error = %e, "Discarding malformed result payload"),
                },
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "Result consumer broker error");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Subscriber>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
