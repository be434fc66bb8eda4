//! Fixed-size worker pool.
//!
//! One dispatcher pulls deliveries from the [`JobConsumer`] and hands them to W
//! workers over a rendezvous channel. The consumer's window (prefetch × W)
//! bounds how many jobs are unacknowledged at once, counting jobs waiting in
//! the channel as well as jobs being executed.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use proctor_common::config::Config;
use proctor_common::queue::DEFAULT_POLL_INTERVAL;
use proctor_common::{
    Broker, Delivery, ExecutionResult, JobConsumer, JobStatus, Output, QueueError, ResultPublisher,
};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::ExecError;
use crate::executor::{JobOutcome, Orchestrator};

/// Back-off after a broker error before fetching again.
const BROKER_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    /// Unacknowledged deliveries allowed per worker.
    pub prefetch: usize,
    pub poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            prefetch: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl From<&Config> for PoolConfig {
    fn from(config: &Config) -> Self {
        Self {
            workers: config.workers,
            prefetch: config.prefetch,
            ..Default::default()
        }
    }
}

pub struct WorkerPool {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Requeue whatever a previous run left in flight, then start consuming.
    pub async fn start(
        config: PoolConfig,
        broker: Arc<dyn Broker>,
        orchestrator: Arc<Orchestrator>,
    ) -> Result<Self, QueueError> {
        let workers = config.workers.max(1);
        let window = workers * config.prefetch.max(1);

        let consumer = JobConsumer::new(broker.clone(), window).with_poll_interval(config.poll_interval);
        let recovered = consumer.recover().await?;
        if recovered > 0 {
            info!(recovered, "Requeued in-flight jobs from a previous run");
        }

        let publisher = ResultPublisher::new(broker);
        let shutdown = CancellationToken::new();
        let (tx, rx) = mpsc::channel::<Delivery>(1);
        let rx = Arc::new(Mutex::new(rx));

        let mut tasks = Vec::with_capacity(workers + 1);
        tasks.push(tokio::spawn(dispatch(consumer, tx, shutdown.clone())));
        for worker_id in 0..workers {
            tasks.push(tokio::spawn(worker_loop(
                worker_id,
                rx.clone(),
                orchestrator.clone(),
                publisher.clone(),
                shutdown.clone(),
            )));
        }

        info!(workers, window, "Worker pool started");
        Ok(Self { shutdown, tasks })
    }

    /// Stop taking new jobs and wait for in-flight ones to finish.
    pub async fn shutdown(self) {
        info!("Worker pool shutting down");
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Pool task ended abnormally");
            }
        }
        info!("Worker pool stopped");
    }
}

async fn dispatch(consumer: JobConsumer, tx: mpsc::Sender<Delivery>, shutdown: CancellationToken) {
    loop {
        match consumer.next(&shutdown).await {
            Ok(Some(delivery)) => {
                debug!(job_id = %delivery.job().id, "Dispatching job");
                if tx.send(delivery).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "Failed to fetch job");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(BROKER_RETRY_DELAY) => {}
                }
            }
        }
    }
    debug!("Dispatcher stopped");
}

#[instrument(skip_all, fields(worker_id = worker_id))]
async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Delivery>>>,
    orchestrator: Arc<Orchestrator>,
    publisher: ResultPublisher,
    shutdown: CancellationToken,
) {
    loop {
        // Deliveries still queued at shutdown are dropped unacked and redelivered later.
        let delivery = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            delivery = async { rx.lock().await.recv().await } => delivery,
        };
        let Some(delivery) = delivery else {
            break;
        };
        handle(delivery, &orchestrator, &publisher).await;
    }
    debug!(worker_id, "Worker stopped");
}

/// Run one job and publish exactly one result for it, then ack.
#[instrument(skip_all, fields(job_id = %delivery.job().id, language = %delivery.job().language))]
async fn handle(delivery: Delivery, orchestrator: &Orchestrator, publisher: &ResultPublisher) {
    let job = delivery.job().clone();
    let ctx = orchestrator.context_for(&job);
    info!(timeout_ms = ctx.remaining().as_millis() as u64, files = job.code.len(), "Received job");

    let start = Instant::now();
    let outcome = AssertUnwindSafe(orchestrator.run(&job, &ctx)).catch_unwind().await;
    let elapsed = start.elapsed();

    let result = match outcome {
        Ok(JobOutcome { output, error: None }) => ExecutionResult::completed(job.id, output, elapsed),
        Ok(JobOutcome {
            error: Some(ExecError::AlreadyRunning(_)),
            ..
        }) => {
            // The running copy publishes the result.
            warn!("Duplicate delivery of a running job, acknowledging without a result");
            if let Err(e) = delivery.ack().await {
                error!(error = %e, "Failed to ack duplicate delivery");
            }
            return;
        }
        Ok(JobOutcome { output, error: Some(e) }) if e.is_timeout() => {
            ExecutionResult::timed_out(job.id, output, e.to_string(), elapsed)
        }
        Ok(JobOutcome { output, error: Some(e) }) => ExecutionResult::failed(job.id, output, e.to_string(), elapsed),
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(panic = %message, "Job execution panicked");
            // Phase output died with the panic; the static scan is still worth reporting.
            let output = Output {
                risks: orchestrator.scan_risks(&job),
                ..Default::default()
            };
            ExecutionResult::failed(job.id, output, format!("worker panicked: {}", message), elapsed)
        }
    };

    log_result(&result);

    if let Err(e) = publisher.publish(&result).await {
        // Unacked: broker recovery redelivers the job.
        error!(error = %e, "Failed to publish result, leaving job unacknowledged");
        return;
    }
    if let Err(e) = delivery.ack().await {
        error!(error = %e, "Failed to ack job");
    }
}

fn log_result(result: &ExecutionResult) {
    match result.status {
        JobStatus::Completed => info!(
            status = ?result.status,
            duration_ms = result.duration_ms,
            build_ok = result.output.build_ok,
            test_ok = result.output.test_ok,
            "Job completed"
        ),
        JobStatus::Timeout | JobStatus::Failed => warn!(
            status = ?result.status,
            duration_ms = result.duration_ms,
            error = result.error.as_deref().unwrap_or_default(),
            "Job did not complete"
        ),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
