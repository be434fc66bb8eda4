//! In-process broker with the same delivery semantics as the Redis one.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::queue::{Broker, QueueError};

#[derive(Default)]
struct State {
    jobs: VecDeque<String>,
    in_flight: Vec<String>,
    dead: Vec<String>,
    results: VecDeque<String>,
    peak_in_flight: usize,
}

#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
    jobs_ready: Notify,
    results_ready: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_jobs(&self) -> usize {
        self.lock().jobs.len()
    }

    /// Deliveries fetched but not yet acked or rejected.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Highest in-flight count observed since creation.
    pub fn peak_in_flight(&self) -> usize {
        self.lock().peak_in_flight
    }

    pub fn dead_letters(&self) -> Vec<String> {
        self.lock().dead.clone()
    }

    pub fn pending_results(&self) -> usize {
        self.lock().results.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_in_flight(state: &mut State, payload: &str) -> bool {
        match state.in_flight.iter().position(|p| p == payload) {
            Some(idx) => {
                state.in_flight.remove(idx);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish_job(&self, payload: String) -> Result<(), QueueError> {
        self.lock().jobs.push_back(payload);
        self.jobs_ready.notify_one();
        Ok(())
    }

    async fn fetch_job(&self, timeout: Duration) -> Result<Option<String>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut state = self.lock();
                if let Some(payload) = state.jobs.pop_front() {
                    state.in_flight.push(payload.clone());
                    state.peak_in_flight = state.peak_in_flight.max(state.in_flight.len());
                    return Ok(Some(payload));
                }
            }
            if tokio::time::timeout_at(deadline, self.jobs_ready.notified()).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack_job(&self, payload: &str) -> Result<(), QueueError> {
        Self::remove_in_flight(&mut self.lock(), payload);
        Ok(())
    }

    async fn reject_job(&self, payload: &str) -> Result<(), QueueError> {
        let mut state = self.lock();
        Self::remove_in_flight(&mut state, payload);
        state.dead.push(payload.to_string());
        Ok(())
    }

    async fn recover_jobs(&self) -> Result<usize, QueueError> {
        let recovered = {
            let mut state = self.lock();
            let stranded: Vec<String> = state.in_flight.drain(..).collect();
            let count = stranded.len();
            for payload in stranded.into_iter().rev() {
                state.jobs.push_front(payload);
            }
            count
        };
        for _ in 0..recovered {
            self.jobs_ready.notify_one();
        }
        Ok(recovered)
    }

    async fn publish_result(&self, payload: String) -> Result<(), QueueError> {
        self.lock().results.push_back(payload);
        self.results_ready.notify_one();
        Ok(())
    }

    async fn pop_result(&self, timeout: Duration) -> Result<Option<String>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let popped = self.lock().results.pop_front();
            if let Some(payload) = popped {
                return Ok(Some(payload));
            }
            if tokio::time::timeout_at(deadline, self.results_ready.notified()).await.is_err() {
                return Ok(None);
            }
        }
    }
}
