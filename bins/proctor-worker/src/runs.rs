use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ExecError;

struct RunEntry {
    cancel: CancellationToken,
    done: CancellationToken,
}

/// In-flight executions keyed by job ID. At most one entry per job.
#[derive(Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<Uuid, RunEntry>>,
}

/// Keeps a job registered while alive; unregisters and wakes waiters on drop.
pub struct RunGuard<'a> {
    registry: &'a RunRegistry,
    job_id: Uuid,
    done: CancellationToken,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.job_id);
        self.done.cancel();
    }
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job_id: Uuid, cancel: CancellationToken) -> Result<RunGuard<'_>, ExecError> {
        let mut runs = self.lock();
        if runs.contains_key(&job_id) {
            return Err(ExecError::AlreadyRunning(job_id));
        }
        let done = CancellationToken::new();
        runs.insert(
            job_id,
            RunEntry {
                cancel,
                done: done.clone(),
            },
        );
        Ok(RunGuard {
            registry: self,
            job_id,
            done,
        })
    }

    pub fn is_running(&self, job_id: &Uuid) -> bool {
        self.lock().contains_key(job_id)
    }

    /// Signal a running job to stop. Unknown or finished jobs are a no-op.
    /// Returns whether a running job was signalled.
    pub fn cancel(&self, job_id: &Uuid) -> bool {
        match self.lock().get(job_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Wait until `job_id` finishes or `ctx` is cancelled. Returns immediately if
    /// the job is not tracked.
    pub async fn wait(&self, job_id: &Uuid, ctx: &CancellationToken) {
        let done = match self.lock().get(job_id) {
            Some(entry) => entry.done.clone(),
            None => return,
        };
        tokio::select! {
            _ = done.cancelled() => {}
            _ = ctx.cancelled() => {}
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, RunEntry>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_register_rejects_duplicates() {
        let registry = RunRegistry::new();
        let id = Uuid::new_v4();
        let guard = registry.register(id, CancellationToken::new()).unwrap();
        assert!(registry.is_running(&id));
        assert!(matches!(
            registry.register(id, CancellationToken::new()),
            Err(ExecError::AlreadyRunning(dup)) if dup == id
        ));

        drop(guard);
        assert!(!registry.is_running(&id));
        assert!(registry.register(id, CancellationToken::new()).is_ok());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let registry = RunRegistry::new();
        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        let guard = registry.register(id, token.clone()).unwrap();

        assert!(registry.cancel(&id));
        assert!(registry.cancel(&id));
        assert!(token.is_cancelled());

        drop(guard);
        assert!(!registry.cancel(&id));
        assert!(!registry.cancel(&Uuid::new_v4()));
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_untracked() {
        let registry = RunRegistry::new();
        tokio::time::timeout(
            Duration::from_millis(50),
            registry.wait(&Uuid::new_v4(), &CancellationToken::new()),
        )
        .await
        .expect("wait on an unknown job must not block");
    }

    #[tokio::test]
    async fn test_wait_wakes_when_run_finishes() {
        let registry = std::sync::Arc::new(RunRegistry::new());
        let id = Uuid::new_v4();

        let finisher = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let _guard = registry.register(id, CancellationToken::new()).unwrap();
                tokio::time::sleep(Duration::from_millis(30)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(registry.is_running(&id));

        tokio::time::timeout(Duration::from_secs(1), registry.wait(&id, &CancellationToken::new()))
            .await
            .unwrap();
        finisher.await.unwrap();
        assert!(registry.is_empty());
    }
}
