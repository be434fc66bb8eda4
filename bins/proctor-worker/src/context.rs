use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ExecError;

/// Deadline and cancellation scope for one job.
///
/// Both the deadline and an explicit cancel end up in the same place: anything
/// waiting on [`ExecContext::done`] wakes up and tears down what it started.
#[derive(Debug, Clone)]
pub struct ExecContext {
    cancel: CancellationToken,
    deadline: Instant,
}

impl ExecContext {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new(CancellationToken::new(), timeout)
    }

    pub fn new(cancel: CancellationToken, timeout: Duration) -> Self {
        Self {
            cancel,
            deadline: Instant::now() + timeout,
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Fail fast if the job is already past its deadline or cancelled.
    pub fn check(&self) -> Result<(), ExecError> {
        if self.cancel.is_cancelled() {
            Err(ExecError::Cancelled)
        } else if Instant::now() >= self.deadline {
            Err(ExecError::Timeout)
        } else {
            Ok(())
        }
    }

    /// Resolves when the job must stop, yielding the reason.
    pub async fn done(&self) -> ExecError {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => ExecError::Cancelled,
            _ = tokio::time::sleep_until(self.deadline) => ExecError::Timeout,
        }
    }
}
