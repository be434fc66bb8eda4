use proctor_common::Language;
use uuid::Uuid;

use crate::engine::SandboxError;

/// Why a job could not produce an [`Output`](proctor_common::Output).
///
/// Negative check outcomes (unformatted code, failing build, failing tests) are
/// not errors; they are reported through the `*_ok` flags.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("no executor registered for language {0}")]
    NoExecutor(Language),

    /// The isolated environment or toolchain could not be started.
    #[error("sandbox unavailable: {0}")]
    Sandbox(String),

    #[error("deadline exceeded")]
    Timeout,

    #[error("execution cancelled")]
    Cancelled,

    #[error("job {0} is already running")]
    AlreadyRunning(Uuid),

    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("workspace error: {0}")]
    Workspace(#[from] std::io::Error),
}

impl ExecError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecError::Timeout)
    }
}

impl From<SandboxError> for ExecError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Timeout => ExecError::Timeout,
            SandboxError::Cancelled => ExecError::Cancelled,
            SandboxError::Unavailable(msg) => ExecError::Sandbox(msg),
        }
    }
}
