/// Sandbox Runtime - runs one toolchain invocation under limits
///
/// **Core Responsibility:**
/// Execute a command inside an isolated, resource-bounded environment and hand
/// back raw stdout/stderr/exit code.
///
/// **Boundary:**
/// - The sandbox knows HOW to run (container, subprocess)
/// - It does NOT know what a toolchain's output means
/// - A non-zero guest exit is a normal outcome, not an error
/// - An error means the environment itself failed, or the job ran out of time
///
/// Production uses [`crate::docker::DockerSandbox`]. [`LocalSandbox`] runs plain
/// subprocesses for hosts without container support and must be opted into.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use proctor_common::Language;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::context::ExecContext;
use crate::error::ExecError;

/// Cap on captured bytes per stream; guest programs can print without bound.
pub const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox failed to start: {0}")]
    Unavailable(String),
    #[error("deadline exceeded")]
    Timeout,
    #[error("cancelled")]
    Cancelled,
}

impl From<ExecError> for SandboxError {
    fn from(reason: ExecError) -> Self {
        match reason {
            ExecError::Timeout => SandboxError::Timeout,
            ExecError::Cancelled => SandboxError::Cancelled,
            other => SandboxError::Unavailable(other.to_string()),
        }
    }
}

/// One toolchain invocation.
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub language: Language,
    /// Host directory holding the job's files; becomes the working directory.
    pub workdir: PathBuf,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl SandboxRequest {
    pub fn new(language: Language, workdir: PathBuf, command: Vec<String>) -> Self {
        Self {
            language,
            workdir,
            command,
            env: Vec::new(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct SandboxOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub duration: Duration,
}

impl SandboxOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => {
                let mut out = self.stdout.clone();
                if !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str(&self.stderr);
                out
            }
        }
    }
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run `request` to completion, or until `ctx` fires.
    ///
    /// On deadline or cancellation the guest is killed and its resources released
    /// before this returns.
    async fn run(&self, request: &SandboxRequest, ctx: &ExecContext) -> Result<SandboxOutput, SandboxError>;
}

/// Unsandboxed subprocess execution. No memory, CPU or network isolation.
#[derive(Debug)]
pub struct LocalSandbox {
    _opt_in: (),
}

impl LocalSandbox {
    /// The name is the opt-in: callers must acknowledge running guest code bare.
    pub fn new_unsandboxed() -> Self {
        warn!("Local sandbox enabled: guest code runs without isolation");
        Self { _opt_in: () }
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn run(&self, request: &SandboxRequest, ctx: &ExecContext) -> Result<SandboxOutput, SandboxError> {
        ctx.check()?;

        let (program, args) = request
            .command
            .split_first()
            .ok_or_else(|| SandboxError::Unavailable("empty command".to_string()))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&request.workdir)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let start = Instant::now();
        let mut child = command
            .spawn()
            .map_err(|e| SandboxError::Unavailable(format!("failed to spawn {}: {}", program, e)))?;
        let group = child.id().map(|pid| Pid::from_raw(pid as i32));

        let stdout = child.stdout.take().map(|s| tokio::spawn(read_capped(s)));
        let stderr = child.stderr.take().map(|s| tokio::spawn(read_capped(s)));

        let status = tokio::select! {
            status = child.wait() => status
                .map_err(|e| SandboxError::Unavailable(format!("failed to wait for {}: {}", program, e)))?,
            reason = ctx.done() => {
                warn!(program = %program, reason = %reason, "Killing guest process group");
                kill_group(group);
                if let Err(e) = child.kill().await {
                    warn!(program = %program, error = %e, "Failed to kill guest process");
                }
                for reader in [stdout, stderr].into_iter().flatten() {
                    reader.abort();
                }
                return Err(reason.into());
            }
        };

        // Descendants left behind would outlive the job and hold the pipes open.
        kill_group(group);
        let stdout = join_reader(stdout).await;
        let stderr = join_reader(stderr).await;
        // Killed by a signal has no exit code; report it the way a shell would.
        let exit_code = status.code().map(i64::from).unwrap_or(128 + 9);

        debug!(program = %program, exit_code, duration_ms = start.elapsed().as_millis() as u64, "Local process exited");

        Ok(SandboxOutput {
            stdout,
            stderr,
            exit_code,
            duration: start.elapsed(),
        })
    }
}

/// SIGKILL every process in the guest's group. A group that already exited is fine.
fn kill_group(group: Option<Pid>) {
    let Some(group) = group else {
        return;
    };
    match killpg(group, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid = group.as_raw(), error = %e, "Failed to kill guest process group"),
    }
}

async fn read_capped<R>(mut reader: R) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut captured = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            // Keep draining past the cap so the child never blocks on a full pipe.
            Ok(n) => {
                let room = MAX_CAPTURE_BYTES.saturating_sub(captured.len());
                captured.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    String::from_utf8_lossy(&captured).into_owned()
}

async fn join_reader(handle: Option<tokio::task::JoinHandle<String>>) -> String {
    match handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    }
}
