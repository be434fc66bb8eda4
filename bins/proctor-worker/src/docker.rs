// Docker sandbox backed by Bollard
//
// One throwaway container per toolchain invocation. The job workspace is
// bind-mounted at /workspace; nothing else from the host is visible.

use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use tracing::{debug, info, warn};

use crate::config::{LanguageConfig, LanguageConfigManager};
use crate::context::ExecContext;
use crate::engine::{Sandbox, SandboxError, SandboxOutput, SandboxRequest, MAX_CAPTURE_BYTES};

pub const GUEST_WORKDIR: &str = "/workspace";

/// Guarantees container removal on drop, including panics and dropped futures.
/// Disarmed once the container has been removed explicitly.
struct ContainerGuard {
    docker: Docker,
    container_id: Option<String>,
}

impl ContainerGuard {
    fn new(docker: &Docker, container_id: String) -> Self {
        Self {
            docker: docker.clone(),
            container_id: Some(container_id),
        }
    }

    fn disarm(&mut self) {
        self.container_id = None;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(container_id) = self.container_id.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(container = %container_id, "No runtime to remove container");
            return;
        };
        let docker = self.docker.clone();
        handle.spawn(async move {
            if let Err(e) = docker.remove_container(&container_id, Some(force_remove())).await {
                warn!(container = %container_id, error = %e, "Failed to clean up container");
            }
        });
    }
}

fn force_remove() -> RemoveContainerOptions {
    RemoveContainerOptions {
        force: true,
        ..Default::default()
    }
}

/// Production sandbox: network disabled, memory/CPU/pid limits from the
/// language config, guest runs as the owner of the workspace directory.
pub struct DockerSandbox {
    docker: Docker,
    languages: LanguageConfigManager,
}

impl DockerSandbox {
    pub fn new(languages: LanguageConfigManager) -> anyhow::Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| anyhow::anyhow!("Failed to connect to Docker daemon: {}", e))?;
        Ok(Self::with_client(docker, languages))
    }

    pub fn with_client(docker: Docker, languages: LanguageConfigManager) -> Self {
        Self { docker, languages }
    }

    /// Pull the image if it is not cached locally.
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "Image cache hit");
            return Ok(());
        }

        warn!(image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| SandboxError::Unavailable(format!("failed to pull {}: {}", image, e)))?;
        }
        info!(image, "Image pulled");
        Ok(())
    }

    /// Read logs until the container exits, then fetch its exit code.
    async fn collect(&self, container_id: &str) -> Result<(String, String, i64), SandboxError> {
        let logs_options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: true,
            ..Default::default()
        });

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut logs = self.docker.logs(container_id, logs_options);
        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) => append_capped(&mut stdout, &message),
                Ok(LogOutput::StdErr { message }) => append_capped(&mut stderr, &message),
                Ok(_) => {}
                Err(e) => {
                    warn!(container = %container_id, error = %e, "Error reading container logs");
                    break;
                }
            }
        }

        let wait_options = Some(WaitContainerOptions {
            condition: "not-running",
        });
        let mut wait = self.docker.wait_container(container_id, wait_options);
        let exit_code = match wait.next().await {
            Some(Ok(response)) => response.status_code,
            // Bollard reports a non-zero exit as an error carrying the code.
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => {
                return Err(SandboxError::Unavailable(format!("failed to wait for container: {}", e)));
            }
            None => return Err(SandboxError::Unavailable("no wait response from container".to_string())),
        };

        Ok((
            String::from_utf8_lossy(&stdout).into_owned(),
            String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        ))
    }

    /// Pull the image if needed, then create and start the container.
    ///
    /// The guard is armed as soon as the container exists, so a caller that drops
    /// this future mid-start still removes it.
    async fn launch(
        &self,
        request: &SandboxRequest,
        language: &LanguageConfig,
        guard: &mut Option<ContainerGuard>,
    ) -> Result<String, SandboxError> {
        self.ensure_image(&language.image).await?;

        let user = workspace_owner(&request.workdir)?;
        let config = container_config(request, language, &user);
        let container_name = format!("proctor-{}", uuid::Uuid::new_v4());
        let create_options = Some(CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        });

        let container = self
            .docker
            .create_container(create_options, config)
            .await
            .map_err(|e| SandboxError::Unavailable(format!("failed to create container: {}", e)))?;
        let container_id = container.id;
        *guard = Some(ContainerGuard::new(&self.docker, container_id.clone()));

        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Unavailable(format!("failed to start container: {}", e)))?;
        Ok(container_id)
    }

    /// Warm the image cache for every enabled language so no job pays for a pull.
    /// Failures are logged; a job that needs a missing image pulls it under its own deadline.
    pub async fn pull_images(&self) {
        for language in self.languages.enabled_languages() {
            let Ok(config) = self.languages.get_config(&language) else {
                continue;
            };
            if let Err(e) = self.ensure_image(&config.image).await {
                warn!(language = %language, image = %config.image, error = %e, "Failed to pre-pull image");
            }
        }
    }

    async fn remove(&self, guard: &mut ContainerGuard, container_id: &str) {
        if let Err(e) = self.docker.remove_container(container_id, Some(force_remove())).await {
            warn!(container = %container_id, error = %e, "Failed to remove container");
            return;
        }
        guard.disarm();
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    #[tracing::instrument(skip_all, fields(language = %request.language))]
    async fn run(&self, request: &SandboxRequest, ctx: &ExecContext) -> Result<SandboxOutput, SandboxError> {
        ctx.check()?;

        let language = self
            .languages
            .get_config(&request.language)
            .map_err(|e| SandboxError::Unavailable(e.to_string()))?;

        // Pull, create and start all count against the job's deadline.
        let mut guard: Option<ContainerGuard> = None;
        let launched = tokio::select! {
            launched = self.launch(request, language, &mut guard) => launched,
            reason = ctx.done() => Err(reason.into()),
        };
        let container_id = match launched {
            Ok(container_id) => container_id,
            Err(e) => {
                if let Some(mut guard) = guard {
                    if let Some(container_id) = guard.container_id.clone() {
                        warn!(container = %container_id, error = %e, "Container launch aborted");
                        self.remove(&mut guard, &container_id).await;
                    }
                }
                return Err(e);
            }
        };
        // A successful launch always arms the guard.
        let Some(mut guard) = guard else {
            return Err(SandboxError::Unavailable("container guard missing after launch".to_string()));
        };
        let start = Instant::now();

        let outcome = tokio::select! {
            collected = self.collect(&container_id) => collected,
            reason = ctx.done() => {
                warn!(container = %container_id, reason = %reason, "Killing container");
                if let Err(e) = self
                    .docker
                    .kill_container(&container_id, None::<KillContainerOptions<String>>)
                    .await
                {
                    debug!(container = %container_id, error = %e, "Kill failed, container may have exited");
                }
                self.remove(&mut guard, &container_id).await;
                return Err(reason.into());
            }
        };

        let duration = start.elapsed();
        self.remove(&mut guard, &container_id).await;

        let (stdout, mut stderr, exit_code) = outcome?;
        match exit_code {
            137 => stderr.push_str("\n[container killed: likely exceeded memory limit]"),
            139 => stderr.push_str("\n[container killed: segmentation fault]"),
            _ => {}
        }

        debug!(container = %container_id, exit_code, duration_ms = duration.as_millis() as u64, "Container exited");

        Ok(SandboxOutput {
            stdout,
            stderr,
            exit_code,
            duration,
        })
    }
}

fn append_capped(buf: &mut Vec<u8>, message: &[u8]) {
    let room = MAX_CAPTURE_BYTES.saturating_sub(buf.len());
    buf.extend_from_slice(&message[..message.len().min(room)]);
}

/// `uid:gid` of the workspace directory, so guest writes stay removable by the worker.
fn workspace_owner(workdir: &Path) -> Result<String, SandboxError> {
    let meta = std::fs::metadata(workdir)
        .map_err(|e| SandboxError::Unavailable(format!("workspace {} unreadable: {}", workdir.display(), e)))?;
    Ok(format!("{}:{}", meta.uid(), meta.gid()))
}

fn container_config(request: &SandboxRequest, language: &LanguageConfig, user: &str) -> Config<String> {
    let env = request
        .env
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();

    Config {
        image: Some(language.image.clone()),
        cmd: Some(request.command.clone()),
        env: Some(env),
        user: Some(user.to_string()),
        working_dir: Some(GUEST_WORKDIR.to_string()),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        network_disabled: Some(true),
        host_config: Some(HostConfig {
            binds: Some(vec![format!("{}:{}", request.workdir.display(), GUEST_WORKDIR)]),
            network_mode: Some("none".to_string()),
            memory: Some(language.memory_limit_bytes()),
            // Equal to memory: no swap on top of the limit.
            memory_swap: Some(language.memory_limit_bytes()),
            nano_cpus: Some(language.nano_cpus()),
            pids_limit: Some(language.pids_limit),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proctor_common::Language;
    use std::path::PathBuf;

    fn python_config() -> LanguageConfig {
        LanguageConfig {
            name: Language::Python,
            image: "proctor-python:latest".to_string(),
            memory_limit_mb: 256,
            cpu_limit: 0.5,
            pids_limit: 64,
        }
    }

    #[test]
    fn test_container_config_isolates_guest() {
        let request = SandboxRequest::new(
            Language::Python,
            PathBuf::from("/var/proctor/proctor-abc"),
            vec!["python".to_string(), "-m".to_string(), "pytest".to_string()],
        )
        .env("PROCTOR_REPORT", ".proctor-report.jsonl");

        let config = container_config(&request, &python_config(), "1000:1000");

        assert_eq!(config.image.as_deref(), Some("proctor-python:latest"));
        assert_eq!(config.working_dir.as_deref(), Some(GUEST_WORKDIR));
        assert_eq!(config.user.as_deref(), Some("1000:1000"));
        assert_eq!(config.network_disabled, Some(true));
        assert_eq!(config.env, Some(vec!["PROCTOR_REPORT=.proctor-report.jsonl".to_string()]));

        let host = config.host_config.unwrap();
        assert_eq!(host.binds, Some(vec!["/var/proctor/proctor-abc:/workspace".to_string()]));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.memory, Some(256 * 1024 * 1024));
        assert_eq!(host.nano_cpus, Some(500_000_000));
        assert_eq!(host.pids_limit, Some(64));
    }

    #[test]
    fn test_append_capped_stops_at_limit() {
        let mut buf = vec![0u8; MAX_CAPTURE_BYTES - 2];
        append_capped(&mut buf, b"abcdef");
        assert_eq!(buf.len(), MAX_CAPTURE_BYTES);
        assert_eq!(&buf[buf.len() - 2..], b"ab");
        append_capped(&mut buf, b"more");
        assert_eq!(buf.len(), MAX_CAPTURE_BYTES);
    }

    #[test]
    fn test_workspace_owner_reads_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let owner = workspace_owner(dir.path()).unwrap();
        let (uid, gid) = owner.split_once(':').unwrap();
        assert!(uid.parse::<u32>().is_ok());
        assert!(gid.parse::<u32>().is_ok());
        assert!(workspace_owner(Path::new("/definitely/not/here")).is_err());
    }

    /// Accepts connections and never answers, like a daemon wedged mid-pull.
    async fn stalled_daemon() -> (String, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("tcp://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        (addr, server)
    }

    #[tokio::test]
    async fn test_deadline_covers_image_pull() {
        let (addr, server) = stalled_daemon().await;
        let docker = Docker::connect_with_http(&addr, 120, bollard::API_DEFAULT_VERSION).unwrap();
        let languages = LanguageConfigManager::from_json(
            r#"{"languages":[{"name":"python","image":"proctor-python:latest","memory_limit_mb":256,"cpu_limit":0.5,"pids_limit":64}]}"#,
        )
        .unwrap();
        let sandbox = DockerSandbox::with_client(docker, languages);

        let workdir = tempfile::tempdir().unwrap();
        let request = SandboxRequest::new(Language::Python, workdir.path().to_path_buf(), vec!["true".to_string()]);
        let ctx = ExecContext::with_timeout(std::time::Duration::from_millis(300));

        let started = Instant::now();
        let err = sandbox.run(&request, &ctx).await.unwrap_err();

        assert!(matches!(err, SandboxError::Timeout), "got {:?}", err);
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
        server.abort();
    }

    #[tokio::test]
    async fn test_cancel_during_launch() {
        let (addr, server) = stalled_daemon().await;
        let docker = Docker::connect_with_http(&addr, 120, bollard::API_DEFAULT_VERSION).unwrap();
        let languages = LanguageConfigManager::from_json(
            r#"{"languages":[{"name":"go","image":"proctor-go:latest","memory_limit_mb":512,"cpu_limit":1.0,"pids_limit":256}]}"#,
        )
        .unwrap();
        let sandbox = DockerSandbox::with_client(docker, languages);

        let workdir = tempfile::tempdir().unwrap();
        let request = SandboxRequest::new(Language::Go, workdir.path().to_path_buf(), vec!["true".to_string()]);
        let ctx = ExecContext::with_timeout(std::time::Duration::from_secs(60));
        let token = ctx.cancel_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            token.cancel();
        });

        let err = sandbox.run(&request, &ctx).await.unwrap_err();
        assert!(matches!(err, SandboxError::Cancelled), "got {:?}", err);
        server.abort();
    }
}
