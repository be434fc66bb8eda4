use std::sync::Arc;

use anyhow::Context;
use proctor_common::config::{Config, SandboxBackend};
use proctor_common::redis::RedisBroker;
use proctor_common::Broker;
use proctor_worker::config::LanguageConfigManager;
use proctor_worker::docker::DockerSandbox;
use proctor_worker::engine::{LocalSandbox, Sandbox};
use proctor_worker::languages::ExecutorRegistry;
use proctor_worker::workspace::sweep_orphans;
use proctor_worker::{Orchestrator, PoolConfig, WorkerPool};
use tokio::signal;
use tracing::{info, warn};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    if std::env::var("PROCTOR_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Proctor Worker booting...");

    let config = Config::from_env().context("Invalid worker configuration")?;

    let languages = LanguageConfigManager::load(&config.languages_path)
        .context("Failed to load language configurations")?;
    let enabled = languages.enabled_languages();
    info!(languages = ?enabled, "Loaded language configurations");

    std::fs::create_dir_all(&config.scratch_dir)
        .with_context(|| format!("Failed to create scratch dir {}", config.scratch_dir.display()))?;
    sweep_orphans(&config.scratch_dir).context("Failed to sweep orphaned workspaces")?;

    let sandbox: Arc<dyn Sandbox> = match config.sandbox {
        SandboxBackend::Docker => {
            let docker = DockerSandbox::new(languages)?;
            docker.pull_images().await;
            Arc::new(docker)
        }
        SandboxBackend::Local => Arc::new(LocalSandbox::new_unsandboxed()),
    };
    info!(sandbox = sandbox.name(), "Sandbox ready");

    let executors = Arc::new(ExecutorRegistry::with_defaults(sandbox, &enabled));
    let orchestrator = Arc::new(
        Orchestrator::new(executors, config.scratch_dir.clone()).with_default_timeout(config.default_timeout),
    );

    let broker: Arc<dyn Broker> = Arc::new(
        RedisBroker::connect(&config.redis_url, &config.consumer_name)
            .await
            .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))?,
    );
    info!(redis_url = %config.redis_url, consumer = %config.consumer_name, "Connected to Redis");

    let pool = WorkerPool::start(PoolConfig::from(&config), broker, orchestrator)
        .await
        .context("Failed to start worker pool")?;

    signal::ctrl_c().await.context("Failed to install CTRL+C signal handler")?;
    warn!("Received shutdown signal, finishing in-flight jobs...");

    pool.shutdown().await;
    info!("Worker shutdown complete");
    Ok(())
}
