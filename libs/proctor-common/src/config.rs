// Runtime configuration shared by the worker binary and in-process callers.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::types::DEFAULT_TIMEOUT_SECS;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("PROCTOR_SANDBOX=local requires PROCTOR_ALLOW_UNSANDBOXED=true")]
    UnsandboxedNotAllowed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxBackend {
    Docker,
    /// Plain subprocesses without isolation. Operator opt-in only.
    Local,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub workers: usize,
    pub prefetch: usize,
    pub default_timeout: Duration,
    pub consumer_name: String,
    pub sandbox: SandboxBackend,
    pub scratch_dir: PathBuf,
    pub languages_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            workers: 3,
            prefetch: 1,
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS as u64),
            consumer_name: "worker-0".to_string(),
            sandbox: SandboxBackend::Docker,
            scratch_dir: std::env::temp_dir().join("proctor"),
            languages_path: PathBuf::from("config/languages.json"),
        }
    }
}

impl Config {
    /// Load from process environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Lets tests avoid mutating the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let workers = parse_or(&lookup, "PROCTOR_WORKERS", defaults.workers)?;
        let prefetch = parse_or(&lookup, "PROCTOR_PREFETCH", defaults.prefetch)?;
        let timeout_secs = parse_or(
            &lookup,
            "PROCTOR_DEFAULT_TIMEOUT_SECS",
            defaults.default_timeout.as_secs(),
        )?;

        if workers == 0 {
            return Err(invalid("PROCTOR_WORKERS", "0", "must be at least 1"));
        }
        if prefetch == 0 {
            return Err(invalid("PROCTOR_PREFETCH", "0", "must be at least 1"));
        }
        if timeout_secs == 0 {
            return Err(invalid("PROCTOR_DEFAULT_TIMEOUT_SECS", "0", "must be at least 1"));
        }

        let allow_unsandboxed = parse_or(&lookup, "PROCTOR_ALLOW_UNSANDBOXED", false)?;
        let sandbox = match lookup("PROCTOR_SANDBOX").as_deref().map(str::trim) {
            None | Some("") | Some("docker") => SandboxBackend::Docker,
            Some("local") if allow_unsandboxed => SandboxBackend::Local,
            Some("local") => return Err(ConfigError::UnsandboxedNotAllowed),
            Some(other) => return Err(invalid("PROCTOR_SANDBOX", other, "expected docker or local")),
        };

        Ok(Self {
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            workers,
            prefetch,
            default_timeout: Duration::from_secs(timeout_secs),
            consumer_name: lookup("PROCTOR_CONSUMER").unwrap_or(defaults.consumer_name),
            sandbox,
            scratch_dir: lookup("PROCTOR_SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.scratch_dir),
            languages_path: lookup("PROCTOR_LANGUAGES")
                .map(PathBuf::from)
                .unwrap_or(defaults.languages_path),
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, &raw, &e.to_string())),
    }
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
