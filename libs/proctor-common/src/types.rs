use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Timeout applied when a recipe does not ask for a positive one.
pub const DEFAULT_TIMEOUT_SECS: i64 = 30;

/// Guest languages the pipeline knows how to check.
///
/// Closed set: a payload naming any other language does not deserialize and is
/// treated as malformed by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Go,
    Python,
    Rust,
}

impl Language {
    pub const ALL: [Language; 3] = [Language::Go, Language::Python, Language::Rust];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Go => "go",
            Language::Python => "python",
            Language::Rust => "rust",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown language: {0}")]
pub struct UnknownLanguage(pub String);

/// Case-insensitive, accepting the common short names.
impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "go" | "golang" => Ok(Language::Go),
            "python" | "py" => Ok(Language::Python),
            "rust" | "rs" => Ok(Language::Rust),
            _ => Err(UnknownLanguage(s.to_string())),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checks requested for one job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    #[serde(default)]
    pub format: bool,
    #[serde(default)]
    pub build: bool,
    #[serde(default)]
    pub test: bool,
    /// Seconds. Zero or negative selects the default.
    #[serde(default)]
    pub timeout: i64,
    #[serde(default)]
    pub test_flags: Vec<String>,
}

impl Recipe {
    /// Effective deadline for the whole job.
    pub fn timeout(&self) -> Duration {
        self.timeout_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS as u64))
    }

    /// Effective deadline, falling back to `default` when unset.
    pub fn timeout_or(&self, default: Duration) -> Duration {
        if self.timeout > 0 {
            Duration::from_secs(self.timeout as u64)
        } else {
            default
        }
    }
}

/// A request to check one bundle of source files. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub user_id: String,
    pub artifact_id: String,
    pub language: Language,
    /// filename -> content
    pub code: BTreeMap<String, String>,
    pub recipe: Recipe,
}

impl Job {
    pub fn new(language: Language, code: BTreeMap<String, String>, recipe: Recipe) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: String::new(),
            artifact_id: String::new(),
            language,
            code,
            recipe,
        }
    }

    pub fn with_owner(mut self, user_id: impl Into<String>, artifact_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self.artifact_id = artifact_id.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Completed,
    Failed,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
    Error,
    Warning,
    Note,
}

/// One compiler or type-checker message tied to a source location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub file: String,
    pub line: u32,
    pub message: String,
    pub severity: DiagnosticSeverity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub passed: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskSeverity {
    Low,
    Medium,
    High,
}

/// Advisory finding from the static pattern scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskNotice {
    pub pattern_id: String,
    pub category: String,
    pub severity: RiskSeverity,
    pub title: String,
    pub description: String,
    pub file: String,
    /// 1-based
    pub line: u32,
    pub suggestion: String,
}

/// Normalized outcome of the requested checks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub format_ok: bool,
    #[serde(default)]
    pub format_diff: String,
    pub build_ok: bool,
    #[serde(default)]
    pub build_output: String,
    #[serde(default)]
    pub build_errors: Vec<Diagnostic>,
    pub test_ok: bool,
    /// Raw runner output, kept so a report that fails to parse is still visible.
    #[serde(default)]
    pub test_output: String,
    pub tests_passed: u32,
    pub tests_failed: u32,
    #[serde(default)]
    pub test_results: Vec<TestResult>,
    #[serde(default)]
    pub risks: Vec<RiskNotice>,
}

/// The single result published for every job that reached a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub output: Output,
    #[serde(default)]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn completed(job_id: Uuid, output: Output, duration: Duration) -> Self {
        Self::new(job_id, JobStatus::Completed, output, None, duration)
    }

    /// `output` carries whatever was gathered before the failure, such as risk notices.
    pub fn failed(job_id: Uuid, output: Output, error: impl Into<String>, duration: Duration) -> Self {
        Self::new(job_id, JobStatus::Failed, output, Some(error.into()), duration)
    }

    pub fn timed_out(job_id: Uuid, output: Output, error: impl Into<String>, duration: Duration) -> Self {
        Self::new(job_id, JobStatus::Timeout, output, Some(error.into()), duration)
    }

    fn new(
        job_id: Uuid,
        status: JobStatus,
        output: Output,
        error: Option<String>,
        duration: Duration,
    ) -> Self {
        Self {
            job_id,
            status,
            output,
            error,
            duration_ms: duration.as_millis() as u64,
            completed_at: Utc::now(),
        }
    }
}
