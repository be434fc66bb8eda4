//! Per-language toolchain drivers and the registry that resolves them.
//!
//! An executor knows which commands check a guest language and how to read
//! their output. It never executes anything itself: every invocation goes
//! through the shared [`Sandbox`].

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use proctor_common::{Diagnostic, Language, TestResult};
use tracing::{debug, info};

use crate::context::ExecContext;
use crate::engine::{Sandbox, SandboxOutput, SandboxRequest};
use crate::error::ExecError;
use crate::parsers::ParseError;
use crate::workspace::Workspace;

pub mod go;
pub mod python;
pub mod rust;

pub use go::GoExecutor;
pub use python::PythonExecutor;
pub use rust::RustExecutor;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatReport {
    pub ok: bool,
    /// What the formatter would change; empty when `ok`.
    pub diff: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub ok: bool,
    pub output: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestReport {
    /// Runner exit status only; individual results come from parsing.
    pub ok: bool,
    pub output: String,
    /// Machine-readable payload for the parser, when the runner produces one
    /// separately from its console output.
    pub report: Option<String>,
    pub duration: Duration,
}

#[async_trait]
pub trait LanguageExecutor: Send + Sync {
    fn language(&self) -> Language;

    /// Toolchain files a submission may leave out. Only written when absent.
    fn scaffold(&self, workspace: &Workspace) -> Vec<(&'static str, String)>;

    /// Materialize `files` into a fresh workspace under `scratch_root`.
    fn prepare(&self, scratch_root: &Path, files: &BTreeMap<String, String>) -> Result<Workspace, ExecError> {
        let workspace = Workspace::materialize(scratch_root, files)?;
        for (name, content) in self.scaffold(&workspace) {
            if workspace.inject_if_absent(name, &content)? {
                debug!(language = %self.language(), file = name, "Injected scaffold");
            }
        }
        Ok(workspace)
    }

    /// Check formatting without modifying anything.
    async fn format(&self, workspace: &Workspace, ctx: &ExecContext) -> Result<FormatReport, ExecError>;

    /// Format in place and return the corrected submitted files.
    async fn format_fix(&self, workspace: &Workspace, ctx: &ExecContext) -> Result<BTreeMap<String, String>, ExecError>;

    async fn build(&self, workspace: &Workspace, ctx: &ExecContext) -> Result<BuildReport, ExecError>;

    async fn test(&self, workspace: &Workspace, flags: &[String], ctx: &ExecContext) -> Result<TestReport, ExecError>;

    fn parse_build_errors(&self, output: &str) -> Vec<Diagnostic>;

    fn parse_tests(&self, report: &TestReport) -> Result<Vec<TestResult>, ParseError>;
}

/// Runs one language's commands through the sandbox with a fixed environment.
pub(crate) struct Toolchain {
    language: Language,
    sandbox: Arc<dyn Sandbox>,
    env: Vec<(String, String)>,
}

impl Toolchain {
    pub(crate) fn new(language: Language, sandbox: Arc<dyn Sandbox>, env: &[(&str, &str)]) -> Self {
        Self {
            language,
            sandbox,
            env: env.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[tracing::instrument(skip_all, fields(language = %self.language, phase = phase))]
    pub(crate) async fn run(
        &self,
        workspace: &Workspace,
        phase: &'static str,
        command: Vec<String>,
        extra_env: &[(&str, &str)],
        ctx: &ExecContext,
    ) -> Result<SandboxOutput, ExecError> {
        let mut request = SandboxRequest::new(self.language, workspace.root().to_path_buf(), command);
        request.env = self.env.clone();
        for (key, value) in extra_env {
            request = request.env(*key, *value);
        }

        let output = self.sandbox.run(&request, ctx).await?;
        info!(
            exit_code = output.exit_code,
            duration_ms = output.duration.as_millis() as u64,
            "Phase finished"
        );
        Ok(output)
    }
}

/// `program args... files...`
pub(crate) fn command_with_files(base: &[&str], files: &[String]) -> Vec<String> {
    base.iter()
        .map(|s| s.to_string())
        .chain(files.iter().cloned())
        .collect()
}

/// Formatter output: a clean run prints nothing and exits zero.
pub(crate) fn format_report(output: &SandboxOutput) -> FormatReport {
    let ok = output.success() && output.stdout.trim().is_empty();
    let diff = if ok {
        String::new()
    } else if output.stdout.trim().is_empty() {
        // Formatter errored instead of diffing, e.g. on a syntax error.
        output.combined()
    } else {
        output.stdout.clone()
    };
    FormatReport { ok, diff }
}

/// The fixer refused the code; nothing was rewritten.
pub(crate) fn fix_failed(tool: &str, output: &SandboxOutput) -> ExecError {
    ExecError::InvalidSubmission(format!("{} could not format the submission: {}", tool, output.combined().trim()))
}

/// Language -> executor. Lookups for languages nobody registered fail loudly.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: Mutex<HashMap<Language, Arc<dyn LanguageExecutor>>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in executor for each of `enabled`.
    pub fn with_defaults(sandbox: Arc<dyn Sandbox>, enabled: &[Language]) -> Self {
        let registry = Self::new();
        for language in enabled {
            let executor: Arc<dyn LanguageExecutor> = match language {
                Language::Go => Arc::new(GoExecutor::new(sandbox.clone())),
                Language::Python => Arc::new(PythonExecutor::new(sandbox.clone())),
                Language::Rust => Arc::new(RustExecutor::new(sandbox.clone())),
            };
            registry.register(executor);
        }
        registry
    }

    /// Replaces any executor already registered for the same language.
    pub fn register(&self, executor: Arc<dyn LanguageExecutor>) {
        let language = executor.language();
        self.lock().insert(language, executor);
        debug!(%language, "Executor registered");
    }

    pub fn get(&self, language: Language) -> Result<Arc<dyn LanguageExecutor>, ExecError> {
        self.lock()
            .get(&language)
            .cloned()
            .ok_or(ExecError::NoExecutor(language))
    }

    pub fn languages(&self) -> Vec<Language> {
        let mut languages: Vec<Language> = self.lock().keys().copied().collect();
        languages.sort();
        languages
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Language, Arc<dyn LanguageExecutor>>> {
        self.executors.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
