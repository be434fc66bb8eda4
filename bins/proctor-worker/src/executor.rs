/// Job Executor - High-Level Orchestration
///
/// **Responsibility:**
/// Sequence Format -> Build -> Test for one job against its language executor
/// and fold the reports into a single [`Output`].
///
/// **Architecture:**
/// 1. Resolve the executor from the registry (languages/)
/// 2. Materialize the submission into a scratch workspace
/// 3. Run the requested phases inside the sandbox (engine.rs)
/// 4. Normalize raw output with the parsers (parsers/)
/// 5. Attach static risk findings (risk.rs)
///
/// This module is the glue layer - it knows nothing about:
/// - How code executes (the sandbox's job)
/// - What commands a language needs (the executor's job)

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use proctor_common::types::DEFAULT_TIMEOUT_SECS;
use proctor_common::{Job, Output, RiskNotice};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::context::ExecContext;
use crate::error::ExecError;
use crate::languages::ExecutorRegistry;
use crate::risk::RiskDetector;
use crate::runs::RunRegistry;

/// Everything one execution produced. `error` is set when a phase could not
/// finish; `output` still holds what was gathered up to that point.
#[derive(Debug)]
pub struct JobOutcome {
    pub output: Output,
    pub error: Option<ExecError>,
}

impl JobOutcome {
    pub fn into_result(self) -> Result<Output, ExecError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.output),
        }
    }
}

pub struct Orchestrator {
    executors: Arc<ExecutorRegistry>,
    runs: RunRegistry,
    risk: RiskDetector,
    scratch_root: PathBuf,
    default_timeout: Duration,
}

impl Orchestrator {
    pub fn new(executors: Arc<ExecutorRegistry>, scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            executors,
            runs: RunRegistry::new(),
            risk: RiskDetector::new(),
            scratch_root: scratch_root.into(),
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS as u64),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_risk_detector(mut self, risk: RiskDetector) -> Self {
        self.risk = risk;
        self
    }

    /// Fresh deadline scope for `job`, from its recipe or the default.
    pub fn context_for(&self, job: &Job) -> ExecContext {
        ExecContext::with_timeout(job.recipe.timeout_or(self.default_timeout))
    }

    /// Run `job` with a deadline derived from its recipe.
    pub async fn execute(&self, job: &Job) -> Result<Output, ExecError> {
        let ctx = self.context_for(job);
        self.execute_with(job, &ctx).await
    }

    /// Run `job` under a caller-supplied context.
    ///
    /// Fails with [`ExecError::AlreadyRunning`] if the same job ID is in flight.
    /// Negative check outcomes are reported in the output, not as errors.
    pub async fn execute_with(&self, job: &Job, ctx: &ExecContext) -> Result<Output, ExecError> {
        self.run(job, ctx).await.into_result()
    }

    /// Like [`Self::execute_with`], but keeps the partial output when a phase
    /// errors: risk notices and every phase that finished before the failure.
    #[instrument(skip_all, fields(job_id = %job.id, language = %job.language))]
    pub async fn run(&self, job: &Job, ctx: &ExecContext) -> JobOutcome {
        let mut output = Output {
            risks: self.scan_risks(job),
            ..Default::default()
        };
        if !output.risks.is_empty() {
            debug!(risks = output.risks.len(), "Risk patterns matched");
        }

        let error = self.run_phases(job, ctx, &mut output).await.err();
        JobOutcome { output, error }
    }

    /// Static risk findings for the submission. Never fails.
    pub fn scan_risks(&self, job: &Job) -> Vec<RiskNotice> {
        self.risk.scan(job.language, &job.code)
    }

    async fn run_phases(&self, job: &Job, ctx: &ExecContext, output: &mut Output) -> Result<(), ExecError> {
        let _run = self.runs.register(job.id, ctx.cancel_token().clone())?;
        let executor = self.executors.get(job.language)?;
        let recipe = &job.recipe;

        let workspace = executor.prepare(&self.scratch_root, &job.code)?;
        ctx.check()?;

        if recipe.format {
            let report = executor.format(&workspace, ctx).await?;
            output.format_ok = report.ok;
            output.format_diff = report.diff;
        }

        let mut build_ok = true;
        if recipe.build {
            let report = executor.build(&workspace, ctx).await?;
            build_ok = report.ok;
            output.build_ok = report.ok;
            output.build_errors = executor.parse_build_errors(&report.output);
            output.build_output = report.output;
        }

        if recipe.test && !build_ok {
            info!("Build failed, skipping tests");
        } else if recipe.test {
            let report = executor.test(&workspace, &recipe.test_flags, ctx).await?;
            match executor.parse_tests(&report) {
                Ok(results) => {
                    output.tests_passed = results.iter().filter(|r| r.passed).count() as u32;
                    output.tests_failed = results.len() as u32 - output.tests_passed;
                    output.test_ok = report.ok && output.tests_failed == 0;
                    output.test_results = results;
                }
                Err(e) => {
                    warn!(error = %e, "Test output could not be parsed");
                    output.test_ok = false;
                }
            }
            output.test_output = report.output;
        }

        info!(
            format_ok = output.format_ok,
            build_ok = output.build_ok,
            test_ok = output.test_ok,
            tests_passed = output.tests_passed,
            tests_failed = output.tests_failed,
            "Job checks finished"
        );
        Ok(())
    }

    /// Format the submission in place and return the corrected files.
    #[instrument(skip_all, fields(job_id = %job.id, language = %job.language))]
    pub async fn format_fix(&self, job: &Job) -> Result<BTreeMap<String, String>, ExecError> {
        let executor = self.executors.get(job.language)?;
        let ctx = self.context_for(job);
        let workspace = executor.prepare(&self.scratch_root, &job.code)?;
        executor.format_fix(&workspace, &ctx).await
    }

    pub fn is_running(&self, job_id: &Uuid) -> bool {
        self.runs.is_running(job_id)
    }

    /// Stop a running job. No-op for unknown or finished jobs.
    pub fn cancel(&self, job_id: &Uuid) -> bool {
        let cancelled = self.runs.cancel(job_id);
        if cancelled {
            info!(job_id = %job_id, "Cancellation requested");
        }
        cancelled
    }

    /// Wait for a job to finish, or for `ctx` to be cancelled.
    pub async fn wait(&self, job_id: &Uuid, ctx: &CancellationToken) {
        self.runs.wait(job_id, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{job, FakeExecutor, SleepExecutor};
    use proctor_common::{Language, Recipe, RiskSeverity};
    use std::time::Instant;

    fn orchestrator(executor: Arc<FakeExecutor>) -> (tempfile::TempDir, Orchestrator) {
        let scratch = tempfile::tempdir().unwrap();
        let registry = ExecutorRegistry::new();
        registry.register(executor);
        let orchestrator = Orchestrator::new(Arc::new(registry), scratch.path());
        (scratch, orchestrator)
    }

    fn all_phases() -> Recipe {
        Recipe {
            format: true,
            build: true,
            test: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_all_phases_pass() {
        let fake = Arc::new(FakeExecutor::new(Language::Python));
        let (_scratch, orchestrator) = orchestrator(fake.clone());

        let output = orchestrator.execute(&job(Language::Python, all_phases())).await.unwrap();

        assert!(output.format_ok);
        assert!(output.build_ok);
        assert!(output.test_ok);
        assert_eq!(output.tests_passed, 2);
        assert_eq!(output.tests_failed, 0);
        assert_eq!(fake.builds(), 1);
        assert_eq!(fake.tests(), 1);
    }

    #[tokio::test]
    async fn test_failed_build_skips_tests() {
        let fake = Arc::new(FakeExecutor::new(Language::Python).failing_build());
        let (_scratch, orchestrator) = orchestrator(fake.clone());

        let output = orchestrator.execute(&job(Language::Python, all_phases())).await.unwrap();

        assert!(!output.build_ok);
        assert!(!output.test_ok);
        assert_eq!(output.build_errors.len(), 1);
        assert_eq!(output.build_errors[0].line, 3);
        assert_eq!(fake.tests(), 0);
        // Format does not depend on build.
        assert!(output.format_ok);
    }

    #[tokio::test]
    async fn test_tests_run_when_build_not_requested() {
        let fake = Arc::new(FakeExecutor::new(Language::Python).failing_build());
        let (_scratch, orchestrator) = orchestrator(fake.clone());
        let recipe = Recipe {
            test: true,
            ..Default::default()
        };

        let output = orchestrator.execute(&job(Language::Python, recipe)).await.unwrap();
        assert_eq!(fake.builds(), 0);
        assert_eq!(fake.tests(), 1);
        assert!(output.test_ok);
        assert!(!output.format_ok);
    }

    #[tokio::test]
    async fn test_failing_tests_are_counted() {
        let fake = Arc::new(FakeExecutor::new(Language::Python).failing_tests());
        let (_scratch, orchestrator) = orchestrator(fake);

        let output = orchestrator.execute(&job(Language::Python, all_phases())).await.unwrap();
        assert!(!output.test_ok);
        assert_eq!(output.tests_passed, 1);
        assert_eq!(output.tests_failed, 1);
        assert_eq!(output.test_results.len(), 2);
    }

    #[tokio::test]
    async fn test_unparseable_tests_degrade_test_ok() {
        let fake = Arc::new(FakeExecutor::new(Language::Python).with_test_output("Segmentation fault\n"));
        let (_scratch, orchestrator) = orchestrator(fake);

        let output = orchestrator.execute(&job(Language::Python, all_phases())).await.unwrap();
        assert!(!output.test_ok);
        assert!(output.test_results.is_empty());
        assert_eq!(output.test_output, "Segmentation fault\n");
    }

    #[tokio::test]
    async fn test_unregistered_language_fails() {
        let fake = Arc::new(FakeExecutor::new(Language::Python));
        let (_scratch, orchestrator) = orchestrator(fake);

        let err = orchestrator.execute(&job(Language::Go, all_phases())).await.unwrap_err();
        assert!(matches!(err, ExecError::NoExecutor(Language::Go)));
    }

    #[tokio::test]
    async fn test_risks_attached_even_when_build_fails() {
        let fake = Arc::new(FakeExecutor::new(Language::Python).failing_build());
        let (_scratch, orchestrator) = orchestrator(fake);
        let mut job = job(Language::Python, all_phases());
        job.code.insert("evil.py".to_string(), "eval(input())\n".to_string());

        let output = orchestrator.execute(&job).await.unwrap();
        assert_eq!(output.risks.len(), 1);
        assert_eq!(output.risks[0].severity, RiskSeverity::High);
        assert_eq!(output.risks[0].file, "evil.py");
    }

    #[tokio::test]
    async fn test_invalid_filename_rejected() {
        let fake = Arc::new(FakeExecutor::new(Language::Python));
        let (_scratch, orchestrator) = orchestrator(fake.clone());
        let mut job = job(Language::Python, all_phases());
        job.code.insert("../escape.py".to_string(), String::new());

        let err = orchestrator.execute(&job).await.unwrap_err();
        assert!(matches!(err, ExecError::InvalidSubmission(_)));
        assert_eq!(fake.builds(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_job_rejected_while_running() {
        let fake = Arc::new(FakeExecutor::new(Language::Python).with_delay(Duration::from_millis(300)));
        let (_scratch, orchestrator) = orchestrator(fake);
        let orchestrator = Arc::new(orchestrator);
        let job = job(Language::Python, all_phases());

        let first = {
            let orchestrator = orchestrator.clone();
            let job = job.clone();
            tokio::spawn(async move { orchestrator.execute(&job).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(orchestrator.is_running(&job.id));

        let err = orchestrator.execute(&job).await.unwrap_err();
        assert!(matches!(err, ExecError::AlreadyRunning(id) if id == job.id));

        first.await.unwrap().unwrap();
        assert!(!orchestrator.is_running(&job.id));
    }

    #[tokio::test]
    async fn test_cancel_stops_running_job() {
        let fake = Arc::new(FakeExecutor::new(Language::Python).with_delay(Duration::from_secs(10)));
        let (_scratch, orchestrator) = orchestrator(fake);
        let orchestrator = Arc::new(orchestrator);
        let job = job(Language::Python, all_phases());

        let running = {
            let orchestrator = orchestrator.clone();
            let job = job.clone();
            tokio::spawn(async move { orchestrator.execute(&job).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(orchestrator.cancel(&job.id));
        assert!(orchestrator.cancel(&job.id));
        orchestrator.wait(&job.id, &CancellationToken::new()).await;

        let err = running.await.unwrap().unwrap_err();
        assert!(matches!(err, ExecError::Cancelled));
        assert!(!orchestrator.cancel(&job.id));
    }

    #[tokio::test]
    async fn test_deadline_kills_sleeping_guest() {
        let scratch = tempfile::tempdir().unwrap();
        let registry = ExecutorRegistry::new();
        registry.register(Arc::new(SleepExecutor::new(Language::Python)));
        let orchestrator = Orchestrator::new(Arc::new(registry), scratch.path());
        let recipe = Recipe {
            test: true,
            timeout: 1,
            ..Default::default()
        };

        let started = Instant::now();
        let err = orchestrator.execute(&job(Language::Python, recipe)).await.unwrap_err();

        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_format_fix_returns_corrected_files() {
        let fake = Arc::new(FakeExecutor::new(Language::Python));
        let (_scratch, orchestrator) = orchestrator(fake);

        let fixed = orchestrator.format_fix(&job(Language::Python, Recipe::default())).await.unwrap();
        assert_eq!(fixed.get("main.py").map(String::as_str), Some("x = 1\n"));
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output() {
        let scratch = tempfile::tempdir().unwrap();
        let registry = ExecutorRegistry::new();
        registry.register(Arc::new(SleepExecutor::new(Language::Python)));
        let orchestrator = Orchestrator::new(Arc::new(registry), scratch.path());

        let mut job = job(
            Language::Python,
            Recipe {
                timeout: 1,
                ..all_phases()
            },
        );
        job.code.insert("loop.py".to_string(), "while True:\n    pass\n".to_string());

        let outcome = orchestrator.run(&job, &orchestrator.context_for(&job)).await;

        assert!(outcome.error.as_ref().is_some_and(ExecError::is_timeout));
        assert!(outcome.output.format_ok);
        assert!(outcome.output.build_ok);
        assert!(!outcome.output.test_ok);
        assert!(outcome.output.risks.iter().any(|r| r.pattern_id == "PY-WHILE-TRUE"));
        assert!(outcome.into_result().is_err());
    }

    #[tokio::test]
    async fn test_unknown_language_still_reports_risks() {
        let fake = Arc::new(FakeExecutor::new(Language::Python));
        let (_scratch, orchestrator) = orchestrator(fake);
        let mut job = job(Language::Go, all_phases());
        job.code = BTreeMap::from([("main.go".to_string(), "import \"unsafe\"\n".to_string())]);

        let outcome = orchestrator.run(&job, &orchestrator.context_for(&job)).await;

        assert!(matches!(outcome.error, Some(ExecError::NoExecutor(_))));
        assert!(outcome.output.risks.iter().any(|r| r.pattern_id == "GO-UNSAFE"));
    }
}
