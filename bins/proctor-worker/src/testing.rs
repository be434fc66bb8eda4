//! Test doubles for executors.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use proctor_common::{Diagnostic, Job, Language, Recipe, TestResult};

use crate::context::ExecContext;
use crate::engine::LocalSandbox;
use crate::error::ExecError;
use crate::languages::{BuildReport, FormatReport, LanguageExecutor, TestReport, Toolchain};
use crate::parsers::{self, ParseError};
use crate::workspace::Workspace;

pub fn job(language: Language, recipe: Recipe) -> Job {
    let code = BTreeMap::from([("main.py".to_string(), "x = 1\n".to_string())]);
    Job::new(language, code, recipe).with_owner("user-1", "artifact-1")
}

const PASSING_TESTS: &str = "running 2 tests\ntest a ... ok\ntest b ... ok\n";
const FAILING_TESTS: &str = "running 2 tests\ntest a ... ok\ntest b ... FAILED\n";
const BROKEN_BUILD: &str = "  File \"main.py\", line 3\n    x =\n      ^\nSyntaxError: invalid syntax\n";

/// Executor with scripted phase outcomes that never touches a toolchain.
pub struct FakeExecutor {
    language: Language,
    build_ok: bool,
    test_ok: bool,
    test_output: Option<String>,
    delay: Duration,
    panic_on_build: bool,
    builds: AtomicUsize,
    tests: AtomicUsize,
}

impl FakeExecutor {
    pub fn new(language: Language) -> Self {
        Self {
            language,
            build_ok: true,
            test_ok: true,
            test_output: None,
            delay: Duration::ZERO,
            panic_on_build: false,
            builds: AtomicUsize::new(0),
            tests: AtomicUsize::new(0),
        }
    }

    pub fn failing_build(mut self) -> Self {
        self.build_ok = false;
        self
    }

    pub fn failing_tests(mut self) -> Self {
        self.test_ok = false;
        self
    }

    pub fn with_test_output(mut self, output: &str) -> Self {
        self.test_output = Some(output.to_string());
        self
    }

    /// Test phase sleeps this long, honouring deadline and cancellation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn panicking(mut self) -> Self {
        self.panic_on_build = true;
        self
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn tests(&self) -> usize {
        self.tests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageExecutor for FakeExecutor {
    fn language(&self) -> Language {
        self.language
    }

    fn scaffold(&self, _workspace: &Workspace) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    async fn format(&self, _workspace: &Workspace, _ctx: &ExecContext) -> Result<FormatReport, ExecError> {
        Ok(FormatReport { ok: true, diff: String::new() })
    }

    async fn format_fix(&self, workspace: &Workspace, _ctx: &ExecContext) -> Result<BTreeMap<String, String>, ExecError> {
        Ok(workspace.read_submitted()?)
    }

    async fn build(&self, _workspace: &Workspace, _ctx: &ExecContext) -> Result<BuildReport, ExecError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_build {
            panic!("toolchain exploded");
        }
        Ok(BuildReport {
            ok: self.build_ok,
            output: if self.build_ok { String::new() } else { BROKEN_BUILD.to_string() },
        })
    }

    async fn test(&self, _workspace: &Workspace, _flags: &[String], ctx: &ExecContext) -> Result<TestReport, ExecError> {
        self.tests.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                reason = ctx.done() => return Err(reason),
            }
        }
        let output = match &self.test_output {
            Some(output) => output.clone(),
            None if self.test_ok => PASSING_TESTS.to_string(),
            None => FAILING_TESTS.to_string(),
        };
        Ok(TestReport {
            ok: self.test_ok,
            output,
            report: None,
            duration: self.delay,
        })
    }

    fn parse_build_errors(&self, output: &str) -> Vec<Diagnostic> {
        parsers::pytest::parse_compile_errors(output)
    }

    fn parse_tests(&self, report: &TestReport) -> Result<Vec<TestResult>, ParseError> {
        parsers::libtest::parse_test_output(&report.output)
    }
}

/// Executor whose test phase runs `sleep 5` as a real local subprocess.
pub struct SleepExecutor {
    language: Language,
    toolchain: Toolchain,
}

impl SleepExecutor {
    pub fn new(language: Language) -> Self {
        Self {
            language,
            toolchain: Toolchain::new(language, Arc::new(LocalSandbox::new_unsandboxed()), &[]),
        }
    }
}

#[async_trait]
impl LanguageExecutor for SleepExecutor {
    fn language(&self) -> Language {
        self.language
    }

    fn scaffold(&self, _workspace: &Workspace) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    async fn format(&self, _workspace: &Workspace, _ctx: &ExecContext) -> Result<FormatReport, ExecError> {
        Ok(FormatReport { ok: true, diff: String::new() })
    }

    async fn format_fix(&self, workspace: &Workspace, _ctx: &ExecContext) -> Result<BTreeMap<String, String>, ExecError> {
        Ok(workspace.read_submitted()?)
    }

    async fn build(&self, _workspace: &Workspace, _ctx: &ExecContext) -> Result<BuildReport, ExecError> {
        Ok(BuildReport { ok: true, output: String::new() })
    }

    async fn test(&self, workspace: &Workspace, _flags: &[String], ctx: &ExecContext) -> Result<TestReport, ExecError> {
        let command = vec!["sleep".to_string(), "5".to_string()];
        let output = self.toolchain.run(workspace, "test", command, &[], ctx).await?;
        Ok(TestReport {
            ok: output.success(),
            output: output.combined(),
            report: None,
            duration: output.duration,
        })
    }

    fn parse_build_errors(&self, _output: &str) -> Vec<Diagnostic> {
        Vec::new()
    }

    fn parse_tests(&self, _report: &TestReport) -> Result<Vec<TestResult>, ParseError> {
        Ok(Vec::new())
    }
}
