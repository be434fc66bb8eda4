use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use proctor_common::{Diagnostic, Language, TestResult};
use tracing::warn;

use super::{command_with_files, fix_failed, format_report, BuildReport, FormatReport, LanguageExecutor, TestReport, Toolchain};
use crate::context::ExecContext;
use crate::engine::Sandbox;
use crate::error::ExecError;
use crate::parsers::{self, ParseError};
use crate::workspace::Workspace;

pub const REPORT_PLUGIN: &str = "_proctor_report.py";
pub const REPORT_FILE: &str = ".proctor-report.jsonl";

/// pytest plugin writing one JSON line per test to `$PROCTOR_REPORT`.
const REPORT_PLUGIN_SOURCE: &str = r#"import json
import os

_PATH = os.environ.get("PROCTOR_REPORT", ".proctor-report.jsonl")


def pytest_sessionstart(session):
    open(_PATH, "w").close()


def pytest_runtest_logreport(report):
    if report.when == "call" or (report.when == "setup" and report.outcome != "passed"):
        outcome = report.outcome
        if report.when == "setup" and outcome == "failed":
            outcome = "error"
        record = {
            "name": report.nodeid,
            "outcome": outcome,
            "duration": report.duration,
            "output": report.longreprtext or report.capstdout,
        }
        with open(_PATH, "a") as fh:
            fh.write(json.dumps(record) + "\n")
"#;

const PYTHON_ENV: &[(&str, &str)] = &[
    ("PYTHONDONTWRITEBYTECODE", "1"),
    ("PYTHONUNBUFFERED", "1"),
    ("HOME", "/tmp"),
];

pub struct PythonExecutor {
    toolchain: Toolchain,
}

impl PythonExecutor {
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            toolchain: Toolchain::new(Language::Python, sandbox, PYTHON_ENV),
        }
    }
}

#[async_trait]
impl LanguageExecutor for PythonExecutor {
    fn language(&self) -> Language {
        Language::Python
    }

    fn scaffold(&self, _workspace: &Workspace) -> Vec<(&'static str, String)> {
        vec![(REPORT_PLUGIN, REPORT_PLUGIN_SOURCE.to_string())]
    }

    async fn format(&self, workspace: &Workspace, ctx: &ExecContext) -> Result<FormatReport, ExecError> {
        let files = workspace.submitted_with_extension("py");
        if files.is_empty() {
            return Ok(FormatReport { ok: true, diff: String::new() });
        }
        let output = self
            .toolchain
            .run(workspace, "format", command_with_files(&["black", "--check", "--diff", "-q"], &files), &[], ctx)
            .await?;
        Ok(format_report(&output))
    }

    async fn format_fix(&self, workspace: &Workspace, ctx: &ExecContext) -> Result<BTreeMap<String, String>, ExecError> {
        let files = workspace.submitted_with_extension("py");
        if !files.is_empty() {
            let output = self
                .toolchain
                .run(workspace, "format_fix", command_with_files(&["black", "-q"], &files), &[], ctx)
                .await?;
            if !output.success() {
                return Err(fix_failed("black", &output));
            }
        }
        Ok(workspace.read_submitted()?)
    }

    async fn build(&self, workspace: &Workspace, ctx: &ExecContext) -> Result<BuildReport, ExecError> {
        let output = self
            .toolchain
            .run(workspace, "build", command_with_files(&["python", "-m", "compileall", "-q", "."], &[]), &[], ctx)
            .await?;
        Ok(BuildReport {
            ok: output.success(),
            output: output.combined(),
        })
    }

    async fn test(&self, workspace: &Workspace, flags: &[String], ctx: &ExecContext) -> Result<TestReport, ExecError> {
        let command = command_with_files(&["python", "-m", "pytest", "-p", "_proctor_report"], flags);
        let output = self
            .toolchain
            .run(workspace, "test", command, &[("PROCTOR_REPORT", REPORT_FILE)], ctx)
            .await?;

        // Missing when pytest died before the session started.
        let report = match workspace.read(REPORT_FILE) {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(error = %e, "No pytest report written");
                None
            }
        };

        Ok(TestReport {
            // Exit 5 (no tests collected) is not a pass.
            ok: output.success(),
            output: output.combined(),
            report,
            duration: output.duration,
        })
    }

    fn parse_build_errors(&self, output: &str) -> Vec<Diagnostic> {
        parsers::pytest::parse_compile_errors(output)
    }

    fn parse_tests(&self, report: &TestReport) -> Result<Vec<TestResult>, ParseError> {
        parsers::pytest::parse_report(report.report.as_deref().unwrap_or(&report.output))
    }
}
