use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use proctor_common::{Diagnostic, Language, TestResult};

use super::{command_with_files, fix_failed, format_report, BuildReport, FormatReport, LanguageExecutor, TestReport, Toolchain};
use crate::context::ExecContext;
use crate::engine::Sandbox;
use crate::error::ExecError;
use crate::parsers::{self, ParseError};
use crate::workspace::Workspace;

const GO_MOD: &str = "module submission\n\ngo 1.22\n";

/// Guest code is offline and has no home directory inside the sandbox.
const GO_ENV: &[(&str, &str)] = &[
    ("GOPROXY", "off"),
    ("GOFLAGS", "-mod=mod"),
    ("GOTOOLCHAIN", "local"),
    ("GOCACHE", "/tmp/proctor-go-cache"),
    ("HOME", "/tmp"),
    ("CGO_ENABLED", "0"),
];

pub struct GoExecutor {
    toolchain: Toolchain,
}

impl GoExecutor {
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            toolchain: Toolchain::new(Language::Go, sandbox, GO_ENV),
        }
    }
}

#[async_trait]
impl LanguageExecutor for GoExecutor {
    fn language(&self) -> Language {
        Language::Go
    }

    fn scaffold(&self, _workspace: &Workspace) -> Vec<(&'static str, String)> {
        vec![("go.mod", GO_MOD.to_string())]
    }

    async fn format(&self, workspace: &Workspace, ctx: &ExecContext) -> Result<FormatReport, ExecError> {
        let files = workspace.submitted_with_extension("go");
        if files.is_empty() {
            return Ok(FormatReport { ok: true, diff: String::new() });
        }
        let output = self
            .toolchain
            .run(workspace, "format", command_with_files(&["gofmt", "-l", "-d"], &files), &[], ctx)
            .await?;
        Ok(format_report(&output))
    }

    async fn format_fix(&self, workspace: &Workspace, ctx: &ExecContext) -> Result<BTreeMap<String, String>, ExecError> {
        let files = workspace.submitted_with_extension("go");
        if !files.is_empty() {
            let output = self
                .toolchain
                .run(workspace, "format_fix", command_with_files(&["gofmt", "-w"], &files), &[], ctx)
                .await?;
            if !output.success() {
                return Err(fix_failed("gofmt", &output));
            }
        }
        Ok(workspace.read_submitted()?)
    }

    async fn build(&self, workspace: &Workspace, ctx: &ExecContext) -> Result<BuildReport, ExecError> {
        let build = self
            .toolchain
            .run(workspace, "build", command_with_files(&["go", "build", "./..."], &[]), &[], ctx)
            .await?;
        if !build.success() {
            return Ok(BuildReport {
                ok: false,
                output: build.combined(),
            });
        }

        // Vet findings fail the build the same way compile errors do.
        let vet = self
            .toolchain
            .run(workspace, "vet", command_with_files(&["go", "vet", "./..."], &[]), &[], ctx)
            .await?;
        let mut output = build.combined();
        output.push_str(&vet.combined());
        Ok(BuildReport {
            ok: vet.success(),
            output,
        })
    }

    async fn test(&self, workspace: &Workspace, flags: &[String], ctx: &ExecContext) -> Result<TestReport, ExecError> {
        let mut command = command_with_files(&["go", "test", "-json"], flags);
        command.push("./...".to_string());

        let output = self.toolchain.run(workspace, "test", command, &[], ctx).await?;
        Ok(TestReport {
            ok: output.success(),
            output: output.combined(),
            report: Some(output.stdout.clone()),
            duration: output.duration,
        })
    }

    fn parse_build_errors(&self, output: &str) -> Vec<Diagnostic> {
        parsers::go::parse_build_output(output)
    }

    fn parse_tests(&self, report: &TestReport) -> Result<Vec<TestResult>, ParseError> {
        parsers::go::parse_test_events(report.report.as_deref().unwrap_or(&report.output))
    }
}
