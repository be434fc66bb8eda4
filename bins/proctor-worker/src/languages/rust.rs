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

const RUST_ENV: &[(&str, &str)] = &[
    ("CARGO_HOME", "/tmp/proctor-cargo"),
    ("CARGO_TERM_COLOR", "never"),
    ("CARGO_NET_OFFLINE", "true"),
    ("HOME", "/tmp"),
];

pub struct RustExecutor {
    toolchain: Toolchain,
}

impl RustExecutor {
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            toolchain: Toolchain::new(Language::Rust, sandbox, RUST_ENV),
        }
    }
}

/// Manifest for a submission. Flat submissions (`main.rs` / `lib.rs` at the
/// root) get explicit target paths; a conventional `src/` layout needs none.
fn cargo_manifest(workspace: &Workspace) -> String {
    let mut manifest = String::from(
        "[package]\nname = \"submission\"\nversion = \"0.1.0\"\nedition = \"2021\"\n\n[workspace]\n\n[dependencies]\n",
    );
    if workspace.contains("src/main.rs") || workspace.contains("src/lib.rs") {
        return manifest;
    }
    if workspace.contains("lib.rs") {
        manifest.push_str("\n[lib]\npath = \"lib.rs\"\n");
    }
    if workspace.contains("main.rs") {
        manifest.push_str("\n[[bin]]\nname = \"submission\"\npath = \"main.rs\"\n");
    }
    manifest
}

#[async_trait]
impl LanguageExecutor for RustExecutor {
    fn language(&self) -> Language {
        Language::Rust
    }

    fn scaffold(&self, workspace: &Workspace) -> Vec<(&'static str, String)> {
        vec![("Cargo.toml", cargo_manifest(workspace))]
    }

    async fn format(&self, workspace: &Workspace, ctx: &ExecContext) -> Result<FormatReport, ExecError> {
        let files = workspace.submitted_with_extension("rs");
        if files.is_empty() {
            return Ok(FormatReport { ok: true, diff: String::new() });
        }
        let output = self
            .toolchain
            .run(workspace, "format", command_with_files(&["rustfmt", "--check", "--edition", "2021"], &files), &[], ctx)
            .await?;
        Ok(format_report(&output))
    }

    async fn format_fix(&self, workspace: &Workspace, ctx: &ExecContext) -> Result<BTreeMap<String, String>, ExecError> {
        let files = workspace.submitted_with_extension("rs");
        if !files.is_empty() {
            let output = self
                .toolchain
                .run(workspace, "format_fix", command_with_files(&["rustfmt", "--edition", "2021"], &files), &[], ctx)
                .await?;
            if !output.success() {
                return Err(fix_failed("rustfmt", &output));
            }
        }
        Ok(workspace.read_submitted()?)
    }

    async fn build(&self, workspace: &Workspace, ctx: &ExecContext) -> Result<BuildReport, ExecError> {
        let command = command_with_files(&["cargo", "build", "--offline", "--message-format=short"], &[]);
        let output = self.toolchain.run(workspace, "build", command, &[], ctx).await?;
        Ok(BuildReport {
            ok: output.success(),
            output: output.combined(),
        })
    }

    async fn test(&self, workspace: &Workspace, flags: &[String], ctx: &ExecContext) -> Result<TestReport, ExecError> {
        let mut command = command_with_files(&["cargo", "test", "--offline"], &[]);
        if !flags.is_empty() {
            command.push("--".to_string());
            command.extend(flags.iter().cloned());
        }
        let output = self.toolchain.run(workspace, "test", command, &[], ctx).await?;
        Ok(TestReport {
            ok: output.success(),
            output: output.combined(),
            // libtest prints results on stdout; cargo's own chatter goes to stderr.
            report: Some(output.stdout.clone()),
            duration: output.duration,
        })
    }

    fn parse_build_errors(&self, output: &str) -> Vec<Diagnostic> {
        parsers::libtest::parse_build_output(output)
    }

    fn parse_tests(&self, report: &TestReport) -> Result<Vec<TestResult>, ParseError> {
        parsers::libtest::parse_test_output(report.report.as_deref().unwrap_or(&report.output))
    }
}
