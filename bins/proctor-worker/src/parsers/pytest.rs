//! Python: the JSON-lines report written by the injected pytest plugin, and
//! `compileall` tracebacks.

use std::sync::LazyLock;

use proctor_common::{Diagnostic, DiagnosticSeverity, TestResult};
use regex::Regex;
use serde::Deserialize;

use super::{relative_path, require_events, ParseError};

static TRACEBACK_LOCATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\s*File "(.+?)", line (\d+)"#).expect("valid traceback location regex"));

static EXCEPTION_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z_][\w.]*(?:Error|Exception|Warning)):\s*(.*)$").expect("valid exception regex")
});

/// One record written by the report plugin per test.
#[derive(Debug, Deserialize)]
struct ReportRecord {
    name: String,
    outcome: String,
    #[serde(default)]
    duration: f64,
    #[serde(default)]
    output: String,
}

/// Outcomes: `passed`, `failed`, `error` (setup failure), `skipped`. Skipped
/// tests are dropped.
pub fn parse_report(input: &str) -> Result<Vec<TestResult>, ParseError> {
    let mut results = Vec::new();
    let mut recognized = 0;

    for line in input.lines() {
        let Ok(record) = serde_json::from_str::<ReportRecord>(line.trim()) else {
            continue;
        };
        recognized += 1;

        let passed = match record.outcome.as_str() {
            "passed" => true,
            "failed" | "error" => false,
            _ => continue,
        };
        results.push(TestResult {
            name: record.name,
            passed,
            output: record.output,
            duration_ms: (record.duration.max(0.0) * 1000.0).round() as u64,
        });
    }

    require_events("pytest report", input, recognized)?;
    Ok(results)
}

/// Pair each `File "x", line N` with the exception line that closes its traceback.
pub fn parse_compile_errors(output: &str) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    let mut location: Option<(String, u32)> = None;

    for line in output.lines() {
        if let Some(caps) = TRACEBACK_LOCATION.captures(line) {
            location = caps[2].parse().ok().map(|n| (relative_path(&caps[1]), n));
            continue;
        }
        let Some(caps) = EXCEPTION_LINE.captures(line.trim_end()) else {
            continue;
        };
        let Some((file, line_no)) = location.take() else {
            continue;
        };
        let kind = &caps[1];
        let severity = if kind.ends_with("Warning") {
            DiagnosticSeverity::Warning
        } else {
            DiagnosticSeverity::Error
        };
        let detail = caps[2].trim();
        diagnostics.push(Diagnostic {
            file,
            line: line_no,
            message: if detail.is_empty() {
                kind.to_string()
            } else {
                format!("{}: {}", kind, detail)
            },
            severity,
        });
    }

    diagnostics
}
