//! Rust: libtest's human-readable output and rustc's short diagnostic format.

use std::sync::LazyLock;

use proctor_common::{Diagnostic, DiagnosticSeverity, TestResult};
use regex::Regex;

use super::{relative_path, require_events, ParseError};

static TEST_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^test (.+?) \.\.\. (\S+.*)$").expect("valid libtest line regex"));

static RUNNING_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^running \d+ tests?$").expect("valid libtest header regex"));

static FAILURE_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^---- (.+?) stdout ----$").expect("valid libtest failure regex"));

static RUSTC_SHORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([^\s:]+\.rs):(\d+):\d+: (error|warning|note)(?:\[\w+\])?: (.+)$").expect("valid rustc regex")
});

/// `test name ... ok|FAILED|ignored` lines plus the `---- name stdout ----`
/// failure sections. Ignored tests are dropped.
pub fn parse_test_output(input: &str) -> Result<Vec<TestResult>, ParseError> {
    let mut results: Vec<TestResult> = Vec::new();
    let mut recognized = 0;
    let mut section: Option<(String, String)> = None;

    for line in input.lines() {
        let line = line.trim_end();

        if let Some(caps) = FAILURE_HEADER.captures(line) {
            attach_section(&mut results, section.take());
            section = Some((caps[1].to_string(), String::new()));
            continue;
        }
        if line == "failures:" || line.starts_with("test result:") {
            attach_section(&mut results, section.take());
            continue;
        }
        if let Some((_, body)) = section.as_mut() {
            body.push_str(line);
            body.push('\n');
            continue;
        }

        if RUNNING_LINE.is_match(line) {
            recognized += 1;
            continue;
        }
        let Some(caps) = TEST_LINE.captures(line) else {
            continue;
        };
        recognized += 1;

        let name = caps[1].trim_end_matches(" - should panic").to_string();
        let passed = match caps[2].split_whitespace().next() {
            Some("ok") => true,
            Some("FAILED") => false,
            _ => continue,
        };
        results.push(TestResult {
            name,
            passed,
            output: String::new(),
            duration_ms: 0,
        });
    }
    attach_section(&mut results, section);

    require_events("libtest", input, recognized)?;
    Ok(results)
}

fn attach_section(results: &mut [TestResult], section: Option<(String, String)>) {
    let Some((name, body)) = section else {
        return;
    };
    if let Some(result) = results.iter_mut().find(|r| r.name == name) {
        result.output = body.trim_end().to_string();
    }
}

/// `cargo build --message-format=short` lines.
pub fn parse_build_output(output: &str) -> Vec<Diagnostic> {
    output
        .lines()
        .filter_map(|line| {
            let caps = RUSTC_SHORT.captures(line.trim_end())?;
            let severity = match &caps[3] {
                "error" => DiagnosticSeverity::Error,
                "warning" => DiagnosticSeverity::Warning,
                _ => DiagnosticSeverity::Note,
            };
            Some(Diagnostic {
                file: relative_path(&caps[1]),
                line: caps[2].parse().ok()?,
                message: caps[4].trim().to_string(),
                severity,
            })
        })
        .collect()
}
