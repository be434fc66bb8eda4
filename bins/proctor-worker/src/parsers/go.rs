//! `go test -json` event streams and `go build` / `go vet` diagnostics.

use std::collections::HashMap;
use std::sync::LazyLock;

use proctor_common::{Diagnostic, DiagnosticSeverity, TestResult};
use regex::Regex;
use serde::Deserialize;

use super::{relative_path, require_events, ParseError};

static GO_DIAGNOSTIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:vet: )?((?:\./|/)?[^\s:]+\.go):(\d+)(?::\d+)?: (.+)$").expect("valid go diagnostic regex")
});

/// One line of `go test -json` (test2json) output.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TestEvent {
    action: String,
    #[serde(default)]
    package: String,
    #[serde(default)]
    test: Option<String>,
    #[serde(default)]
    elapsed: Option<f64>,
    #[serde(default)]
    output: Option<String>,
}

#[derive(Default)]
struct Accumulator {
    name: String,
    output: String,
    outcome: Option<bool>,
    duration_ms: u64,
}

/// Fold the event stream into one result per test. Skipped tests are dropped.
pub fn parse_test_events(input: &str) -> Result<Vec<TestResult>, ParseError> {
    let mut order: Vec<(String, String)> = Vec::new();
    let mut tests: HashMap<(String, String), Accumulator> = HashMap::new();
    let mut recognized = 0;

    for line in input.lines() {
        let Ok(event) = serde_json::from_str::<TestEvent>(line.trim()) else {
            continue;
        };
        recognized += 1;

        // Package-level events carry build output and summaries, not results.
        let Some(test) = event.test else {
            continue;
        };
        let key = (event.package, test);
        let entry = tests.entry(key.clone()).or_insert_with(|| {
            order.push(key.clone());
            Accumulator {
                name: key.1.clone(),
                ..Default::default()
            }
        });

        match event.action.as_str() {
            "output" => {
                if let Some(output) = event.output {
                    entry.output.push_str(&output);
                }
            }
            // Repeated runs (-count=N) share one entry; any failing run fails the test.
            "pass" | "fail" => {
                let passed = event.action == "pass";
                entry.outcome = Some(entry.outcome.unwrap_or(true) && passed);
                entry.duration_ms += event.elapsed.map(|s| (s * 1000.0).round() as u64).unwrap_or(0);
            }
            "skip" => {
                if entry.outcome.is_none() {
                    tests.remove(&key);
                }
            }
            _ => {}
        }
    }

    require_events("go test -json", input, recognized)?;

    Ok(order
        .into_iter()
        .filter_map(|key| tests.remove(&key))
        // A test that never reported an outcome was cut short; count it as failed.
        .map(|acc| TestResult {
            name: acc.name,
            passed: acc.outcome.unwrap_or(false),
            output: acc.output,
            duration_ms: acc.duration_ms,
        })
        .collect())
}

/// `file.go:line[:col]: message` lines from `go build` and `go vet`.
pub fn parse_build_output(output: &str) -> Vec<Diagnostic> {
    output
        .lines()
        .filter_map(|line| {
            let caps = GO_DIAGNOSTIC.captures(line.trim_end())?;
            Some(Diagnostic {
                file: relative_path(&caps[1]),
                line: caps[2].parse().ok()?,
                message: caps[3].trim().to_string(),
                severity: DiagnosticSeverity::Error,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = r#"{"Time":"2024-05-01T10:00:00Z","Action":"start","Package":"submission"}
{"Time":"2024-05-01T10:00:00Z","Action":"run","Package":"submission","Test":"TestAdd"}
{"Time":"2024-05-01T10:00:00Z","Action":"output","Package":"submission","Test":"TestAdd","Output":"=== RUN   TestAdd\n"}
{"Time":"2024-05-01T10:00:00Z","Action":"output","Package":"submission","Test":"TestAdd","Output":"--- PASS: TestAdd (0.00s)\n"}
{"Time":"2024-05-01T10:00:00Z","Action":"pass","Package":"submission","Test":"TestAdd","Elapsed":0.012}
{"Time":"2024-05-01T10:00:00Z","Action":"run","Package":"submission","Test":"TestSub"}
{"Time":"2024-05-01T10:00:00Z","Action":"output","Package":"submission","Test":"TestSub","Output":"    main_test.go:12: got 3, want 1\n"}
{"Time":"2024-05-01T10:00:00Z","Action":"fail","Package":"submission","Test":"TestSub","Elapsed":0.5}
{"Time":"2024-05-01T10:00:00Z","Action":"run","Package":"submission","Test":"TestSlow"}
{"Time":"2024-05-01T10:00:00Z","Action":"skip","Package":"submission","Test":"TestSlow","Elapsed":0}
{"Time":"2024-05-01T10:00:00Z","Action":"output","Package":"submission","Output":"FAIL\n"}
{"Time":"2024-05-01T10:00:00Z","Action":"fail","Package":"submission","Elapsed":0.6}
"#;

    #[test]
    fn test_parse_stream() {
        let results = parse_test_events(STREAM).unwrap();
        assert_eq!(results.len(), 2);

        assert_eq!(results[0].name, "TestAdd");
        assert!(results[0].passed);
        assert_eq!(results[0].duration_ms, 12);

        assert_eq!(results[1].name, "TestSub");
        assert!(!results[1].passed);
        assert_eq!(results[1].duration_ms, 500);
        assert!(results[1].output.contains("got 3, want 1"));
    }

    #[test]
    fn test_skips_noise_lines() {
        let input = format!("# submission\nsome compiler chatter\n{}", STREAM);
        assert_eq!(parse_test_events(&input).unwrap().len(), 2);
    }

    #[test]
    fn test_empty_and_invalid_input() {
        assert!(parse_test_events("").unwrap().is_empty());
        assert!(matches!(
            parse_test_events("./main.go:3:1: syntax error\n"),
            Err(ParseError::Unrecognized { .. })
        ));
    }

    #[test]
    fn test_package_without_tests_is_not_an_error() {
        let input = r#"{"Action":"output","Package":"submission","Output":"?   \tsubmission\t[no test files]\n"}
{"Action":"skip","Package":"submission","Elapsed":0}
"#;
        assert!(parse_test_events(input).unwrap().is_empty());
    }

    #[test]
    fn test_unfinished_test_counts_as_failed() {
        let input = r#"{"Action":"run","Package":"p","Test":"TestHang"}
{"Action":"output","Package":"p","Test":"TestHang","Output":"panic: test timed out\n"}
"#;
        let results = parse_test_events(input).unwrap();
        assert_eq!(results.len(), 1);
        assert!(!results[0].passed);
    }

    #[test]
    fn test_repeated_runs_keep_failure() {
        let input = r#"{"Action":"run","Package":"p","Test":"TestFlaky"}
{"Action":"fail","Package":"p","Test":"TestFlaky","Elapsed":0.1}
{"Action":"run","Package":"p","Test":"TestFlaky"}
{"Action":"pass","Package":"p","Test":"TestFlaky","Elapsed":0.2}
{"Action":"run","Package":"p","Test":"TestStable"}
{"Action":"pass","Package":"p","Test":"TestStable","Elapsed":0.1}
{"Action":"run","Package":"p","Test":"TestStable"}
{"Action":"pass","Package":"p","Test":"TestStable","Elapsed":0.1}
"#;
        let results = parse_test_events(input).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].name, "TestFlaky");
        assert!(!results[0].passed);
        assert_eq!(results[0].duration_ms, 300);
        assert!(results[1].passed);
    }

    #[test]
    fn test_build_diagnostics() {
        let output = "# submission\n./main.go:5:2: undefined: x\nvet: ./util.go:9: unreachable code\nmain.go:12:10: missing return\nnot a diagnostic\n";
        let diags = parse_build_output(output);
        assert_eq!(diags.len(), 3);
        assert_eq!(diags[0].file, "main.go");
        assert_eq!(diags[0].line, 5);
        assert_eq!(diags[0].message, "undefined: x");
        assert_eq!(diags[1].file, "util.go");
        assert_eq!(diags[1].line, 9);
        assert_eq!(diags[2].line, 12);
        assert!(parse_build_output("").is_empty());
    }
}
