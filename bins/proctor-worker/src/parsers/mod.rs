//! Normalizers for raw toolchain output.
//!
//! Each parser is a pure function from text to [`TestResult`]s or
//! [`Diagnostic`]s. They are tolerant: lines that do not match are skipped, and
//! empty input yields nothing. Test parsers additionally fail with
//! [`ParseError`] when a non-empty payload contains no recognizable event at
//! all, since that means the toolchain never reached the test runner.
//!
//! [`TestResult`]: proctor_common::TestResult
//! [`Diagnostic`]: proctor_common::Diagnostic

pub mod go;
pub mod libtest;
pub mod pytest;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("no {format} events recognized in {lines} lines of output")]
    Unrecognized { format: &'static str, lines: usize },
}

/// Shared tail of every test parser: zero recognized events is only fine when
/// there was nothing to recognize.
fn require_events(format: &'static str, input: &str, recognized: usize) -> Result<(), ParseError> {
    let lines = input.lines().filter(|l| !l.trim().is_empty()).count();
    if recognized == 0 && lines > 0 {
        return Err(ParseError::Unrecognized { format, lines });
    }
    Ok(())
}

/// Tool output refers to files as `./x.go` or `/workspace/x.go`; results use
/// workspace-relative names.
fn relative_path(path: &str) -> String {
    let path = path.strip_prefix("/workspace/").unwrap_or(path);
    path.strip_prefix("./").unwrap_or(path).to_string()
}
