//! Static pattern scan over submitted source.
//!
//! Findings are advisory: they never fail a job and are attached to the output
//! whether or not the code builds.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use proctor_common::{Language, RiskNotice, RiskSeverity};
use regex::Regex;

#[derive(Debug, Clone)]
pub struct RiskPattern {
    pub id: &'static str,
    pub category: &'static str,
    pub severity: RiskSeverity,
    pub title: &'static str,
    pub description: &'static str,
    pub suggestion: &'static str,
    pub expression: Regex,
    /// `None` applies to every language.
    pub language: Option<Language>,
}

struct Builtin {
    id: &'static str,
    category: &'static str,
    severity: RiskSeverity,
    title: &'static str,
    description: &'static str,
    suggestion: &'static str,
    expression: &'static str,
    language: Option<Language>,
}

const BUILTINS: &[Builtin] = &[
    Builtin {
        id: "PY-EVAL",
        category: "security",
        severity: RiskSeverity::High,
        title: "Use of eval()",
        description: "eval() executes arbitrary expressions built from strings.",
        suggestion: "Parse the input explicitly, or use ast.literal_eval for literals.",
        expression: r"\beval\s*\(",
        language: Some(Language::Python),
    },
    Builtin {
        id: "PY-EXEC",
        category: "security",
        severity: RiskSeverity::High,
        title: "Use of exec()",
        description: "exec() runs arbitrary code built from strings.",
        suggestion: "Call the intended functions directly.",
        expression: r"\bexec\s*\(",
        language: Some(Language::Python),
    },
    Builtin {
        id: "PY-SHELL",
        category: "security",
        severity: RiskSeverity::High,
        title: "Subprocess with shell=True",
        description: "Passing a command through the shell allows injection via interpolated values.",
        suggestion: "Pass an argument list and leave shell=False.",
        expression: r"shell\s*=\s*True",
        language: Some(Language::Python),
    },
    Builtin {
        id: "PY-OS-SYSTEM",
        category: "security",
        severity: RiskSeverity::Medium,
        title: "Use of os.system()",
        description: "os.system() runs a shell command string.",
        suggestion: "Use subprocess.run with an argument list.",
        expression: r"\bos\.(system|popen)\s*\(",
        language: Some(Language::Python),
    },
    Builtin {
        id: "PY-PICKLE",
        category: "security",
        severity: RiskSeverity::Medium,
        title: "Unpickling data",
        description: "pickle.load can execute code embedded in the payload.",
        suggestion: "Use json or another data-only format for untrusted input.",
        expression: r"\bpickle\.loads?\s*\(",
        language: Some(Language::Python),
    },
    Builtin {
        id: "PY-BARE-EXCEPT",
        category: "reliability",
        severity: RiskSeverity::Low,
        title: "Bare except",
        description: "A bare except also swallows KeyboardInterrupt and SystemExit.",
        suggestion: "Catch the specific exceptions you expect.",
        expression: r"^\s*except\s*:",
        language: Some(Language::Python),
    },
    Builtin {
        id: "PY-WHILE-TRUE",
        category: "resource",
        severity: RiskSeverity::Low,
        title: "Unbounded loop",
        description: "while True only terminates through an explicit break or return.",
        suggestion: "Make sure every path through the loop can exit.",
        expression: r"^\s*while\s+(True|1)\s*:",
        language: Some(Language::Python),
    },
    Builtin {
        id: "GO-EXEC",
        category: "security",
        severity: RiskSeverity::High,
        title: "Spawning processes",
        description: "exec.Command runs external programs.",
        suggestion: "Avoid shelling out; implement the behaviour in Go.",
        expression: r"\bexec\.Command(Context)?\s*\(",
        language: Some(Language::Go),
    },
    Builtin {
        id: "GO-TLS-SKIP",
        category: "security",
        severity: RiskSeverity::High,
        title: "TLS verification disabled",
        description: "InsecureSkipVerify accepts any certificate.",
        suggestion: "Configure the expected root CAs instead.",
        expression: r"InsecureSkipVerify\s*:\s*true",
        language: Some(Language::Go),
    },
    Builtin {
        id: "GO-UNSAFE",
        category: "security",
        severity: RiskSeverity::Medium,
        title: "Import of unsafe",
        description: "Package unsafe bypasses Go's type and memory safety.",
        suggestion: "Use safe conversions from the standard library.",
        expression: r#""unsafe""#,
        language: Some(Language::Go),
    },
    Builtin {
        id: "GO-IGNORED-ERR",
        category: "reliability",
        severity: RiskSeverity::Low,
        title: "Discarded error",
        description: "An error return is assigned to the blank identifier.",
        suggestion: "Handle or return the error.",
        expression: r",\s*_\s*:?=\s*\w[\w.]*\(",
        language: Some(Language::Go),
    },
    Builtin {
        id: "GO-FOR-EVER",
        category: "resource",
        severity: RiskSeverity::Low,
        title: "Unbounded loop",
        description: "A bare for loop only terminates through break or return.",
        suggestion: "Make sure every path through the loop can exit.",
        expression: r"^\s*for\s*\{",
        language: Some(Language::Go),
    },
    Builtin {
        id: "RS-UNSAFE",
        category: "security",
        severity: RiskSeverity::Medium,
        title: "Unsafe block",
        description: "unsafe code opts out of the borrow checker's guarantees.",
        suggestion: "Use a safe abstraction, or document the invariants the block relies on.",
        expression: r"\bunsafe\s*(\{|fn\b|impl\b)",
        language: Some(Language::Rust),
    },
    Builtin {
        id: "RS-UNWRAP",
        category: "reliability",
        severity: RiskSeverity::Low,
        title: "unwrap() call",
        description: "unwrap() panics on None or Err.",
        suggestion: "Propagate with ? or handle the failure case.",
        expression: r"\.unwrap\(\)",
        language: Some(Language::Rust),
    },
    Builtin {
        id: "RS-COMMAND",
        category: "security",
        severity: RiskSeverity::High,
        title: "Spawning processes",
        description: "std::process::Command runs external programs.",
        suggestion: "Avoid shelling out; implement the behaviour in Rust.",
        expression: r"\bCommand::new\s*\(",
        language: Some(Language::Rust),
    },
    Builtin {
        id: "RS-LOOP",
        category: "resource",
        severity: RiskSeverity::Low,
        title: "Unbounded loop",
        description: "loop only terminates through break or return.",
        suggestion: "Make sure every path through the loop can exit.",
        expression: r"^\s*loop\s*\{",
        language: Some(Language::Rust),
    },
    Builtin {
        id: "ANY-SECRET",
        category: "secrets",
        severity: RiskSeverity::High,
        title: "Hard-coded credential",
        description: "A password, token or API key appears to be assigned a literal value.",
        suggestion: "Read secrets from the environment or a secret store.",
        expression: r#"(?i)\b(password|passwd|secret|api_?key|access_?token)\b\s*[:=]+\s*["'][^"']{4,}["']"#,
        language: None,
    },
    Builtin {
        id: "ANY-PRIVATE-KEY",
        category: "secrets",
        severity: RiskSeverity::High,
        title: "Embedded private key",
        description: "A PEM private key block is present in source.",
        suggestion: "Remove the key and rotate it.",
        expression: r"-----BEGIN ([A-Z]+ )?PRIVATE KEY-----",
        language: None,
    },
];

static BUILTIN_PATTERNS: LazyLock<Arc<[RiskPattern]>> = LazyLock::new(|| {
    BUILTINS
        .iter()
        .map(|b| RiskPattern {
            id: b.id,
            category: b.category,
            severity: b.severity,
            title: b.title,
            description: b.description,
            suggestion: b.suggestion,
            expression: Regex::new(b.expression).expect("valid builtin risk pattern"),
            language: b.language,
        })
        .collect()
});

/// Scans source line by line; a pattern reports at most once per line.
#[derive(Clone)]
pub struct RiskDetector {
    patterns: Arc<[RiskPattern]>,
}

impl Default for RiskDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl RiskDetector {
    /// Detector with the built-in pattern table.
    pub fn new() -> Self {
        Self {
            patterns: BUILTIN_PATTERNS.clone(),
        }
    }

    pub fn with_patterns(patterns: Vec<RiskPattern>) -> Self {
        Self {
            patterns: patterns.into(),
        }
    }

    pub fn patterns(&self) -> &[RiskPattern] {
        &self.patterns
    }

    pub fn scan(&self, language: Language, files: &BTreeMap<String, String>) -> Vec<RiskNotice> {
        let applicable: Vec<&RiskPattern> = self
            .patterns
            .iter()
            .filter(|p| p.language.map_or(true, |l| l == language))
            .collect();

        let mut notices = Vec::new();
        for (file, content) in files {
            for (index, line) in content.lines().enumerate() {
                for pattern in &applicable {
                    if pattern.expression.is_match(line) {
                        notices.push(RiskNotice {
                            pattern_id: pattern.id.to_string(),
                            category: pattern.category.to_string(),
                            severity: pattern.severity,
                            title: pattern.title.to_string(),
                            description: pattern.description.to_string(),
                            file: file.clone(),
                            line: (index + 1) as u32,
                            suggestion: pattern.suggestion.to_string(),
                        });
                    }
                }
            }
        }
        notices
    }
}
