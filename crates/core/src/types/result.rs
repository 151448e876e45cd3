//! Compile and process results

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

/// Raw outcome of one bridge invocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessResult {
    pub success: bool,
    pub output: String,
    pub error_output: String,
    pub exit_code: Option<i32>,
}

impl ProcessResult {
    /// A successful result with exit code 0
    pub fn succeeded(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error_output: String::new(),
            exit_code: Some(0),
        }
    }

    /// A failed result with the given exit code
    pub fn failed(error_output: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error_output: error_output.into(),
            exit_code,
        }
    }
}

/// Diagnostic severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Note,
}

/// One structured compiler diagnostic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub file: Option<String>,
    pub line: u32,
    pub column: u32,
    pub message: String,
    pub severity: Severity,
}

fn diagnostic_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?m)^(?P<file>[^:\n]+):(?P<line>\d+):(?:(?P<col>\d+):)?\s*(?P<sev>fatal error|error|warning|note):\s*(?P<msg>.*?)\s*$",
        )
        .expect("diagnostic pattern is valid")
    })
}

impl Diagnostic {
    /// Capture `file:line[:col]: severity: message` lines.
    ///
    /// Anything that does not match is ignored; this is not a compiler
    /// diagnostics parser, only basic structured capture.
    pub fn parse_all(text: &str) -> Vec<Diagnostic> {
        diagnostic_pattern()
            .captures_iter(text)
            .filter_map(|caps| {
                let line = caps.name("line")?.as_str().parse().ok()?;
                let column = caps
                    .name("col")
                    .and_then(|c| c.as_str().parse().ok())
                    .unwrap_or(0);
                let severity = match caps.name("sev")?.as_str() {
                    "warning" => Severity::Warning,
                    "note" => Severity::Note,
                    _ => Severity::Error,
                };
                Some(Diagnostic {
                    file: caps.name("file").map(|f| f.as_str().trim().to_string()),
                    line,
                    column,
                    message: caps.name("msg")?.as_str().to_string(),
                    severity,
                })
            })
            .collect()
    }
}

/// Counters gathered while a compile ran
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceCounters {
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    pub error_count: usize,
    pub warning_count: usize,
    pub progress_events: u32,
}

/// Outcome of a compile, shared between the cache and the tasks it satisfied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileResult {
    pub success: bool,
    pub execution_time_ms: u64,
    pub counters: PerformanceCounters,
    pub diagnostics: Vec<Diagnostic>,
    pub output_files: Vec<PathBuf>,
}

impl CompileResult {
    /// Build a result from a finished bridge invocation
    pub fn from_process(
        process: &ProcessResult,
        execution_time: Duration,
        progress_events: u32,
        output_files: Vec<PathBuf>,
    ) -> Self {
        let mut diagnostics = Diagnostic::parse_all(&process.error_output);
        diagnostics.extend(Diagnostic::parse_all(&process.output));

        let counters = PerformanceCounters {
            stdout_bytes: process.output.len() as u64,
            stderr_bytes: process.error_output.len() as u64,
            error_count: diagnostics
                .iter()
                .filter(|d| d.severity == Severity::Error)
                .count(),
            warning_count: diagnostics
                .iter()
                .filter(|d| d.severity == Severity::Warning)
                .count(),
            progress_events,
        };

        Self {
            success: process.success,
            execution_time_ms: execution_time.as_millis() as u64,
            counters,
            diagnostics,
            output_files,
        }
    }

    pub fn execution_time(&self) -> Duration {
        Duration::from_millis(self.execution_time_ms)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
    }
}
