//! Turns a finished sandbox run into a score, a user-facing message and a
//! validity flag. Everything here is a pure function of the captured logs
//! and the raw results artifact.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::engine::{models::SubmissionKind, sandbox::RunExit};

pub const ALL_TESTS_PASSED: &str = "All tests passed!";
pub const TIME_LIMIT_MESSAGE: &str = "Time limit exceeded";
pub const MEMORY_LIMIT_MESSAGE: &str = "Memory limit exceeded";
pub const CRASH_MESSAGE: &str =
    "Crashed while running tests - make sure all your files contain valid syntax";
pub const NO_OUTPUT_MESSAGE: &str =
    "No output - did you add a top-level statement or \"if __name__ == '__main__'\"?";

const HINT_MARKER: &str = "@@";
const RESULTS_SCHEMA_VERSION: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    /// Execution error on a graded run: it exited without a readable
    /// results artifact, so the score is forced to zero and stays invalid.
    Crashed,
    ExecutionError,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GradeResults {
    pub points: f64,
    pub hints: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ResultsError {
    #[error("results artifact is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("results artifact must be a JSON object")]
    NotAnObject,
}

impl GradeResults {
    /// Decodes `{ "version"?: n, "points"?: number, "hints"?: [string] }`.
    ///
    /// Missing or mistyped fields fall back to defaults; unknown fields and
    /// newer versions are accepted so grading scripts can evolve freely.
    pub fn decode(raw: &str) -> Result<Self, ResultsError> {
        let value: Value = serde_json::from_str(raw)?;
        let object = value.as_object().ok_or(ResultsError::NotAnObject)?;

        let version = object
            .get("version")
            .and_then(Value::as_u64)
            .unwrap_or(RESULTS_SCHEMA_VERSION);
        if version > RESULTS_SCHEMA_VERSION {
            tracing::debug!(version, "decoding results artifact from a newer schema");
        }

        let points = object
            .get("points")
            .and_then(Value::as_f64)
            .filter(|p| p.is_finite())
            .unwrap_or(0.0);
        let hints = object
            .get("hints")
            .and_then(Value::as_array)
            .map(|hints| {
                hints
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self { points, hints })
    }
}

/// What the executor observed, plus the artifacts read from the workspace.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub exit: RunExit,
    pub logs: Option<String>,
    /// Raw grading-results artifact; only read for graded runs that exited.
    pub results: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub outcome: Outcome,
    pub points: Option<f64>,
    pub output: Option<String>,
    pub valid: bool,
}

impl Verdict {
    pub fn errored(&self) -> bool {
        self.outcome == Outcome::ExecutionError
    }
}

pub fn interpret(kind: SubmissionKind, max_points: f64, report: &RunReport) -> Verdict {
    let graded = kind.is_graded();
    let logs = report.logs.as_deref().unwrap_or_default();

    match &report.exit {
        RunExit::MemoryLimitExceeded => Verdict {
            outcome: Outcome::MemoryLimitExceeded,
            points: graded.then_some(0.0),
            output: Some(MEMORY_LIMIT_MESSAGE.to_string()),
            valid: !graded,
        },
        RunExit::TimedOut => Verdict {
            outcome: Outcome::TimeLimitExceeded,
            points: None,
            output: Some(TIME_LIMIT_MESSAGE.to_string()),
            valid: !graded,
        },
        RunExit::EngineFailure(message) => Verdict {
            outcome: Outcome::ExecutionError,
            points: None,
            output: Some(format!("Execution error: {message}")),
            valid: !graded,
        },
        RunExit::Exited(_) if !graded => Verdict {
            outcome: Outcome::Completed,
            points: None,
            output: Some(logs.to_string()),
            valid: true,
        },
        RunExit::Exited(code) => {
            match report.results.as_deref().map(GradeResults::decode) {
                Some(Ok(results)) => Verdict {
                    outcome: Outcome::Completed,
                    points: Some(results.points),
                    output: graded_output(&results, max_points, logs),
                    valid: true,
                },
                Some(Err(err)) => {
                    tracing::debug!(exit_code = *code, error = %err, "unreadable results artifact");
                    crashed(logs)
                }
                None => crashed(logs),
            }
        }
    }
}

/// Best-effort explanation of a crash from raw logs.
pub fn extract_error_message(logs: &str) -> String {
    if logs.trim().is_empty() {
        return NO_OUTPUT_MESSAGE.to_string();
    }
    if let Some(message) = marked_message(logs) {
        return message.to_string();
    }
    logs.lines()
        .rev()
        .find(|line| line.contains(": "))
        .map(|line| line.trim().to_string())
        .unwrap_or_else(|| CRASH_MESSAGE.to_string())
}

fn crashed(logs: &str) -> Verdict {
    Verdict {
        outcome: Outcome::Crashed,
        points: Some(0.0),
        output: Some(extract_error_message(logs)),
        valid: false,
    }
}

fn graded_output(results: &GradeResults, max_points: f64, logs: &str) -> Option<String> {
    if let Some(first) = results.hints.first() {
        return Some(first.clone());
    }
    if results.points >= max_points {
        return Some(ALL_TESTS_PASSED.to_string());
    }
    marked_message(logs).map(ToString::to_string)
}

fn marked_message(logs: &str) -> Option<&str> {
    let start = logs.find(HINT_MARKER)? + HINT_MARKER.len();
    let len = logs[start..].find(HINT_MARKER)?;
    Some(&logs[start..start + len]).filter(|m| !m.trim().is_empty())
}
