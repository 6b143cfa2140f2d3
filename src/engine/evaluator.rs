use serde::{Deserialize, Serialize};

use crate::engine::models::SubmissionKind;

pub const DEFAULT_GRADE_RESULTS_FILENAME: &str = "grade_results.json";

/// Task-level evaluator configuration as supplied by the course platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvaluator {
    pub docker_image: String,
    pub run_command: String,
    #[serde(default)]
    pub test_command: Option<String>,
    pub grade_command: String,
    #[serde(default = "default_results_filename")]
    pub grade_results_filename: String,
}

impl TaskEvaluator {
    pub fn command_table(&self) -> CommandTable {
        CommandTable {
            run: non_blank(Some(&self.run_command)),
            test: non_blank(self.test_command.as_ref()),
            grade: non_blank(Some(&self.grade_command)),
        }
    }

    /// Resolves everything a sandbox run needs for one submission kind.
    /// `None` when the task has no command for that kind.
    pub fn plan(&self, kind: SubmissionKind) -> Option<ExecutionPlan> {
        let command = self.command_table().resolve(kind)?.to_string();
        let results_file = kind.is_graded().then(|| {
            non_blank(Some(&self.grade_results_filename)).unwrap_or_else(default_results_filename)
        });
        Some(ExecutionPlan {
            kind,
            image: self.docker_image.clone(),
            command,
            results_file,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandTable {
    pub run: Option<String>,
    pub test: Option<String>,
    pub grade: Option<String>,
}

impl CommandTable {
    pub fn resolve(&self, kind: SubmissionKind) -> Option<&str> {
        match kind {
            SubmissionKind::Run => self.run.as_deref(),
            SubmissionKind::Test => self.test.as_deref(),
            SubmissionKind::Grade => self.grade.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub kind: SubmissionKind,
    pub image: String,
    pub command: String,
    /// Set for graded runs only.
    pub results_file: Option<String>,
}

fn non_blank(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

fn default_results_filename() -> String {
    DEFAULT_GRADE_RESULTS_FILENAME.to_string()
}
