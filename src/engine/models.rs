use std::collections::HashSet;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::{
    error::EngineError, evaluator::TaskEvaluator, interpreter::Outcome,
    lifecycle::SubmissionState, throttle::AttemptPolicy,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionKind {
    Run,
    Test,
    Grade,
}

impl SubmissionKind {
    pub fn is_graded(self) -> bool {
        matches!(self, Self::Grade)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Test => "test",
            Self::Grade => "grade",
        }
    }
}

/// A template file belonging to a task.
///
/// Enabled non-grading files are staged for every run; grading files only for
/// graded runs, where they cannot be overridden by submitted content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFile {
    pub path: String,
    #[serde(default)]
    pub template: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub grading: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AssignmentWindow {
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

impl AssignmentWindow {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.start_date <= now && now < self.end_date
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    pub max_points: f64,
    pub max_attempts: u32,
    #[serde(default)]
    pub attempt_window_secs: Option<u64>,
    #[serde(default)]
    pub time_limit_secs: Option<u64>,
    pub evaluator: TaskEvaluator,
    #[serde(default)]
    pub files: Vec<TaskFile>,
    /// Absent means the task accepts graded submissions at any time.
    #[serde(default)]
    pub assignment: Option<AssignmentWindow>,
}

impl TaskSpec {
    pub fn attempt_policy(&self) -> AttemptPolicy {
        let window = self
            .attempt_window_secs
            .filter(|secs| *secs > 0)
            .and_then(|secs| TimeDelta::try_seconds(i64::try_from(secs).ok()?));
        AttemptPolicy {
            max_attempts: self.max_attempts,
            window,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionRequest {
    pub task: TaskSpec,
    pub user_id: String,
    pub kind: SubmissionKind,
    /// Instructor-triggered submissions set this to false and skip admission.
    #[serde(default = "default_true")]
    pub restricted: bool,
    #[serde(default)]
    pub files: Vec<SubmissionFile>,
}

impl SubmissionRequest {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.user_id.trim().is_empty() {
            return Err(EngineError::InvalidRequest("user_id is empty".to_string()));
        }
        if self.task.id.trim().is_empty() {
            return Err(EngineError::InvalidRequest("task id is empty".to_string()));
        }
        if self.task.evaluator.docker_image.trim().is_empty() {
            return Err(EngineError::InvalidRequest(
                "task has no docker image".to_string(),
            ));
        }
        if !self.task.max_points.is_finite() || self.task.max_points < 0.0 {
            return Err(EngineError::InvalidRequest(
                "max_points must be a non-negative number".to_string(),
            ));
        }
        if self.files.len() > 256 {
            return Err(EngineError::InvalidRequest(
                "too many submitted files; max is 256".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for file in &self.files {
            if file.content.len() > 1024 * 1024 {
                return Err(EngineError::InvalidRequest(format!(
                    "file {} exceeds 1 MiB",
                    file.path
                )));
            }
            if !seen.insert(file.path.trim_start_matches('/')) {
                return Err(EngineError::InvalidRequest(format!(
                    "file {} submitted twice",
                    file.path
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: Uuid,
    pub task_id: String,
    pub user_id: String,
    pub kind: SubmissionKind,
    pub ordinal_num: u32,
    pub created_at: DateTime<Utc>,
    pub files: Vec<SubmissionFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
    pub output: Option<String>,
    pub points: Option<f64>,
    pub valid: bool,
    pub state: SubmissionState,
    pub outcome: Option<Outcome>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Submission {
    pub fn new(
        task_id: String,
        user_id: String,
        kind: SubmissionKind,
        ordinal_num: u32,
        files: Vec<SubmissionFile>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            user_id,
            kind,
            ordinal_num,
            created_at,
            files,
            logs: None,
            output: None,
            points: None,
            // RUN and TEST are valid by construction; GRADE earns validity from its score.
            valid: !kind.is_graded(),
            state: SubmissionState::Created,
            outcome: None,
            finished_at: None,
        }
    }

    pub fn name(&self) -> String {
        format!("{} {}", self.kind.as_str(), self.ordinal_num)
    }

    /// Counts against the attempt budget.
    pub fn is_scored_attempt(&self) -> bool {
        self.kind.is_graded() && self.valid && self.state.is_terminal()
    }
}

/// Per user and task aggregate. Holds submission ids, never copies.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub task_id: String,
    pub user_id: String,
    pub best_score: Option<f64>,
    pub policy: AttemptPolicy,
    pub submissions: Vec<Uuid>,
}

impl Evaluation {
    pub fn new(task_id: String, user_id: String, policy: AttemptPolicy) -> Self {
        Self {
            task_id,
            user_id,
            best_score: None,
            policy,
            submissions: Vec::new(),
        }
    }

    pub fn record_score(&mut self, points: f64) {
        self.best_score = Some(self.best_score.map_or(points, |best| best.max(points)));
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationSummary {
    pub task_id: String,
    pub user_id: String,
    pub best_score: Option<f64>,
    pub remaining_attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub submissions: Vec<Uuid>,
}

fn default_true() -> bool {
    true
}
