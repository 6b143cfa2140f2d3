use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::{interpreter::Verdict, models::Submission};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionState {
    Created,
    Staged,
    Running,
    Completed,
    Errored,
}

impl SubmissionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored)
    }

    pub fn can_advance_to(self, next: Self) -> bool {
        use SubmissionState::*;
        matches!(
            (self, next),
            (Created, Staged)
                | (Created, Errored)
                | (Staged, Running)
                | (Staged, Errored)
                | (Running, Completed)
                | (Running, Errored)
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("illegal transition from {from:?} to {to:?}")]
    IllegalTransition {
        from: SubmissionState,
        to: SubmissionState,
    },
    #[error("submission is still being evaluated")]
    NotFinished,
    #[error("only graded submissions can be invalidated")]
    NotGraded,
}

impl Submission {
    pub fn advance(&mut self, next: SubmissionState) -> Result<(), LifecycleError> {
        if !self.state.can_advance_to(next) {
            return Err(LifecycleError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Applies an interpreted run and moves the submission into its terminal state.
    pub fn finish(&mut self, verdict: Verdict, logs: Option<String>) -> Result<(), LifecycleError> {
        let next = if verdict.errored() {
            SubmissionState::Errored
        } else {
            SubmissionState::Completed
        };
        self.advance(next)?;
        self.logs = logs;
        self.output = verdict.output;
        self.points = verdict.points;
        self.valid = verdict.valid;
        self.outcome = Some(verdict.outcome);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Administrative override. Returns whether the flag actually changed.
    pub fn invalidate(&mut self) -> Result<bool, LifecycleError> {
        if !self.kind.is_graded() {
            return Err(LifecycleError::NotGraded);
        }
        if !self.state.is_terminal() {
            return Err(LifecycleError::NotFinished);
        }
        let changed = self.valid;
        self.valid = false;
        Ok(changed)
    }
}
