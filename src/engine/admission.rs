use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::engine::{
    error::EngineError,
    models::{AssignmentWindow, SubmissionKind},
    sandbox::ContainerEngine,
    throttle::{AttemptPolicy, remaining_attempts},
};

pub struct AdmissionCheck<'a> {
    pub user_id: &'a str,
    pub kind: SubmissionKind,
    pub restricted: bool,
    pub policy: AttemptPolicy,
    pub assignment: Option<AssignmentWindow>,
    pub now: DateTime<Utc>,
}

/// Held for the whole evaluation. Dropping it lets the user submit again.
#[derive(Debug)]
pub struct UserLease {
    _guard: Option<OwnedMutexGuard<()>>,
}

#[derive(Clone)]
pub struct AdmissionGuard {
    engine: Arc<dyn ContainerEngine>,
    user_label: String,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl AdmissionGuard {
    pub fn new(engine: Arc<dyn ContainerEngine>, user_label: impl Into<String>) -> Self {
        Self {
            engine,
            user_label: user_label.into(),
            locks: Arc::new(DashMap::new()),
        }
    }

    /// One in-flight sandbox per user: the in-process lock covers requests
    /// routed here, the label query covers containers started elsewhere.
    ///
    /// `graded_history` yields the creation times of the user's scored
    /// attempts. It runs only once the user's lock is held.
    pub async fn admit<F>(
        &self,
        check: &AdmissionCheck<'_>,
        graded_history: F,
    ) -> Result<UserLease, EngineError>
    where
        F: FnOnce() -> Vec<DateTime<Utc>>,
    {
        if !check.restricted {
            return Ok(UserLease { _guard: None });
        }

        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        let lock = self
            .locks
            .entry(check.user_id.to_string())
            .or_default()
            .clone();
        let guard = lock
            .try_lock_owned()
            .map_err(|_| EngineError::ConcurrentSubmission)?;

        let running = self
            .engine
            .count_running(&self.user_label, check.user_id)
            .await
            .map_err(|err| {
                tracing::error!(user_id = %check.user_id, error = %err, "running container query failed");
                EngineError::from(err)
            })?;
        if running > 0 {
            return Err(EngineError::ConcurrentSubmission);
        }

        if check.kind.is_graded() {
            if remaining_attempts(&check.policy, &graded_history(), check.now) == 0 {
                return Err(EngineError::NoAttemptsRemaining);
            }
            if check
                .assignment
                .is_some_and(|window| !window.is_active(check.now))
            {
                return Err(EngineError::TaskInactive);
            }
        }

        Ok(UserLease {
            _guard: Some(guard),
        })
    }
}
