use std::{path::PathBuf, sync::Arc};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::{io::AsyncWriteExt, sync::Mutex};
use uuid::Uuid;

use crate::engine::{
    error::EngineError,
    interpreter::Verdict,
    lifecycle::SubmissionState,
    models::{Evaluation, EvaluationSummary, Submission, SubmissionRequest},
    throttle::{next_attempt_at, remaining_attempts},
};

type EvaluationKey = (String, String);

#[derive(Clone)]
pub struct SubmissionStore {
    submissions: Arc<DashMap<Uuid, Submission>>,
    evaluations: Arc<DashMap<EvaluationKey, Evaluation>>,
    persistence_path: Option<PathBuf>,
    write_lock: Arc<Mutex<()>>,
}

impl SubmissionStore {
    pub fn new(persistence_path: Option<PathBuf>) -> Self {
        Self {
            submissions: Arc::new(DashMap::new()),
            evaluations: Arc::new(DashMap::new()),
            persistence_path,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Records a new submission under its user and task and assigns the next
    /// ordinal for its kind.
    pub fn open(&self, request: &SubmissionRequest, now: DateTime<Utc>) -> Submission {
        let key = (request.task.id.clone(), request.user_id.clone());
        let mut evaluation = self.evaluations.entry(key).or_insert_with(|| {
            Evaluation::new(
                request.task.id.clone(),
                request.user_id.clone(),
                request.task.attempt_policy(),
            )
        });
        evaluation.policy = request.task.attempt_policy();

        let same_kind = evaluation
            .submissions
            .iter()
            .filter(|id| {
                self.submissions
                    .get(*id)
                    .is_some_and(|s| s.kind == request.kind)
            })
            .count();
        let submission = Submission::new(
            request.task.id.clone(),
            request.user_id.clone(),
            request.kind,
            same_kind as u32 + 1,
            request.files.clone(),
            now,
        );
        self.submissions.insert(submission.id, submission.clone());
        evaluation.submissions.push(submission.id);
        submission
    }

    pub fn get(&self, id: &Uuid) -> Option<Submission> {
        self.submissions.get(id).map(|e| e.value().clone())
    }

    pub fn advance(&self, id: Uuid, next: SubmissionState) -> Result<(), EngineError> {
        let mut entry = self.submissions.get_mut(&id).ok_or(EngineError::NotFound)?;
        entry.advance(next)?;
        Ok(())
    }

    /// Moves the submission into its terminal state, raises the best score
    /// when the run was a valid graded one, and appends the record to the
    /// persistence log.
    pub async fn finish(
        &self,
        id: Uuid,
        verdict: Verdict,
        logs: Option<String>,
    ) -> Result<Submission, EngineError> {
        let snapshot = {
            let mut entry = self.submissions.get_mut(&id).ok_or(EngineError::NotFound)?;
            entry.finish(verdict, logs)?;
            entry.clone()
        };

        if let (true, true, Some(points)) = (
            snapshot.kind.is_graded(),
            snapshot.valid,
            snapshot.points,
        ) {
            let key = (snapshot.task_id.clone(), snapshot.user_id.clone());
            if let Some(mut evaluation) = self.evaluations.get_mut(&key) {
                evaluation.record_score(points);
            }
        }

        self.persist(&snapshot).await;
        Ok(snapshot)
    }

    /// Administrative override; the attempt comes back to the user because
    /// only valid graded runs count against the budget.
    pub async fn invalidate(&self, id: Uuid) -> Result<Submission, EngineError> {
        let (snapshot, changed) = {
            let mut entry = self.submissions.get_mut(&id).ok_or(EngineError::NotFound)?;
            let changed = entry.invalidate()?;
            (entry.clone(), changed)
        };
        if changed {
            self.persist(&snapshot).await;
        }
        Ok(snapshot)
    }

    /// Creation times of valid, finished graded submissions.
    pub fn graded_history(&self, task_id: &str, user_id: &str) -> Vec<DateTime<Utc>> {
        let ids = self
            .evaluations
            .get(&(task_id.to_string(), user_id.to_string()))
            .map(|e| e.submissions.clone())
            .unwrap_or_default();
        ids.iter()
            .filter_map(|id| self.submissions.get(id))
            .filter(|s| s.is_scored_attempt())
            .map(|s| s.created_at)
            .collect()
    }

    pub fn summary(
        &self,
        task_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Option<EvaluationSummary> {
        let evaluation = self
            .evaluations
            .get(&(task_id.to_string(), user_id.to_string()))
            .map(|e| e.value().clone())?;
        let history = self.graded_history(task_id, user_id);
        Some(EvaluationSummary {
            remaining_attempts: remaining_attempts(&evaluation.policy, &history, now),
            next_attempt_at: next_attempt_at(&evaluation.policy, &history, now),
            task_id: evaluation.task_id,
            user_id: evaluation.user_id,
            best_score: evaluation.best_score,
            submissions: evaluation.submissions,
        })
    }

    async fn persist(&self, submission: &Submission) {
        let Some(path) = &self.persistence_path else {
            return;
        };
        let line = match serde_json::to_string(submission) {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(submission_id = %submission.id, error = %err, "failed to encode submission");
                return;
            }
        };
        let _guard = self.write_lock.lock().await;
        let mut options = tokio::fs::OpenOptions::new();
        options.create(true).append(true);
        let written = match options.open(path).await {
            Ok(mut file) => file.write_all(format!("{line}\n").as_bytes()).await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            tracing::warn!(path = %path.display(), error = %err, "failed to persist submission");
        }
    }
}
