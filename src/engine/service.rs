use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::engine::{
    admission::{AdmissionCheck, AdmissionGuard, UserLease},
    error::EngineError,
    evaluator::ExecutionPlan,
    interpreter::{RunReport, Verdict, interpret},
    lifecycle::SubmissionState,
    metrics::MetricsRegistry,
    models::{Submission, SubmissionRequest, TaskSpec},
    sandbox::{ContainerExecutor, RunExit},
    store::SubmissionStore,
    workspace::WorkspaceBuilder,
};

/// Admission, staging, sandboxing and interpretation for one submission at
/// a time per user.
pub struct SubmissionEngine {
    store: SubmissionStore,
    admission: AdmissionGuard,
    workspaces: WorkspaceBuilder,
    executor: ContainerExecutor,
    metrics: Arc<MetricsRegistry>,
    permits: Arc<Semaphore>,
}

impl SubmissionEngine {
    pub fn new(
        store: SubmissionStore,
        admission: AdmissionGuard,
        workspaces: WorkspaceBuilder,
        executor: ContainerExecutor,
        metrics: Arc<MetricsRegistry>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            store,
            admission,
            workspaces,
            executor,
            metrics,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn store(&self) -> &SubmissionStore {
        &self.store
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Admits the request, then evaluates it on its own task so that a
    /// dropped caller never leaves a half-finished sandbox behind.
    pub async fn submit(
        self: &Arc<Self>,
        request: SubmissionRequest,
    ) -> Result<Submission, EngineError> {
        self.metrics.submitted();
        let (plan, lease) = match self.admit(&request).await {
            Ok(admitted) => admitted,
            Err(err) => {
                self.metrics.rejected();
                tracing::warn!(
                    user_id = %request.user_id,
                    task_id = %request.task.id,
                    kind = request.kind.as_str(),
                    error = %err,
                    "submission rejected"
                );
                return Err(err);
            }
        };

        let submission = self.store.open(&request, Utc::now());
        tracing::info!(
            submission_id = %submission.id,
            user_id = %submission.user_id,
            task_id = %submission.task_id,
            name = %submission.name(),
            "submission accepted"
        );

        let engine = Arc::clone(self);
        let task = request.task;
        let handle = tokio::spawn(async move {
            let evaluated = engine.evaluate(submission, plan, task).await;
            drop(lease);
            evaluated
        });
        handle
            .await
            .map_err(|err| EngineError::Internal(format!("evaluation task failed: {err}")))?
    }

    async fn admit(
        &self,
        request: &SubmissionRequest,
    ) -> Result<(ExecutionPlan, UserLease), EngineError> {
        request.validate()?;
        let plan = request
            .task
            .evaluator
            .plan(request.kind)
            .ok_or(EngineError::CommandUnsupported(request.kind))?;
        let check = AdmissionCheck {
            user_id: &request.user_id,
            kind: request.kind,
            restricted: request.restricted,
            policy: request.task.attempt_policy(),
            assignment: request.task.assignment,
            now: Utc::now(),
        };
        let lease = self
            .admission
            .admit(&check, || {
                self.store
                    .graded_history(&request.task.id, &request.user_id)
            })
            .await?;
        Ok((plan, lease))
    }

    async fn evaluate(
        &self,
        submission: Submission,
        plan: ExecutionPlan,
        task: TaskSpec,
    ) -> Result<Submission, EngineError> {
        let id = submission.id;
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|err| EngineError::Internal(err.to_string()))?;
        self.metrics.started();

        let workspace = match self
            .workspaces
            .build(id, plan.kind, &task.files, &submission.files)
            .await
        {
            Ok(workspace) => workspace,
            Err(err) => {
                tracing::error!(submission_id = %id, error = %err, "failed to stage sandbox workspace");
                let report = RunReport {
                    exit: RunExit::EngineFailure(err.to_string()),
                    logs: None,
                    results: None,
                };
                let verdict = interpret(plan.kind, task.max_points, &report);
                return self.conclude(id, verdict, None).await;
            }
        };
        self.store.advance(id, SubmissionState::Staged)?;

        let exit = match self
            .executor
            .launch(&workspace, &plan, &submission.user_id, id)
            .await
        {
            Ok(container) => {
                self.store.advance(id, SubmissionState::Running)?;
                tracing::info!(submission_id = %id, container_id = %container.id(), "sandbox started");
                let timeout = self.executor.effective_timeout(task.time_limit_secs);
                container.wait(timeout).await
            }
            Err(err) => {
                tracing::error!(submission_id = %id, error = %err, "failed to launch sandbox");
                RunExit::EngineFailure(err.to_string())
            }
        };

        let limits = self.executor.limits();
        let logs = workspace
            .read_logs(&limits.log_file, limits.log_lines, limits.max_output_bytes)
            .await;
        let results = match (&exit, &plan.results_file) {
            (RunExit::Exited(_), Some(file)) => {
                workspace.read_artifact(file, limits.max_output_bytes).await
            }
            _ => None,
        };
        workspace.close().await;

        let report = RunReport {
            exit,
            logs: logs.clone(),
            results,
        };
        let verdict = interpret(plan.kind, task.max_points, &report);
        self.conclude(id, verdict, logs).await
    }

    async fn conclude(
        &self,
        id: Uuid,
        verdict: Verdict,
        logs: Option<String>,
    ) -> Result<Submission, EngineError> {
        self.metrics.finished(verdict.outcome);
        let finished = self.store.finish(id, verdict, logs).await?;
        tracing::info!(
            submission_id = %id,
            outcome = ?finished.outcome,
            points = ?finished.points,
            valid = finished.valid,
            "submission finished"
        );
        Ok(finished)
    }

    pub async fn invalidate(&self, id: Uuid) -> Result<Submission, EngineError> {
        let submission = self.store.invalidate(id).await?;
        tracing::info!(submission_id = %id, user_id = %submission.user_id, "submission invalidated");
        Ok(submission)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::{
        interpreter::{ALL_TESTS_PASSED, MEMORY_LIMIT_MESSAGE, Outcome, TIME_LIMIT_MESSAGE},
        models::{SubmissionFile, SubmissionKind},
        sandbox::{
            ContainerEngine, ExecutorLimits,
            fake::{FakeEngine, Script},
        },
    };

    const FAILED_ASSERTION: &str = "F\n======================================================================\nFAIL: test_fac (grading.tests.TestFac)\n----------------------------------------------------------------------\nTraceback (most recent call last):\n  File \"/grading/tests.py\", line 7, in test_fac\n    self.assertEqual(fac(0), 1, \"@@The calculation of fac(0) is incorrect@@\")\nAssertionError: 2 != 1 : @@The calculation of fac(0) is incorrect@@";

    const SYNTAX_ERROR: &str = "Traceback (most recent call last):\n  File \"/public/script.py\", line 1\n    def fac(n) return 1\n               ^^^^^^\nSyntaxError: invalid syntax";

    struct Harness {
        engine: Arc<SubmissionEngine>,
        fake: Arc<FakeEngine>,
        root: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let root = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeEngine::new());
        let limits = ExecutorLimits {
            memory_bytes: 512 * 1024 * 1024,
            timeout: Duration::from_secs(120),
            log_file: "logs.txt".to_string(),
            log_lines: 50,
            max_output_bytes: 64 * 1024,
            user_label: "grader.user".to_string(),
        };
        let engine = SubmissionEngine::new(
            SubmissionStore::new(None),
            AdmissionGuard::new(fake.clone(), "grader.user"),
            WorkspaceBuilder::new(root.path()),
            ContainerExecutor::new(fake.clone(), limits),
            Arc::new(MetricsRegistry::new()),
            4,
        );
        Harness {
            engine: Arc::new(engine),
            fake,
            root,
        }
    }

    fn request(user_id: &str, kind: SubmissionKind, max_attempts: u32) -> SubmissionRequest {
        let task: TaskSpec = serde_json::from_value(serde_json::json!({
            "id": "fac",
            "max_points": 12.0,
            "max_attempts": max_attempts,
            "attempt_window_secs": 3600,
            "evaluator": {
                "docker_image": "python:3.12-slim",
                "run_command": "python -m public.script",
                "grade_command": "python -m grading.tests"
            },
            "files": [
                { "path": "public/script.py", "template": "# your code" },
                { "path": "grading/tests.py", "template": "import unittest", "grading": true }
            ]
        }))
        .unwrap();
        SubmissionRequest {
            task,
            user_id: user_id.to_string(),
            kind,
            restricted: true,
            files: vec![SubmissionFile {
                path: "public/script.py".to_string(),
                content: "def fac(n):\n    return 1 if n == 0 else n * fac(n - 1)\n".to_string(),
            }],
        }
    }

    fn results(points: f64) -> String {
        serde_json::json!({ "points": points, "hints": [] }).to_string()
    }

    fn workspace_root_is_empty(h: &Harness) -> bool {
        std::fs::read_dir(h.root.path())
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }

    #[tokio::test]
    async fn passing_grade_scores_full_marks() {
        let h = harness();
        h.fake.push(
            Script::exit(0)
                .with_file("logs.txt", "....\nOK")
                .with_file("grade_results.json", &results(12.0)),
        );

        let submission = h
            .engine
            .submit(request("ada", SubmissionKind::Grade, 5))
            .await
            .unwrap();
        assert!(submission.valid);
        assert_eq!(submission.points, Some(12.0));
        assert_eq!(submission.output.as_deref(), Some(ALL_TESTS_PASSED));
        assert_eq!(submission.state, SubmissionState::Completed);
        assert_eq!(submission.logs.as_deref(), Some("....\nOK"));

        let summary = h.engine.store().summary("fac", "ada", Utc::now()).unwrap();
        assert_eq!(summary.best_score, Some(12.0));
        assert_eq!(summary.remaining_attempts, 4);
        assert_eq!(h.fake.live(), 0);
        assert!(workspace_root_is_empty(&h));
    }

    #[tokio::test]
    async fn failed_assertion_surfaces_the_marked_message() {
        let h = harness();
        h.fake.push(
            Script::exit(1)
                .with_file("logs.txt", FAILED_ASSERTION)
                .with_file("grade_results.json", &results(8.0)),
        );

        let submission = h
            .engine
            .submit(request("ada", SubmissionKind::Grade, 5))
            .await
            .unwrap();
        assert!(submission.valid);
        assert_eq!(submission.points, Some(8.0));
        assert_eq!(
            submission.output.as_deref(),
            Some("The calculation of fac(0) is incorrect")
        );
    }

    #[tokio::test]
    async fn syntax_error_is_an_invalid_zero() {
        let h = harness();
        h.fake.push(Script::exit(1).with_file("logs.txt", SYNTAX_ERROR));

        let submission = h
            .engine
            .submit(request("ada", SubmissionKind::Grade, 5))
            .await
            .unwrap();
        assert!(!submission.valid);
        assert_eq!(submission.points, Some(0.0));
        assert_eq!(submission.outcome, Some(Outcome::Crashed));
        assert!(submission.output.unwrap().contains("SyntaxError"));

        // Invalid runs do not spend the budget.
        let summary = h.engine.store().summary("fac", "ada", Utc::now()).unwrap();
        assert_eq!(summary.remaining_attempts, 5);
        assert_eq!(summary.best_score, None);
    }

    #[tokio::test(start_paused = true)]
    async fn endless_run_is_stopped_at_the_time_limit() {
        let h = harness();
        h.fake.push(Script::hang().with_file("logs.txt", "tick\ntick"));

        let submission = h
            .engine
            .submit(request("ada", SubmissionKind::Run, 5))
            .await
            .unwrap();
        assert_eq!(submission.outcome, Some(Outcome::TimeLimitExceeded));
        assert_eq!(submission.output.as_deref(), Some(TIME_LIMIT_MESSAGE));
        assert_eq!(submission.logs.as_deref(), Some("tick\ntick"));
        assert_eq!(submission.state, SubmissionState::Completed);
        assert_eq!(h.fake.live(), 0);
    }

    #[tokio::test]
    async fn out_of_memory_grade_is_forced_to_zero() {
        let h = harness();
        h.fake.push(Script::exit(137));

        let submission = h
            .engine
            .submit(request("ada", SubmissionKind::Grade, 5))
            .await
            .unwrap();
        assert_eq!(submission.outcome, Some(Outcome::MemoryLimitExceeded));
        assert_eq!(submission.points, Some(0.0));
        assert!(!submission.valid);
        assert_eq!(submission.output.as_deref(), Some(MEMORY_LIMIT_MESSAGE));
    }

    #[tokio::test]
    async fn run_output_is_the_log() {
        let h = harness();
        h.fake.push(Script::exit(0).with_file("logs.txt", "120"));

        let submission = h
            .engine
            .submit(request("ada", SubmissionKind::Run, 5))
            .await
            .unwrap();
        assert!(submission.valid);
        assert_eq!(submission.points, None);
        assert_eq!(submission.output.as_deref(), Some("120"));
        assert_eq!(submission.name(), "run 1");

        let spec = &h.fake.specs()[0];
        assert!(spec.cmd[2].starts_with("python -m public.script"));
        assert_eq!(spec.labels["grader.user"], "ada");
    }

    #[tokio::test]
    async fn same_user_cannot_run_two_sandboxes() {
        let h = harness();
        h.fake.push(Script::held(0));
        h.fake.push(Script::exit(0));

        let first = tokio::spawn({
            let engine = h.engine.clone();
            async move { engine.submit(request("ada", SubmissionKind::Run, 5)).await }
        });
        while h.fake.count_running("grader.user", "ada").await.unwrap() == 0 {
            tokio::task::yield_now().await;
        }

        let second = h
            .engine
            .submit(request("ada", SubmissionKind::Run, 5))
            .await;
        assert!(matches!(second, Err(EngineError::ConcurrentSubmission)));

        let other = h
            .engine
            .submit(request("grace", SubmissionKind::Run, 5))
            .await;
        assert!(other.is_ok());

        h.fake.release(1);
        assert!(first.await.unwrap().is_ok());
        assert!(
            h.engine
                .submit(request("ada", SubmissionKind::Run, 5))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn exhausted_budget_recovers_after_invalidation() {
        let h = harness();
        h.fake.push(Script::exit(0).with_file("grade_results.json", &results(6.0)));

        let first = h
            .engine
            .submit(request("ada", SubmissionKind::Grade, 1))
            .await
            .unwrap();
        let blocked = h
            .engine
            .submit(request("ada", SubmissionKind::Grade, 1))
            .await;
        assert!(matches!(blocked, Err(EngineError::NoAttemptsRemaining)));
        assert_eq!(h.fake.created(), 1);

        let summary = h.engine.store().summary("fac", "ada", Utc::now()).unwrap();
        assert!(summary.next_attempt_at.is_some());

        h.engine.invalidate(first.id).await.unwrap();
        h.fake.push(Script::exit(0).with_file("grade_results.json", &results(3.0)));
        let retry = h
            .engine
            .submit(request("ada", SubmissionKind::Grade, 1))
            .await
            .unwrap();
        assert_eq!(retry.ordinal_num, 2);
        let summary = h.engine.store().summary("fac", "ada", Utc::now()).unwrap();
        assert_eq!(summary.best_score, Some(6.0));
    }

    #[tokio::test]
    async fn missing_test_command_is_rejected_up_front() {
        let h = harness();
        let rejected = h
            .engine
            .submit(request("ada", SubmissionKind::Test, 5))
            .await;
        assert!(matches!(
            rejected,
            Err(EngineError::CommandUnsupported(SubmissionKind::Test))
        ));
        assert_eq!(h.fake.created(), 0);
        assert!(h.engine.metrics().render_prometheus().contains("grader_rejected_total 1"));
    }

    #[tokio::test]
    async fn staging_failure_is_recorded_as_an_execution_error() {
        let h = harness();
        let mut bad = request("ada", SubmissionKind::Run, 5);
        bad.files.push(SubmissionFile {
            path: "../outside.py".to_string(),
            content: "print('escape')".to_string(),
        });

        let submission = h.engine.submit(bad).await.unwrap();
        assert_eq!(submission.state, SubmissionState::Errored);
        assert_eq!(submission.outcome, Some(Outcome::ExecutionError));
        assert!(submission.output.unwrap().starts_with("Execution error:"));
        assert_eq!(h.fake.created(), 0);
        assert!(workspace_root_is_empty(&h));
    }

    #[tokio::test]
    async fn engine_failure_on_launch_errors_the_submission() {
        let h = harness();
        h.fake.push(Script::failing_create("image not found"));

        let submission = h
            .engine
            .submit(request("ada", SubmissionKind::Grade, 5))
            .await
            .unwrap();
        assert_eq!(submission.state, SubmissionState::Errored);
        assert_eq!(submission.points, None);
        assert!(!submission.valid);
        assert!(submission.output.unwrap().contains("image not found"));
        assert!(workspace_root_is_empty(&h));
    }
}
