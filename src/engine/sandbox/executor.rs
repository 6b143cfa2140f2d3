use std::{collections::HashMap, sync::Arc, time::Duration};

use uuid::Uuid;

use crate::engine::{
    evaluator::ExecutionPlan,
    sandbox::{ContainerEngine, ContainerError, ContainerSpec, RunExit},
    workspace::SandboxWorkspace,
};

/// Exit status of a process killed by the kernel OOM killer.
pub const OOM_EXIT_CODE: i64 = 137;

const SUBMISSION_LABEL: &str = "grader.submission";

#[derive(Debug, Clone)]
pub struct ExecutorLimits {
    pub memory_bytes: i64,
    pub timeout: Duration,
    pub log_file: String,
    pub log_lines: usize,
    pub max_output_bytes: usize,
    pub user_label: String,
}

#[derive(Clone)]
pub struct ContainerExecutor {
    engine: Arc<dyn ContainerEngine>,
    limits: ExecutorLimits,
}

impl ContainerExecutor {
    pub fn new(engine: Arc<dyn ContainerEngine>, limits: ExecutorLimits) -> Self {
        Self { engine, limits }
    }

    pub fn limits(&self) -> &ExecutorLimits {
        &self.limits
    }

    /// A task may shorten the configured timeout, never extend it.
    pub fn effective_timeout(&self, task_limit_secs: Option<u64>) -> Duration {
        task_limit_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .map_or(self.limits.timeout, |task| task.min(self.limits.timeout))
    }

    pub fn container_spec(
        &self,
        workspace: &SandboxWorkspace,
        plan: &ExecutionPlan,
        user_id: &str,
        submission_id: Uuid,
    ) -> ContainerSpec {
        let dir = workspace.path().to_string_lossy().into_owned();
        let labels = HashMap::from([
            (self.limits.user_label.clone(), user_id.to_string()),
            (SUBMISSION_LABEL.to_string(), submission_id.to_string()),
        ]);
        ContainerSpec {
            image: plan.image.clone(),
            cmd: vec![
                "/bin/bash".to_string(),
                "-c".to_string(),
                format!("{} &> {}", plan.command, self.limits.log_file),
            ],
            working_dir: workspace.path().to_path_buf(),
            binds: vec![format!("{dir}:{dir}:rw")],
            memory_bytes: self.limits.memory_bytes,
            network_disabled: true,
            labels,
        }
    }

    /// Creates and starts the sandbox. A container that was created but
    /// failed to start is torn down before returning.
    pub async fn launch(
        &self,
        workspace: &SandboxWorkspace,
        plan: &ExecutionPlan,
        user_id: &str,
        submission_id: Uuid,
    ) -> Result<RunningContainer, ContainerError> {
        let spec = self.container_spec(workspace, plan, user_id, submission_id);
        let id = self.engine.create(&spec).await?;
        let guard = ContainerGuard::new(self.engine.clone(), id);
        tracing::debug!(
            submission_id = %submission_id,
            container_id = %guard.id,
            engine = self.engine.name(),
            "sandbox container created"
        );
        if let Err(err) = self.engine.start(&guard.id).await {
            guard.teardown().await;
            return Err(err);
        }
        Ok(RunningContainer { guard })
    }
}

/// A started sandbox. Dropping it without waiting still kills and removes
/// the container.
pub struct RunningContainer {
    guard: ContainerGuard,
}

impl RunningContainer {
    pub fn id(&self) -> &str {
        &self.guard.id
    }

    pub async fn wait(self, timeout: Duration) -> RunExit {
        let waited = tokio::time::timeout(timeout, self.guard.engine.wait(&self.guard.id)).await;
        let exit = match waited {
            Ok(Ok(OOM_EXIT_CODE)) => RunExit::MemoryLimitExceeded,
            Ok(Ok(code)) => RunExit::Exited(code),
            Ok(Err(err)) => {
                tracing::error!(container_id = %self.guard.id, error = %err, "sandbox wait failed");
                RunExit::EngineFailure(err.to_string())
            }
            Err(_) => {
                tracing::warn!(
                    container_id = %self.guard.id,
                    timeout_secs = timeout.as_secs(),
                    "sandbox exceeded its time limit, killing"
                );
                RunExit::TimedOut
            }
        };
        self.guard.teardown().await;
        exit
    }
}

struct ContainerGuard {
    engine: Arc<dyn ContainerEngine>,
    id: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(engine: Arc<dyn ContainerEngine>, id: String) -> Self {
        Self {
            engine,
            id,
            armed: true,
        }
    }

    async fn teardown(mut self) {
        self.armed = false;
        destroy(self.engine.as_ref(), &self.id).await;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let engine = self.engine.clone();
        let id = std::mem::take(&mut self.id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { destroy(engine.as_ref(), &id).await });
            }
            Err(_) => tracing::warn!(container_id = %id, "no runtime to remove abandoned container"),
        }
    }
}

async fn destroy(engine: &dyn ContainerEngine, id: &str) {
    if let Err(err) = engine.kill(id).await {
        tracing::warn!(container_id = %id, error = %err, "failed to kill sandbox container");
    }
    if let Err(err) = engine.remove(id).await {
        tracing::warn!(container_id = %id, error = %err, "failed to remove sandbox container");
    }
}
