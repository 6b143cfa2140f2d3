mod docker;
mod executor;
#[cfg(test)]
pub mod fake;

use std::{collections::HashMap, path::PathBuf};

use async_trait::async_trait;
use thiserror::Error;

pub use docker::DockerEngine;
pub use executor::{ContainerExecutor, ExecutorLimits};

/// How a sandbox run ended, as seen from outside the container.
#[derive(Debug, Clone, PartialEq)]
pub enum RunExit {
    Exited(i64),
    MemoryLimitExceeded,
    TimedOut,
    EngineFailure(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub image: String,
    pub cmd: Vec<String>,
    pub working_dir: PathBuf,
    /// `host:container:mode` bind specifications.
    pub binds: Vec<String>,
    pub memory_bytes: i64,
    pub network_disabled: bool,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("container engine unavailable: {0}")]
    Connect(String),
    #[error("{operation} failed for {target}: {message}")]
    Operation {
        operation: &'static str,
        target: String,
        message: String,
    },
}

impl ContainerError {
    pub fn operation(operation: &'static str, target: impl Into<String>, message: impl ToString) -> Self {
        Self::Operation {
            operation,
            target: target.into(),
            message: message.to_string(),
        }
    }
}

/// The slice of a container engine the grader depends on.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    fn name(&self) -> &'static str;
    async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError>;
    async fn start(&self, id: &str) -> Result<(), ContainerError>;
    /// Blocks until the container stops and returns its exit code.
    async fn wait(&self, id: &str) -> Result<i64, ContainerError>;
    /// Stopping an already stopped container is not an error.
    async fn kill(&self, id: &str) -> Result<(), ContainerError>;
    /// Removing an already removed container is not an error.
    async fn remove(&self, id: &str) -> Result<(), ContainerError>;
    async fn count_running(&self, label_key: &str, label_value: &str)
    -> Result<usize, ContainerError>;
}
