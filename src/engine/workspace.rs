use std::{
    collections::HashSet,
    io,
    path::{Component, Path, PathBuf},
};

use thiserror::Error;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use crate::engine::models::{SubmissionFile, SubmissionKind, TaskFile};

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("rejected file path {0:?}")]
    InvalidPath(String),
    #[error("failed to create directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone)]
pub struct WorkspaceBuilder {
    root: PathBuf,
}

impl WorkspaceBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Stages a fresh directory for one submission.
    ///
    /// Order matters: resources first, then grading files for graded runs,
    /// then submitted content. A submitted file never replaces a grading
    /// file. Any failure removes the partially populated directory.
    pub async fn build(
        &self,
        submission_id: Uuid,
        kind: SubmissionKind,
        task_files: &[TaskFile],
        submitted: &[SubmissionFile],
    ) -> Result<SandboxWorkspace, WorkspaceError> {
        let root = std::path::absolute(&self.root).map_err(|source| WorkspaceError::CreateDir {
            path: self.root.clone(),
            source,
        })?;
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|source| WorkspaceError::CreateDir {
                path: root.clone(),
                source,
            })?;

        let path = root.join(submission_id.as_simple().to_string());
        tokio::fs::create_dir(&path)
            .await
            .map_err(|source| WorkspaceError::CreateDir {
                path: path.clone(),
                source,
            })?;
        let workspace = SandboxWorkspace {
            path,
            armed: true,
        };
        if let Err(err) = workspace.populate(submission_id, kind, task_files, submitted).await {
            workspace.close().await;
            return Err(err);
        }
        Ok(workspace)
    }
}

/// A staged submission directory. Removed when dropped.
#[derive(Debug)]
pub struct SandboxWorkspace {
    path: PathBuf,
    armed: bool,
}

impl SandboxWorkspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn populate(
        &self,
        submission_id: Uuid,
        kind: SubmissionKind,
        task_files: &[TaskFile],
        submitted: &[SubmissionFile],
    ) -> Result<(), WorkspaceError> {
        let resources = task_files.iter().filter(|f| f.enabled && !f.grading);
        for file in resources {
            self.stage(&file.path, &file.template).await?;
        }

        let mut protected = HashSet::new();
        if kind.is_graded() {
            for file in task_files.iter().filter(|f| f.enabled && f.grading) {
                protected.insert(relative_path(&file.path)?);
                self.stage(&file.path, &file.template).await?;
            }
        }

        for file in submitted {
            let relative = relative_path(&file.path)?;
            if protected.contains(&relative) {
                tracing::warn!(
                    submission_id = %submission_id,
                    path = %file.path,
                    "ignoring submitted file that shadows a grading file"
                );
                continue;
            }
            self.stage(&file.path, &file.content).await?;
        }
        Ok(())
    }

    async fn stage(&self, task_path: &str, content: &str) -> Result<(), WorkspaceError> {
        let target = self.path.join(relative_path(task_path)?);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| WorkspaceError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::write(&target, content.as_bytes())
            .await
            .map_err(|source| WorkspaceError::Write {
                path: target.clone(),
                source,
            })
    }

    /// First `limit` lines of a text artifact, newline-joined.
    pub async fn read_logs(&self, file_name: &str, limit: usize, max_bytes: usize) -> Option<String> {
        let raw = self.read_artifact(file_name, max_bytes).await?;
        Some(raw.lines().take(limit).collect::<Vec<_>>().join("\n"))
    }

    /// At most `max_bytes` of a file the sandbox left behind. The workspace
    /// is writable from inside the container, so only regular files that
    /// resolve under the workspace directory are read.
    pub async fn read_artifact(&self, file_name: &str, max_bytes: usize) -> Option<String> {
        let path = self.path.join(relative_path(file_name).ok()?);
        match self.read_contained(&path, max_bytes).await {
            Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to read sandbox artifact");
                None
            }
        }
    }

    async fn read_contained(&self, path: &Path, max_bytes: usize) -> io::Result<Vec<u8>> {
        let metadata = tokio::fs::symlink_metadata(path).await?;
        if !metadata.file_type().is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "artifact is not a regular file",
            ));
        }
        let root = tokio::fs::canonicalize(&self.path).await?;
        let resolved = tokio::fs::canonicalize(path).await?;
        if !resolved.starts_with(&root) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "artifact resolves outside the workspace",
            ));
        }

        let file = tokio::fs::File::open(&resolved).await?;
        let mut out = Vec::with_capacity(max_bytes.min(8192));
        file.take(max_bytes as u64).read_to_end(&mut out).await?;
        Ok(out)
    }

    pub async fn close(mut self) {
        self.armed = false;
        if let Err(err) = tokio::fs::remove_dir_all(&self.path).await {
            log_cleanup_failure(&self.path, &err);
        }
    }
}

impl Drop for SandboxWorkspace {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let path = std::mem::take(&mut self.path);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || remove_workspace(&path));
            }
            Err(_) => remove_workspace(&path),
        }
    }
}

fn remove_workspace(path: &Path) {
    if let Err(err) = std::fs::remove_dir_all(path) {
        log_cleanup_failure(path, &err);
    }
}

fn log_cleanup_failure(path: &Path, err: &io::Error) {
    if err.kind() != io::ErrorKind::NotFound {
        tracing::warn!(path = %path.display(), error = %err, "failed to remove sandbox workspace");
    }
}

/// Task paths are POSIX-style and relative; a single leading `/` is tolerated.
fn relative_path(raw: &str) -> Result<PathBuf, WorkspaceError> {
    let trimmed = raw.strip_prefix('/').unwrap_or(raw);
    let mut out = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return Err(WorkspaceError::InvalidPath(raw.to_string())),
        }
    }
    if out.as_os_str().is_empty() {
        return Err(WorkspaceError::InvalidPath(raw.to_string()));
    }
    Ok(out)
}
