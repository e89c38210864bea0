//! Scratch and output directory management for render jobs.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use thiserror::Error;
use tokio::fs;
use tracing::warn;

use crate::config::WorkspaceSettings;
use crate::domain::job::JobId;

/// Errors raised while touching the workspace filesystem.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("invalid artifact path")]
    InvalidPath,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Filesystem roots shared by every job: a scratch directory holding one
/// source file per in-flight job and an append-only output directory the
/// toolchain writes artifacts into.
#[derive(Debug)]
pub struct Workspace {
    scratch_dir: PathBuf,
    output_dir: PathBuf,
    artifact_extension: String,
}

impl Workspace {
    /// Initialise the workspace, creating both directories if necessary.
    /// Paths are canonicalised so they stay valid when the render process
    /// runs with a different working directory.
    pub fn new(settings: &WorkspaceSettings) -> Result<Self, WorkspaceError> {
        std::fs::create_dir_all(&settings.scratch_dir)?;
        std::fs::create_dir_all(&settings.output_dir)?;
        Ok(Self {
            scratch_dir: std::fs::canonicalize(&settings.scratch_dir)?,
            output_dir: std::fs::canonicalize(&settings.output_dir)?,
            artifact_extension: settings.artifact_extension.clone(),
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn artifact_extension(&self) -> &str {
        &self.artifact_extension
    }

    /// Write the job's source text into the scratch directory and return a
    /// guard that removes the file again when the job reaches a terminal
    /// state, however it gets there.
    pub async fn stage_source(
        &self,
        job_id: &JobId,
        text: &str,
    ) -> Result<ScratchSource, WorkspaceError> {
        let path = self.scratch_dir.join(format!("{job_id}.py"));
        fs::write(&path, text).await?;
        Ok(ScratchSource { path, armed: true })
    }

    /// Absolute path of an artifact addressed relative to the output
    /// directory. Rejects absolute paths and any traversal components.
    pub fn resolve_artifact(&self, relative: &str) -> Result<PathBuf, WorkspaceError> {
        let path = Path::new(relative);
        if path.is_absolute()
            || path
                .components()
                .any(|component| matches!(component, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(WorkspaceError::InvalidPath);
        }
        Ok(self.output_dir.join(path))
    }

    /// Read a finished artifact into memory for serving.
    pub async fn read_artifact(&self, relative: &str) -> Result<Bytes, WorkspaceError> {
        let absolute = self.resolve_artifact(relative)?;
        let data = fs::read(absolute).await?;
        Ok(Bytes::from(data))
    }

    /// Path of an artifact relative to the output directory, for URL
    /// assembly. Falls back to the bare file name when the artifact sits
    /// outside the root (which the locator never produces).
    pub fn relativize(&self, artifact: &Path) -> String {
        artifact
            .strip_prefix(&self.output_dir)
            .unwrap_or(artifact)
            .to_string_lossy()
            .into_owned()
    }
}

/// Scoped handle to one job's staged source file. The file is deleted when
/// the guard is dropped; `discard` does the same removal eagerly with
/// logging. Cleanup failures are logged and never escalated.
#[derive(Debug)]
pub struct ScratchSource {
    path: PathBuf,
    armed: bool,
}

impl ScratchSource {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the staged file now instead of waiting for drop.
    pub async fn discard(mut self) {
        self.armed = false;
        if let Err(err) = fs::remove_file(&self.path).await {
            if err.kind() != ErrorKind::NotFound {
                warn!(
                    target = "infra::workspace",
                    path = %self.path.display(),
                    error = %err,
                    "failed to remove staged source"
                );
            }
        }
    }
}

impl Drop for ScratchSource {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                warn!(
                    target = "infra::workspace",
                    path = %self.path.display(),
                    error = %err,
                    "failed to remove staged source on drop"
                );
            }
        }
    }
}
