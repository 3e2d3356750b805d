//! Render capability: the injected "run this script" contract.
//!
//! The executor does not know how scripts are executed. It hands a script
//! path, environment bindings, and a cancellation token to a
//! `RendererExecuter` and acts on the outcome.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

// Re-export CancellationToken for convenience
pub use tokio_util::sync::CancellationToken;

use crate::catalogue::ArtifactCatalogue;
use crate::types::JobSpec;

/// Renderer outcome. Cancellation is distinguishable from failure so the
/// executor can surface it as such.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("{0}")]
    Failed(String),

    #[error("render cancelled")]
    Cancelled,
}

/// Capability that runs a materialized script under a cancellation token
/// with a set of environment bindings.
#[async_trait]
pub trait RendererExecuter: Send + Sync {
    async fn render(
        &self,
        cancel: &CancellationToken,
        env: &HashMap<String, String>,
        script: &Path,
    ) -> Result<(), RenderError>;
}

/// Execution context handed to a stage: the job spec the stage belongs
/// to, the renderer that runs its scripts, and the artifact catalogue its
/// build shorthands are resolved against.
#[derive(Clone)]
pub struct RenderData {
    pub job_spec: Arc<JobSpec>,
    pub renderer: Arc<dyn RendererExecuter>,
    pub catalogue: Arc<dyn ArtifactCatalogue>,
}

impl RenderData {
    pub fn new(
        job_spec: Arc<JobSpec>,
        renderer: Arc<dyn RendererExecuter>,
        catalogue: Arc<dyn ArtifactCatalogue>,
    ) -> Self {
        Self {
            job_spec,
            renderer,
            catalogue,
        }
    }
}

/// Renderer that runs scripts through a shell on the host.
///
/// The child inherits the caller's stdio so build output lands on the
/// console; cancellation kills the child and reports `Cancelled`.
pub struct ShellRenderer {
    shell: PathBuf,
}

impl ShellRenderer {
    pub fn new() -> Self {
        Self {
            shell: PathBuf::from("/bin/bash"),
        }
    }

    /// Override the shell binary.
    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }
}

impl Default for ShellRenderer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RendererExecuter for ShellRenderer {
    async fn render(
        &self,
        cancel: &CancellationToken,
        env: &HashMap<String, String>,
        script: &Path,
    ) -> Result<(), RenderError> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg(script);
        cmd.envs(env);
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|err| RenderError::Failed(format!("failed to spawn {}: {err}", script.display())))?;

        tokio::select! {
            status = child.wait() => match status {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => Err(RenderError::Failed(format!(
                    "script {} exited with {status}",
                    script.display()
                ))),
                Err(err) => Err(RenderError::Failed(format!(
                    "failed waiting on {}: {err}",
                    script.display()
                ))),
            },
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                Err(RenderError::Cancelled)
            }
        }
    }
}
