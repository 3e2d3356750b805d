//! Stage execution error types.

use thiserror::Error;

use crate::render::RenderError;

/// Errors raised while synthesizing or executing a stage.
#[derive(Debug, Error)]
pub enum StageError {
    /// The shorthand does not name anything the pipeline can build.
    #[error("{0} is not a known buildable artifact")]
    UnknownArtifact(String),

    /// The stage has neither build artifacts nor commands.
    #[error("no commands to execute")]
    NoCommands,

    /// The prep script failed; main commands were never started.
    #[error("failed execution of the prep stage: {0}")]
    Prep(RenderError),

    /// A main command script failed.
    #[error("stage command failed: {0}")]
    Command(RenderError),

    /// The post script failed after a successful main run.
    #[error("post command failed: {0}")]
    Post(RenderError),

    /// Execution was cancelled through the shared token.
    #[error("stage execution cancelled")]
    Cancelled,

    /// A spawned command task could not be joined.
    #[error("stage task failed: {0}")]
    Join(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl StageError {
    /// Fold a renderer outcome for a main command into a stage error,
    /// keeping cancellation distinguishable from ordinary failure.
    pub(crate) fn from_command(err: RenderError) -> Self {
        match err {
            RenderError::Cancelled => StageError::Cancelled,
            other => StageError::Command(other),
        }
    }
}
