//! Worker pod error types.

use thiserror::Error;

/// Errors raised while running a worker pod.
#[derive(Debug, Error)]
pub enum PodError {
    #[error("failed to create pod {pod}: {message}")]
    Create { pod: String, message: String },

    #[error("pod {0} not found")]
    NotFound(String),

    /// The watch channel closed before the pod reached a terminal phase.
    #[error("orphaned pod {0}")]
    Orphaned(String),

    #[error("pod {0} did not complete work in time")]
    DeadlineExceeded(String),

    #[error("termination requested by {0}")]
    TerminationRequested(&'static str),

    #[error("worker pod {pod} failed: {message}")]
    WorkerFailed { pod: String, message: String },

    #[error("cluster api error: {0}")]
    Api(String),

    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
