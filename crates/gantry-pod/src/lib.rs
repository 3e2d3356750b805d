//! # Gantry Pod
//!
//! Worker pod lifecycle control for the gantry build pipeline.
//!
//! This crate contains:
//! - The worker pod description builder (platform-version aware)
//! - The cluster runner: create, watch, stream logs, tear down
//! - The local runner: the same work driven through a host container
//!   runtime socket instead of a cluster
//! - Caller-owned termination signal plumbing
//!
//! The cluster API and the container runtime are both consumed through
//! narrow trait seams; this crate never talks to a wire client directly.

pub mod cluster;
pub mod error;
pub mod local;
pub mod signal;
pub mod spec;

pub use cluster::{ClusterClient, ClusterRunner, LogStream, PodPhase, PodStatus};
pub use error::PodError;
pub use local::{AttachStreams, ContainerConfig, ContainerRuntime, LocalRunner};
pub use signal::TerminationStream;
pub use spec::{ApiBuild, EnvVar, PlatformVersion, WorkerPod, WorkerPodSpec};

/// The shared work directory inside every worker.
pub const SRV_DIR: &str = "/srv";
