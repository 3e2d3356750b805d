//! # Gantry Core
//!
//! Stage model and deterministic execution logic for the gantry build
//! pipeline.
//!
//! This crate contains:
//! - JobSpec / Stage definitions and the deep-copy contract
//! - Shorthand-to-stage planning (artifact ordering, requirement pruning)
//! - Command synthesis for buildable artifacts
//! - Stage execution (serial or concurrent) against an injected renderer
//! - Cross-stage scheduling by execution order
//!
//! This crate does NOT care about:
//! - How a script is actually invoked (see `RendererExecuter`)
//! - Where the worker runs (cluster or local container runtime)
//! - How a job spec file reaches memory

pub mod catalogue;
pub mod command;
pub mod error;
pub mod executor;
pub mod planner;
pub mod render;
pub mod schedule;
pub mod types;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::catalogue::{ArtifactCatalogue, BuildCatalogue};
    pub use crate::command::commands_for_artifact;
    pub use crate::error::StageError;
    pub use crate::planner::{artifact_shorthand_names, PlanError};
    pub use crate::render::{CancellationToken, RenderData, RenderError, RendererExecuter, ShellRenderer};
    pub use crate::schedule::{execution_groups, run_stages};
    pub use crate::types::{JobSpec, Stage};
}

// Re-export key types at crate root
pub use catalogue::{ArtifactCatalogue, BuildCatalogue};
pub use error::StageError;
pub use planner::PlanError;
pub use render::{CancellationToken, RenderData, RenderError, RendererExecuter};
pub use types::{JobSpec, Stage};
