//! Stage type definition.
//!
//! A Stage is a declarative unit of work: prep, main, and post command
//! groups plus the metadata that governs concurrency and ordering.

use serde::{Deserialize, Serialize};

use crate::error::StageError;

/// A single stage of a build job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Stage {
    /// Stable identifier, unique within a job spec. May be empty until
    /// assigned by the planner.
    pub id: String,

    /// Human-readable description.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// When true, the stage's own main commands run in parallel with each
    /// other.
    #[serde(rename = "concurrent", skip_serializing_if = "std::ops::Not::not")]
    pub concurrent_execution: bool,

    /// When true, commands are invoked directly rather than materialized
    /// into script files. Carried through for downstream use; execution
    /// treats commands identically either way.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub direct_exec: bool,

    /// When true, the stage does not block the next execution order from
    /// starting.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub not_blocking: bool,

    /// Artifacts that must already exist for the stage to run. The
    /// planner computes this set; enforcement is left to the scheduling
    /// orchestrator.
    #[serde(rename = "requires_artifacts", skip_serializing_if = "Vec::is_empty")]
    pub require_artifacts: Vec<String>,

    /// Artifact shorthands to build, synthesized into commands at
    /// execution time. The special `base` produces an OSTree and qemu.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub build_artifacts: Vec<String>,

    /// Arbitrary commands run after the artifact builds. Prefer the bare
    /// name in `build_artifacts` over a hand-written `cosa buildextend-*`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,

    /// Commands run before the artifact builds, serially.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub prep_commands: Vec<String>,

    /// Commands run after the artifact builds, serially.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub post_commands: Vec<String>,

    /// Ensures the post commands run even when main execution fails.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub post_always: bool,

    /// Order of the stage. Stages sharing a value may run concurrently
    /// with each other; lower orders run first. Zero means unset.
    #[serde(skip_serializing_if = "is_zero")]
    pub execution_order: u32,

    /// Wire fields this build does not recognize. Kept so they survive
    /// re-serialization and deep copies.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

impl Stage {
    /// Value copy of the stage sharing no state with the original,
    /// obtained by rendering to JSON and reading it back.
    pub fn deep_copy(&self) -> Result<Stage, StageError> {
        let out = serde_json::to_vec(self)?;
        Ok(serde_json::from_slice(&out)?)
    }
}
