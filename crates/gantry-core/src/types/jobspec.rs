//! Job spec type definition.

use serde::{Deserialize, Serialize};

use crate::planner::PlanError;
use crate::types::Stage;

/// A declarative build job: the ordered stages plus the knobs that change
/// how their commands are synthesized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSpec {
    /// Ordered stages of the job.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<Stage>,

    /// When true, the base build defers merging its metadata so that
    /// parallel workers can merge results later.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub delayed_meta_merge: bool,

    /// Strict-mode build. Set as a side effect of planning from
    /// shorthands.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub strict_mode: bool,
}

impl JobSpec {
    /// Look up a stage by its ID.
    pub fn stage(&self, id: &str) -> Result<&Stage, PlanError> {
        self.stages
            .iter()
            .find(|stage| stage.id == id)
            .ok_or_else(|| PlanError::NoSuchStage(id.to_string()))
    }
}
