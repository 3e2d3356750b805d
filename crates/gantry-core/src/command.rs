//! Command synthesis for artifact shorthands.
//!
//! These are the only hard-coded commands gantry understands; everything
//! else comes from the job spec verbatim.

use tracing::debug;

use crate::catalogue::ArtifactCatalogue;
use crate::error::StageError;
use crate::types::JobSpec;

/// The basic build command.
pub const DEFAULT_BASE_COMMAND: &str = "cosa fetch; cosa build;";

/// Base build for distributed jobs using parallel worker pods.
pub const DEFAULT_BASE_DELAY_MERGE_COMMAND: &str = "cosa fetch; cosa build --delay-meta-merge;";

/// Ensures that the build metadata is merged.
pub const DEFAULT_FINALIZE_COMMAND: &str = "cosa meta --finalize;";

/// Map an artifact shorthand to its build commands.
///
/// `base` and `finalize` are pseudo-stages with fixed commands; any other
/// name must be accepted by the catalogue and maps to `cosa
/// buildextend-<name>`.
pub fn commands_for_artifact(
    name: &str,
    js: &JobSpec,
    catalogue: &dyn ArtifactCatalogue,
) -> Result<Vec<String>, StageError> {
    debug!(command = name, "checking shorthand");
    match name.to_ascii_lowercase().as_str() {
        "base" => {
            if js.delayed_meta_merge {
                Ok(vec![DEFAULT_BASE_DELAY_MERGE_COMMAND.to_string()])
            } else {
                Ok(vec![DEFAULT_BASE_COMMAND.to_string()])
            }
        }
        "finalize" => Ok(vec![DEFAULT_FINALIZE_COMMAND.to_string()]),
        lowered => {
            if catalogue.can_build(lowered) {
                Ok(vec![format!("cosa buildextend-{lowered}")])
            } else {
                Err(StageError::UnknownArtifact(name.to_string()))
            }
        }
    }
}
