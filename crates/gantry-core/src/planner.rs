//! Shorthand-to-stage planning.
//!
//! A shorthand group like `"base+metal+live-iso"` folds into a single
//! Stage with a deduplicated build list, an execution order equal to the
//! lowest order any member implies, and a pruned requirement set.

use thiserror::Error;
use tracing::info;

use crate::catalogue::ArtifactCatalogue;
use crate::types::{JobSpec, Stage};

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A shorthand named nothing the catalogue or the pseudo-stages know.
    #[error("unknown artifact shorthand {0}")]
    UnknownShorthand(String),

    /// Stage lookup by ID failed.
    #[error("no such stage with ID {0:?}")]
    NoSuchStage(String),
}

/// Order and implied artifacts of a single shorthand.
struct ShorthandSeed {
    execution_order: u32,
    build_artifacts: &'static [&'static str],
    require_artifacts: &'static [&'static str],
}

/// Classify a shorthand. Generic catalogue artifacts build behind the
/// qemu image at order 3; the pseudo-stages bracket the run.
fn seed_for(artifact: &str, catalogue: &dyn ArtifactCatalogue) -> Option<ShorthandSeed> {
    let seed = match artifact {
        "base" => ShorthandSeed {
            execution_order: 1,
            build_artifacts: &["base"],
            require_artifacts: &["base"],
        },
        "finalize" => ShorthandSeed {
            execution_order: 999,
            build_artifacts: &["finalize"],
            require_artifacts: &[],
        },
        "live-iso" => ShorthandSeed {
            execution_order: 2,
            build_artifacts: &["live-iso"],
            require_artifacts: &["qemu", "metal", "metal4k"],
        },
        "metal" => ShorthandSeed {
            execution_order: 2,
            build_artifacts: &["metal"],
            require_artifacts: &[],
        },
        "metal4k" => ShorthandSeed {
            execution_order: 2,
            build_artifacts: &["metal4k"],
            require_artifacts: &[],
        },
        _ => {
            if !catalogue.can_build(artifact) {
                return None;
            }
            ShorthandSeed {
                execution_order: 3,
                build_artifacts: &[],
                require_artifacts: &["qemu"],
            }
        }
    };
    Some(seed)
}

/// Shorthands for buildable stages: the pseudo-stages followed by every
/// catalogue artifact.
pub fn artifact_shorthand_names(catalogue: &dyn ArtifactCatalogue) -> Vec<String> {
    let mut names = vec!["base".to_string(), "finalize".to_string()];
    names.extend(catalogue.built_in_artifacts());
    names
}

/// Remove the first occurrence of `key`, reporting whether it was found.
fn remove_first(list: &mut Vec<String>, key: &str) -> bool {
    match list.iter().position(|item| item == key) {
        Some(idx) => {
            list.remove(idx);
            true
        }
        None => false,
    }
}

/// Order-preserving dedupe.
fn unique(list: Vec<String>) -> Vec<String> {
    let mut seen = Vec::with_capacity(list.len());
    for item in list {
        if !seen.contains(&item) {
            seen.push(item);
        }
    }
    seen
}

/// Fold one build shorthand into the accumulating stage, keeping the
/// build list ordered by the dependencies the shorthands imply.
fn add_shorthand_to_stage(
    artifact: &str,
    stage: &mut Stage,
    catalogue: &dyn ArtifactCatalogue,
) -> Result<(), PlanError> {
    let working =
        seed_for(artifact, catalogue).ok_or_else(|| PlanError::UnknownShorthand(artifact.to_string()))?;

    if working.build_artifacts.is_empty() {
        // Generic catalogue artifact: the build list is the shorthand itself.
        stage.build_artifacts.push(artifact.to_string());
    } else {
        stage
            .build_artifacts
            .extend(working.build_artifacts.iter().map(|s| s.to_string()));
    }
    stage
        .require_artifacts
        .extend(working.require_artifacts.iter().map(|s| s.to_string()));

    // Assume the lowest execution order seen so far.
    if stage.execution_order == 0 || working.execution_order < stage.execution_order {
        stage.execution_order = working.execution_order;
    }

    stage.id = format!("Generated Stage in Execution Order {}", stage.execution_order);
    stage.description = format!(
        "Stage {} execution for {}",
        stage.execution_order,
        stage.build_artifacts.join(",")
    );

    // Re-sort the build list by the minimum order each artifact implies.
    // Arrival order is preserved within an order group so planning stays
    // deterministic.
    let mut ordered: Vec<(u32, String)> = Vec::with_capacity(stage.build_artifacts.len());
    for name in stage.build_artifacts.drain(..) {
        let implied = seed_for(&name, catalogue)
            .map(|s| s.execution_order)
            .ok_or_else(|| PlanError::UnknownShorthand(name.clone()))?;
        ordered.push((implied, name));
    }
    ordered.sort_by_key(|(order, _)| *order);
    stage.build_artifacts = unique(ordered.into_iter().map(|(_, name)| name).collect());

    // A stage may not require what it builds in the same stage.
    let mut requires = stage.require_artifacts.clone();
    for built in &stage.build_artifacts {
        remove_first(&mut requires, built);
    }

    // base is shorthand for ostree and qemu, so a required base strips
    // both. A stage that builds base starts from a fresh fetch and
    // produces its artifact chain in place, so no external requirement
    // survives at all.
    if remove_first(&mut requires, "base") {
        remove_first(&mut requires, "ostree");
        remove_first(&mut requires, "qemu");
    }
    if stage.build_artifacts.iter().any(|b| b == "base") {
        requires.clear();
    }
    stage.require_artifacts = unique(requires);

    Ok(())
}

impl JobSpec {
    /// Synthesize stages from `+`-joined shorthand groups and append them
    /// to the job. Planning switches the job to delayed meta merge and
    /// strict mode; an unknown shorthand aborts the whole plan.
    pub fn generate_stages(
        &mut self,
        from_names: &[String],
        catalogue: &dyn ArtifactCatalogue,
    ) -> Result<(), PlanError> {
        if from_names.is_empty() {
            return Ok(());
        }

        self.delayed_meta_merge = true;
        self.strict_mode = true;

        for group in from_names {
            let mut stage = Stage::default();
            for shorthand in group.split('+') {
                add_shorthand_to_stage(shorthand, &mut stage, catalogue)?;
            }
            info!(
                stage = %stage.id,
                builds = ?stage.build_artifacts,
                requires = ?stage.require_artifacts,
                "planned stage from shorthand group"
            );
            self.stages.push(stage);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::BuildCatalogue;

    fn plan(groups: &[&str]) -> (JobSpec, Vec<Stage>) {
        let mut js = JobSpec::default();
        let groups: Vec<String> = groups.iter().map(|s| s.to_string()).collect();
        js.generate_stages(&groups, &BuildCatalogue).expect("plan");
        let stages = js.stages.clone();
        (js, stages)
    }

    #[test]
    fn test_single_base_group() {
        let (js, stages) = plan(&["base"]);
        assert_eq!(stages.len(), 1);
        let stage = &stages[0];
        assert_eq!(stage.execution_order, 1);
        assert_eq!(stage.build_artifacts, vec!["base".to_string()]);
        assert!(stage.require_artifacts.is_empty());
        assert_eq!(stage.id, "Generated Stage in Execution Order 1");
        assert!(js.delayed_meta_merge);
        assert!(js.strict_mode);
    }

    #[test]
    fn test_combined_base_metal_live_iso_group() {
        let (_, stages) = plan(&["base+metal+live-iso"]);
        assert_eq!(stages.len(), 1);
        let stage = &stages[0];
        assert_eq!(stage.execution_order, 1);
        assert_eq!(
            stage.build_artifacts,
            vec![
                "base".to_string(),
                "metal".to_string(),
                "live-iso".to_string()
            ]
        );
        assert!(stage.require_artifacts.is_empty());
    }

    #[test]
    fn test_live_iso_alone_keeps_its_requirements() {
        let (_, stages) = plan(&["live-iso"]);
        let stage = &stages[0];
        assert_eq!(stage.execution_order, 2);
        assert_eq!(stage.build_artifacts, vec!["live-iso".to_string()]);
        assert_eq!(
            stage.require_artifacts,
            vec![
                "qemu".to_string(),
                "metal".to_string(),
                "metal4k".to_string()
            ]
        );
    }

    #[test]
    fn test_generic_artifact_requires_qemu() {
        let (_, stages) = plan(&["aws"]);
        let stage = &stages[0];
        assert_eq!(stage.execution_order, 3);
        assert_eq!(stage.build_artifacts, vec!["aws".to_string()]);
        assert_eq!(stage.require_artifacts, vec!["qemu".to_string()]);
    }

    #[test]
    fn test_base_clears_generic_requirements() {
        let (_, stages) = plan(&["base+aws"]);
        let stage = &stages[0];
        assert_eq!(stage.execution_order, 1);
        assert_eq!(
            stage.build_artifacts,
            vec!["base".to_string(), "aws".to_string()]
        );
        assert!(stage.require_artifacts.is_empty());
    }

    #[test]
    fn test_build_list_is_deduplicated_in_arrival_order() {
        let (_, stages) = plan(&["metal+metal4k+metal"]);
        let stage = &stages[0];
        assert_eq!(
            stage.build_artifacts,
            vec!["metal".to_string(), "metal4k".to_string()]
        );
        assert_eq!(stage.execution_order, 2);
    }

    #[test]
    fn test_lower_order_artifacts_sort_first_regardless_of_arrival() {
        let (_, stages) = plan(&["aws+metal+base"]);
        let stage = &stages[0];
        assert_eq!(
            stage.build_artifacts,
            vec![
                "base".to_string(),
                "metal".to_string(),
                "aws".to_string()
            ]
        );
        assert_eq!(stage.execution_order, 1);
    }

    #[test]
    fn test_finalize_runs_last() {
        let (_, stages) = plan(&["finalize"]);
        let stage = &stages[0];
        assert_eq!(stage.execution_order, 999);
        assert_eq!(stage.build_artifacts, vec!["finalize".to_string()]);
        assert!(stage.require_artifacts.is_empty());
    }

    #[test]
    fn test_multiple_groups_yield_multiple_stages() {
        let (_, stages) = plan(&["base", "live-iso", "finalize"]);
        assert_eq!(stages.len(), 3);
        assert_eq!(stages[0].execution_order, 1);
        assert_eq!(stages[1].execution_order, 2);
        assert_eq!(stages[2].execution_order, 999);
    }

    #[test]
    fn test_unknown_shorthand_is_fatal_to_the_plan() {
        let mut js = JobSpec::default();
        let err = js
            .generate_stages(&["base+warp-drive".to_string()], &BuildCatalogue)
            .unwrap_err();
        assert!(matches!(err, PlanError::UnknownShorthand(name) if name == "warp-drive"));
    }

    #[test]
    fn test_empty_input_is_a_no_op() {
        let mut js = JobSpec::default();
        js.generate_stages(&[], &BuildCatalogue).expect("no-op");
        assert!(js.stages.is_empty());
        assert!(!js.delayed_meta_merge);
        assert!(!js.strict_mode);
    }

    #[test]
    fn test_planning_is_deterministic() {
        let groups = ["base+metal+metal4k+live-iso", "aws+gcp", "finalize"];
        let (_, first) = plan(&groups);
        let (_, second) = plan(&groups);
        assert_eq!(first, second);
    }

    #[test]
    fn test_planned_stages_satisfy_invariants() {
        let groups = [
            "base",
            "base+metal+live-iso",
            "live-iso",
            "aws+azure+aws",
            "base+aws",
            "metal4k+metal",
        ];
        let (_, stages) = plan(&groups);
        for stage in &stages {
            // Build list is duplicate-free.
            let deduped = unique(stage.build_artifacts.clone());
            assert_eq!(stage.build_artifacts, deduped);

            // A stage never requires what it builds.
            for built in &stage.build_artifacts {
                assert!(!stage.require_artifacts.contains(built));
            }

            // A base build implies ostree and qemu.
            if stage.build_artifacts.iter().any(|b| b == "base") {
                assert!(!stage.require_artifacts.iter().any(|r| r == "ostree"));
                assert!(!stage.require_artifacts.iter().any(|r| r == "qemu"));
            }
        }
    }

    #[test]
    fn test_shorthand_names_include_pseudo_stages() {
        let names = artifact_shorthand_names(&BuildCatalogue);
        assert_eq!(names[0], "base");
        assert_eq!(names[1], "finalize");
        assert!(names.iter().any(|n| n == "live-iso"));
    }
}
