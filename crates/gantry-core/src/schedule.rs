//! Cross-stage scheduling by execution order.
//!
//! Stages sharing an execution order are eligible to run concurrently
//! with each other; no stage of a later order starts before every
//! blocking stage of the orders below it has completed. A `not_blocking`
//! stage does not delay the transition but is still awaited before the
//! run returns.

use std::collections::{BTreeMap, HashMap};

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::StageError;
use crate::render::{CancellationToken, RenderData};
use crate::types::Stage;

/// Group stages by ascending execution order, preserving declaration
/// order within a group.
pub fn execution_groups(stages: &[Stage]) -> Vec<Vec<Stage>> {
    let mut groups: BTreeMap<u32, Vec<Stage>> = BTreeMap::new();
    for stage in stages {
        groups
            .entry(stage.execution_order)
            .or_default()
            .push(stage.clone());
    }
    groups.into_values().collect()
}

/// Run stages grouped by execution order.
///
/// Blocking failures stop later orders from starting; the first error
/// encountered (by completion) is returned once every launched stage has
/// terminated.
pub async fn run_stages(
    cancel: &CancellationToken,
    rd: &RenderData,
    env: &HashMap<String, String>,
    stages: &[Stage],
) -> Result<(), StageError> {
    let mut carryover: Vec<JoinHandle<Result<(), StageError>>> = Vec::new();
    let mut first_error: Option<StageError> = None;

    for group in execution_groups(stages) {
        if first_error.is_some() {
            break;
        }
        info!(
            order = group[0].execution_order,
            stages = group.len(),
            "starting execution order group"
        );

        let mut blocking = Vec::new();
        for stage in group {
            let cancel = cancel.clone();
            let rd = rd.clone();
            let env = env.clone();
            let not_blocking = stage.not_blocking;
            let handle = tokio::spawn(async move { stage.execute(&cancel, &rd, &env).await });
            if not_blocking {
                carryover.push(handle);
            } else {
                blocking.push(handle);
            }
        }

        for handle in blocking {
            collect(handle.await, &mut first_error);
        }
    }

    for handle in carryover {
        collect(handle.await, &mut first_error);
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn collect(
    joined: Result<Result<(), StageError>, tokio::task::JoinError>,
    first_error: &mut Option<StageError>,
) {
    let outcome = match joined {
        Ok(result) => result,
        Err(err) => Err(StageError::Join(err.to_string())),
    };
    if let Err(err) = outcome {
        warn!(error = %err, "stage failed");
        if first_error.is_none() {
            *first_error = Some(err);
        }
    }
}
