//! # Gantry Config
//!
//! Job-spec file loading and validation. A job spec is a YAML document
//! describing the stages of a build; this crate reads it into the
//! `gantry-core` types and rejects specs the pipeline could not run.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use thiserror::Error;

use gantry_core::types::JobSpec;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid job spec: {0}")]
    Invalid(String),
}

/// Load a job spec from a YAML file.
pub fn load_job_spec(path: &Path) -> Result<JobSpec, ConfigError> {
    let content = fs::read_to_string(path)?;
    job_spec_from_str(&content)
}

/// Parse a job spec from YAML text.
pub fn job_spec_from_str(content: &str) -> Result<JobSpec, ConfigError> {
    let js: JobSpec = serde_yaml::from_str(content)?;
    validate_job_spec(&js)?;
    Ok(js)
}

fn validate_job_spec(js: &JobSpec) -> Result<(), ConfigError> {
    let mut seen_ids: HashSet<&str> = HashSet::new();
    for stage in &js.stages {
        if !stage.id.is_empty() && !seen_ids.insert(stage.id.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate stage id {:?}",
                stage.id
            )));
        }

        if stage.build_artifacts.is_empty()
            && stage.commands.is_empty()
            && stage.prep_commands.is_empty()
            && stage.post_commands.is_empty()
        {
            return Err(ConfigError::Invalid(format!(
                "stage {:?} declares nothing to run",
                stage.id
            )));
        }

        for required in &stage.require_artifacts {
            if stage.build_artifacts.contains(required) {
                return Err(ConfigError::Invalid(format!(
                    "stage {:?} requires artifact {:?} that it also builds",
                    stage.id, required
                )));
            }
        }
    }
    Ok(())
}
