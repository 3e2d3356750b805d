//! Stage execution.
//!
//! A stage's commands are materialized into a scratch workspace as
//! `prep.sh`, `post.sh`, and one `script-<i>.sh` per main command, then
//! driven through the injected renderer either serially or concurrently.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::command::commands_for_artifact;
use crate::error::StageError;
use crate::render::{CancellationToken, RenderData};
use crate::types::Stage;

/// Delay between concurrent launches so scripts start serially but run
/// in parallel.
const CONCURRENT_LAUNCH_STAGGER: Duration = Duration::from_millis(50);

async fn write_script(path: &Path, contents: &str) -> Result<(), StageError> {
    tokio::fs::write(path, contents).await?;
    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(0o755);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

impl Stage {
    /// Map the stage's build shorthands and raw commands to one flat
    /// command list: one synthesized command per artifact, followed by
    /// the user-specified commands in order.
    fn stage_commands(&self, rd: &RenderData) -> Result<Vec<String>, StageError> {
        if !self.build_artifacts.is_empty() {
            info!(artifacts = ?self.build_artifacts, "mapping artifacts to commands");
        }
        let mut ret = Vec::with_capacity(self.build_artifacts.len() + self.commands.len());
        for artifact in &self.build_artifacts {
            let cmds = commands_for_artifact(artifact, &rd.job_spec, rd.catalogue.as_ref())?;
            ret.push(cmds.join("\n"));
        }
        ret.extend(self.commands.iter().cloned());
        Ok(ret)
    }

    /// Run the commands of the stage.
    ///
    /// Prep runs first and its failure is fatal. Main commands run
    /// serially or concurrently per `concurrent_execution`. Post runs
    /// after a successful main run, or on every exit path (result
    /// discarded) when `post_always` is set. The scratch workspace is
    /// removed on all paths.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        rd: &RenderData,
        env: &HashMap<String, String>,
    ) -> Result<(), StageError> {
        let cmds = self.stage_commands(rd)?;
        if cmds.is_empty() {
            return Err(StageError::NoCommands);
        }
        debug!(stage = %self.id, commands = ?cmds, "stage commands readied");

        let workspace = tempfile::Builder::new().prefix("stages-").tempdir()?;

        let prep_script = workspace.path().join("prep.sh");
        write_script(&prep_script, &self.prep_commands.join("\n")).await?;
        rd.renderer
            .render(cancel, env, &prep_script)
            .await
            .map_err(StageError::Prep)?;

        let post_script = workspace.path().join("post.sh");
        write_script(&post_script, &self.post_commands.join("\n")).await?;

        // Each command gets its own file to enable concurrent execution.
        let mut scripts = Vec::with_capacity(cmds.len());
        for (i, c) in cmds.iter().enumerate() {
            let script = workspace.path().join(format!("script-{i}.sh"));
            write_script(&script, c).await?;
            debug!(script = %script.display(), command = %c, "materialized stage command");
            scripts.push(script);
        }

        let main_result = if self.concurrent_execution {
            self.run_concurrent(cancel, rd, env, &scripts).await
        } else {
            self.run_serial(cancel, rd, env, &scripts).await
        };

        if self.post_always {
            info!(stage = %self.id, "post commands run regardless of command success");
            if let Err(err) = rd.renderer.render(cancel, env, &post_script).await {
                warn!(stage = %self.id, error = %err, "post command failed, ignored");
            }
            main_result
        } else {
            main_result?;
            rd.renderer
                .render(cancel, env, &post_script)
                .await
                .map_err(StageError::Post)
        }
    }

    async fn run_serial(
        &self,
        cancel: &CancellationToken,
        rd: &RenderData,
        env: &HashMap<String, String>,
        scripts: &[PathBuf],
    ) -> Result<(), StageError> {
        info!(count = scripts.len(), "executing stage commands serially");
        for script in scripts {
            rd.renderer
                .render(cancel, env, script)
                .await
                .map_err(StageError::from_command)?;
        }
        Ok(())
    }

    async fn run_concurrent(
        &self,
        cancel: &CancellationToken,
        rd: &RenderData,
        env: &HashMap<String, String>,
        scripts: &[PathBuf],
    ) -> Result<(), StageError> {
        info!(count = scripts.len(), "executing stage commands concurrently");
        let mut tasks = FuturesUnordered::new();
        for (idx, script) in scripts.iter().enumerate() {
            let renderer = rd.renderer.clone();
            let cancel = cancel.clone();
            let env = env.clone();
            let script = script.clone();
            tasks.push(tokio::spawn(async move {
                debug!(script = %script.display(), "starting stage command");
                let result = renderer.render(&cancel, &env, &script).await;
                match &result {
                    Ok(()) => info!(script = %script.display(), "stage command succeeded"),
                    Err(err) => error!(script = %script.display(), error = %err, "stage command failed"),
                }
                (idx, result)
            }));
            // Scripts are started serially but may run concurrently.
            sleep(CONCURRENT_LAUNCH_STAGGER).await;
        }

        // Every task publishes exactly one result; drain them all, join
        // failures included, so no result is lost. The lowest-indexed
        // failure is reported, script failures ranking ahead of join
        // failures.
        let mut failures: Vec<(usize, StageError)> = Vec::new();
        while let Some(joined) = tasks.next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((idx, Err(err))) => failures.push((idx, StageError::from_command(err))),
                Err(err) => {
                    error!(error = %err, "stage command task could not be joined");
                    failures.push((usize::MAX, StageError::Join(err.to_string())));
                }
            }
        }
        failures.sort_by_key(|(idx, _)| *idx);
        match failures.into_iter().next() {
            Some((_, err)) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    use crate::catalogue::BuildCatalogue;
    use crate::render::{RenderError, RendererExecuter};
    use crate::types::JobSpec;

    /// Test renderer that records every script it is asked to run (file
    /// name and contents) and fails, panics, or blocks on request.
    #[derive(Default)]
    struct ScriptedRenderer {
        records: Mutex<Vec<(String, String)>>,
        fail_names: Vec<String>,
        fail_contents: Vec<String>,
        panic_contents: Vec<String>,
        block_main_until_cancel: bool,
    }

    impl ScriptedRenderer {
        fn new() -> Self {
            Self::default()
        }

        fn fail_on_name(mut self, name: &str) -> Self {
            self.fail_names.push(name.to_string());
            self
        }

        fn fail_on_content(mut self, contents: &str) -> Self {
            self.fail_contents.push(contents.to_string());
            self
        }

        fn panic_on_content(mut self, contents: &str) -> Self {
            self.panic_contents.push(contents.to_string());
            self
        }

        fn block_main_until_cancel(mut self) -> Self {
            self.block_main_until_cancel = true;
            self
        }

        fn names(&self) -> Vec<String> {
            self.records
                .lock()
                .expect("records")
                .iter()
                .map(|(name, _)| name.clone())
                .collect()
        }

        fn contents_of(&self, name: &str) -> Option<String> {
            self.records
                .lock()
                .expect("records")
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, c)| c.clone())
        }
    }

    #[async_trait]
    impl RendererExecuter for ScriptedRenderer {
        async fn render(
            &self,
            cancel: &CancellationToken,
            _env: &HashMap<String, String>,
            script: &Path,
        ) -> Result<(), RenderError> {
            let name = script
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            let contents = std::fs::read_to_string(script).unwrap_or_default();
            self.records
                .lock()
                .expect("records")
                .push((name.clone(), contents.clone()));

            if self.block_main_until_cancel && name.starts_with("script-") {
                cancel.cancelled().await;
                return Err(RenderError::Cancelled);
            }
            if self.panic_contents.contains(&contents) {
                panic!("scripted panic for {name}");
            }
            if self.fail_names.contains(&name) || self.fail_contents.contains(&contents) {
                return Err(RenderError::Failed(format!("scripted failure for {name}")));
            }
            Ok(())
        }
    }

    fn render_data(renderer: Arc<ScriptedRenderer>, js: JobSpec) -> RenderData {
        RenderData::new(Arc::new(js), renderer, Arc::new(BuildCatalogue))
    }

    fn stage_with_commands(commands: &[&str]) -> Stage {
        Stage {
            id: "test-stage".to_string(),
            commands: commands.iter().map(|c| c.to_string()).collect(),
            ..Stage::default()
        }
    }

    #[test]
    fn test_empty_stage_has_no_commands_to_execute() {
        tokio_test::block_on(async {
            let renderer = Arc::new(ScriptedRenderer::new());
            let rd = render_data(renderer.clone(), JobSpec::default());
            let stage = Stage::default();

            let err = stage
                .execute(&CancellationToken::new(), &rd, &HashMap::new())
                .await
                .unwrap_err();
            assert!(matches!(err, StageError::NoCommands));
            assert!(renderer.names().is_empty());
        });
    }

    #[test]
    fn test_unknown_build_artifact_fails_before_rendering() {
        tokio_test::block_on(async {
            let renderer = Arc::new(ScriptedRenderer::new());
            let rd = render_data(renderer.clone(), JobSpec::default());
            let stage = Stage {
                build_artifacts: vec!["warp-drive".to_string()],
                ..Stage::default()
            };

            let err = stage
                .execute(&CancellationToken::new(), &rd, &HashMap::new())
                .await
                .unwrap_err();
            assert!(matches!(err, StageError::UnknownArtifact(name) if name == "warp-drive"));
            assert!(renderer.names().is_empty());
        });
    }

    #[test]
    fn test_build_artifacts_precede_user_commands() {
        tokio_test::block_on(async {
            let renderer = Arc::new(ScriptedRenderer::new());
            let js = JobSpec {
                delayed_meta_merge: true,
                ..JobSpec::default()
            };
            let rd = render_data(renderer.clone(), js);
            let stage = Stage {
                build_artifacts: vec!["base".to_string()],
                commands: vec!["echo hi".to_string()],
                ..Stage::default()
            };

            stage
                .execute(&CancellationToken::new(), &rd, &HashMap::new())
                .await
                .expect("execute");

            assert_eq!(
                renderer.names(),
                vec!["prep.sh", "script-0.sh", "script-1.sh", "post.sh"]
            );
            assert_eq!(
                renderer.contents_of("script-0.sh").as_deref(),
                Some("cosa fetch; cosa build --delay-meta-merge;")
            );
            assert_eq!(renderer.contents_of("script-1.sh").as_deref(), Some("echo hi"));
        });
    }

    #[test]
    fn test_serial_execution_stops_at_first_failure() {
        tokio_test::block_on(async {
            let renderer = Arc::new(ScriptedRenderer::new().fail_on_content("false"));
            let rd = render_data(renderer.clone(), JobSpec::default());
            let stage = stage_with_commands(&["true", "false", "never-reached"]);

            let err = stage
                .execute(&CancellationToken::new(), &rd, &HashMap::new())
                .await
                .unwrap_err();
            assert!(matches!(err, StageError::Command(_)));
            // Post is skipped on main failure, the third command never runs.
            assert_eq!(renderer.names(), vec!["prep.sh", "script-0.sh", "script-1.sh"]);
        });
    }

    #[test]
    fn test_prep_failure_short_circuits_main() {
        tokio_test::block_on(async {
            let renderer = Arc::new(ScriptedRenderer::new().fail_on_name("prep.sh"));
            let rd = render_data(renderer.clone(), JobSpec::default());
            let stage = stage_with_commands(&["true"]);

            let err = stage
                .execute(&CancellationToken::new(), &rd, &HashMap::new())
                .await
                .unwrap_err();
            assert!(matches!(err, StageError::Prep(_)));
            assert_eq!(renderer.names(), vec!["prep.sh"]);
        });
    }

    #[test]
    fn test_post_runs_after_main_success_and_its_failure_is_the_stages() {
        tokio_test::block_on(async {
            let renderer = Arc::new(ScriptedRenderer::new().fail_on_name("post.sh"));
            let rd = render_data(renderer.clone(), JobSpec::default());
            let mut stage = stage_with_commands(&["true"]);
            stage.post_commands = vec!["echo done".to_string()];

            let err = stage
                .execute(&CancellationToken::new(), &rd, &HashMap::new())
                .await
                .unwrap_err();
            assert!(matches!(err, StageError::Post(_)));
            assert_eq!(renderer.names(), vec!["prep.sh", "script-0.sh", "post.sh"]);
        });
    }

    #[test]
    fn test_post_always_runs_on_main_failure_and_result_is_ignored() {
        tokio_test::block_on(async {
            let renderer = Arc::new(
                ScriptedRenderer::new()
                    .fail_on_content("false")
                    .fail_on_name("post.sh"),
            );
            let rd = render_data(renderer.clone(), JobSpec::default());
            let mut stage = stage_with_commands(&["true", "false"]);
            stage.post_always = true;
            stage.post_commands = vec!["echo cleanup".to_string()];

            let err = stage
                .execute(&CancellationToken::new(), &rd, &HashMap::new())
                .await
                .unwrap_err();
            // The main failure is reported, not the post failure.
            assert!(matches!(err, StageError::Command(_)));
            let names = renderer.names();
            assert_eq!(names.iter().filter(|n| n.as_str() == "post.sh").count(), 1);
        });
    }

    #[test]
    fn test_concurrent_execution_runs_every_script() {
        tokio_test::block_on(async {
            let renderer = Arc::new(ScriptedRenderer::new());
            let rd = render_data(renderer.clone(), JobSpec::default());
            let mut stage = stage_with_commands(&["one", "two", "three"]);
            stage.concurrent_execution = true;

            stage
                .execute(&CancellationToken::new(), &rd, &HashMap::new())
                .await
                .expect("execute");

            let mut mains: Vec<String> = renderer
                .names()
                .into_iter()
                .filter(|n| n.starts_with("script-"))
                .collect();
            mains.sort();
            assert_eq!(mains, vec!["script-0.sh", "script-1.sh", "script-2.sh"]);
        });
    }

    #[test]
    fn test_concurrent_execution_drains_all_results_and_reports_first_failure() {
        tokio_test::block_on(async {
            let renderer = Arc::new(
                ScriptedRenderer::new()
                    .fail_on_content("boom-a")
                    .fail_on_content("boom-c"),
            );
            let rd = render_data(renderer.clone(), JobSpec::default());
            let mut stage = stage_with_commands(&["boom-a", "fine", "boom-c"]);
            stage.concurrent_execution = true;

            let err = stage
                .execute(&CancellationToken::new(), &rd, &HashMap::new())
                .await
                .unwrap_err();
            match err {
                StageError::Command(RenderError::Failed(msg)) => {
                    assert!(msg.contains("script-0.sh"), "unexpected failure: {msg}");
                }
                other => panic!("expected command failure, got {other:?}"),
            }
            // All three scripts ran despite the failures.
            let mains = renderer
                .names()
                .into_iter()
                .filter(|n| n.starts_with("script-"))
                .count();
            assert_eq!(mains, 3);
        });
    }

    #[test]
    fn test_concurrent_task_panic_still_drains_remaining_results() {
        tokio_test::block_on(async {
            let renderer = Arc::new(ScriptedRenderer::new().panic_on_content("kaboom"));
            let rd = render_data(renderer.clone(), JobSpec::default());
            let mut stage = stage_with_commands(&["kaboom", "fine", "fine-too"]);
            stage.concurrent_execution = true;

            let err = stage
                .execute(&CancellationToken::new(), &rd, &HashMap::new())
                .await
                .unwrap_err();
            assert!(matches!(err, StageError::Join(_)));

            // The panicking task did not stop the other results from
            // being drained; every script was still started.
            let mains = renderer
                .names()
                .into_iter()
                .filter(|n| n.starts_with("script-"))
                .count();
            assert_eq!(mains, 3);
        });
    }

    #[test]
    fn test_script_failure_outranks_task_panic_in_reporting() {
        tokio_test::block_on(async {
            let renderer = Arc::new(
                ScriptedRenderer::new()
                    .panic_on_content("kaboom")
                    .fail_on_content("boom"),
            );
            let rd = render_data(renderer.clone(), JobSpec::default());
            let mut stage = stage_with_commands(&["kaboom", "boom", "fine"]);
            stage.concurrent_execution = true;

            let err = stage
                .execute(&CancellationToken::new(), &rd, &HashMap::new())
                .await
                .unwrap_err();
            assert!(matches!(err, StageError::Command(_)));

            let mains = renderer
                .names()
                .into_iter()
                .filter(|n| n.starts_with("script-"))
                .count();
            assert_eq!(mains, 3);
        });
    }

    #[test]
    fn test_cancelled_concurrent_stage_still_runs_post_once() {
        tokio_test::block_on(async {
            let renderer = Arc::new(ScriptedRenderer::new().block_main_until_cancel());
            let rd = render_data(renderer.clone(), JobSpec::default());
            let mut stage = stage_with_commands(&["sleep", "sleep"]);
            stage.concurrent_execution = true;
            stage.post_always = true;
            stage.post_commands = vec!["echo".to_string()];

            let cancel = CancellationToken::new();
            let canceller = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                canceller.cancel();
            });

            let err = stage.execute(&cancel, &rd, &HashMap::new()).await.unwrap_err();
            assert!(matches!(err, StageError::Cancelled));

            let names = renderer.names();
            assert_eq!(names.iter().filter(|n| n.as_str() == "post.sh").count(), 1);
            assert_eq!(
                names.iter().filter(|n| n.starts_with("script-")).count(),
                2
            );
        });
    }
}
