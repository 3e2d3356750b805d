//! Cluster runner: drive a worker pod to completion on a cluster.
//!
//! The runner submits the pod, follows its phase transitions over a
//! watch channel, multiplexes container logs to the console and to
//! `/srv/logs`, and guarantees the pod is deleted on every exit path.
//! Worker pods are responsible for their work, but not for their logs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::PodError;
use crate::signal::TerminationStream;
use crate::spec::{ApiBuild, EnvVar, PlatformVersion, WorkerPod, WorkerPodSpec};
use crate::SRV_DIR;

/// A pod did not finish inside this window, no matter what the watch
/// says.
const DEFAULT_WATCH_TIMEOUT: Duration = Duration::from_secs(90 * 60);

/// Wait after a failure before teardown so log streams can drain.
const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(60);

/// Lifecycle phase reported for a watched pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/// One watch event: the pod's phase and an optional status message.
#[derive(Debug, Clone)]
pub struct PodStatus {
    pub phase: PodPhase,
    pub message: Option<String>,
}

impl PodStatus {
    pub fn phase(phase: PodPhase) -> Self {
        Self {
            phase,
            message: None,
        }
    }
}

/// A follow-mode log stream for one container.
pub type LogStream = Box<dyn AsyncRead + Send + Unpin>;

/// Narrow cluster API surface the runner consumes.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Discover the platform version.
    async fn server_version(&self) -> Result<PlatformVersion, PodError>;

    /// Submit a pod.
    async fn create_pod(&self, spec: &WorkerPodSpec) -> Result<(), PodError>;

    /// Delete a pod by name. Returns `PodError::NotFound` when it is
    /// already gone.
    async fn delete_pod(&self, name: &str) -> Result<(), PodError>;

    /// Open a phase watch for the named pod. The channel closing before
    /// a terminal phase means the pod was orphaned.
    async fn watch_pod(&self, name: &str) -> Result<mpsc::Receiver<PodStatus>, PodError>;

    /// Open a follow-mode log stream for one container of the pod.
    async fn stream_logs(&self, pod: &str, container: &str) -> Result<LogStream, PodError>;
}

/// Drives one worker pod on the cluster.
pub struct ClusterRunner {
    client: Arc<dyn ClusterClient>,
    pod: WorkerPod,
    watch_timeout: Duration,
    settle_delay: Duration,
    log_root: PathBuf,
}

impl ClusterRunner {
    pub fn new(client: Arc<dyn ClusterClient>, pod: WorkerPod) -> Self {
        Self {
            client,
            pod,
            watch_timeout: DEFAULT_WATCH_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
            log_root: PathBuf::from(SRV_DIR).join("logs"),
        }
    }

    /// Build a runner for the given build, adapting the worker pod to
    /// the discovered platform version.
    pub async fn detect(
        client: Arc<dyn ClusterClient>,
        build: ApiBuild,
        index: usize,
    ) -> Result<Self, PodError> {
        let version = client.server_version().await?;
        info!(major = %version.major, minor = %version.minor, "discovered platform version");
        let pod = WorkerPod::new(build, index).with_platform_version(&version);
        Ok(Self::new(client, pod))
    }

    pub fn with_watch_timeout(mut self, timeout: Duration) -> Self {
        self.watch_timeout = timeout;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_log_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.log_root = root.into();
        self
    }

    /// Create the worker pod and block until it reaches a terminal
    /// state, the watch times out, termination is requested, or the
    /// token is cancelled. The pod is deleted on every exit path;
    /// cancellation returns `Ok(())`.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        env: &[EnvVar],
        term: &mut TerminationStream,
    ) -> Result<(), PodError> {
        let spec = self.pod.pod_spec(env);
        self.client
            .create_pod(&spec)
            .await
            .map_err(|err| PodError::Create {
                pod: spec.name.clone(),
                message: err.to_string(),
            })?;
        info!(pod = %spec.name, "pod created");

        let result = match self.client.watch_pod(&spec.name).await {
            Ok(watch) => self.watch_loop(cancel, term, &spec, watch).await,
            Err(err) => Err(err),
        };
        self.teardown(&spec.name).await;
        result
    }

    async fn watch_loop(
        &self,
        cancel: &CancellationToken,
        term: &mut TerminationStream,
        spec: &WorkerPodSpec,
        mut watch: mpsc::Receiver<PodStatus>,
    ) -> Result<(), PodError> {
        let deadline = sleep(self.watch_timeout);
        tokio::pin!(deadline);

        let mut log_started: HashMap<String, bool> = HashMap::new();

        loop {
            tokio::select! {
                event = watch.recv() => match event {
                    None => {
                        error!(pod = %spec.name, "watch channel closed before a terminal phase");
                        return Err(PodError::Orphaned(spec.name.clone()));
                    }
                    Some(status) => match status.phase {
                        PodPhase::Succeeded => {
                            info!(pod = %spec.name, "pod successfully completed");
                            return Ok(());
                        }
                        PodPhase::Running => {
                            info!(pod = %spec.name, "pod running, attaching log streams");
                            for container in spec.init_containers.iter().chain(&spec.containers) {
                                if let Err(err) = self
                                    .stream_pod_logs(&mut log_started, &spec.name, &container.name)
                                    .await
                                {
                                    error!(
                                        pod = %spec.name,
                                        container = %container.name,
                                        error = %err,
                                        "failed to open logging"
                                    );
                                }
                            }
                        }
                        PodPhase::Failed => {
                            let message = status
                                .message
                                .unwrap_or_else(|| "pod reported failure".to_string());
                            error!(pod = %spec.name, message = %message, "pod failed");
                            // Let the log streams drain before the pod goes away.
                            sleep(self.settle_delay).await;
                            return Err(PodError::WorkerFailed {
                                pod: spec.name.clone(),
                                message,
                            });
                        }
                        PodPhase::Pending | PodPhase::Unknown => {
                            debug!(pod = %spec.name, message = ?status.message, "waiting");
                        }
                    },
                },
                () = &mut deadline => {
                    return Err(PodError::DeadlineExceeded(spec.name.clone()));
                }
                signal = term.recv() => {
                    return Err(PodError::TerminationRequested(signal));
                }
                _ = cancel.cancelled() => {
                    return Ok(());
                }
            }
        }
    }

    /// Idempotent teardown: delete by name, ignore "already gone", log
    /// anything else.
    async fn teardown(&self, name: &str) {
        info!(pod = name, "terminating");
        match self.client.delete_pod(name).await {
            Ok(()) | Err(PodError::NotFound(_)) => {}
            Err(err) => error!(pod = name, error = %err, "failed to delete pod"),
        }
    }

    /// Start one background log streamer per container, at most once.
    async fn stream_pod_logs(
        &self,
        log_started: &mut HashMap<String, bool>,
        pod_name: &str,
        container: &str,
    ) -> Result<(), PodError> {
        if log_started.get(container).copied().unwrap_or(false) {
            return Ok(());
        }
        log_started.insert(container.to_string(), true);

        let stream = self.client.stream_logs(pod_name, container).await?;
        tokio::fs::create_dir_all(&self.log_root).await?;
        let log_path = self.log_root.join(format!("{pod_name}-{container}.log"));

        let container = container.to_string();
        tokio::spawn(pump_log_stream(stream, log_path, container));
        Ok(())
    }
}

/// Copy a container's log stream to the console (prefixed with the
/// container name and elapsed time) and to its append-only log file,
/// until EOF.
pub(crate) async fn pump_log_stream(stream: LogStream, log_path: PathBuf, container: String) {
    let mut logf = match OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .await
    {
        Ok(file) => file,
        Err(err) => {
            warn!(path = %log_path.display(), error = %err, "failed to create pod log file");
            return;
        }
    };

    let start = Instant::now();
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                println!(
                    "{container} [+{}]: {line}",
                    format_elapsed(start.elapsed())
                );
                if let Err(err) = logf.write_all(line.as_bytes()).await {
                    warn!(container = %container, error = %err, "unable to log to file");
                }
                let _ = logf.write_all(b"\n").await;
            }
            Ok(None) => {
                info!(container = %container, "log closed");
                return;
            }
            Err(err) => {
                warn!(container = %container, error = %err, "error scanning output");
                return;
            }
        }
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    format!("{}.{:03}s", elapsed.as_secs(), elapsed.subsec_millis())
}
