//! Local runner: the cluster runner's equivalent for a host container
//! runtime.
//!
//! The worker runs as a single privileged container with the host's
//! network namespace, `/dev/kvm` and `/dev/fuse` exposed, and a host
//! directory bind-mounted at `/srv`. Kube-style pod play does not give
//! us id mappings, so the container is assembled directly from the pod
//! spec's first container.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::unistd::Uid;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::PodError;
use crate::signal::TerminationStream;
use crate::spec::WorkerPod;
use crate::SRV_DIR;

/// Set on the worker so it knows it is not on a cluster.
pub const FORCE_LOCAL_ENV_VAR: &str = "COSA_FORCE_NO_CLUSTER";

/// One uid mapping entry for the container's user namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdMapping {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

/// Bind mount of a host path into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub destination: String,
}

/// Container create request handed to the runtime client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerConfig {
    pub name: String,
    pub image: String,
    pub entrypoint: Vec<String>,
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: String,
    pub user: String,
    pub privileged: bool,
    pub host_network: bool,
    pub terminal: bool,
    pub id_mappings: Vec<IdMapping>,
    pub devices: Vec<String>,
    pub mounts: Vec<BindMount>,
}

/// Stdio handles to attach to the worker container. Defaults attach
/// nothing and leave the runtime's own plumbing in place.
#[derive(Default)]
pub struct AttachStreams {
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stdout: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,
}

/// Narrow container runtime surface the runner consumes: a connected
/// client over the local socket.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container, returning its id.
    async fn create(&self, config: &ContainerConfig) -> Result<String, PodError>;

    /// Start a created container.
    async fn start(&self, id: &str) -> Result<(), PodError>;

    /// Attach stdio to a running container.
    async fn attach(&self, id: &str, streams: AttachStreams) -> Result<(), PodError>;

    /// Wait for the container to exit, returning its exit code.
    async fn wait(&self, id: &str) -> Result<i64, PodError>;

    /// Remove a container.
    async fn remove(&self, id: &str, force: bool) -> Result<(), PodError>;
}

/// Drives one worker container on the host runtime.
pub struct LocalRunner {
    runtime: Arc<dyn ContainerRuntime>,
    pod: WorkerPod,
    /// Caller-supplied persistent `/srv`; when set, cleanup is skipped.
    srv_dir: Option<PathBuf>,
    /// Parent of ephemeral `/srv` directories.
    srv_root: PathBuf,
    /// Relabel ephemeral `/srv` for the container (SELinux).
    relabel: bool,
    settle_delay: Duration,
}

impl LocalRunner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, pod: WorkerPod) -> Self {
        Self {
            runtime,
            pod,
            srv_dir: None,
            srv_root: PathBuf::from(SRV_DIR),
            relabel: true,
            settle_delay: Duration::from_secs(1),
        }
    }

    /// Use a persistent host `/srv` and skip cleanup.
    pub fn with_srv_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.srv_dir = Some(dir.into());
        self
    }

    pub fn with_srv_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.srv_root = root.into();
        self
    }

    pub fn with_relabel(mut self, relabel: bool) -> Self {
        self.relabel = relabel;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Run the worker container to completion. The container is removed
    /// on every terminal path; an ephemeral `/srv` is scrubbed by a
    /// short-lived cleaner container and then deleted from the host.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        env: &HashMap<String, String>,
        term: &mut TerminationStream,
        stdio: AttachStreams,
    ) -> Result<(), PodError> {
        let spec = self.pod.pod_spec(&[]);
        let image = spec
            .containers
            .first()
            .map(|c| c.image.clone())
            .ok_or_else(|| PodError::Runtime("pod spec has no containers".to_string()))?;

        let mut env = env.clone();
        env.insert(FORCE_LOCAL_ENV_VAR.to_string(), "1".to_string());

        let (srv_dir, ephemeral) = self.ensure_srv_dir(&spec.name).await?;
        info!(srv = %srv_dir.display(), image = %image, pod = %spec.name, "using host directory for /srv");

        let host_uid = Uid::current().as_raw();
        let config = ContainerConfig {
            name: spec.name.clone(),
            image,
            entrypoint: vec!["/usr/bin/dumb-init".to_string()],
            command: vec!["/usr/bin/gantry".to_string(), "builder".to_string()],
            env,
            working_dir: SRV_DIR.to_string(),
            user: "builder".to_string(),
            privileged: true,
            host_network: true,
            terminal: true,
            id_mappings: vec![
                IdMapping {
                    container_id: 0,
                    host_id: host_uid,
                    size: 1,
                },
                IdMapping {
                    container_id: 1000,
                    host_id: host_uid,
                    size: 200000,
                },
            ],
            devices: vec!["/dev/kvm".to_string(), "/dev/fuse".to_string()],
            mounts: vec![BindMount {
                source: srv_dir.clone(),
                destination: SRV_DIR.to_string(),
            }],
        };

        let id = self.runtime.create(&config).await?;
        let result = self.drive(cancel, term, &id, stdio).await;
        self.cleanup(&id, &config, &srv_dir, ephemeral).await;
        result
    }

    async fn drive(
        &self,
        cancel: &CancellationToken,
        term: &mut TerminationStream,
        id: &str,
        stdio: AttachStreams,
    ) -> Result<(), PodError> {
        self.runtime.start(id).await?;

        // Attach in the background; the worker owns its lifetime.
        let runtime = self.runtime.clone();
        let attach_id = id.to_string();
        tokio::spawn(async move {
            if let Err(err) = runtime.attach(&attach_id, stdio).await {
                warn!(container = %attach_id, error = %err, "attach to container failed");
            }
        });

        tokio::select! {
            rc = self.runtime.wait(id) => match rc? {
                0 => Ok(()),
                code => Err(PodError::WorkerFailed {
                    pod: id.to_string(),
                    message: format!("work pod failed with exit code {code}"),
                }),
            },
            signal = term.recv() => Err(PodError::TerminationRequested(signal)),
            _ = cancel.cancelled() => Ok(()),
        }
    }

    /// Resolve the host-side `/srv`: the caller-supplied persistent
    /// directory, or a fresh ephemeral one the builder can write.
    async fn ensure_srv_dir(&self, pod_name: &str) -> Result<(PathBuf, bool), PodError> {
        if let Some(dir) = &self.srv_dir {
            return Ok((dir.clone(), false));
        }

        let dir = self.srv_root.join(pod_name);
        tokio::fs::create_dir_all(&dir).await?;
        let mut perms = tokio::fs::metadata(&dir).await?.permissions();
        perms.set_mode(0o777);
        tokio::fs::set_permissions(&dir, perms).await?;

        if self.relabel {
            // Without the container file context the builder emits weird
            // errors deep inside the build.
            let status = Command::new("chcon")
                .args(["-R", "system_u:object_r:container_file_t:s0"])
                .arg(&dir)
                .status()
                .await?;
            if !status.success() {
                return Err(PodError::Runtime(format!(
                    "failed to set selinux context on {}",
                    dir.display()
                )));
            }
        }
        Ok((dir, true))
    }

    /// Remove the worker container and, for an ephemeral `/srv`, scrub
    /// its contents with a root cleaner container before deleting the
    /// host directory. Failures are logged, never returned.
    async fn cleanup(&self, id: &str, config: &ContainerConfig, srv_dir: &Path, ephemeral: bool) {
        sleep(self.settle_delay).await;
        if let Err(err) = self.runtime.remove(id, true).await {
            warn!(container = id, error = %err, "failed to remove worker container");
        }
        if !ephemeral {
            return;
        }

        info!("cleaning up ephemeral /srv");
        let mut cleaner = config.clone();
        cleaner.name = format!("{}-cleaner", config.name);
        cleaner.user = "root".to_string();
        cleaner.entrypoint = vec![
            "/bin/rm".to_string(),
            "-rvf".to_string(),
            format!("{SRV_DIR}/"),
        ];
        cleaner.command = Vec::new();

        match self.runtime.create(&cleaner).await {
            Ok(cleaner_id) => {
                if let Err(err) = self.runtime.start(&cleaner_id).await {
                    warn!(error = %err, "failed to start cleanup container");
                } else if let Err(err) = self.runtime.wait(&cleaner_id).await {
                    error!(error = %err, "cleanup container failed");
                }
                let _ = self.runtime.remove(&cleaner_id, true).await;
            }
            Err(err) => warn!(error = %err, "failed to create cleanup container"),
        }

        if let Err(err) = tokio::fs::remove_dir_all(srv_dir).await {
            warn!(srv = %srv_dir.display(), error = %err, "failed to remove ephemeral /srv");
        }
    }
}
