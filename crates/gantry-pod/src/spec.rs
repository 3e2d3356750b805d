//! Worker pod description builder.
//!
//! A worker pod runs the gantry builder under dumb-init with `/srv`
//! mounted from an ephemeral volume. Resource requests, security
//! context, and init commands differ between modern platforms and legacy
//! 3.x clusters (Kubernetes minor 11), where `/dev/kvm` is unlikely to
//! be world-RW and the worker must run privileged.

use std::collections::BTreeMap;

use crate::SRV_DIR;

/// Resource label requesting a KVM device from the device plugin.
pub const KVM_LABEL: &str = "devices.kubevirt.io/kvm";

const ACTIVE_DEADLINE_SECONDS: i64 = 1800;
const TERMINATION_GRACE_PERIOD_SECONDS: i64 = 300;

const BASE_CPU: &str = "2";
const BASE_MEMORY: &str = "4Gi";

/// Commands run by the init container on legacy clusters: gantry runs as
/// root there, but `cosa` commands run as the builder user.
const LEGACY_INIT_COMMANDS: &[&str] = &[
    "/usr/bin/chmod 0666 /dev/kvm || echo missing kvm",
    "/usr/bin/stat /dev/kvm || :",
];

/// Quantities keyed by resource name.
pub type ResourceList = BTreeMap<String, String>;

/// A name/value environment binding for a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Security settings applied to a worker container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityContext {
    pub run_as_user: Option<i64>,
    pub run_as_group: Option<i64>,
    pub privileged: bool,
}

/// Restart behavior of the pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    Never,
    OnFailure,
    Always,
}

/// A named volume of the pod. Workers only ever use ephemeral volumes;
/// anything persistent is the embedding platform's business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub name: String,
    pub ephemeral: bool,
}

/// Mount of a pod volume into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
}

/// One container of the worker pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: Vec<EnvVar>,
    pub working_dir: String,
    pub volume_mounts: Vec<VolumeMount>,
    pub security_context: SecurityContext,
    pub requests: ResourceList,
    pub limits: ResourceList,
}

/// The full worker pod description submitted to the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPodSpec {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub service_account: String,
    pub restart_policy: RestartPolicy,
    pub active_deadline_seconds: i64,
    pub termination_grace_period_seconds: i64,
    pub automount_service_account_token: bool,
    pub init_containers: Vec<ContainerSpec>,
    pub containers: Vec<ContainerSpec>,
    pub volumes: Vec<VolumeSpec>,
}

/// The build this worker belongs to: naming, image, and identity carried
/// over from the build pipeline that spawned us.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiBuild {
    /// Build configuration name, the first half of the worker pod name.
    pub name: String,
    /// Build number, the second half of the worker pod name.
    pub build_number: String,
    /// Image the worker container runs.
    pub image: String,
    /// Service account the pod runs under.
    pub service_account: String,
    /// Labels cargo-culted onto the worker pod.
    pub labels: BTreeMap<String, String>,
}

/// Platform version hints from the cluster discovery client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformVersion {
    pub major: String,
    pub minor: String,
}

impl PlatformVersion {
    /// Minor version as a number; trailing `+` markers are trimmed.
    pub fn minor_number(&self) -> Option<u32> {
        self.minor.trim_end_matches('+').parse().ok()
    }

    /// Legacy 3.x platforms report Kubernetes minor 11.
    pub fn is_legacy(&self) -> bool {
        self.minor_number() == Some(11)
    }
}

/// Builder for worker pod descriptions.
#[derive(Debug, Clone)]
pub struct WorkerPod {
    build: ApiBuild,
    index: usize,

    init_commands: Vec<String>,
    requirements: ResourceList,
    security_context: SecurityContext,
}

impl WorkerPod {
    /// Seed a worker with modern-platform defaults: unprivileged, one
    /// KVM device requested through the device plugin, no init step.
    pub fn new(build: ApiBuild, index: usize) -> Self {
        let mut requirements = ResourceList::new();
        requirements.insert("cpu".to_string(), BASE_CPU.to_string());
        requirements.insert("memory".to_string(), BASE_MEMORY.to_string());
        requirements.insert(KVM_LABEL.to_string(), "1".to_string());

        Self {
            build,
            index,
            init_commands: Vec::new(),
            requirements,
            security_context: SecurityContext::default(),
        }
    }

    /// Adapt the worker to the discovered platform version. Legacy 3.x
    /// clusters get a privileged container, no KVM device request, and an
    /// init step that opens up `/dev/kvm`.
    pub fn with_platform_version(mut self, version: &PlatformVersion) -> Self {
        if version.is_legacy() {
            let mut requirements = ResourceList::new();
            requirements.insert("cpu".to_string(), BASE_CPU.to_string());
            requirements.insert("memory".to_string(), BASE_MEMORY.to_string());
            self.requirements = requirements;
            self.security_context = SecurityContext {
                run_as_user: Some(0),
                run_as_group: Some(1000),
                privileged: true,
            };
            self.init_commands = LEGACY_INIT_COMMANDS.iter().map(|s| s.to_string()).collect();
        }
        self
    }

    /// Name of the worker pod.
    pub fn pod_name(&self) -> String {
        format!(
            "{}-{}-worker-{}",
            self.build.name, self.build.build_number, self.index
        )
    }

    /// The build descriptor this worker was created from.
    pub fn build(&self) -> &ApiBuild {
        &self.build
    }

    /// Emit the pod description for this worker.
    pub fn pod_spec(&self, env: &[EnvVar]) -> WorkerPodSpec {
        let pod_name = self.pod_name();

        let volume_mounts = vec![VolumeMount {
            name: "srv".to_string(),
            mount_path: SRV_DIR.to_string(),
        }];

        let worker = ContainerSpec {
            name: pod_name.clone(),
            image: self.build.image.clone(),
            command: vec!["/usr/bin/dumb-init".to_string()],
            args: vec!["/usr/bin/gantry".to_string(), "builder".to_string()],
            env: env.to_vec(),
            working_dir: SRV_DIR.to_string(),
            volume_mounts,
            security_context: self.security_context.clone(),
            requests: self.requirements.clone(),
            limits: self.requirements.clone(),
        };

        let init_containers = if self.init_commands.is_empty() {
            Vec::new()
        } else {
            let mut init = worker.clone();
            init.name = "init".to_string();
            init.args = vec![
                "/bin/bash".to_string(),
                "-xc".to_string(),
                format!(
                    "#!/bin/bash\nexport PATH=/usr/sbin:/usr/bin\n{}\n",
                    self.init_commands.join("\n")
                ),
            ];
            vec![init]
        };

        WorkerPodSpec {
            name: pod_name,
            labels: self.build.labels.clone(),
            service_account: self.build.service_account.clone(),
            restart_policy: RestartPolicy::Never,
            active_deadline_seconds: ACTIVE_DEADLINE_SECONDS,
            termination_grace_period_seconds: TERMINATION_GRACE_PERIOD_SECONDS,
            automount_service_account_token: true,
            init_containers,
            containers: vec![worker],
            volumes: vec![VolumeSpec {
                name: "srv".to_string(),
                ephemeral: true,
            }],
        }
    }
}
