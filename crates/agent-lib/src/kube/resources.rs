//! Minimal typed views of the platform API objects the agent consumes
//!
//! Only the fields the scanner and executor actually read are modelled;
//! everything else in the API responses is ignored by serde. The module
//! also owns the secrets-hygiene pass applied to every pod spec before it
//! leaves the process.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::ReplicasStatus;

/// Replacement token for env values and command arguments.
pub const MASKED_VALUE: &str = "**MASKED**";

const MILLICORE: i64 = 1000;

/// A generic `List` response envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct List<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub owner_references: Vec<OwnerReference>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
}

/// A platform resource quantity, kept as its wire string until resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(pub String);

impl Quantity {
    /// CPU quantity in millicores: `"250m"` is 250, `"2"` is 2000.
    pub fn to_millicores(&self) -> i64 {
        let s = self.0.trim();
        if s.is_empty() {
            return 0;
        }
        if let Some(milli) = s.strip_suffix('m') {
            return milli.parse::<i64>().unwrap_or(0);
        }
        match s.parse::<f64>() {
            Ok(cores) => (cores * MILLICORE as f64).round() as i64,
            Err(_) => 0,
        }
    }

    /// Memory (or storage) quantity in bytes, honoring the binary and
    /// decimal suffixes the platform emits.
    pub fn to_bytes(&self) -> i64 {
        let s = self.0.trim();
        if s.is_empty() {
            return 0;
        }
        const SUFFIXES: &[(&str, i64)] = &[
            ("Ki", 1 << 10),
            ("Mi", 1 << 20),
            ("Gi", 1 << 30),
            ("Ti", 1 << 40),
            ("Pi", 1 << 50),
            ("Ei", 1 << 60),
            ("k", 1_000),
            ("M", 1_000_000),
            ("G", 1_000_000_000),
            ("T", 1_000_000_000_000),
            ("P", 1_000_000_000_000_000),
            ("E", 1_000_000_000_000_000_000),
        ];
        for (suffix, scale) in SUFFIXES {
            if let Some(number) = s.strip_suffix(suffix) {
                return match number.parse::<f64>() {
                    Ok(n) => (n * *scale as f64).round() as i64,
                    Err(_) => 0,
                };
            }
        }
        match s.parse::<f64>() {
            Ok(n) => n.round() as i64,
            Err(_) => 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequirements {
    pub requests: BTreeMap<String, Quantity>,
    pub limits: BTreeMap<String, Quantity>,
}

impl ResourceRequirements {
    pub fn request_millicores(&self) -> i64 {
        self.requests.get("cpu").map_or(0, Quantity::to_millicores)
    }

    pub fn limit_millicores(&self) -> i64 {
        self.limits.get("cpu").map_or(0, Quantity::to_millicores)
    }

    pub fn request_memory_bytes(&self) -> i64 {
        self.requests.get("memory").map_or(0, Quantity::to_bytes)
    }

    pub fn limit_memory_bytes(&self) -> i64 {
        self.limits.get("memory").map_or(0, Quantity::to_bytes)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvVar {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Container {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: Vec<EnvVar>,
    pub resources: ResourceRequirements,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodSpec {
    pub containers: Vec<Container>,
    pub init_containers: Vec<Container>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PodTemplateSpec {
    pub spec: PodSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Pod {
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeAddress {
    #[serde(rename = "type")]
    pub kind: String,
    pub address: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeStatus {
    pub capacity: BTreeMap<String, Quantity>,
    pub allocatable: BTreeMap<String, Quantity>,
    pub addresses: Vec<NodeAddress>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Node {
    pub metadata: ObjectMeta,
    pub status: NodeStatus,
}

impl Node {
    /// Internal IP when reported, otherwise the node name.
    pub fn scrape_address(&self) -> String {
        self.status
            .addresses
            .iter()
            .find(|a| a.kind == "InternalIP")
            .map(|a| a.address.clone())
            .unwrap_or_else(|| self.metadata.name.clone())
    }

    /// Instance type/size parsed from the cloud instance-type label,
    /// e.g. `m4.xlarge` becomes `("m4", "xlarge")`.
    pub fn instance_type_size(&self) -> (String, String) {
        let labels = &self.metadata.labels;
        let raw = labels
            .get("node.kubernetes.io/instance-type")
            .or_else(|| labels.get("beta.kubernetes.io/instance-type"))
            .cloned()
            .unwrap_or_default();
        match raw.split_once('.') {
            Some((ty, size)) => (ty.to_string(), size.to_string()),
            None => (raw, String::new()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkloadSpec {
    pub replicas: Option<i32>,
    pub template: PodTemplateSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkloadStatus {
    pub replicas: Option<i32>,
    pub ready_replicas: Option<i32>,
    pub available_replicas: Option<i32>,
    pub current_replicas: Option<i32>,
    // DaemonSet counters.
    pub desired_number_scheduled: Option<i32>,
    pub current_number_scheduled: Option<i32>,
    pub number_ready: Option<i32>,
    pub number_available: Option<i32>,
    // CronJob active jobs.
    pub active: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Workload {
    pub metadata: ObjectMeta,
    pub spec: WorkloadSpec,
    pub status: WorkloadStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RollingUpdateStrategy {
    pub partition: Option<i32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatefulSetUpdateStrategy {
    #[serde(rename = "type")]
    pub kind: String,
    pub rolling_update: Option<RollingUpdateStrategy>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatefulSetSpec {
    pub replicas: Option<i32>,
    pub template: PodTemplateSpec,
    pub update_strategy: StatefulSetUpdateStrategy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatefulSet {
    pub metadata: ObjectMeta,
    pub spec: StatefulSetSpec,
    pub status: WorkloadStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CronJobSpec {
    pub job_template: JobTemplateSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobTemplateSpec {
    pub spec: WorkloadSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CronJob {
    pub metadata: ObjectMeta,
    pub spec: CronJobSpec,
    pub status: WorkloadStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitRange {
    pub metadata: ObjectMeta,
    pub spec: serde_json::Value,
}

/// Workload controller kinds the scanner inventories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
    ReplicaSet,
    ReplicationController,
    CronJob,
    OrphanPod,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::DaemonSet => "DaemonSet",
            WorkloadKind::ReplicaSet => "ReplicaSet",
            WorkloadKind::ReplicationController => "ReplicationController",
            WorkloadKind::CronJob => "CronJob",
            WorkloadKind::OrphanPod => "OrphanPod",
        }
    }

    /// REST resource path segment for patch requests.
    pub fn resource_plural(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "deployments",
            WorkloadKind::StatefulSet => "statefulsets",
            WorkloadKind::DaemonSet => "daemonsets",
            WorkloadKind::ReplicaSet => "replicasets",
            WorkloadKind::ReplicationController => "replicationcontrollers",
            WorkloadKind::CronJob => "cronjobs",
            WorkloadKind::OrphanPod => "pods",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "deployment" => Some(WorkloadKind::Deployment),
            "statefulset" => Some(WorkloadKind::StatefulSet),
            "daemonset" => Some(WorkloadKind::DaemonSet),
            "replicaset" => Some(WorkloadKind::ReplicaSet),
            "replicationcontroller" => Some(WorkloadKind::ReplicationController),
            "cronjob" => Some(WorkloadKind::CronJob),
            "orphanpod" => Some(WorkloadKind::OrphanPod),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A workload controller normalized across the heterogeneous kinds.
///
/// Each kind reports desired/current/ready counts through different status
/// fields; the per-kind constructors below map them onto one record and
/// derive the pod-name matcher used when an endpoint carries no UID.
#[derive(Debug, Clone)]
pub struct WorkloadResource {
    pub kind: WorkloadKind,
    pub namespace: String,
    pub name: String,
    pub annotations: BTreeMap<String, String>,
    pub replicas: ReplicasStatus,
    pub containers: Vec<Container>,
    pub pod_matcher: Regex,
}

fn pod_matcher(pattern: &str) -> Regex {
    // The patterns are built from `regex::escape`d names, so compilation
    // cannot fail on cluster input.
    Regex::new(pattern).unwrap_or_else(|_| Regex::new("$^").unwrap())
}

impl WorkloadResource {
    pub fn from_deployment(deployment: Workload) -> Self {
        let name = regex::escape(&deployment.metadata.name);
        Self {
            kind: WorkloadKind::Deployment,
            namespace: deployment.metadata.namespace,
            name: deployment.metadata.name,
            annotations: deployment.metadata.annotations,
            replicas: ReplicasStatus {
                desired: deployment.spec.replicas,
                current: deployment.status.replicas,
                ready: deployment.status.ready_replicas,
                available: deployment.status.available_replicas,
            },
            containers: deployment.spec.template.spec.containers,
            pod_matcher: pod_matcher(&format!("^{name}-[^-]+-[^-]+$")),
        }
    }

    pub fn from_stateful_set(set: StatefulSet) -> Self {
        let name = regex::escape(&set.metadata.name);
        Self {
            kind: WorkloadKind::StatefulSet,
            namespace: set.metadata.namespace,
            name: set.metadata.name,
            annotations: set.metadata.annotations,
            replicas: ReplicasStatus {
                desired: set.spec.replicas,
                current: set.status.replicas,
                ready: set.status.ready_replicas,
                available: set.status.current_replicas,
            },
            containers: set.spec.template.spec.containers,
            pod_matcher: pod_matcher(&format!("^{name}-[0-9]+$")),
        }
    }

    pub fn from_daemon_set(daemon: Workload) -> Self {
        let name = regex::escape(&daemon.metadata.name);
        Self {
            kind: WorkloadKind::DaemonSet,
            namespace: daemon.metadata.namespace,
            name: daemon.metadata.name,
            annotations: daemon.metadata.annotations,
            replicas: ReplicasStatus {
                desired: daemon.status.desired_number_scheduled,
                current: daemon.status.current_number_scheduled,
                ready: daemon.status.number_ready,
                available: daemon.status.number_available,
            },
            containers: daemon.spec.template.spec.containers,
            pod_matcher: pod_matcher(&format!("^{name}-[^-]+$")),
        }
    }

    pub fn from_replica_set(set: Workload) -> Self {
        let name = regex::escape(&set.metadata.name);
        Self {
            kind: WorkloadKind::ReplicaSet,
            namespace: set.metadata.namespace,
            name: set.metadata.name,
            annotations: set.metadata.annotations,
            replicas: ReplicasStatus {
                desired: set.spec.replicas,
                current: set.status.replicas,
                ready: set.status.ready_replicas,
                available: set.status.available_replicas,
            },
            containers: set.spec.template.spec.containers,
            pod_matcher: pod_matcher(&format!("^{name}-[^-]+$")),
        }
    }

    pub fn from_replication_controller(controller: Workload) -> Self {
        let name = regex::escape(&controller.metadata.name);
        Self {
            kind: WorkloadKind::ReplicationController,
            namespace: controller.metadata.namespace,
            name: controller.metadata.name,
            annotations: controller.metadata.annotations,
            replicas: ReplicasStatus {
                desired: controller.spec.replicas,
                current: controller.status.replicas,
                ready: controller.status.ready_replicas,
                available: controller.status.available_replicas,
            },
            containers: controller.spec.template.spec.containers,
            pod_matcher: pod_matcher(&format!("^{name}-[^-]+$")),
        }
    }

    pub fn from_cron_job(job: CronJob) -> Self {
        let name = regex::escape(&job.metadata.name);
        let active = job.status.active.as_ref().map(|jobs| jobs.len() as i32);
        Self {
            kind: WorkloadKind::CronJob,
            namespace: job.metadata.namespace,
            name: job.metadata.name,
            annotations: job.metadata.annotations,
            replicas: ReplicasStatus {
                desired: None,
                current: active,
                ready: None,
                available: None,
            },
            containers: job.spec.job_template.spec.template.spec.containers,
            pod_matcher: pod_matcher(&format!("^{name}-[^-]+-[^-]+$")),
        }
    }

    /// A pod with no controller owner, surfaced as a singleton service.
    pub fn from_orphan_pod(pod: Pod) -> Self {
        let name = regex::escape(&pod.metadata.name);
        Self {
            kind: WorkloadKind::OrphanPod,
            namespace: pod.metadata.namespace,
            name: pod.metadata.name,
            annotations: pod.metadata.annotations,
            replicas: ReplicasStatus {
                desired: Some(1),
                current: Some(1),
                ready: Some(1),
                available: Some(1),
            },
            containers: pod.spec.containers,
            pod_matcher: pod_matcher(&format!("^{name}$")),
        }
    }
}

/// Replaces env values and command arguments before a pod spec leaves the
/// process. Names, images and resource quantities are retained.
pub fn mask_pod_spec(spec: &mut PodSpec) {
    mask_containers(&mut spec.containers);
    mask_containers(&mut spec.init_containers);
}

fn mask_containers(containers: &mut [Container]) {
    for container in containers {
        for env in &mut container.env {
            if matches!(&env.value, Some(v) if !v.is_empty()) {
                env.value = Some(MASKED_VALUE.to_string());
            }
        }
        for arg in &mut container.args {
            *arg = MASKED_VALUE.to_string();
        }
    }
}
