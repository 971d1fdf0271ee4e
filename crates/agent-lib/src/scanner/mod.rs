//! Topology scanner
//!
//! Maintains an up-to-date, atomically-published inventory of the cluster:
//! nodes, workload controllers normalized into applications/services, and
//! the indices that map scraped pod names and UIDs back to stable
//! identifiers. One rescan lists all workload kinds concurrently; if any
//! listing fails the whole cycle is discarded and the previous snapshot
//! stays in place until the next tick.

mod snapshot;

pub use snapshot::{IdentitySpace, TopologySnapshot};

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::kube::{CronJob, KubeClient, Pod, StatefulSet, Workload, WorkloadResource};
use crate::models::{ApplicationEntry, NodeEntry};

/// Scanner configuration.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Rescan cadence.
    pub interval: Duration,
    /// Namespace glob patterns to exclude, e.g. `system-*`.
    pub skip_namespaces: Vec<String>,
    /// Retain masked raw listings for the analysis-data packet.
    pub keep_raw_resources: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            skip_namespaces: Vec::new(),
            keep_raw_resources: false,
        }
    }
}

/// Periodic cluster inventory with identifier resolution.
pub struct Scanner {
    kube: KubeClient,
    identity: IdentitySpace,
    config: ScannerConfig,
    skip_matchers: Vec<Regex>,
    current: RwLock<Arc<TopologySnapshot>>,
    raw_resources: RwLock<Option<serde_json::Value>>,
}

impl Scanner {
    pub fn new(kube: KubeClient, identity: IdentitySpace, config: ScannerConfig) -> Self {
        let skip_matchers = config
            .skip_namespaces
            .iter()
            .map(|pattern| glob_to_regex(pattern))
            .collect();
        Self {
            kube,
            identity,
            config,
            skip_matchers,
            current: RwLock::new(Arc::new(TopologySnapshot::empty())),
            raw_resources: RwLock::new(None),
        }
    }

    /// The currently-published snapshot. Callers hold the returned Arc for
    /// the duration of one operation; publication never mutates in place.
    pub async fn snapshot(&self) -> Arc<TopologySnapshot> {
        self.current.read().await.clone()
    }

    pub async fn nodes(&self) -> Vec<NodeEntry> {
        self.snapshot().await.nodes.clone()
    }

    pub async fn applications(&self) -> Vec<ApplicationEntry> {
        self.snapshot().await.applications.clone()
    }

    pub async fn nodes_last_scan_time(&self) -> DateTime<Utc> {
        self.snapshot().await.nodes_scan_time
    }

    pub async fn apps_last_scan_time(&self) -> DateTime<Utc> {
        self.snapshot().await.apps_scan_time
    }

    /// Masked raw listings from the last successful rescan, when retention
    /// is enabled. Taking them clears the slot so each scan ships once.
    pub async fn take_raw_resources(&self) -> Option<serde_json::Value> {
        self.raw_resources.write().await.take()
    }

    /// Runs one full rescan and publishes the resulting snapshot.
    pub async fn rescan(&self) -> Result<()> {
        let scan_time = Utc::now();
        debug!("rescanning cluster topology");

        let (
            nodes,
            pods,
            deployments,
            stateful_sets,
            daemon_sets,
            replica_sets,
            controllers,
            cron_jobs,
            limit_ranges,
        ) = tokio::try_join!(
            self.kube.list_nodes(),
            self.kube.list_pods(),
            self.kube.list_deployments(),
            self.kube.list_stateful_sets(),
            self.kube.list_daemon_sets(),
            self.kube.list_replica_sets(),
            self.kube.list_replication_controllers(),
            self.kube.list_cron_jobs(),
            self.kube.list_limit_ranges(),
        )
        .context("topology scan failed")?;

        if self.config.keep_raw_resources {
            // Pod specs in every list are already masked by the client.
            let raw = serde_json::json!({
                "nodes": &nodes,
                "pods": &pods,
                "deployments": &deployments,
                "statefulSets": &stateful_sets,
                "daemonSets": &daemon_sets,
                "replicaSets": &replica_sets,
                "controllers": &controllers,
                "cronJobs": &cron_jobs,
                "limitRanges": &limit_ranges,
            });
            *self.raw_resources.write().await = Some(raw);
        }

        let (resources, pods) = assemble_resources(
            deployments,
            stateful_sets,
            daemon_sets,
            replica_sets,
            controllers,
            cron_jobs,
            pods,
            &self.skip_matchers,
        );

        let snapshot = TopologySnapshot::build(&self.identity, nodes, resources, &pods, scan_time);
        info!(
            nodes = snapshot.nodes.len(),
            applications = snapshot.applications.len(),
            "topology snapshot published"
        );
        *self.current.write().await = Arc::new(snapshot);
        Ok(())
    }

    /// Background rescan loop; failures keep the previous snapshot and the
    /// next tick is the retry.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = self.rescan().await {
                        warn!(error = %error, "topology rescan failed, keeping previous snapshot");
                    }
                }
                _ = shutdown.recv() => {
                    info!("shutting down topology scanner");
                    break;
                }
            }
        }
    }

    pub async fn find_service(&self, namespace: &str, pod_name: &str) -> Option<(Uuid, Uuid)> {
        self.snapshot().await.find_service(namespace, pod_name)
    }

    pub async fn find_container(
        &self,
        namespace: &str,
        pod_name: &str,
        container_name: &str,
    ) -> Option<(Uuid, Uuid, crate::models::ContainerEntry)> {
        self.snapshot()
            .await
            .find_container(namespace, pod_name, container_name)
    }

    pub async fn find_container_by_pod_uid(
        &self,
        pod_uid: &str,
        container_name: &str,
    ) -> Option<(Uuid, Uuid, Uuid)> {
        self.snapshot()
            .await
            .find_container_by_pod_uid(pod_uid, container_name)
    }
}

/// Normalizes the per-kind listings into workload resources.
///
/// ReplicaSets owned by another controller are dropped (their owner already
/// represents them), pods without an owner become orphan-pod services, and
/// skipped namespaces are filtered everywhere.
#[allow(clippy::too_many_arguments)]
fn assemble_resources(
    deployments: Vec<Workload>,
    stateful_sets: Vec<StatefulSet>,
    daemon_sets: Vec<Workload>,
    replica_sets: Vec<Workload>,
    controllers: Vec<Workload>,
    cron_jobs: Vec<CronJob>,
    pods: Vec<Pod>,
    skip: &[Regex],
) -> (Vec<WorkloadResource>, Vec<Pod>) {
    let skipped = |namespace: &str| skip.iter().any(|m| m.is_match(namespace));

    let mut resources = Vec::new();
    resources.extend(
        deployments
            .into_iter()
            .filter(|d| !skipped(&d.metadata.namespace))
            .map(WorkloadResource::from_deployment),
    );
    resources.extend(
        stateful_sets
            .into_iter()
            .filter(|s| !skipped(&s.metadata.namespace))
            .map(WorkloadResource::from_stateful_set),
    );
    resources.extend(
        daemon_sets
            .into_iter()
            .filter(|d| !skipped(&d.metadata.namespace))
            .map(WorkloadResource::from_daemon_set),
    );
    resources.extend(
        replica_sets
            .into_iter()
            .filter(|r| r.metadata.owner_references.is_empty())
            .filter(|r| !skipped(&r.metadata.namespace))
            .map(WorkloadResource::from_replica_set),
    );
    resources.extend(
        controllers
            .into_iter()
            .filter(|c| !skipped(&c.metadata.namespace))
            .map(WorkloadResource::from_replication_controller),
    );
    resources.extend(
        cron_jobs
            .into_iter()
            .filter(|j| !skipped(&j.metadata.namespace))
            .map(WorkloadResource::from_cron_job),
    );

    let pods: Vec<Pod> = pods
        .into_iter()
        .filter(|p| !skipped(&p.metadata.namespace))
        .collect();
    resources.extend(
        pods.iter()
            .filter(|p| p.metadata.owner_references.is_empty())
            .cloned()
            .map(WorkloadResource::from_orphan_pod),
    );

    (resources, pods)
}

fn glob_to_regex(pattern: &str) -> Regex {
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    Regex::new(&format!("^{escaped}$")).unwrap_or_else(|_| Regex::new("$^").unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube::{ObjectMeta, OwnerReference, WorkloadKind};

    fn workload(namespace: &str, name: &str, owned: bool) -> Workload {
        Workload {
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                owner_references: if owned {
                    vec![OwnerReference {
                        kind: "Deployment".into(),
                        name: "owner".into(),
                    }]
                } else {
                    Vec::new()
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn pod(namespace: &str, name: &str, owned: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                owner_references: if owned {
                    vec![OwnerReference {
                        kind: "ReplicaSet".into(),
                        name: "owner".into(),
                    }]
                } else {
                    Vec::new()
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_glob_to_regex() {
        let matcher = glob_to_regex("system-*");
        assert!(matcher.is_match("system-monitoring"));
        assert!(!matcher.is_match("user-system-a"));

        let exact = glob_to_regex("kube-system");
        assert!(exact.is_match("kube-system"));
        assert!(!exact.is_match("kube-system-extra"));
    }

    #[test]
    fn test_owned_replica_sets_are_skipped() {
        let (resources, _) = assemble_resources(
            Vec::new(),
            Vec::new(),
            Vec::new(),
            vec![workload("prod", "owned-rs", true), workload("prod", "bare-rs", false)],
            Vec::new(),
            Vec::new(),
            Vec::new(),
            &[],
        );
        let names: Vec<&str> = resources.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["bare-rs"]);
    }

    #[test]
    fn test_orphan_pods_become_singleton_services() {
        let (resources, pods) = assemble_resources(
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            vec![pod("prod", "one-off", false), pod("prod", "managed", true)],
            &[],
        );
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].kind, WorkloadKind::OrphanPod);
        assert_eq!(resources[0].replicas.desired, Some(1));
        // Both pods still feed the indices.
        assert_eq!(pods.len(), 2);
    }

    #[test]
    fn test_namespace_skip_filters_everything() {
        let skip = vec![glob_to_regex("system-*")];
        let (resources, pods) = assemble_resources(
            vec![workload("system-monitoring", "exporter", false)],
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            vec![pod("system-monitoring", "exporter-abc", false)],
            &skip,
        );
        assert!(resources.is_empty());
        assert!(pods.is_empty());
    }
}
