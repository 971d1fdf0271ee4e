//! Decision executor
//!
//! Listens for control-plane decisions, validates them against the current
//! topology, guards partially-rolled StatefulSets and applies the
//! requested figures as a strategic-merge patch. Every decision produces a
//! structured result for the control plane, whatever the outcome.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use crate::gateway::{
    decode, encode, DecisionStatus, PacketDecision, PacketDecisionResult, PacketHandler,
    PacketKind, Reply, TotalResources,
};
use crate::kube::{KubeClient, StatefulSet, WorkloadKind};
use crate::observability::AgentMetrics;
use crate::scanner::Scanner;

const MILLICORE: f64 = 1000.0;

pub struct Executor {
    kube: KubeClient,
    scanner: Arc<Scanner>,
    metrics: AgentMetrics,
    dry_run: bool,
}

impl Executor {
    pub fn new(
        kube: KubeClient,
        scanner: Arc<Scanner>,
        metrics: AgentMetrics,
        dry_run: bool,
    ) -> Self {
        Self {
            kube,
            scanner,
            metrics,
            dry_run,
        }
    }

    /// Applies one decision end to end and reports the outcome.
    pub async fn apply(&self, decision: &PacketDecision) -> PacketDecisionResult {
        let result = |status: DecisionStatus, reason: String| PacketDecisionResult {
            id: decision.id,
            status,
            reason,
        };

        let Some(kind) = WorkloadKind::parse(&decision.kind) else {
            return result(
                DecisionStatus::Invalid,
                format!("unsupported workload kind {}", decision.kind),
            );
        };

        let resources = &decision.total_resources;
        if resources.replicas.is_none() && resources.containers.is_empty() {
            return result(
                DecisionStatus::Invalid,
                "nothing to change: no replicas and no containers".to_string(),
            );
        }

        if !self
            .workload_in_topology(kind, &decision.namespace, &decision.name)
            .await
        {
            return result(
                DecisionStatus::Invalid,
                format!(
                    "{kind} {}/{} is not part of the current topology",
                    decision.namespace, decision.name
                ),
            );
        }

        if kind == WorkloadKind::StatefulSet {
            let set = match self
                .kube
                .get_stateful_set(&decision.namespace, &decision.name)
                .await
            {
                Ok(set) => set,
                Err(error) => {
                    return result(
                        DecisionStatus::Failed,
                        format!("unable to read current spec: {error:#}"),
                    )
                }
            };
            if let Some(reason) = stateful_set_guard(&set) {
                return result(DecisionStatus::Skipped, reason);
            }
        }

        let patch = match build_patch(kind, resources) {
            Ok(patch) => patch,
            Err(reason) => return result(DecisionStatus::Invalid, reason),
        };

        if self.dry_run {
            info!(
                kind = %kind,
                namespace = %decision.namespace,
                name = %decision.name,
                patch = %patch,
                "dry run: patch not applied"
            );
            return result(DecisionStatus::Applied, "dry run".to_string());
        }

        match self
            .kube
            .patch_workload(kind, &decision.namespace, &decision.name, &patch)
            .await
        {
            Ok(()) => {
                info!(
                    kind = %kind,
                    namespace = %decision.namespace,
                    name = %decision.name,
                    "decision applied"
                );
                result(DecisionStatus::Applied, String::new())
            }
            Err(error) => result(DecisionStatus::Failed, format!("{error:#}")),
        }
    }

    async fn workload_in_topology(&self, kind: WorkloadKind, namespace: &str, name: &str) -> bool {
        let snapshot = self.scanner.snapshot().await;
        snapshot
            .applications
            .iter()
            .filter(|app| app.name == namespace)
            .flat_map(|app| app.services.iter())
            .any(|service| service.name == name && service.kind == kind.as_str())
    }
}

#[async_trait]
impl PacketHandler for Executor {
    async fn handle(&self, payload: &[u8]) -> Result<Option<Reply>> {
        let decision: PacketDecision = decode(payload)?;
        let result = self.apply(&decision).await;
        self.metrics.inc_decision_result(result.status.as_str());
        if result.status != DecisionStatus::Applied {
            warn!(
                status = ?result.status,
                reason = %result.reason,
                namespace = %decision.namespace,
                name = %decision.name,
                "decision not applied"
            );
        }
        Ok(Some(Reply {
            kind: PacketKind::DecisionResult,
            payload: encode(&result)?,
        }))
    }
}

/// Rolling-update guard for multi-replica StatefulSets.
///
/// Returns the skip reason when the set must not be patched: a partition
/// pinned above zero, or any strategy other than RollingUpdate, would leave
/// replicas permanently split across revisions.
fn stateful_set_guard(set: &StatefulSet) -> Option<String> {
    let replicas = set.spec.replicas.unwrap_or(0);
    if replicas <= 1 {
        return None;
    }

    let strategy = &set.spec.update_strategy;
    if strategy.kind != "RollingUpdate" {
        return Some(format!(
            "replicas {replicas} > 1 and UpdateStrategy not RollingUpdate"
        ));
    }
    if let Some(rolling) = &strategy.rolling_update {
        if rolling.partition.unwrap_or(0) != 0 {
            return Some(format!(
                "replicas {replicas} > 1 and RollingUpdate partition not equal 0"
            ));
        }
    }
    None
}

/// Builds the strategic-merge body carrying only the changed fields.
/// Containers merge by name; CPU is fractional cores, memory mebibytes.
fn build_patch(kind: WorkloadKind, resources: &TotalResources) -> Result<serde_json::Value, String> {
    let mut container_specs = Vec::with_capacity(resources.containers.len());
    for container in &resources.containers {
        let mut limits = serde_json::Map::new();
        let mut requests = serde_json::Map::new();

        if let Some(memory) = container.limits.memory {
            limits.insert("memory".into(), json!(format!("{memory}Mi")));
        }
        if let Some(cpu) = container.limits.cpu {
            limits.insert("cpu".into(), json!(cpu as f64 / MILLICORE));
        }
        if let Some(memory) = container.requests.memory {
            requests.insert("memory".into(), json!(format!("{memory}Mi")));
        }
        if let Some(cpu) = container.requests.cpu {
            requests.insert("cpu".into(), json!(cpu as f64 / MILLICORE));
        }

        let mut spec_resources = serde_json::Map::new();
        if !limits.is_empty() {
            spec_resources.insert("limits".into(), limits.into());
        }
        if !requests.is_empty() {
            spec_resources.insert("requests".into(), requests.into());
        }
        if spec_resources.is_empty() {
            return Err(format!("no resources for container {}", container.name));
        }

        container_specs.push(json!({
            "name": container.name,
            "resources": spec_resources,
        }));
    }

    let mut spec = serde_json::Map::new();
    if !container_specs.is_empty() {
        spec.insert(
            "template".into(),
            json!({"spec": {"containers": container_specs}}),
        );
    }
    // An explicit null or zero would reset the platform default to 1.
    if let Some(replicas) = resources.replicas {
        if replicas > 0 {
            spec.insert("replicas".into(), json!(replicas));
        }
    }

    Ok(json!({
        "kind": kind.as_str(),
        "spec": spec,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{ContainerResources, RequestLimit};

    fn stateful_set(replicas: i32, strategy: &str, partition: Option<i32>) -> StatefulSet {
        serde_json::from_value(json!({
            "metadata": {"name": "db", "namespace": "prod"},
            "spec": {
                "replicas": replicas,
                "updateStrategy": {
                    "type": strategy,
                    "rollingUpdate": partition.map(|p| json!({"partition": p})),
                },
            },
        }))
        .unwrap()
    }

    #[test]
    fn test_guard_allows_single_replica() {
        assert!(stateful_set_guard(&stateful_set(1, "OnDelete", None)).is_none());
    }

    #[test]
    fn test_guard_rejects_non_rolling_update() {
        let reason = stateful_set_guard(&stateful_set(3, "OnDelete", None)).unwrap();
        assert!(reason.contains("UpdateStrategy not RollingUpdate"));
    }

    #[test]
    fn test_guard_rejects_pinned_partition() {
        let reason = stateful_set_guard(&stateful_set(3, "RollingUpdate", Some(2))).unwrap();
        assert!(reason.contains("partition"));

        // Partition zero (or no rollingUpdate block) is fine.
        assert!(stateful_set_guard(&stateful_set(3, "RollingUpdate", Some(0))).is_none());
        assert!(stateful_set_guard(&stateful_set(3, "RollingUpdate", None)).is_none());
    }

    #[test]
    fn test_patch_body_shape() {
        let resources = TotalResources {
            replicas: Some(3),
            containers: vec![ContainerResources {
                name: "web".into(),
                requests: RequestLimit {
                    cpu: Some(250),
                    memory: Some(128),
                },
                limits: RequestLimit {
                    cpu: Some(1500),
                    memory: None,
                },
            }],
        };

        let patch = build_patch(WorkloadKind::Deployment, &resources).unwrap();
        assert_eq!(patch["kind"], "Deployment");
        assert_eq!(patch["spec"]["replicas"], 3);

        let container = &patch["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["name"], "web");
        assert_eq!(container["resources"]["requests"]["cpu"], 0.25);
        assert_eq!(container["resources"]["requests"]["memory"], "128Mi");
        assert_eq!(container["resources"]["limits"]["cpu"], 1.5);
        assert!(container["resources"]["limits"].get("memory").is_none());
    }

    #[test]
    fn test_patch_omits_zero_replicas() {
        let resources = TotalResources {
            replicas: Some(0),
            containers: vec![ContainerResources {
                name: "web".into(),
                requests: RequestLimit {
                    cpu: Some(100),
                    memory: None,
                },
                limits: RequestLimit::default(),
            }],
        };
        let patch = build_patch(WorkloadKind::Deployment, &resources).unwrap();
        assert!(patch["spec"].get("replicas").is_none());
    }

    #[test]
    fn test_patch_rejects_empty_container() {
        let resources = TotalResources {
            replicas: None,
            containers: vec![ContainerResources {
                name: "web".into(),
                requests: RequestLimit::default(),
                limits: RequestLimit::default(),
            }],
        };
        assert!(build_patch(WorkloadKind::Deployment, &resources).is_err());
    }
}
