//! Core data models shared across the agent subsystems

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Scope of a single measurement.
///
/// The scope decides which identifier columns of a [`MetricRecord`] are
/// meaningful; the rest stay at the nil UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricScope {
    Cluster,
    Node,
    Pod,
    PodContainer,
}

/// One measurement produced by a scrape cycle.
///
/// Metric names are stable strings with `/` as hierarchy separator,
/// e.g. `cpu/usage_rate` or `network/rx`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub scope: MetricScope,
    pub node: Uuid,
    pub application: Uuid,
    pub service: Uuid,
    pub container: Uuid,
    pub pod_name: String,
    pub timestamp: DateTime<Utc>,
    pub value: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
}

impl MetricRecord {
    /// Checks that exactly the identifiers required by the scope are set.
    ///
    /// Cluster carries no identifiers, Node carries the node only, Pod
    /// carries node + application + service, PodContainer all four.
    /// Snapshot-derived container spec metrics are the one exception: they
    /// carry a nil node because they are emitted independently of node
    /// reachability, which this check allows for `PodContainer`.
    pub fn identifiers_match_scope(&self) -> bool {
        let nil = Uuid::nil();
        match self.scope {
            MetricScope::Cluster => {
                self.node == nil
                    && self.application == nil
                    && self.service == nil
                    && self.container == nil
            }
            MetricScope::Node => {
                self.node != nil
                    && self.application == nil
                    && self.service == nil
                    && self.container == nil
            }
            MetricScope::Pod => {
                self.node != nil
                    && self.application != nil
                    && self.service != nil
                    && self.container == nil
            }
            MetricScope::PodContainer => {
                self.application != nil && self.service != nil && self.container != nil
            }
        }
    }
}

/// Millicore / byte pair used for node capacity and allocatable figures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFigures {
    pub cpu_millicores: i64,
    pub memory_bytes: i64,
}

/// A node as the topology scanner sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub id: Uuid,
    pub name: String,
    /// Preferred scrape address (internal IP, falling back to the name).
    pub address: String,
    pub instance_type: String,
    pub instance_size: String,
    pub capacity: ResourceFigures,
    pub allocatable: ResourceFigures,
}

impl NodeEntry {
    /// Hardware-class label, `"{type}.{size}"`, used for coarse node counts.
    pub fn instance_group(&self) -> String {
        match (self.instance_type.is_empty(), self.instance_size.is_empty()) {
            (false, false) => format!("{}.{}", self.instance_type, self.instance_size),
            (false, true) => self.instance_type.clone(),
            (true, false) => self.instance_size.clone(),
            (true, true) => String::new(),
        }
    }
}

/// Container spec figures resolved from the workload controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerEntry {
    pub id: Uuid,
    pub name: String,
    pub cpu_request_millicores: i64,
    pub cpu_limit_millicores: i64,
    pub memory_request_bytes: i64,
    pub memory_limit_bytes: i64,
}

/// Desired/observed replica counts; which fields are present depends on the
/// workload kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicasStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available: Option<i32>,
}

/// A workload controller surfaced as a service of its namespace application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub id: Uuid,
    pub name: String,
    pub kind: String,
    pub replicas: ReplicasStatus,
    pub containers: Vec<ContainerEntry>,
}

/// A namespace with its services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationEntry {
    pub id: Uuid,
    pub name: String,
    pub services: Vec<ServiceEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(scope: MetricScope, node: Uuid, app: Uuid, svc: Uuid, ctr: Uuid) -> MetricRecord {
        MetricRecord {
            name: "cpu/usage".into(),
            scope,
            node,
            application: app,
            service: svc,
            container: ctr,
            pod_name: String::new(),
            timestamp: Utc::now(),
            value: 0,
            tags: None,
        }
    }

    #[test]
    fn test_identifier_scope_rules() {
        let id = Uuid::new_v4();
        let nil = Uuid::nil();

        assert!(record(MetricScope::Cluster, nil, nil, nil, nil).identifiers_match_scope());
        assert!(!record(MetricScope::Cluster, id, nil, nil, nil).identifiers_match_scope());

        assert!(record(MetricScope::Node, id, nil, nil, nil).identifiers_match_scope());
        assert!(!record(MetricScope::Node, nil, nil, nil, nil).identifiers_match_scope());

        assert!(record(MetricScope::Pod, id, id, id, nil).identifiers_match_scope());
        assert!(!record(MetricScope::Pod, id, id, nil, nil).identifiers_match_scope());

        assert!(record(MetricScope::PodContainer, id, id, id, id).identifiers_match_scope());
        // Snapshot-derived spec metrics have no node.
        assert!(record(MetricScope::PodContainer, nil, id, id, id).identifiers_match_scope());
        assert!(!record(MetricScope::PodContainer, id, id, id, nil).identifiers_match_scope());
    }

    #[test]
    fn test_instance_group() {
        let mut node = NodeEntry {
            id: Uuid::new_v4(),
            name: "node-a".into(),
            address: "10.0.0.1".into(),
            instance_type: "m4".into(),
            instance_size: "xlarge".into(),
            capacity: ResourceFigures::default(),
            allocatable: ResourceFigures::default(),
        };
        assert_eq!(node.instance_group(), "m4.xlarge");

        node.instance_size.clear();
        assert_eq!(node.instance_group(), "m4");

        node.instance_type.clear();
        assert_eq!(node.instance_group(), "");
    }
}
