//! Immutable topology snapshots and their resolution indices
//!
//! A snapshot is built wholesale from one successful scan and published by
//! pointer swap; it is never mutated afterwards. Identifiers are derived
//! deterministically from the account/cluster pair and the entity path, so
//! they are stable across rescans and restarts.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use regex::Regex;
use uuid::Uuid;

use crate::kube::{Node, Pod, WorkloadResource};
use crate::models::{
    ApplicationEntry, ContainerEntry, NodeEntry, ResourceFigures, ServiceEntry,
};

/// Derives stable entity identifiers within one account/cluster.
#[derive(Debug, Clone, Copy)]
pub struct IdentitySpace {
    namespace: Uuid,
}

impl IdentitySpace {
    pub fn new(account_id: Uuid, cluster_id: Uuid) -> Self {
        let seed = format!("{account_id}/{cluster_id}");
        Self {
            namespace: Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes()),
        }
    }

    pub fn node_id(&self, name: &str) -> Uuid {
        Uuid::new_v5(&self.namespace, format!("node/{name}").as_bytes())
    }

    pub fn application_id(&self, namespace: &str) -> Uuid {
        Uuid::new_v5(&self.namespace, format!("app/{namespace}").as_bytes())
    }

    pub fn service_id(&self, namespace: &str, kind: &str, name: &str) -> Uuid {
        Uuid::new_v5(
            &self.namespace,
            format!("service/{namespace}/{kind}/{name}").as_bytes(),
        )
    }

    pub fn container_id(&self, namespace: &str, kind: &str, service: &str, name: &str) -> Uuid {
        Uuid::new_v5(
            &self.namespace,
            format!("container/{namespace}/{kind}/{service}/{name}").as_bytes(),
        )
    }
}

/// Per-service lookup entry used for pod-name fallback resolution.
struct ServiceIndexEntry {
    application_id: Uuid,
    service_id: Uuid,
    pod_matcher: Regex,
    containers: Vec<ContainerEntry>,
}

/// An atomically-published, immutable inventory of the cluster topology.
pub struct TopologySnapshot {
    pub nodes: Vec<NodeEntry>,
    pub applications: Vec<ApplicationEntry>,
    pub nodes_scan_time: DateTime<Utc>,
    pub apps_scan_time: DateTime<Utc>,

    service_by_pod: HashMap<(String, String), (Uuid, Uuid)>,
    container_by_pod: HashMap<(String, String, String), (Uuid, Uuid, ContainerEntry)>,
    container_by_uid: HashMap<(String, String), (Uuid, Uuid, Uuid)>,
    services_by_namespace: HashMap<String, Vec<ServiceIndexEntry>>,
}

impl TopologySnapshot {
    pub fn empty() -> Self {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        Self {
            nodes: Vec::new(),
            applications: Vec::new(),
            nodes_scan_time: epoch,
            apps_scan_time: epoch,
            service_by_pod: HashMap::new(),
            container_by_pod: HashMap::new(),
            container_by_uid: HashMap::new(),
            services_by_namespace: HashMap::new(),
        }
    }

    /// Builds a snapshot from one scan's listings.
    ///
    /// `resources` must already exclude skipped namespaces and owned
    /// ReplicaSets; `pods` feed the exact-name and pod-UID indices.
    pub fn build(
        identity: &IdentitySpace,
        nodes: Vec<Node>,
        resources: Vec<WorkloadResource>,
        pods: &[Pod],
        scan_time: DateTime<Utc>,
    ) -> Self {
        let mut snapshot = Self::empty();
        snapshot.nodes_scan_time = scan_time;
        snapshot.apps_scan_time = scan_time;

        snapshot.nodes = nodes
            .into_iter()
            .map(|node| {
                let (instance_type, instance_size) = node.instance_type_size();
                NodeEntry {
                    id: identity.node_id(&node.metadata.name),
                    address: node.scrape_address(),
                    name: node.metadata.name,
                    instance_type,
                    instance_size,
                    capacity: ResourceFigures {
                        cpu_millicores: node
                            .status
                            .capacity
                            .get("cpu")
                            .map_or(0, |q| q.to_millicores()),
                        memory_bytes: node
                            .status
                            .capacity
                            .get("memory")
                            .map_or(0, |q| q.to_bytes()),
                    },
                    allocatable: ResourceFigures {
                        cpu_millicores: node
                            .status
                            .allocatable
                            .get("cpu")
                            .map_or(0, |q| q.to_millicores()),
                        memory_bytes: node
                            .status
                            .allocatable
                            .get("memory")
                            .map_or(0, |q| q.to_bytes()),
                    },
                }
            })
            .collect();
        snapshot.nodes.sort_by(|a, b| a.name.cmp(&b.name));

        let mut applications: HashMap<String, ApplicationEntry> = HashMap::new();
        for resource in resources {
            let application_id = identity.application_id(&resource.namespace);
            let service_id =
                identity.service_id(&resource.namespace, resource.kind.as_str(), &resource.name);
            let containers: Vec<ContainerEntry> = resource
                .containers
                .iter()
                .map(|container| ContainerEntry {
                    id: identity.container_id(
                        &resource.namespace,
                        resource.kind.as_str(),
                        &resource.name,
                        &container.name,
                    ),
                    name: container.name.clone(),
                    cpu_request_millicores: container.resources.request_millicores(),
                    cpu_limit_millicores: container.resources.limit_millicores(),
                    memory_request_bytes: container.resources.request_memory_bytes(),
                    memory_limit_bytes: container.resources.limit_memory_bytes(),
                })
                .collect();

            snapshot
                .services_by_namespace
                .entry(resource.namespace.clone())
                .or_default()
                .push(ServiceIndexEntry {
                    application_id,
                    service_id,
                    pod_matcher: resource.pod_matcher.clone(),
                    containers: containers.clone(),
                });

            applications
                .entry(resource.namespace.clone())
                .or_insert_with(|| ApplicationEntry {
                    id: application_id,
                    name: resource.namespace.clone(),
                    services: Vec::new(),
                })
                .services
                .push(ServiceEntry {
                    id: service_id,
                    name: resource.name,
                    kind: resource.kind.as_str().to_string(),
                    replicas: resource.replicas,
                    containers,
                });
        }
        snapshot.applications = applications.into_values().collect();
        snapshot.applications.sort_by(|a, b| a.name.cmp(&b.name));
        for app in &mut snapshot.applications {
            app.services.sort_by(|a, b| a.name.cmp(&b.name));
        }

        for pod in pods {
            let namespace = &pod.metadata.namespace;
            let pod_name = &pod.metadata.name;
            let Some(entry) = snapshot.resolve_service_entry(namespace, pod_name) else {
                continue;
            };
            let (application_id, service_id) = (entry.application_id, entry.service_id);
            let containers: Vec<ContainerEntry> = entry.containers.clone();

            snapshot.service_by_pod.insert(
                (namespace.clone(), pod_name.clone()),
                (application_id, service_id),
            );
            for container in containers {
                if !pod.metadata.uid.is_empty() {
                    snapshot.container_by_uid.insert(
                        (pod.metadata.uid.clone(), container.name.clone()),
                        (application_id, service_id, container.id),
                    );
                }
                snapshot.container_by_pod.insert(
                    (namespace.clone(), pod_name.clone(), container.name.clone()),
                    (application_id, service_id, container),
                );
            }
        }

        snapshot
    }

    fn resolve_service_entry(&self, namespace: &str, pod_name: &str) -> Option<&ServiceIndexEntry> {
        self.services_by_namespace
            .get(namespace)?
            .iter()
            .find(|entry| entry.pod_matcher.is_match(pod_name))
    }

    /// `(namespace, pod) -> (application, service)`, with pod-matcher
    /// fallback for pods born after the scan.
    pub fn find_service(&self, namespace: &str, pod_name: &str) -> Option<(Uuid, Uuid)> {
        if let Some(found) = self
            .service_by_pod
            .get(&(namespace.to_string(), pod_name.to_string()))
        {
            return Some(*found);
        }
        self.resolve_service_entry(namespace, pod_name)
            .map(|entry| (entry.application_id, entry.service_id))
    }

    /// `(namespace, pod, container) -> (application, service, container)`.
    pub fn find_container(
        &self,
        namespace: &str,
        pod_name: &str,
        container_name: &str,
    ) -> Option<(Uuid, Uuid, ContainerEntry)> {
        if let Some((app, svc, container)) = self.container_by_pod.get(&(
            namespace.to_string(),
            pod_name.to_string(),
            container_name.to_string(),
        )) {
            return Some((*app, *svc, container.clone()));
        }
        let entry = self.resolve_service_entry(namespace, pod_name)?;
        let container = entry
            .containers
            .iter()
            .find(|c| c.name == container_name)?
            .clone();
        Some((entry.application_id, entry.service_id, container))
    }

    /// `(pod UID, container) -> (application, service, container id)`.
    pub fn find_container_by_pod_uid(
        &self,
        pod_uid: &str,
        container_name: &str,
    ) -> Option<(Uuid, Uuid, Uuid)> {
        self.container_by_uid
            .get(&(pod_uid.to_string(), container_name.to_string()))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube::{ObjectMeta, Workload};
    use std::collections::HashSet;

    fn identity() -> IdentitySpace {
        IdentitySpace::new(Uuid::new_v4(), Uuid::new_v4())
    }

    fn deployment(namespace: &str, name: &str, containers: &[&str]) -> WorkloadResource {
        let mut workload = Workload {
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                ..Default::default()
            },
            ..Default::default()
        };
        workload.spec.template.spec.containers = containers
            .iter()
            .map(|c| crate::kube::Container {
                name: (*c).into(),
                ..Default::default()
            })
            .collect();
        WorkloadResource::from_deployment(workload)
    }

    fn pod(namespace: &str, name: &str, uid: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                uid: uid.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_identity_is_deterministic() {
        let account = Uuid::new_v4();
        let cluster = Uuid::new_v4();
        let a = IdentitySpace::new(account, cluster);
        let b = IdentitySpace::new(account, cluster);
        assert_eq!(a.node_id("node-1"), b.node_id("node-1"));
        assert_ne!(a.node_id("node-1"), a.node_id("node-2"));
    }

    #[test]
    fn test_find_service_exact_and_fallback() {
        let identity = identity();
        let resources = vec![deployment("prod", "api", &["web"])];
        let pods = vec![pod("prod", "api-7f9c4d-x2x9z", "uid-1")];
        let snapshot =
            TopologySnapshot::build(&identity, Vec::new(), resources, &pods, Utc::now());

        // Exact index hit.
        assert!(snapshot.find_service("prod", "api-7f9c4d-x2x9z").is_some());
        // A pod born after the scan resolves through the matcher.
        assert!(snapshot.find_service("prod", "api-5b5b5b-abcde").is_some());
        // Foreign names do not resolve.
        assert!(snapshot.find_service("prod", "unrelated-abc").is_none());
        assert!(snapshot.find_service("staging", "api-7f9c4d-x2x9z").is_none());
    }

    #[test]
    fn test_find_container_by_pod_uid() {
        let identity = identity();
        let resources = vec![deployment("prod", "api", &["web", "sidecar"])];
        let pods = vec![pod("prod", "api-7f9c4d-x2x9z", "uid-1")];
        let snapshot =
            TopologySnapshot::build(&identity, Vec::new(), resources, &pods, Utc::now());

        let (app, svc, container) = snapshot
            .find_container_by_pod_uid("uid-1", "web")
            .expect("container resolves by pod uid");
        let (app2, svc2, entry) = snapshot
            .find_container("prod", "api-7f9c4d-x2x9z", "web")
            .expect("container resolves by name");
        assert_eq!((app, svc, container), (app2, svc2, entry.id));

        assert!(snapshot.find_container_by_pod_uid("uid-1", "missing").is_none());
        assert!(snapshot.find_container_by_pod_uid("uid-2", "web").is_none());
    }

    #[test]
    fn test_container_ids_unique_across_services() {
        let identity = identity();
        // Same container name under two services in the same namespace.
        let resources = vec![
            deployment("prod", "api", &["web"]),
            deployment("prod", "frontend", &["web"]),
        ];
        let snapshot =
            TopologySnapshot::build(&identity, Vec::new(), resources, &[], Utc::now());

        let mut seen = HashSet::new();
        for app in &snapshot.applications {
            for service in &app.services {
                for container in &service.containers {
                    assert!(
                        seen.insert(container.id),
                        "container id appears in more than one service"
                    );
                }
            }
        }
        assert_eq!(seen.len(), 2);
    }
}
