//! Per-node metrics scraper
//!
//! One scrape cycle walks the current topology snapshot, fetches the
//! summary and cumulative endpoints of every node concurrently, joins the
//! measurements against the snapshot's indices and produces a single batch
//! of metric records. A node that fails only degrades itself for the
//! cycle; partial batches are always returned.

mod cadvisor;
mod kubelet;
mod rates;
mod summary;

pub use cadvisor::{parse_exposition, Sample, SampleTable};
pub use kubelet::{KubeletClient, KubeletConfig};
pub use rates::{RateError, RateKey, RateTable};
pub use summary::{ContainerStats, NodeSummary, PodStats};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::{MetricRecord, MetricScope};
use crate::scanner::TopologySnapshot;

const SUMMARY_PATH: &str = "stats/summary";
const CUMULATIVE_PATH: &str = "metrics/cadvisor";

/// Exposition family -> emitted metric name for the cumulative endpoint.
const CUMULATIVE_FAMILIES: &[(&str, &str)] = &[
    ("container_cpu_cfs_periods_total", "container_cpu_cfs/periods_total"),
    (
        "container_cpu_cfs_throttled_periods_total",
        "container_cpu_cfs_throttled/periods_total",
    ),
    (
        "container_cpu_cfs_throttled_seconds_total",
        "container_cpu_cfs_throttled/seconds_total",
    ),
];

/// Identifier columns of a record, grouped by scope.
#[derive(Debug, Clone, Copy)]
struct EntityIds {
    node: Uuid,
    application: Uuid,
    service: Uuid,
    container: Uuid,
}

impl EntityIds {
    fn cluster() -> Self {
        Self {
            node: Uuid::nil(),
            application: Uuid::nil(),
            service: Uuid::nil(),
            container: Uuid::nil(),
        }
    }

    fn node(node: Uuid) -> Self {
        Self {
            node,
            ..Self::cluster()
        }
    }

    fn pod(node: Uuid, application: Uuid, service: Uuid) -> Self {
        Self {
            node,
            application,
            service,
            container: Uuid::nil(),
        }
    }

    fn container(node: Uuid, application: Uuid, service: Uuid, container: Uuid) -> Self {
        Self {
            node,
            application,
            service,
            container,
        }
    }
}

/// Per-cycle record accumulator shared by the node tasks.
struct MetricSink {
    tick_time: DateTime<Utc>,
    rates: Arc<RateTable>,
    records: Mutex<Vec<MetricRecord>>,
}

impl MetricSink {
    fn new(tick_time: DateTime<Utc>, rates: Arc<RateTable>) -> Self {
        Self {
            tick_time,
            rates,
            records: Mutex::new(Vec::new()),
        }
    }

    /// Missing or zero timestamps fall back to the tick time; that is an
    /// error event, not silent repair.
    fn resolve_timestamp(&self, name: &str, timestamp: Option<DateTime<Utc>>) -> DateTime<Utc> {
        match timestamp {
            Some(ts) if ts != DateTime::<Utc>::UNIX_EPOCH => ts,
            _ => {
                error!(metric = name, "invalid timestamp, defaulting to tick time");
                self.tick_time
            }
        }
    }

    fn absolute(
        &self,
        scope: MetricScope,
        name: &str,
        ids: EntityIds,
        pod_name: &str,
        timestamp: Option<DateTime<Utc>>,
        value: i64,
    ) {
        self.absolute_with_tags(scope, name, ids, pod_name, timestamp, value, None);
    }

    fn absolute_with_tags(
        &self,
        scope: MetricScope,
        name: &str,
        ids: EntityIds,
        pod_name: &str,
        timestamp: Option<DateTime<Utc>>,
        value: i64,
        tags: Option<std::collections::BTreeMap<String, String>>,
    ) {
        let timestamp = self.resolve_timestamp(name, timestamp);
        let record = MetricRecord {
            name: name.to_string(),
            scope,
            node: ids.node,
            application: ids.application,
            service: ids.service,
            container: ids.container,
            pod_name: pod_name.to_string(),
            timestamp,
            value,
            tags,
        };
        self.records
            .lock()
            .expect("metric accumulator mutex poisoned")
            .push(record);
    }

    /// Computes and emits a rate for a cumulative counter. Rate errors drop
    /// the emission for this cycle; the new baseline is stored either way.
    #[allow(clippy::too_many_arguments)]
    fn rate(
        &self,
        scope: MetricScope,
        parent: &str,
        entity: &str,
        name: &str,
        ids: EntityIds,
        pod_name: &str,
        timestamp: Option<DateTime<Utc>>,
        value: i64,
        multiplier: i64,
    ) {
        let timestamp = self.resolve_timestamp(name, timestamp);
        let key = RateKey {
            scope,
            name: name.to_string(),
            parent: parent.to_string(),
            entity: entity.to_string(),
        };
        match self.rates.rate(key, timestamp, value, multiplier) {
            Ok(rate) => {
                self.absolute(scope, name, ids, pod_name, Some(timestamp), rate);
            }
            Err(reason) => {
                debug!(metric = name, %reason, "rate dropped for this cycle");
            }
        }
    }

    fn into_records(self) -> Vec<MetricRecord> {
        self.records
            .into_inner()
            .expect("metric accumulator mutex poisoned")
    }
}

/// Default-zero cumulative values for one summary container, overwritten by
/// exposition samples when present.
struct CumulativeStore {
    application: Uuid,
    service: Uuid,
    container: Uuid,
    namespace: String,
    pod_name: String,
    container_name: String,
    values: HashMap<&'static str, f64>,
}

/// Result of one scrape cycle.
pub struct ScrapeOutcome {
    pub records: Vec<MetricRecord>,
    /// Raw summary documents per node, retained when analysis opt-in is set.
    pub raw_responses: Option<HashMap<Uuid, serde_json::Value>>,
    /// Nodes that degraded this cycle.
    pub failed_nodes: usize,
}

/// Scraper over all nodes of the current snapshot.
pub struct MetricsScraper {
    kubelet: KubeletClient,
    rates: Arc<RateTable>,
    opt_in_analysis_data: bool,
}

impl MetricsScraper {
    pub fn new(kubelet: KubeletClient, opt_in_analysis_data: bool) -> Self {
        Self {
            kubelet,
            rates: Arc::new(RateTable::new()),
            opt_in_analysis_data,
        }
    }

    /// Runs one scrape cycle against the given snapshot.
    pub async fn collect(
        self: Arc<Self>,
        snapshot: Arc<TopologySnapshot>,
        tick_time: DateTime<Utc>,
    ) -> ScrapeOutcome {
        self.rates.collect_garbage();

        let sink = Arc::new(MetricSink::new(tick_time, Arc::clone(&self.rates)));
        let raw_responses: Arc<Mutex<HashMap<Uuid, serde_json::Value>>> =
            Arc::new(Mutex::new(HashMap::new()));

        emit_cluster_metrics(&sink, &snapshot);

        let parallelism = num_cpus::get().min(snapshot.nodes.len()).max(1);
        let semaphore = Arc::new(Semaphore::new(parallelism));
        let mut tasks = JoinSet::new();
        for node in snapshot.nodes.clone() {
            let scraper = Arc::clone(&self);
            let sink = Arc::clone(&sink);
            let snapshot = Arc::clone(&snapshot);
            let raw_responses = Arc::clone(&raw_responses);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let name = node.name.clone();
                let outcome = scraper
                    .scrape_node(&node, &snapshot, &sink, &raw_responses)
                    .await;
                (name, outcome)
            });
        }

        let mut failed_nodes = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((node, Err(reason))) => {
                    failed_nodes += 1;
                    error!(node, error = %reason, "node degraded for this scrape cycle");
                }
                Err(join_error) => {
                    failed_nodes += 1;
                    error!(error = %join_error, "node scrape task aborted");
                }
            }
        }

        emit_spec_metrics(&sink, &snapshot);

        let records = match Arc::try_unwrap(sink) {
            Ok(sink) => sink.into_records(),
            Err(sink) => sink
                .records
                .lock()
                .expect("metric accumulator mutex poisoned")
                .drain(..)
                .collect(),
        };
        info!(
            measurements = records.len(),
            failed_nodes, "scrape cycle complete"
        );

        let raw_responses = self.opt_in_analysis_data.then(|| {
            std::mem::take(
                &mut *raw_responses
                    .lock()
                    .expect("raw response mutex poisoned"),
            )
        });

        ScrapeOutcome {
            records,
            raw_responses,
            failed_nodes,
        }
    }

    async fn scrape_node(
        &self,
        node: &crate::models::NodeEntry,
        snapshot: &TopologySnapshot,
        sink: &MetricSink,
        raw_responses: &Mutex<HashMap<Uuid, serde_json::Value>>,
    ) -> Result<()> {
        debug!(node = %node.name, "requesting metrics from node");

        let summary_body = self
            .kubelet
            .fetch_with_backoff(&node.address, SUMMARY_PATH)
            .await?
            .unwrap_or_else(|| {
                warn!(node = %node.name, "summary resource absent on node");
                "{}".to_string()
            });

        if self.opt_in_analysis_data {
            match serde_json::from_str::<serde_json::Value>(&summary_body) {
                Ok(value) => {
                    raw_responses
                        .lock()
                        .expect("raw response mutex poisoned")
                        .insert(node.id, value);
                }
                Err(error) => {
                    error!(node = %node.name, %error, "unable to retain raw summary document");
                }
            }
        }

        let summary: NodeSummary =
            serde_json::from_str(&summary_body).context("unable to decode summary document")?;

        let mut cumulative = emit_summary_metrics(sink, snapshot, node, &summary);

        let exposition_body = self
            .kubelet
            .fetch_with_backoff(&node.address, CUMULATIVE_PATH)
            .await?
            .unwrap_or_default();
        let samples = parse_exposition(&exposition_body);
        apply_cumulative_samples(snapshot, &samples, &mut cumulative);
        emit_cumulative_metrics(sink, node, &summary, cumulative);

        Ok(())
    }
}

/// Cluster-scope counts derived from the snapshot alone.
fn emit_cluster_metrics(sink: &MetricSink, snapshot: &TopologySnapshot) {
    let scan_time = Some(snapshot.nodes_scan_time);
    sink.absolute(
        MetricScope::Cluster,
        "nodes/count",
        EntityIds::cluster(),
        "",
        scan_time,
        snapshot.nodes.len() as i64,
    );

    let mut instance_groups: HashMap<String, i64> = HashMap::new();
    for node in &snapshot.nodes {
        *instance_groups.entry(node.instance_group()).or_default() += 1;
    }
    for (instance_group, count) in instance_groups {
        let tags = std::collections::BTreeMap::from([(
            "instance_group".to_string(),
            instance_group,
        )]);
        sink.absolute_with_tags(
            MetricScope::Cluster,
            "nodes/count",
            EntityIds::cluster(),
            "",
            scan_time,
            count,
            Some(tags),
        );
    }

    for node in &snapshot.nodes {
        let ids = EntityIds::node(node.id);
        for (name, value) in [
            ("cpu/node_capacity", node.capacity.cpu_millicores),
            ("cpu/node_allocatable", node.allocatable.cpu_millicores),
            ("memory/node_capacity", node.capacity.memory_bytes),
            ("memory/node_allocatable", node.allocatable.memory_bytes),
        ] {
            sink.absolute(MetricScope::Node, name, ids, "", scan_time, value);
        }
    }
}

/// Container spec figures per snapshot container, emitted independently of
/// node reachability so resource-plan metrics survive full scrape outages.
fn emit_spec_metrics(sink: &MetricSink, snapshot: &TopologySnapshot) {
    let scan_time = Some(snapshot.apps_scan_time);
    for application in &snapshot.applications {
        for service in &application.services {
            for container in &service.containers {
                let ids = EntityIds::container(
                    Uuid::nil(),
                    application.id,
                    service.id,
                    container.id,
                );
                for (name, value) in [
                    ("cpu/request", container.cpu_request_millicores),
                    ("cpu/limit", container.cpu_limit_millicores),
                    ("memory/request", container.memory_request_bytes),
                    ("memory/limit", container.memory_limit_bytes),
                ] {
                    sink.absolute(MetricScope::PodContainer, name, ids, "", scan_time, value);
                }
            }
        }
    }
}

/// Keeps one container per name, preferring the latest start time. The
/// cumulative endpoint briefly reports a restarted container twice.
fn dedup_containers(containers: &[ContainerStats]) -> Vec<&ContainerStats> {
    let mut by_name: HashMap<&str, &ContainerStats> = HashMap::new();
    for container in containers {
        by_name
            .entry(container.name.as_str())
            .and_modify(|kept| {
                if container.start_time > kept.start_time {
                    *kept = container;
                }
            })
            .or_insert(container);
    }
    by_name.into_values().collect()
}

/// Emits node, pod and container measurements from one summary document and
/// seeds the cumulative-value store for every resolved container.
fn emit_summary_metrics(
    sink: &MetricSink,
    snapshot: &TopologySnapshot,
    node: &crate::models::NodeEntry,
    summary: &NodeSummary,
) -> HashMap<Uuid, CumulativeStore> {
    let node_ids = EntityIds::node(node.id);
    let stats = &summary.node;

    for (name, time, value) in [
        ("cpu/usage", stats.cpu.time, stats.cpu.usage_core_nano_seconds),
        ("memory/rss", stats.memory.time, stats.memory.rss_bytes),
        ("filesystem/usage", stats.fs.time, stats.fs.used_bytes),
        ("filesystem/node_capacity", stats.fs.time, stats.fs.capacity_bytes),
        ("filesystem/node_allocatable", stats.fs.time, stats.fs.capacity_bytes),
        ("network/tx", stats.network.time, stats.network.tx_bytes),
        ("network/rx", stats.network.time, stats.network.rx_bytes),
        ("network/tx_errors", stats.network.time, stats.network.tx_errors),
        ("network/rx_errors", stats.network.time, stats.network.rx_errors),
    ] {
        sink.absolute(MetricScope::Node, name, node_ids, "", time, value);
    }

    let node_entity = node.id.to_string();
    for (name, time, value, multiplier) in [
        ("cpu/usage_rate", stats.cpu.time, stats.cpu.usage_core_nano_seconds, 1000),
        ("network/tx_rate", stats.network.time, stats.network.tx_bytes, 1_000_000_000),
        ("network/rx_rate", stats.network.time, stats.network.rx_bytes, 1_000_000_000),
        ("network/tx_errors_rate", stats.network.time, stats.network.tx_errors, 1_000_000_000),
        ("network/rx_errors_rate", stats.network.time, stats.network.rx_errors, 1_000_000_000),
    ] {
        sink.rate(
            MetricScope::Node,
            "",
            &node_entity,
            name,
            node_ids,
            "",
            time,
            value,
            multiplier,
        );
    }

    let mut cumulative: HashMap<Uuid, CumulativeStore> = HashMap::new();

    for pod in &summary.pods {
        let namespace = &pod.pod_ref.namespace;
        let pod_name = &pod.pod_ref.name;
        let Some((application, service)) = snapshot.find_service(namespace, pod_name) else {
            warn!(namespace, pod = pod_name, "no service for pod, skipping");
            continue;
        };
        let pod_ids = EntityIds::pod(node.id, application, service);

        for (name, time, value) in [
            ("network/tx", pod.network.time, pod.network.tx_bytes),
            ("network/rx", pod.network.time, pod.network.rx_bytes),
            ("network/tx_errors", pod.network.time, pod.network.tx_errors),
            ("network/rx_errors", pod.network.time, pod.network.rx_errors),
        ] {
            sink.absolute(MetricScope::Pod, name, pod_ids, pod_name, time, value);
        }

        for (name, time, value) in [
            ("network/tx_rate", pod.network.time, pod.network.tx_bytes),
            ("network/rx_rate", pod.network.time, pod.network.rx_bytes),
            ("network/tx_errors_rate", pod.network.time, pod.network.tx_errors),
            ("network/rx_errors_rate", pod.network.time, pod.network.rx_errors),
        ] {
            sink.rate(
                MetricScope::Pod,
                namespace,
                pod_name,
                name,
                pod_ids,
                pod_name,
                time,
                value,
                1_000_000_000,
            );
        }

        for container in dedup_containers(&pod.containers) {
            let Some((application, service, entry)) =
                snapshot.find_container(namespace, pod_name, &container.name)
            else {
                warn!(
                    namespace,
                    pod = pod_name,
                    container = %container.name,
                    "no topology entry for container, skipping"
                );
                continue;
            };
            let ids = EntityIds::container(node.id, application, service, entry.id);

            for (name, time, value) in [
                ("cpu/usage", container.cpu.time, container.cpu.usage_core_nano_seconds),
                ("memory/rss", container.memory.time, container.memory.rss_bytes),
                ("filesystem/usage", container.root_fs.time, container.root_fs.used_bytes),
                ("cpu/request", container.cpu.time, entry.cpu_request_millicores),
                ("cpu/limit", container.cpu.time, entry.cpu_limit_millicores),
                ("memory/request", container.memory.time, entry.memory_request_bytes),
                ("memory/limit", container.memory.time, entry.memory_limit_bytes),
            ] {
                sink.absolute(MetricScope::PodContainer, name, ids, pod_name, time, value);
            }

            sink.rate(
                MetricScope::PodContainer,
                &format!("{namespace}:{pod_name}"),
                &container.name,
                "cpu/usage_rate",
                ids,
                pod_name,
                container.cpu.time,
                container.cpu.usage_core_nano_seconds,
                1000,
            );

            cumulative.insert(
                entry.id,
                CumulativeStore {
                    application,
                    service,
                    container: entry.id,
                    namespace: namespace.clone(),
                    pod_name: pod_name.clone(),
                    container_name: container.name.clone(),
                    values: CUMULATIVE_FAMILIES
                        .iter()
                        .map(|(_, name)| (*name, 0.0))
                        .collect(),
                },
            );
        }
    }

    cumulative
}

/// Overwrites the default-zero cumulative values with exposition samples.
/// Containers the exposition knows but the summary does not are skipped.
fn apply_cumulative_samples(
    snapshot: &TopologySnapshot,
    samples: &SampleTable,
    cumulative: &mut HashMap<Uuid, CumulativeStore>,
) {
    for (family, name) in CUMULATIVE_FAMILIES {
        let Some(family_samples) = samples.get(*family) else {
            continue;
        };
        for sample in family_samples {
            let Some((pod_uid, container_name)) = sample.container_ref() else {
                continue;
            };
            let Some((_, _, container_id)) =
                snapshot.find_container_by_pod_uid(pod_uid, container_name)
            else {
                continue;
            };
            match cumulative.get_mut(&container_id) {
                Some(store) => {
                    store.values.insert(name, sample.value);
                }
                None => {
                    warn!(
                        container = container_name,
                        "container present in cumulative response but absent from summary"
                    );
                }
            }
        }
    }
}

/// Emits the cumulative absolutes and their rate variants.
fn emit_cumulative_metrics(
    sink: &MetricSink,
    node: &crate::models::NodeEntry,
    summary: &NodeSummary,
    cumulative: HashMap<Uuid, CumulativeStore>,
) {
    let node_cpu_time = summary.node.cpu.time;
    let now = Utc::now();

    for store in cumulative.into_values() {
        let ids = EntityIds::container(node.id, store.application, store.service, store.container);
        let parent = format!("{}:{}", store.namespace, store.pod_name);
        for (name, value) in &store.values {
            // Seconds are carried as milliseconds until the wire format
            // grows a float column.
            let scaled = if name.contains("seconds") {
                (value * 1000.0) as i64
            } else {
                *value as i64
            };

            sink.absolute(
                MetricScope::PodContainer,
                name,
                ids,
                &store.pod_name,
                node_cpu_time,
                scaled,
            );
            sink.rate(
                MetricScope::PodContainer,
                &parent,
                &store.container_name,
                &format!("{name}_rate"),
                ids,
                &store.pod_name,
                Some(now),
                scaled,
                1_000_000_000,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube::{Container, ObjectMeta, Pod, Workload, WorkloadResource};
    use crate::models::{NodeEntry, ResourceFigures};
    use crate::scanner::IdentitySpace;
    use chrono::TimeZone;

    fn test_snapshot() -> Arc<TopologySnapshot> {
        let identity = IdentitySpace::new(Uuid::new_v4(), Uuid::new_v4());
        let mut workload = Workload {
            metadata: ObjectMeta {
                name: "api".into(),
                namespace: "prod".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        workload.spec.template.spec.containers = vec![Container {
            name: "web".into(),
            ..Default::default()
        }];
        let pods = vec![Pod {
            metadata: ObjectMeta {
                name: "api-7f9c4d-x2x9z".into(),
                namespace: "prod".into(),
                uid: "uid-1".into(),
                ..Default::default()
            },
            ..Default::default()
        }];
        let nodes = vec![crate::kube::Node {
            metadata: ObjectMeta {
                name: "node-a".into(),
                ..Default::default()
            },
            ..Default::default()
        }];
        Arc::new(TopologySnapshot::build(
            &identity,
            nodes,
            vec![WorkloadResource::from_deployment(workload)],
            &pods,
            Utc::now(),
        ))
    }

    fn test_node(snapshot: &TopologySnapshot) -> NodeEntry {
        let mut node = snapshot.nodes[0].clone();
        node.capacity = ResourceFigures {
            cpu_millicores: 4000,
            memory_bytes: 1 << 31,
        };
        node
    }

    fn container_stats_value(name: &str, start_offset_secs: i64, usage: i64) -> serde_json::Value {
        let base = Utc.timestamp_opt(1_714_557_600, 0).unwrap();
        serde_json::json!({
            "name": name,
            "startTime": (base + chrono::Duration::seconds(start_offset_secs)).to_rfc3339(),
            "cpu": {"time": base.to_rfc3339(), "usageCoreNanoSeconds": usage},
        })
    }

    fn container_stats(name: &str, start_offset_secs: i64, usage: i64) -> ContainerStats {
        serde_json::from_value(container_stats_value(name, start_offset_secs, usage)).unwrap()
    }

    #[test]
    fn test_dedup_keeps_latest_start_time() {
        let containers = vec![
            container_stats("web", 0, 100),
            container_stats("web", 5, 200),
            container_stats("sidecar", 0, 300),
        ];
        let kept = dedup_containers(&containers);
        assert_eq!(kept.len(), 2);
        let web = kept.iter().find(|c| c.name == "web").unwrap();
        assert_eq!(web.cpu.usage_core_nano_seconds, 200);
    }

    #[test]
    fn test_summary_emission_joins_topology() {
        let snapshot = test_snapshot();
        let node = test_node(&snapshot);
        let sink = MetricSink::new(Utc::now(), Arc::new(RateTable::new()));

        let summary: NodeSummary = serde_json::from_value(serde_json::json!({
            "node": {
                "cpu": {"time": "2024-05-01T10:00:00Z", "usageCoreNanoSeconds": 5000},
                "network": {"time": "2024-05-01T10:00:00Z", "rxBytes": 111, "txBytes": 222},
            },
            "pods": [
                {
                    "podRef": {"name": "api-7f9c4d-x2x9z", "namespace": "prod", "uid": "uid-1"},
                    "network": {"time": "2024-05-01T10:00:00Z", "rxBytes": 11, "txBytes": 22},
                    "containers": [container_stats_value("web", 0, 700)],
                },
                {
                    "podRef": {"name": "stranger", "namespace": "prod", "uid": "uid-2"},
                    "containers": [container_stats_value("web", 0, 1)],
                }
            ],
        }))
        .unwrap();

        let cumulative = emit_summary_metrics(&sink, &snapshot, &node, &summary);
        assert_eq!(cumulative.len(), 1);

        let records = sink.into_records();

        // Pod rx comes from the rx counter, not tx.
        let pod_rx = records
            .iter()
            .find(|r| r.scope == MetricScope::Pod && r.name == "network/rx")
            .expect("pod rx emitted");
        assert_eq!(pod_rx.value, 11);
        assert_eq!(pod_rx.pod_name, "api-7f9c4d-x2x9z");

        // The unresolvable pod contributed nothing.
        assert!(!records.iter().any(|r| r.pod_name == "stranger"));

        // Identifier columns always match the scope.
        for record in &records {
            assert!(
                record.identifiers_match_scope(),
                "{} violates its scope",
                record.name
            );
        }
    }

    #[test]
    fn test_cumulative_seconds_scaled_to_milliseconds() {
        let snapshot = test_snapshot();
        let node = test_node(&snapshot);
        let sink = MetricSink::new(Utc::now(), Arc::new(RateTable::new()));

        let summary: NodeSummary = serde_json::from_value(serde_json::json!({
            "node": {"cpu": {"time": "2024-05-01T10:00:00Z", "usageCoreNanoSeconds": 1}},
            "pods": [{
                "podRef": {"name": "api-7f9c4d-x2x9z", "namespace": "prod", "uid": "uid-1"},
                "containers": [container_stats_value("web", 0, 700)],
            }],
        }))
        .unwrap();
        let mut cumulative = emit_summary_metrics(&sink, &snapshot, &node, &summary);

        let samples = parse_exposition(concat!(
            "container_cpu_cfs_periods_total{container=\"web\",pod=\"uid-1\"} 42\n",
            "container_cpu_cfs_throttled_seconds_total{container=\"web\",pod=\"uid-1\"} 1.5\n",
            "container_cpu_cfs_periods_total{container=\"ghost\",pod=\"uid-1\"} 7\n",
        ));
        apply_cumulative_samples(&snapshot, &samples, &mut cumulative);
        emit_cumulative_metrics(&sink, &node, &summary, cumulative);

        let records = sink.into_records();
        let periods = records
            .iter()
            .find(|r| r.name == "container_cpu_cfs/periods_total")
            .expect("periods emitted");
        assert_eq!(periods.value, 42);

        let seconds = records
            .iter()
            .find(|r| r.name == "container_cpu_cfs_throttled/seconds_total")
            .expect("seconds emitted");
        assert_eq!(seconds.value, 1500);

        // Unmatched metrics default to zero rather than disappearing.
        let throttled = records
            .iter()
            .find(|r| r.name == "container_cpu_cfs_throttled/periods_total")
            .expect("throttled periods emitted");
        assert_eq!(throttled.value, 0);
    }

    #[tokio::test]
    async fn test_collect_without_nodes_still_emits_spec_metrics() {
        let identity = IdentitySpace::new(Uuid::new_v4(), Uuid::new_v4());
        let mut workload = Workload {
            metadata: ObjectMeta {
                name: "api".into(),
                namespace: "prod".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        workload.spec.template.spec.containers = vec![Container {
            name: "web".into(),
            resources: serde_json::from_value(serde_json::json!({
                "requests": {"cpu": "250m", "memory": "128Mi"},
                "limits": {"cpu": "1", "memory": "256Mi"},
            }))
            .unwrap(),
            ..Default::default()
        }];
        let snapshot = Arc::new(TopologySnapshot::build(
            &identity,
            Vec::new(),
            vec![WorkloadResource::from_deployment(workload)],
            &[],
            Utc::now(),
        ));

        let scraper = Arc::new(MetricsScraper::new(
            KubeletClient::new(KubeletConfig::default()).unwrap(),
            false,
        ));
        let outcome = scraper.collect(snapshot, Utc::now()).await;

        assert_eq!(outcome.failed_nodes, 0);
        assert!(outcome.raw_responses.is_none());

        let count = outcome
            .records
            .iter()
            .find(|r| r.name == "nodes/count" && r.tags.is_none())
            .expect("cluster node count emitted");
        assert_eq!(count.value, 0);

        let request = outcome
            .records
            .iter()
            .find(|r| r.name == "cpu/request")
            .expect("spec metrics survive with no reachable nodes");
        assert_eq!(request.value, 250);
        assert_eq!(request.node, Uuid::nil());

        let limit = outcome
            .records
            .iter()
            .find(|r| r.name == "memory/limit")
            .unwrap();
        assert_eq!(limit.value, 256 * (1 << 20));
    }
}
