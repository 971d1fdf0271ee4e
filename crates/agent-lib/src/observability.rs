//! Observability infrastructure for the agent itself
//!
//! Provides Prometheus metrics about the agent's own pipeline: scrape
//! cycle latency, batch delivery, queue drops, reconnects and decision
//! outcomes. Exposed through the binary's metrics endpoint.

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;

/// Histogram buckets for scrape cycle latency (in seconds)
const CYCLE_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    scrape_cycle_seconds: Histogram,
    scrape_measurements: IntGauge,
    scrape_failed_nodes: IntCounter,
    batches_sent: IntCounter,
    batches_dropped: IntCounter,
    gateway_reconnects: IntCounter,
    snapshot_nodes: IntGauge,
    snapshot_applications: IntGauge,
    decision_results: IntCounterVec,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            scrape_cycle_seconds: register_histogram!(
                "cluster_agent_scrape_cycle_seconds",
                "Time spent collecting one full metric batch",
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register scrape_cycle_seconds"),

            scrape_measurements: register_int_gauge!(
                "cluster_agent_scrape_measurements",
                "Measurements produced by the last scrape cycle"
            )
            .expect("Failed to register scrape_measurements"),

            scrape_failed_nodes: register_int_counter!(
                "cluster_agent_scrape_failed_nodes_total",
                "Nodes degraded across all scrape cycles"
            )
            .expect("Failed to register scrape_failed_nodes"),

            batches_sent: register_int_counter!(
                "cluster_agent_batches_sent_total",
                "Metric batches handed to the gateway session"
            )
            .expect("Failed to register batches_sent"),

            batches_dropped: register_int_counter!(
                "cluster_agent_batches_dropped_total",
                "Batches evicted from the outbound queue"
            )
            .expect("Failed to register batches_dropped"),

            gateway_reconnects: register_int_counter!(
                "cluster_agent_gateway_reconnects_total",
                "Gateway session reconnect attempts"
            )
            .expect("Failed to register gateway_reconnects"),

            snapshot_nodes: register_int_gauge!(
                "cluster_agent_snapshot_nodes",
                "Nodes in the current topology snapshot"
            )
            .expect("Failed to register snapshot_nodes"),

            snapshot_applications: register_int_gauge!(
                "cluster_agent_snapshot_applications",
                "Applications in the current topology snapshot"
            )
            .expect("Failed to register snapshot_applications"),

            decision_results: register_int_counter_vec!(
                "cluster_agent_decision_results_total",
                "Decision outcomes reported to the control plane",
                &["status"]
            )
            .expect("Failed to register decision_results"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    /// Record one scrape cycle
    pub fn observe_scrape_cycle(&self, duration_secs: f64, measurements: i64, failed_nodes: u64) {
        self.inner().scrape_cycle_seconds.observe(duration_secs);
        self.inner().scrape_measurements.set(measurements);
        self.inner().scrape_failed_nodes.inc_by(failed_nodes);
    }

    /// Record a batch handed to the session
    pub fn inc_batches_sent(&self) {
        self.inner().batches_sent.inc();
    }

    /// Track the session's cumulative drop and reconnect counters
    pub fn set_gateway_counters(&self, dropped_total: u64, reconnects_total: u64) {
        let inner = self.inner();
        let dropped_seen = inner.batches_dropped.get();
        if dropped_total > dropped_seen {
            inner.batches_dropped.inc_by(dropped_total - dropped_seen);
        }
        let reconnects_seen = inner.gateway_reconnects.get();
        if reconnects_total > reconnects_seen {
            inner
                .gateway_reconnects
                .inc_by(reconnects_total - reconnects_seen);
        }
    }

    /// Update snapshot size gauges
    pub fn set_snapshot_size(&self, nodes: i64, applications: i64) {
        self.inner().snapshot_nodes.set(nodes);
        self.inner().snapshot_applications.set(applications);
    }

    /// Count one decision outcome
    pub fn inc_decision_result(&self, status: &str) {
        self.inner()
            .decision_results
            .with_label_values(&[status])
            .inc();
    }
}
