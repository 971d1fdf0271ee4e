//! Agent configuration
//!
//! The full configuration record, assembled once at the boundary from the
//! environment; components receive only the fields they need.

use anyhow::{Context, Result};
use serde::Deserialize;
use uuid::Uuid;

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Control-plane gateway endpoint
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,

    /// Account identifier at the control plane
    pub account_id: Uuid,

    /// Cluster identifier at the control plane
    pub cluster_id: Uuid,

    /// Base64-encoded client secret
    pub client_secret: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Explicit platform API URL (ignored in-cluster)
    #[serde(default)]
    pub kube_url: Option<String>,

    /// Resolve platform access from the in-cluster environment
    #[serde(default)]
    pub kube_incluster: bool,

    /// Skip TLS verification towards the platform API
    #[serde(default)]
    pub kube_insecure: bool,

    /// Root CA bundle for the platform API
    #[serde(default)]
    pub kube_root_ca_cert: Option<String>,

    /// Bearer token for the platform API
    #[serde(default)]
    pub kube_token: Option<String>,

    /// Platform API request deadline in seconds
    #[serde(default = "default_kube_timeout_secs")]
    pub kube_timeout_secs: u64,

    /// Namespace glob patterns to exclude, comma separated
    #[serde(default)]
    pub skip_namespaces: String,

    /// Node scrape endpoint port
    #[serde(default = "default_kubelet_port")]
    pub kubelet_port: u16,

    /// Node scrape backoff base in milliseconds
    #[serde(default = "default_kubelet_backoff_sleep_ms")]
    pub kubelet_backoff_sleep_ms: u64,

    /// Node scrape retry bound
    #[serde(default = "default_kubelet_backoff_max_retries")]
    pub kubelet_backoff_max_retries: u32,

    /// Metrics collection and delivery cadence in seconds
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,

    /// Buffered batches per outbound queue slot; the session queue is
    /// sized as a multiple of this
    #[serde(default = "default_events_buffer_size")]
    pub events_buffer_size: usize,

    /// Gateway handshake deadline in seconds
    #[serde(default = "default_timeout_proto_handshake_secs")]
    pub timeout_proto_handshake_secs: u64,

    /// Gateway write deadline in seconds
    #[serde(default = "default_timeout_proto_write_secs")]
    pub timeout_proto_write_secs: u64,

    /// Gateway read deadline in seconds
    #[serde(default = "default_timeout_proto_read_secs")]
    pub timeout_proto_read_secs: u64,

    /// Gateway reconnect baseline in seconds
    #[serde(default = "default_timeout_proto_reconnect_secs")]
    pub timeout_proto_reconnect_secs: u64,

    /// Gateway backoff step in milliseconds
    #[serde(default = "default_timeout_proto_backoff_ms")]
    pub timeout_proto_backoff_ms: u64,

    /// Ship anonymized raw documents for analysis
    #[serde(default)]
    pub opt_in_analysis_data: bool,

    /// Analysis data cadence in seconds
    #[serde(default = "default_analysis_data_interval_secs")]
    pub analysis_data_interval_secs: u64,

    /// Disable metrics collection and delivery
    #[serde(default)]
    pub disable_metrics: bool,

    /// Log decisions without patching
    #[serde(default)]
    pub dry_run: bool,

    /// Do not mirror logs to the control plane
    #[serde(default)]
    pub no_send_logs: bool,
}

fn default_gateway_url() -> String {
    "ws://gateway.agent.example.cloud".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_kube_timeout_secs() -> u64 {
    20
}

fn default_kubelet_port() -> u16 {
    10255
}

fn default_kubelet_backoff_sleep_ms() -> u64 {
    300
}

fn default_kubelet_backoff_max_retries() -> u32 {
    5
}

fn default_metrics_interval_secs() -> u64 {
    60
}

fn default_events_buffer_size() -> usize {
    20
}

fn default_timeout_proto_handshake_secs() -> u64 {
    10
}

fn default_timeout_proto_write_secs() -> u64 {
    60
}

fn default_timeout_proto_read_secs() -> u64 {
    60
}

fn default_timeout_proto_reconnect_secs() -> u64 {
    1
}

fn default_timeout_proto_backoff_ms() -> u64 {
    300
}

fn default_analysis_data_interval_secs() -> u64 {
    300
}

impl AgentConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("AGENT").try_parsing(true))
            .build()
            .context("unable to read configuration from the environment")?;

        config
            .try_deserialize()
            .context("invalid agent configuration")
    }

    /// Decode the base64 client secret; malformed secrets are fatal.
    pub fn decoded_secret(&self) -> Result<Vec<u8>> {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .decode(self.client_secret.trim())
            .context("unable to decode the base64 client secret")
    }

    /// Namespace skip patterns as a list.
    pub fn skip_namespace_patterns(&self) -> Vec<String> {
        self.skip_namespaces
            .split(',')
            .map(str::trim)
            .filter(|pattern| !pattern.is_empty())
            .map(str::to_string)
            .collect()
    }
}
