//! Cluster telemetry and control agent
//!
//! Discovers the cluster's workload topology, scrapes per-node resource
//! usage, streams metric batches to the control plane over a persistent
//! framed channel and executes the scaling decisions it sends back.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agent_lib::executor::Executor;
use agent_lib::gateway::{Session, SessionConfig};
use agent_lib::health::{components, HealthRegistry};
use agent_lib::kube::{KubeClient, KubeConfig};
use agent_lib::observability::AgentMetrics;
use agent_lib::scanner::{IdentitySpace, Scanner, ScannerConfig};
use agent_lib::scraper::{KubeletClient, KubeletConfig, MetricsScraper};
use agent_lib::supervisor::{Supervisor, SupervisorConfig, EXIT_FATAL};
use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let exit_code = match run().await {
        Ok(code) => code,
        Err(error) => {
            error!(error = %format!("{error:#}"), "fatal initialization error");
            EXIT_FATAL
        }
    };
    std::process::exit(exit_code);
}

async fn run() -> Result<i32> {
    info!(version = AGENT_VERSION, "cluster agent starting");

    let config = config::AgentConfig::load()?;
    let secret = config.decoded_secret()?;

    let mut session_config = SessionConfig::new(
        config.gateway_url.clone(),
        config.account_id,
        config.cluster_id,
    );
    session_config.secret = secret;
    session_config.agent_version = AGENT_VERSION.to_string();
    session_config.handshake_timeout = Duration::from_secs(config.timeout_proto_handshake_secs);
    session_config.read_timeout = Duration::from_secs(config.timeout_proto_read_secs);
    session_config.write_timeout = Duration::from_secs(config.timeout_proto_write_secs);
    session_config.reconnect_timeout = Duration::from_secs(config.timeout_proto_reconnect_secs);
    session_config.backoff_step = Duration::from_millis(config.timeout_proto_backoff_ms);
    session_config.send_logs = !config.no_send_logs;
    session_config.outbound_queue_size = config.events_buffer_size * 16;
    let session = Session::new(session_config);

    let kube = KubeClient::new(&KubeConfig {
        url: config.kube_url.clone(),
        in_cluster: config.kube_incluster,
        insecure: config.kube_insecure,
        root_ca_cert: config.kube_root_ca_cert.clone().map(PathBuf::from),
        token: config.kube_token.clone(),
        timeout: Duration::from_secs(config.kube_timeout_secs),
    })
    .context("unable to initialize the platform client")?;

    let identity = IdentitySpace::new(config.account_id, config.cluster_id);
    let scanner = Arc::new(Scanner::new(
        kube.clone(),
        identity,
        ScannerConfig {
            interval: Duration::from_secs(60),
            skip_namespaces: config.skip_namespace_patterns(),
            keep_raw_resources: config.opt_in_analysis_data,
        },
    ));

    let kubelet = KubeletClient::new(KubeletConfig {
        port: config.kubelet_port,
        backoff_sleep: Duration::from_millis(config.kubelet_backoff_sleep_ms),
        max_retries: config.kubelet_backoff_max_retries,
        timeout: Duration::from_secs(20),
    })
    .context("unable to initialize the node scrape client")?;
    let scraper = Arc::new(MetricsScraper::new(kubelet, config.opt_in_analysis_data));

    let metrics = AgentMetrics::new();

    let executor = Arc::new(Executor::new(
        kube,
        Arc::clone(&scanner),
        metrics.clone(),
        config.dry_run,
    ));

    let health_registry = HealthRegistry::new();
    health_registry.register(components::SCANNER).await;
    health_registry.register(components::SCRAPER).await;
    health_registry.register(components::GATEWAY).await;
    health_registry.register(components::EXECUTOR).await;

    let app_state = Arc::new(api::AppState {
        health_registry: health_registry.clone(),
        agent_version: AGENT_VERSION,
    });
    tokio::spawn(api::serve(config.api_port, app_state));

    let supervisor = Supervisor::new(
        session,
        scanner,
        scraper,
        executor,
        health_registry,
        metrics,
        SupervisorConfig {
            metrics_interval: Duration::from_secs(config.metrics_interval_secs),
            analysis_data_interval: Duration::from_secs(config.analysis_data_interval_secs),
            opt_in_analysis_data: config.opt_in_analysis_data,
            metrics_enabled: !config.disable_metrics,
        },
    );

    Ok(supervisor.run().await)
}
