//! Supervisor
//!
//! Composes the session, scanner, scraper and executor; owns the metric
//! and analysis-data timers, the restart listener and the shutdown order:
//! stop producing, send Bye, wait for the session to drain, exit with the
//! mapped status code.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::executor::Executor;
use crate::gateway::{
    decode, encode, PacketHandler, PacketKind, PacketMetrics, PacketRawResources, PacketRestart,
    Reply, Session, SessionEnd, SessionState,
};
use crate::health::{components, ComponentHealth, HealthRegistry};
use crate::observability::AgentMetrics;
use crate::scanner::Scanner;
use crate::scraper::MetricsScraper;

/// Exit code for fatal failures, including authentication rejection.
pub const EXIT_FATAL: i32 = 1;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub metrics_interval: Duration,
    pub analysis_data_interval: Duration,
    pub opt_in_analysis_data: bool,
    pub metrics_enabled: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            metrics_interval: Duration::from_secs(60),
            analysis_data_interval: Duration::from_secs(300),
            opt_in_analysis_data: false,
            metrics_enabled: true,
        }
    }
}

/// Restart packets carry the status the process must exit with.
struct RestartHandler {
    restart_tx: mpsc::Sender<i32>,
}

#[async_trait]
impl PacketHandler for RestartHandler {
    async fn handle(&self, payload: &[u8]) -> Result<Option<Reply>> {
        let restart: PacketRestart = decode(payload)?;
        info!(status = restart.status, "restart requested by control plane");
        let _ = self.restart_tx.send(restart.status).await;
        Ok(None)
    }
}

pub struct Supervisor {
    session: Arc<Session>,
    scanner: Arc<Scanner>,
    scraper: Arc<MetricsScraper>,
    executor: Arc<Executor>,
    health: HealthRegistry,
    metrics: AgentMetrics,
    config: SupervisorConfig,
    shutdown: broadcast::Sender<()>,
}

impl Supervisor {
    pub fn new(
        session: Arc<Session>,
        scanner: Arc<Scanner>,
        scraper: Arc<MetricsScraper>,
        executor: Arc<Executor>,
        health: HealthRegistry,
        metrics: AgentMetrics,
        config: SupervisorConfig,
    ) -> Arc<Self> {
        let (shutdown, _) = broadcast::channel(1);
        Arc::new(Self {
            session,
            scanner,
            scraper,
            executor,
            health,
            metrics,
            config,
            shutdown,
        })
    }

    /// Runs the agent until a shutdown signal, a restart packet or a
    /// terminal session failure. Returns the process exit code.
    pub async fn run(self: Arc<Self>) -> i32 {
        let (restart_tx, mut restart_rx) = mpsc::channel(1);
        let executor_clone: Arc<Executor> = Arc::clone(&self.executor);
        let decision_listener: Arc<dyn PacketHandler> = executor_clone;
        self.session
            .add_listener(PacketKind::Decision, decision_listener)
            .await;
        self.session
            .add_listener(PacketKind::Restart, Arc::new(RestartHandler { restart_tx }))
            .await;

        let mut session_task = tokio::spawn(Arc::clone(&self.session).run());

        if let Err(error) = self.scanner.rescan().await {
            warn!(error = %error, "initial topology scan failed, retrying on schedule");
            self.health
                .update(components::SCANNER, ComponentHealth::degraded("initial scan failed"))
                .await;
        }

        tokio::spawn(Arc::clone(&self.scanner).run(self.shutdown.subscribe()));
        tokio::spawn(Arc::clone(&self).health_loop(self.shutdown.subscribe()));
        if self.config.metrics_enabled {
            tokio::spawn(Arc::clone(&self).metrics_loop(self.shutdown.subscribe()));
        } else {
            info!("metrics collection disabled");
        }
        if self.config.opt_in_analysis_data {
            tokio::spawn(Arc::clone(&self).analysis_loop(self.shutdown.subscribe()));
        }

        let mut session_ended = false;
        let exit_code = tokio::select! {
            _ = shutdown_signal() => {
                info!("shutdown signal received");
                0
            }
            Some(status) = restart_rx.recv() => status,
            end = &mut session_task => {
                session_ended = true;
                match end {
                    Ok(SessionEnd::AuthRejected(_)) => EXIT_FATAL,
                    Ok(SessionEnd::Clean) => 0,
                    Err(_) => EXIT_FATAL,
                }
            }
        };

        let _ = self.shutdown.send(());
        self.session.done(exit_code).await;
        self.session.wait_exit().await;
        if !session_ended {
            let _ = session_task.await;
        }
        info!(exit_code, "agent stopped");
        exit_code
    }

    /// One scrape cycle per tick; cycles never overlap and each batch is
    /// queued before the next cycle starts. A panic inside a cycle becomes
    /// a final Bye through the session's recover trap.
    async fn metrics_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.config.metrics_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let cycle = AssertUnwindSafe(self.run_scrape_cycle()).catch_unwind().await;
                    if let Err(panic) = cycle {
                        let message = panic_message(&panic);
                        self.session.recover(&message).await;
                        break;
                    }
                }
                _ = shutdown.recv() => {
                    info!("shutting down metrics loop");
                    break;
                }
            }
        }
    }

    async fn run_scrape_cycle(&self) {
        let started = Instant::now();
        let snapshot = self.scanner.snapshot().await;
        self.metrics.set_snapshot_size(
            snapshot.nodes.len() as i64,
            snapshot.applications.len() as i64,
        );

        let outcome = Arc::clone(&self.scraper).collect(snapshot, Utc::now()).await;
        let measurements = outcome.records.len();

        if outcome.failed_nodes > 0 {
            self.health
                .update(
                    components::SCRAPER,
                    ComponentHealth::degraded(format!("{} nodes degraded", outcome.failed_nodes)),
                )
                .await;
        } else {
            self.health
                .update(components::SCRAPER, ComponentHealth::healthy())
                .await;
        }

        let batch = PacketMetrics {
            metrics: outcome.records.into_iter().map(Into::into).collect(),
        };
        match encode(&batch) {
            Ok(payload) => {
                if self
                    .session
                    .send_batch(PacketKind::Metrics, payload)
                    .await
                    .is_ok()
                {
                    self.metrics.inc_batches_sent();
                }
            }
            Err(error) => warn!(error = %error, "unable to encode metric batch"),
        }

        if let Some(raw_responses) = outcome.raw_responses {
            if let Ok(data) = serde_json::to_value(&raw_responses) {
                if let Ok(payload) = encode(&PacketRawResources { data }) {
                    let _ = self
                        .session
                        .send_batch(PacketKind::RawResources, payload)
                        .await;
                }
            }
        }

        self.metrics.observe_scrape_cycle(
            started.elapsed().as_secs_f64(),
            measurements as i64,
            outcome.failed_nodes as u64,
        );
    }

    /// Ships the masked raw topology listings on the opt-in cadence.
    async fn analysis_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.config.analysis_data_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(data) = self.scanner.take_raw_resources().await else {
                        continue;
                    };
                    if let Ok(payload) = encode(&PacketRawResources { data }) {
                        let _ = self
                            .session
                            .send_batch(PacketKind::RawResources, payload)
                            .await;
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    /// Keeps probe state and session counters current.
    async fn health_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let state = self.session.state();
                    self.health.set_ready(state == SessionState::Authenticated).await;
                    let gateway_health = match state {
                        SessionState::Authenticated => ComponentHealth::healthy(),
                        SessionState::Closed => ComponentHealth::unhealthy("session closed"),
                        _ => ComponentHealth::degraded("reconnecting"),
                    };
                    self.health.update(components::GATEWAY, gateway_health).await;
                    self.metrics.set_gateway_counters(
                        self.session.dropped_frames(),
                        self.session.reconnects(),
                    );
                }
                _ = shutdown.recv() => break,
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("unable to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "scrape cycle panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*boxed), "boom");

        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("kaput"));
        assert_eq!(panic_message(&*boxed), "kaput");

        let boxed: Box<dyn std::any::Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(&*boxed), "scrape cycle panicked");
    }

    #[test]
    fn test_supervisor_config_defaults() {
        let config = SupervisorConfig::default();
        assert_eq!(config.metrics_interval, Duration::from_secs(60));
        assert_eq!(config.analysis_data_interval, Duration::from_secs(300));
        assert!(config.metrics_enabled);
        assert!(!config.opt_in_analysis_data);
    }
}
