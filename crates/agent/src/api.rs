//! HTTP API for probes and Prometheus metrics
//!
//! Served next to the agent: `/healthz` and `/readyz` back the platform
//! probes, `/metrics` exposes the agent's own pipeline counters and
//! `/version` reports build and protocol versions.

use agent_lib::gateway::{PROTOCOL_MAJOR_VERSION, PROTOCOL_MINOR_VERSION};
use agent_lib::health::{ComponentStatus, HealthRegistry};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Shared state behind the probe routes
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub agent_version: &'static str,
}

#[derive(Serialize)]
struct VersionResponse {
    agent: &'static str,
    protocol_major: u16,
    protocol_minor: u16,
}

/// Liveness: degraded components are still operational.
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;
    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(health))
}

/// Readiness: the agent is ready once the gateway session authenticated.
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;
    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(readiness))
}

async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(error) = encoder.encode(&families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            error.to_string().into_bytes(),
        );
    }
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

async fn version(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(VersionResponse {
        agent: state.agent_version,
        protocol_major: PROTOCOL_MAJOR_VERSION,
        protocol_minor: PROTOCOL_MINOR_VERSION,
    })
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/version", get(version))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);
    let addr = format!("0.0.0.0:{port}");
    info!(addr = %addr, "starting probe API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
