//! Agent library for cluster telemetry and control
//!
//! This crate provides the core functionality for:
//! - Topology scanning and identifier resolution
//! - Per-node metrics scraping and rate calculation
//! - The framed gateway session to the control plane
//! - Decision execution against workload controllers
//! - Health checks and observability

pub mod executor;
pub mod gateway;
pub mod health;
pub mod kube;
pub mod models;
pub mod observability;
pub mod scanner;
pub mod scraper;
pub mod supervisor;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::AgentMetrics;
pub use supervisor::{Supervisor, SupervisorConfig};
