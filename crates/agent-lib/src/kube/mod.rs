//! Platform API access
//!
//! This module provides:
//! - A REST client for listing cluster resources and patching workloads
//! - Minimal typed views of the platform objects the agent reads
//! - The secrets-hygiene pass applied to every outgoing pod spec

mod client;
mod resources;

pub use client::{KubeClient, KubeConfig};
pub use resources::{
    mask_pod_spec, Container, CronJob, EnvVar, LimitRange, List, Node, ObjectMeta, OwnerReference,
    Pod, PodSpec, Quantity, ResourceRequirements, StatefulSet, Workload, WorkloadKind,
    WorkloadResource, MASKED_VALUE,
};
