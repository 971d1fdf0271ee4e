//! Typed payloads for the gateway packet kinds
//!
//! Payloads are JSON documents; [`encode`] and [`decode`] are the only two
//! functions that touch the serialized form so the framing layer stays
//! byte-agnostic.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{MetricRecord, MetricScope};

/// Protocol major version; the gateway rejects a mismatch.
pub const PROTOCOL_MAJOR_VERSION: u16 = 2;
/// Protocol minor version; a mismatch is warned about and tolerated.
pub const PROTOCOL_MINOR_VERSION: u16 = 4;

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).context("unable to encode packet payload")
}

pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).context("unable to decode packet payload")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketAuth {
    pub account_id: Uuid,
    pub cluster_id: Uuid,
    /// Base64 of the decoded client secret.
    pub secret: String,
    pub agent_version: String,
    /// Unique id of this process start.
    pub start_id: Uuid,
    pub protocol_major: u16,
    pub protocol_minor: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PacketAuthOk {
    #[serde(default)]
    pub protocol_major: u16,
    #[serde(default)]
    pub protocol_minor: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PacketAuthReject {
    #[serde(default)]
    pub reason: String,
}

/// One measurement in wire form; timestamps travel as Unix nanoseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMetric {
    pub name: String,
    #[serde(rename = "type")]
    pub scope: MetricScope,
    pub node: Uuid,
    pub application: Uuid,
    pub service: Uuid,
    pub container: Uuid,
    pub pod_name: String,
    pub timestamp: i64,
    pub value: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
}

impl From<MetricRecord> for WireMetric {
    fn from(record: MetricRecord) -> Self {
        Self {
            name: record.name,
            scope: record.scope,
            node: record.node,
            application: record.application,
            service: record.service,
            container: record.container,
            pod_name: record.pod_name,
            timestamp: record.timestamp.timestamp_nanos_opt().unwrap_or(0),
            value: record.value,
            tags: record.tags,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PacketMetrics {
    pub metrics: Vec<WireMetric>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketRawResources {
    pub data: serde_json::Value,
}

/// Desired resource figures for one container, merged by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestLimit {
    /// Millicores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<i64>,
    /// Mebibytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerResources {
    pub name: String,
    #[serde(default)]
    pub requests: RequestLimit,
    #[serde(default)]
    pub limits: RequestLimit,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TotalResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i64>,
    #[serde(default)]
    pub containers: Vec<ContainerResources>,
}

/// A scaling/resource-patch decision pushed by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketDecision {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub total_resources: TotalResources,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionStatus {
    Applied,
    Invalid,
    Skipped,
    Failed,
}

impl DecisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionStatus::Applied => "applied",
            DecisionStatus::Invalid => "invalid",
            DecisionStatus::Skipped => "skipped",
            DecisionStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketDecisionResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub status: DecisionStatus,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PacketRestart {
    #[serde(default)]
    pub status: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketLog {
    pub level: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PacketBye {
    #[serde(default)]
    pub status: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_wire_metric_from_record() {
        let now = Utc::now();
        let record = MetricRecord {
            name: "cpu/usage_rate".into(),
            scope: MetricScope::Node,
            node: Uuid::new_v4(),
            application: Uuid::nil(),
            service: Uuid::nil(),
            container: Uuid::nil(),
            pod_name: String::new(),
            timestamp: now,
            value: 1099,
            tags: None,
        };

        let wire = WireMetric::from(record.clone());
        assert_eq!(wire.timestamp, now.timestamp_nanos_opt().unwrap());
        assert_eq!(wire.value, 1099);

        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["type"], "node");
        assert!(json.get("tags").is_none());
    }

    #[test]
    fn test_decision_round_trip() {
        let payload = encode(&PacketDecision {
            id: Some(Uuid::new_v4()),
            kind: "Deployment".into(),
            name: "api".into(),
            namespace: "prod".into(),
            total_resources: TotalResources {
                replicas: Some(3),
                containers: vec![ContainerResources {
                    name: "web".into(),
                    requests: RequestLimit {
                        cpu: Some(250),
                        memory: Some(128),
                    },
                    limits: RequestLimit::default(),
                }],
            },
        })
        .unwrap();

        let decoded: PacketDecision = decode(&payload).unwrap();
        assert_eq!(decoded.total_resources.replicas, Some(3));
        assert_eq!(decoded.total_resources.containers[0].requests.cpu, Some(250));
    }

    #[test]
    fn test_decision_result_statuses() {
        let encoded = encode(&PacketDecisionResult {
            id: None,
            status: DecisionStatus::Skipped,
            reason: "UpdateStrategy not RollingUpdate".into(),
        })
        .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(json["status"], "skipped");
    }
}
