//! Typed view of the node summary document
//!
//! The summary endpoint returns one JSON document per node with a node
//! block and per-pod / per-container usage samples. Every field is
//! optional on the wire; missing values decode to defaults so a partial
//! document still yields whatever it carries.

use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeSummary {
    pub node: NodeStats,
    pub pods: Vec<PodStats>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeStats {
    pub cpu: CpuStats,
    pub memory: MemoryStats,
    pub fs: FsStats,
    pub network: NetworkStats,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodStats {
    pub pod_ref: PodReference,
    pub containers: Vec<ContainerStats>,
    pub network: NetworkStats,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodReference {
    pub name: String,
    pub namespace: String,
    pub uid: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerStats {
    pub name: String,
    pub start_time: Option<DateTime<Utc>>,
    pub cpu: CpuStats,
    pub memory: MemoryStats,
    #[serde(rename = "rootfs")]
    pub root_fs: FsStats,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CpuStats {
    pub time: Option<DateTime<Utc>>,
    pub usage_core_nano_seconds: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryStats {
    pub time: Option<DateTime<Utc>>,
    pub rss_bytes: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FsStats {
    pub time: Option<DateTime<Utc>>,
    pub used_bytes: i64,
    pub capacity_bytes: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkStats {
    pub time: Option<DateTime<Utc>>,
    pub rx_bytes: i64,
    pub rx_errors: i64,
    pub tx_bytes: i64,
    pub tx_errors: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "node": {
            "cpu": {"time": "2024-05-01T10:00:00Z", "usageCoreNanoSeconds": 123456789},
            "memory": {"time": "2024-05-01T10:00:00Z", "rssBytes": 1048576},
            "fs": {"time": "2024-05-01T10:00:00Z", "usedBytes": 2048, "capacityBytes": 4096},
            "network": {"time": "2024-05-01T10:00:00Z", "rxBytes": 10, "rxErrors": 1, "txBytes": 20, "txErrors": 2}
        },
        "pods": [
            {
                "podRef": {"name": "api-1", "namespace": "prod", "uid": "uid-1"},
                "network": {"time": "2024-05-01T10:00:00Z", "rxBytes": 5, "txBytes": 6},
                "containers": [
                    {
                        "name": "web",
                        "startTime": "2024-05-01T09:00:00Z",
                        "cpu": {"time": "2024-05-01T10:00:00Z", "usageCoreNanoSeconds": 777},
                        "memory": {"rssBytes": 99},
                        "rootfs": {"usedBytes": 11}
                    }
                ]
            }
        ]
    }"#;

    #[test]
    fn test_decode_summary() {
        let summary: NodeSummary = serde_json::from_str(SAMPLE).expect("summary decodes");
        assert_eq!(summary.node.cpu.usage_core_nano_seconds, 123_456_789);
        assert_eq!(summary.node.network.rx_bytes, 10);
        assert_eq!(summary.pods.len(), 1);

        let pod = &summary.pods[0];
        assert_eq!(pod.pod_ref.namespace, "prod");
        assert_eq!(pod.pod_ref.uid, "uid-1");
        assert_eq!(pod.containers[0].name, "web");
        assert_eq!(pod.containers[0].root_fs.used_bytes, 11);
        // Missing times decode to None, missing values to zero.
        assert!(pod.containers[0].memory.time.is_none());
        assert_eq!(pod.containers[0].memory.rss_bytes, 99);
    }

    #[test]
    fn test_decode_empty_document() {
        let summary: NodeSummary = serde_json::from_str("{}").expect("empty summary decodes");
        assert!(summary.pods.is_empty());
        assert_eq!(summary.node.cpu.usage_core_nano_seconds, 0);
        assert!(summary.node.cpu.time.is_none());
    }
}
