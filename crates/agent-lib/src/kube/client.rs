//! REST client for the orchestration platform API
//!
//! The agent only needs two capabilities from the platform: listing
//! resources across all namespaces and applying strategic-merge patches to
//! workload controllers. Connection settings come either from the
//! in-cluster service-account environment or from explicit configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use super::resources::{
    mask_pod_spec, CronJob, LimitRange, List, Node, Pod, StatefulSet, Workload, WorkloadKind,
};

const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SERVICE_ACCOUNT_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Connection settings for the platform API.
#[derive(Debug, Clone)]
pub struct KubeConfig {
    /// Explicit API server URL; ignored when `in_cluster` is set.
    pub url: Option<String>,
    /// Resolve endpoint and credentials from the in-cluster environment.
    pub in_cluster: bool,
    /// Skip TLS verification.
    pub insecure: bool,
    /// Optional root CA bundle for the API server.
    pub root_ca_cert: Option<PathBuf>,
    /// Bearer token; falls back to the `KUBE_TOKEN` env var.
    pub token: Option<String>,
    /// Per-request deadline.
    pub timeout: Duration,
}

impl Default for KubeConfig {
    fn default() -> Self {
        Self {
            url: None,
            in_cluster: false,
            insecure: false,
            root_ca_cert: None,
            token: None,
            timeout: Duration::from_secs(20),
        }
    }
}

/// Platform API client: list resources, patch workloads.
#[derive(Clone)]
pub struct KubeClient {
    http: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl KubeClient {
    pub fn new(config: &KubeConfig) -> Result<Self> {
        let (base, token, ca) = if config.in_cluster {
            let host = std::env::var("KUBERNETES_SERVICE_HOST")
                .context("not running in-cluster: KUBERNETES_SERVICE_HOST is unset")?;
            let port =
                std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
            let token = std::fs::read_to_string(SERVICE_ACCOUNT_TOKEN)
                .context("unable to read service-account token")?
                .trim()
                .to_string();
            (
                format!("https://{host}:{port}"),
                Some(token),
                Some(PathBuf::from(SERVICE_ACCOUNT_CA)),
            )
        } else {
            let url = config
                .url
                .clone()
                .context("platform API URL is required outside the cluster")?;
            let token = config
                .token
                .clone()
                .or_else(|| std::env::var("KUBE_TOKEN").ok());
            (url, token, config.root_ca_cert.clone())
        };

        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if config.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(ca_path) = ca {
            if ca_path.exists() {
                let pem = std::fs::read(&ca_path)
                    .with_context(|| format!("unable to read root CA {}", ca_path.display()))?;
                let cert = reqwest::Certificate::from_pem(&pem)
                    .with_context(|| format!("invalid root CA {}", ca_path.display()))?;
                builder = builder.add_root_certificate(cert);
            }
        }

        let base = Url::parse(&base).with_context(|| format!("invalid platform URL {base}"))?;
        let http = builder.build().context("unable to build platform client")?;

        Ok(Self { http, base, token })
    }

    /// Test constructor against an arbitrary endpoint.
    pub fn with_endpoint(url: &str, token: Option<String>) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(20))
                .build()
                .context("unable to build platform client")?,
            base: Url::parse(url).with_context(|| format!("invalid platform URL {url}"))?,
            token,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        debug!(path, "platform list request");
        let url = self
            .base
            .join(path)
            .with_context(|| format!("invalid request path {path}"))?;
        let mut request = self.http.get(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("platform request {path} failed"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("platform request {path} returned {status}: {body}");
        }
        response
            .json::<T>()
            .await
            .with_context(|| format!("unable to decode platform response for {path}"))
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.get_json::<List<Node>>("/api/v1/nodes").await?.items)
    }

    pub async fn list_pods(&self) -> Result<Vec<Pod>> {
        let mut pods = self.get_json::<List<Pod>>("/api/v1/pods").await?.items;
        for pod in &mut pods {
            mask_pod_spec(&mut pod.spec);
        }
        Ok(pods)
    }

    pub async fn list_deployments(&self) -> Result<Vec<Workload>> {
        self.list_workloads("/apis/apps/v1/deployments").await
    }

    pub async fn list_stateful_sets(&self) -> Result<Vec<StatefulSet>> {
        let mut sets = self
            .get_json::<List<StatefulSet>>("/apis/apps/v1/statefulsets")
            .await?
            .items;
        for set in &mut sets {
            mask_pod_spec(&mut set.spec.template.spec);
        }
        Ok(sets)
    }

    pub async fn list_daemon_sets(&self) -> Result<Vec<Workload>> {
        self.list_workloads("/apis/apps/v1/daemonsets").await
    }

    pub async fn list_replica_sets(&self) -> Result<Vec<Workload>> {
        self.list_workloads("/apis/apps/v1/replicasets").await
    }

    pub async fn list_replication_controllers(&self) -> Result<Vec<Workload>> {
        self.list_workloads("/api/v1/replicationcontrollers").await
    }

    pub async fn list_cron_jobs(&self) -> Result<Vec<CronJob>> {
        let mut jobs = self
            .get_json::<List<CronJob>>("/apis/batch/v1/cronjobs")
            .await?
            .items;
        for job in &mut jobs {
            mask_pod_spec(&mut job.spec.job_template.spec.template.spec);
        }
        Ok(jobs)
    }

    pub async fn list_limit_ranges(&self) -> Result<Vec<LimitRange>> {
        Ok(self
            .get_json::<List<LimitRange>>("/api/v1/limitranges")
            .await?
            .items)
    }

    async fn list_workloads(&self, path: &str) -> Result<Vec<Workload>> {
        let mut items = self.get_json::<List<Workload>>(path).await?.items;
        for item in &mut items {
            mask_pod_spec(&mut item.spec.template.spec);
        }
        Ok(items)
    }

    pub async fn get_stateful_set(&self, namespace: &str, name: &str) -> Result<StatefulSet> {
        let mut set = self
            .get_json::<StatefulSet>(&format!(
                "/apis/apps/v1/namespaces/{namespace}/statefulsets/{name}"
            ))
            .await?;
        mask_pod_spec(&mut set.spec.template.spec);
        Ok(set)
    }

    /// Applies a strategic-merge patch to a workload controller.
    pub async fn patch_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        body: &serde_json::Value,
    ) -> Result<()> {
        let path = format!(
            "{}/namespaces/{namespace}/{}/{name}",
            api_group_path(kind),
            kind.resource_plural()
        );
        debug!(%kind, namespace, name, "platform patch request");
        let url = self
            .base
            .join(&path)
            .with_context(|| format!("invalid patch path {path}"))?;
        let mut request = self
            .http
            .patch(url)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/strategic-merge-patch+json",
            )
            .json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("patch of {kind} {namespace}/{name} failed"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("patch of {kind} {namespace}/{name} returned {status}: {body}");
        }
        Ok(())
    }
}

fn api_group_path(kind: WorkloadKind) -> &'static str {
    match kind {
        WorkloadKind::Deployment
        | WorkloadKind::StatefulSet
        | WorkloadKind::DaemonSet
        | WorkloadKind::ReplicaSet => "/apis/apps/v1",
        WorkloadKind::CronJob => "/apis/batch/v1",
        WorkloadKind::ReplicationController | WorkloadKind::OrphanPod => "/api/v1",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_group_paths() {
        assert_eq!(api_group_path(WorkloadKind::Deployment), "/apis/apps/v1");
        assert_eq!(api_group_path(WorkloadKind::CronJob), "/apis/batch/v1");
        assert_eq!(
            api_group_path(WorkloadKind::ReplicationController),
            "/api/v1"
        );
    }

    #[test]
    fn test_endpoint_constructor_rejects_bad_url() {
        assert!(KubeClient::with_endpoint("not a url", None).is_err());
        assert!(KubeClient::with_endpoint("https://10.0.0.1:6443", None).is_ok());
    }
}
