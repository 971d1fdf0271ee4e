//! HTTP client for the per-node scrape endpoints
//!
//! Both node resources are optional on older platform versions: a 404 (or
//! the platform's "could not find the requested resource" error body)
//! short-circuits the retry loop and yields an empty payload without an
//! error. Everything else is retried with a bounded, wrapping backoff.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

/// Error-body marker returned by proxied endpoints that hide the status
/// code; kept as a fallback next to the status check.
const RESOURCE_ABSENT_MARKER: &str = "the server could not find the requested resource";

#[derive(Debug, Clone)]
pub struct KubeletConfig {
    /// Node endpoint port.
    pub port: u16,
    /// Base sleep of the backoff policy; multiplied by 1..=10, wrapping.
    pub backoff_sleep: Duration,
    /// Attempts before a node is degraded for the cycle.
    pub max_retries: u32,
    /// Blanket per-request deadline.
    pub timeout: Duration,
}

impl Default for KubeletConfig {
    fn default() -> Self {
        Self {
            port: 10255,
            backoff_sleep: Duration::from_millis(300),
            max_retries: 5,
            timeout: Duration::from_secs(20),
        }
    }
}

/// What one fetch attempt produced.
enum Fetched {
    Body(String),
    /// The resource does not exist on this node; not an error.
    Absent,
}

/// Client for the two node scrape resources.
#[derive(Clone)]
pub struct KubeletClient {
    http: reqwest::Client,
    config: KubeletConfig,
}

impl KubeletClient {
    pub fn new(config: KubeletConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("unable to build node scrape client")?;
        Ok(Self { http, config })
    }

    /// Fetches a node resource with the bounded backoff policy.
    ///
    /// Returns `Ok(None)` when the resource is absent on the node.
    pub async fn fetch_with_backoff(&self, address: &str, path: &str) -> Result<Option<String>> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.fetch_once(address, path).await {
                Ok(Fetched::Body(body)) => return Ok(Some(body)),
                Ok(Fetched::Absent) => return Ok(None),
                Err(error) => {
                    if attempt >= self.config.max_retries {
                        return Err(error.context(format!(
                            "max retries ({}) exceeded for {path} on {address}",
                            self.config.max_retries
                        )));
                    }
                    let timeout = self.backoff_delay(attempt);
                    warn!(
                        node = address,
                        path,
                        retry = attempt,
                        delay_ms = timeout.as_millis() as u64,
                        error = %error,
                        "node scrape failed, retrying"
                    );
                    tokio::time::sleep(timeout).await;
                }
            }
        }
    }

    async fn fetch_once(&self, address: &str, path: &str) -> Result<Fetched> {
        let url = format!("http://{address}:{}/{path}", self.config.port);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .with_context(|| format!("unable to read response from {url}"))?;

        interpret_response(status.as_u16(), body)
            .with_context(|| format!("{url} returned an error"))
    }

    /// `base * (((attempt-1) mod 10) + 1)`: 300ms, 600ms, ... 3s, 300ms.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        self.config.backoff_sleep * (((attempt - 1) % 10) + 1)
    }
}

fn interpret_response(status: u16, body: String) -> Result<Fetched> {
    if status == 404 || body.contains(RESOURCE_ABSENT_MARKER) {
        return Ok(Fetched::Absent);
    }
    if !(200..300).contains(&status) {
        anyhow::bail!("status {status}: {body}");
    }
    Ok(Fetched::Body(body))
}
