//! HTTP readiness polling for freshly spawned backends

use crate::config::ManagerConfig;
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::{Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("timeout after {timeout:?} waiting for HTTP {url}")]
    Timeout { url: String, timeout: Duration },
    #[error("invalid readiness url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// How long and how often a new backend is polled before giving up.
///
/// The whole budget is `attempts * timeout`; each window polls every
/// `interval`, and every single request is bounded by `interval` too.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub attempts: u32,
    pub timeout: Duration,
    pub interval: Duration,
    pub path: String,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self::from(&ManagerConfig::default())
    }
}

impl From<&ManagerConfig> for ReadinessPolicy {
    fn from(config: &ManagerConfig) -> Self {
        Self {
            attempts: config.readiness_attempts.max(1),
            timeout: Duration::from_secs(config.readiness_timeout_secs),
            interval: Duration::from_millis(config.readiness_interval_ms),
            path: config.readiness_path.clone(),
        }
    }
}

/// Decides when a backend listening on `host` is ready for traffic
pub trait ReadinessProbe: Send + Sync + 'static {
    fn wait_ready(&self, host: &str) -> impl Future<Output = Result<(), ProbeError>> + Send;
}

/// Polls `http://{host}{path}` until a 2xx response
pub struct HttpProbe {
    client: Client<HttpConnector, Empty<Bytes>>,
    policy: ReadinessPolicy,
}

impl HttpProbe {
    pub fn new(policy: ReadinessPolicy) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        // Fresh backends come and go; never reuse a connection across them
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        Self { client, policy }
    }
}

impl ReadinessProbe for HttpProbe {
    fn wait_ready(&self, host: &str) -> impl Future<Output = Result<(), ProbeError>> + Send {
        let url = format!("http://{}{}", host, self.policy.path);
        async move {
            let mut last_error = None;
            for attempt in 1..=self.policy.attempts {
                match wait_for_http(&self.client, &url, self.policy.timeout, self.policy.interval)
                    .await
                {
                    Ok(()) => {
                        info!(url, attempt, "Backend is ready");
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(url, attempt, attempts = self.policy.attempts, error = %e, "Readiness window elapsed");
                        last_error = Some(e);
                    }
                }
            }
            Err(last_error.unwrap_or(ProbeError::Timeout {
                url,
                timeout: self.policy.timeout,
            }))
        }
    }
}

/// GET `url` every `interval` until a 2xx arrives or `timeout` elapses
pub async fn wait_for_http(
    client: &Client<HttpConnector, Empty<Bytes>>,
    url: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<(), ProbeError> {
    let uri: Uri = url.parse().map_err(|e: hyper::http::uri::InvalidUri| ProbeError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    let deadline = Instant::now() + timeout;
    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let budget = interval.min(deadline - now);

        let req = Request::get(uri.clone())
            .body(Empty::<Bytes>::new())
            .map_err(|e| ProbeError::InvalidUrl {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        match tokio::time::timeout(budget, client.request(req)).await {
            Ok(Ok(response)) if response.status().is_success() => return Ok(()),
            Ok(Ok(response)) => debug!(url, status = %response.status(), "Backend not ready yet"),
            Ok(Err(e)) => debug!(url, error = %e, "Readiness request failed"),
            Err(_) => debug!(url, "Readiness request timed out"),
        }

        let now = Instant::now();
        if now >= deadline {
            break;
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }

    Err(ProbeError::Timeout {
        url: url.to_string(),
        timeout,
    })
}
