use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use tracing::{debug, warn};

pub const DEFAULT_PROBE_URLS: [&str; 3] = [
    "https://www.google.com/generate_204",
    "https://www.cloudflare.com/cdn-cgi/trace",
    "https://captive.apple.com/hotspot-detect.html",
];

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Answers "can we reach the outside world right now?".
#[async_trait]
pub trait Probe: Send + Sync {
    async fn is_connected(&self) -> bool;
}

/// Single-pass reachability check over a short list of public endpoints.
///
/// Endpoints are tried in order and the first one that produces any HTTP
/// response wins; the status code is irrelevant because only outbound
/// reachability is being confirmed. Each attempt is bounded by `timeout`.
/// No retries happen here.
#[derive(Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    endpoints: Vec<Url>,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(endpoints: &[String], timeout: Duration) -> Self {
        let endpoints = endpoints
            .iter()
            .filter_map(|e| match Url::parse(e) {
                Ok(u) => Some(u),
                Err(err) => {
                    warn!(target: "fixdesk::probe", "ignoring invalid probe url '{}': {}", e, err);
                    None
                }
            })
            .collect();
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, endpoints, timeout }
    }

    pub fn endpoints(&self) -> &[Url] { &self.endpoints }
}

impl Default for HttpProbe {
    fn default() -> Self {
        let urls: Vec<String> = DEFAULT_PROBE_URLS.iter().map(|s| s.to_string()).collect();
        Self::new(&urls, DEFAULT_PROBE_TIMEOUT)
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn is_connected(&self) -> bool {
        for url in &self.endpoints {
            let attempt = self.client.head(url.clone()).timeout(self.timeout).send();
            match tokio::time::timeout(self.timeout, attempt).await {
                Ok(Ok(resp)) => {
                    debug!(target: "fixdesk::probe", "reachable via {} (HTTP {})", url, resp.status());
                    return true;
                }
                Ok(Err(e)) => debug!(target: "fixdesk::probe", "probe {} failed: {}", url, e),
                Err(_) => debug!(target: "fixdesk::probe", "probe {} timed out after {:?}", url, self.timeout),
            }
        }
        warn!(target: "fixdesk::probe", "no probe endpoint reachable ({} tried)", self.endpoints.len());
        false
    }
}

/// Fixed answer. Used when reachability is known up front and in tests.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub bool);

impl StaticProbe {
    pub fn online() -> Self { Self(true) }
    pub fn offline() -> Self { Self(false) }
}

#[async_trait]
impl Probe for StaticProbe {
    async fn is_connected(&self) -> bool { self.0 }
}
