//! Liveness probes through a proxy

use crate::proxy::models::{ProbeOutcome, ProxyDescriptor};
use crate::Result;
use async_trait::async_trait;
use reqwest::{Client, Proxy as ReqwestProxy};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::trace;

/// Default timeout for proxy checks in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default "what is my address" endpoint
pub const DEFAULT_CHECK_URL: &str = "http://api.ipify.org";

/// Performs one liveness probe through a proxy.
///
/// Implementations must fold every failure (timeout, refused connection,
/// non-success status, unparsable body) into the returned outcome.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn check(&self, proxy: &ProxyDescriptor, timeout: Duration) -> ProbeOutcome;
}

/// Configuration for the HTTP health checker
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// URL answering with the caller's address as plain text
    pub check_url: String,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            check_url: DEFAULT_CHECK_URL.to_string(),
        }
    }
}

impl CheckerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_check_url(mut self, url: impl Into<String>) -> Self {
        self.check_url = url.into();
        self
    }
}

/// Health checker asking a plain-text address endpoint through the proxy
#[derive(Debug, Clone)]
pub struct HttpHealthChecker {
    config: CheckerConfig,
}

impl HttpHealthChecker {
    pub fn new(config: CheckerConfig) -> Self {
        Self { config }
    }

    pub fn check_url(&self) -> &str {
        &self.config.check_url
    }

    /// Create a reqwest client routed through the proxy
    fn create_client(&self, proxy: &ProxyDescriptor, timeout: Duration) -> Result<Client> {
        // `all` so an https check URL is tunnelled too instead of going out direct.
        let reqwest_proxy = ReqwestProxy::all(proxy.url())?;

        let client = Client::builder()
            .proxy(reqwest_proxy)
            .timeout(timeout)
            .build()?;

        Ok(client)
    }

    async fn fetch_address(&self, client: &Client) -> std::result::Result<IpAddr, String> {
        let response = client
            .get(&self.config.check_url)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("HTTP status: {}", response.status()));
        }

        let body = response.text().await.map_err(|e| e.to_string())?;
        parse_address(&body)
    }
}

impl Default for HttpHealthChecker {
    fn default() -> Self {
        Self::new(CheckerConfig::default())
    }
}

#[async_trait]
impl HealthChecker for HttpHealthChecker {
    async fn check(&self, proxy: &ProxyDescriptor, timeout: Duration) -> ProbeOutcome {
        let start = Instant::now();

        let client = match self.create_client(proxy, timeout) {
            Ok(client) => client,
            Err(e) => return ProbeOutcome::failed(e.to_string()),
        };

        match tokio::time::timeout(timeout, self.fetch_address(&client)).await {
            Ok(Ok(address)) => {
                let elapsed = start.elapsed().as_millis() as u64;
                trace!(%proxy, %address, elapsed, "address endpoint answered");
                ProbeOutcome::observed(address, elapsed)
            }
            Ok(Err(reason)) => ProbeOutcome::Failed(reason),
            Err(_) => ProbeOutcome::Timeout,
        }
    }
}

/// Parse the endpoint's plain-text body into an address
fn parse_address(body: &str) -> std::result::Result<IpAddr, String> {
    let trimmed = body.trim();
    trimmed
        .parse::<IpAddr>()
        .map_err(|_| format!("unexpected address response: {:?}", truncate(trimmed, 64)))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::models::ProxyType;

    #[test]
    fn test_checker_config_default() {
        let config = CheckerConfig::default();
        assert_eq!(config.check_url, DEFAULT_CHECK_URL);
    }

    #[test]
    fn test_checker_config_builder() {
        let checker =
            HttpHealthChecker::new(CheckerConfig::new().with_check_url("http://example.com/ip"));
        assert_eq!(checker.check_url(), "http://example.com/ip");
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(
            parse_address("203.0.113.7\n"),
            Ok("203.0.113.7".parse().unwrap())
        );
        assert!(parse_address("2001:db8::1").is_ok());
        assert!(parse_address("<html>blocked</html>").is_err());
        assert!(parse_address("").is_err());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abcdef", 3), "abc");
        assert_eq!(truncate("ab", 3), "ab");
    }

    #[tokio::test]
    async fn test_unreachable_proxy_is_a_failure() {
        // Nothing listens on port 1 of the loopback interface.
        let checker = HttpHealthChecker::default();
        let proxy = ProxyDescriptor::new("127.0.0.1", 1, ProxyType::Http);
        let outcome = checker.check(&proxy, Duration::from_secs(2)).await;
        assert!(!outcome.is_alive());
    }
}
