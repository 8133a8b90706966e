use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use reqwest::header::USER_AGENT;
use reqwest::{Client, Proxy};
use sieve_core::error::AppError;
use sieve_core::traits::{FetchRequest, Fetcher};
use url::Url;

/// HTTP fetcher using reqwest.
///
/// Applies the per-request plan (headers, user agent, proxy) carried by each
/// [`FetchRequest`]. One client is kept per proxy so connection pools are
/// reused across pages. Requests to private or reserved addresses are
/// refused unless [`allow_private_urls`](Self::allow_private_urls) is set.
#[derive(Clone)]
pub struct ReqwestFetcher {
    direct: Client,
    proxied: Arc<Mutex<HashMap<String, Client>>>,
    timeout: Duration,
    ssrf_protection: bool,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        Ok(Self {
            direct: build_client(timeout, None)?,
            proxied: Arc::new(Mutex::new(HashMap::new())),
            timeout,
            ssrf_protection: true,
        })
    }

    /// Allow loopback, private and link-local targets.
    ///
    /// Meant for the CLI, where the operator owns the machine.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }

    fn lock_proxied(&self) -> MutexGuard<'_, HashMap<String, Client>> {
        self.proxied.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned proxy client cache");
            poisoned.into_inner()
        })
    }

    fn client_for(&self, proxy: Option<&str>) -> Result<Client, AppError> {
        let Some(proxy) = proxy else {
            return Ok(self.direct.clone());
        };
        let mut clients = self.lock_proxied();
        if let Some(client) = clients.get(proxy) {
            return Ok(client.clone());
        }
        let client = build_client(self.timeout, Some(proxy))?;
        clients.insert(proxy.to_string(), client.clone());
        Ok(client)
    }

    fn map_send_error(&self, e: reqwest::Error) -> AppError {
        if e.is_timeout() {
            AppError::Timeout(self.timeout.as_secs())
        } else if e.is_connect() {
            AppError::NetworkError(format!("Connection failed: {e}"))
        } else {
            AppError::HttpError(e.to_string())
        }
    }
}

fn build_client(timeout: Duration, proxy: Option<&str>) -> Result<Client, AppError> {
    let mut builder = Client::builder().timeout(timeout);
    if let Some(proxy) = proxy {
        let proxy = Proxy::all(proxy)
            .map_err(|e| AppError::ConfigError(format!("Invalid proxy '{proxy}': {e}")))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| AppError::HttpError(format!("Failed to build HTTP client: {e}")))
}

impl Fetcher for ReqwestFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<String, AppError> {
        if self.ssrf_protection {
            guard_url(&request.url).await?;
        }

        let client = self.client_for(request.proxy.as_deref())?;
        let mut builder = client
            .get(&request.url)
            .header(USER_AGENT, request.user_agent.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let started = Instant::now();
        let response = builder.send().await.map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        tracing::debug!(
            url = %request.url,
            status = status.as_u16(),
            proxy = ?request.proxy,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Fetched page"
        );
        if !status.is_success() {
            return Err(AppError::HttpError(format!(
                "HTTP {} for {}",
                status.as_u16(),
                request.url
            )));
        }

        response
            .text()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to read response body: {e}")))
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Refuse URLs that are not http(s) or whose host lands on a private or
/// reserved address. Hostnames are resolved and every address is checked.
async fn guard_url(url: &str) -> Result<(), AppError> {
    let parsed = Url::parse(url).map_err(|e| AppError::HttpError(format!("Invalid URL: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(AppError::HttpError(format!(
            "URL scheme '{}' is not allowed (only http/https)",
            parsed.scheme()
        )));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::HttpError(format!("URL has no host: {url}")))?;

    let literal = host.trim_start_matches('[').trim_end_matches(']');
    let addresses: Vec<IpAddr> = match literal.parse::<IpAddr>() {
        Ok(ip) => vec![ip],
        Err(_) => {
            let port = parsed.port_or_known_default().unwrap_or(80);
            tokio::net::lookup_host((host, port))
                .await
                .map_err(|e| {
                    AppError::NetworkError(format!("DNS resolution failed for {host}: {e}"))
                })?
                .map(|addr| addr.ip())
                .collect()
        }
    };

    if addresses.is_empty() {
        return Err(AppError::NetworkError(format!(
            "DNS resolution returned no addresses for {host}"
        )));
    }
    if let Some(ip) = addresses.into_iter().find(|ip| is_blocked_ip(*ip)) {
        return Err(AppError::HttpError(format!(
            "SSRF blocked: {host} resolves to private/reserved IP {ip}"
        )));
    }
    Ok(())
}

/// Loopback, private, link-local, CGN, documentation and unspecified ranges.
fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || (a == 100 && (b & 0xC0) == 64)
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xFFC0) == 0xFE80
                || (first & 0xFE00) == 0xFC00
                || v6
                    .to_ipv4_mapped()
                    .is_some_and(|v4| is_blocked_ip(IpAddr::V4(v4)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_ranges() {
        for ip in [
            "127.0.0.1",
            "10.1.2.3",
            "172.20.0.1",
            "192.168.0.10",
            "169.254.169.254",
            "0.0.0.0",
            "100.100.0.1",
            "::1",
            "::",
            "fe80::1",
            "fd12::1",
            "::ffff:10.0.0.1",
        ] {
            assert!(is_blocked_ip(ip.parse().unwrap()), "{ip} should be blocked");
        }
    }

    #[test]
    fn test_public_ranges() {
        for ip in ["8.8.4.4", "151.101.1.69", "100.128.0.1", "2606:4700::1111"] {
            assert!(!is_blocked_ip(ip.parse().unwrap()), "{ip} should be allowed");
        }
    }

    #[tokio::test]
    async fn test_guard_rejects_private_literals() {
        for url in ["http://127.0.0.1:8080/", "http://[::1]/", "http://169.254.169.254/latest"] {
            let err = guard_url(url).await.unwrap_err();
            assert!(err.to_string().contains("SSRF blocked"), "{url}: {err}");
        }
    }

    #[tokio::test]
    async fn test_guard_rejects_other_schemes() {
        let err = guard_url("ftp://ex.com/file").await.unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }

    #[tokio::test]
    async fn test_fetch_refuses_loopback_by_default() {
        let fetcher = ReqwestFetcher::new().unwrap();
        let err = fetcher
            .fetch(&FetchRequest::get("http://localhost:9/"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("SSRF blocked"));
    }

    #[test]
    fn test_proxy_clients_are_cached() {
        let fetcher = ReqwestFetcher::new().unwrap();
        fetcher.client_for(Some("http://proxy.local:3128")).unwrap();
        fetcher.client_for(Some("http://proxy.local:3128")).unwrap();
        fetcher.client_for(None).unwrap();
        assert_eq!(fetcher.lock_proxied().len(), 1);
    }
}
