use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, SET_COOKIE};
use reqwest::{Client, Proxy, StatusCode};
use url::{Host, Url};
use veil_core::error::AppError;
use veil_core::models::{ProxyProtocol, ProxyRecord};

/// A downloaded page.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: u16,
    /// URL after redirects.
    pub url: String,
    pub body: String,
    /// `(name, value)` pairs from `Set-Cookie` response headers.
    pub cookies: Vec<(String, String)>,
}

/// HTTP fetcher using reqwest.
///
/// Requests can be routed through a workspace proxy; one client is built
/// and cached per proxy URL. Targets on loopback, private or otherwise
/// reserved addresses are refused unless
/// [`allow_private_urls`](Self::allow_private_urls) is set. Proxied
/// requests are only checked for literal addresses and `localhost`
/// names: the proxy resolves the host, so a local lookup proves nothing.
#[derive(Clone)]
pub struct ReqwestFetcher {
    direct: Client,
    proxied: Arc<Mutex<HashMap<String, Client>>>,
    timeout: Duration,
    public_only: bool,
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
            public_only: true,
        })
    }

    /// Allow targets on private and reserved addresses, e.g. when running
    /// ad hoc from the CLI against a local test server.
    pub fn allow_private_urls(mut self) -> Self {
        self.public_only = false;
        self
    }

    /// GET `url` with `headers`, through `proxy` when given.
    ///
    /// Connection failures, request timeouts and blocking responses (403,
    /// 407, 429) map to [`AppError::NetworkError`] so the proxy gets cooled
    /// down; other non-success statuses are parser errors.
    pub async fn fetch(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
        proxy: Option<&ProxyRecord>,
    ) -> Result<FetchedPage, AppError> {
        if self.public_only {
            check_target(url, proxy.is_some()).await?;
        }

        let client = match proxy {
            Some(record) => self.client_for(record)?,
            None => self.direct.clone(),
        };

        let response = client
            .get(url)
            .headers(header_map(headers)?)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::NetworkError(format!(
                        "Request to {url} timed out after {}s",
                        self.timeout.as_secs()
                    ))
                } else if e.is_connect() {
                    AppError::NetworkError(format!("Connection failed: {e}"))
                } else {
                    AppError::NetworkError(e.to_string())
                }
            })?;

        let status = response.status();
        if is_blocking_status(status) {
            return Err(AppError::NetworkError(format!(
                "HTTP {} for {} (blocked)",
                status.as_u16(),
                url
            )));
        }
        if !status.is_success() {
            return Err(AppError::ParserError(format!(
                "HTTP {} for {}",
                status.as_u16(),
                url
            )));
        }

        let final_url = response.url().to_string();
        let cookies = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(parse_set_cookie)
            .collect();

        let body = response
            .text()
            .await
            .map_err(|e| AppError::NetworkError(format!("Failed to read response body: {e}")))?;

        Ok(FetchedPage {
            status: status.as_u16(),
            url: final_url,
            body,
            cookies,
        })
    }

    fn client_for(&self, record: &ProxyRecord) -> Result<Client, AppError> {
        let key = record.url();
        let mut clients = self
            .proxied
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let client = build_client(self.timeout, Some(record))?;
        tracing::debug!(proxy_id = record.id, proxy = %record.server(), "Built proxied HTTP client");
        clients.insert(key, client.clone());
        Ok(client)
    }
}

fn build_client(timeout: Duration, proxy: Option<&ProxyRecord>) -> Result<Client, AppError> {
    let mut builder = Client::builder().timeout(timeout);

    if let Some(record) = proxy {
        let proxy = Proxy::all(proxy_url(record))
            .map_err(|e| AppError::ConfigError(format!("Invalid proxy {}: {e}", record.server())))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| AppError::ConfigError(format!("Failed to build HTTP client: {e}")))
}

/// URL reqwest dials for `record`. SOCKS5 proxies get the `socks5h`
/// scheme so target names are resolved on the proxy side.
fn proxy_url(record: &ProxyRecord) -> String {
    let url = record.url();
    match record.protocol {
        ProxyProtocol::Socks5 => url.replacen("socks5://", "socks5h://", 1),
        ProxyProtocol::Http | ProxyProtocol::Https => url,
    }
}

fn header_map(headers: &[(&'static str, String)]) -> Result<HeaderMap, AppError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let value = HeaderValue::from_str(value)
            .map_err(|e| AppError::ValidationError(format!("Invalid {name} header: {e}")))?;
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| AppError::ValidationError(format!("Invalid header name {name}: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

fn is_blocking_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::FORBIDDEN | StatusCode::PROXY_AUTHENTICATION_REQUIRED | StatusCode::TOO_MANY_REQUESTS
    )
}

/// `name=value` from a `Set-Cookie` header, attributes dropped.
fn parse_set_cookie(header: &str) -> Option<(String, String)> {
    let pair = header.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().trim_matches('"').to_string()))
}

// ---------------------------------------------------------------------------
// Target checks
// ---------------------------------------------------------------------------

/// Refuse targets that would reach the fetching host or its network.
///
/// Literal addresses and `localhost` names are always checked. Other
/// names are resolved locally only for direct requests.
async fn check_target(url: &str, via_proxy: bool) -> Result<(), AppError> {
    let parsed =
        Url::parse(url).map_err(|e| AppError::ValidationError(format!("Invalid URL: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(AppError::ValidationError(format!(
            "Refusing to fetch {url}: only http and https are supported"
        )));
    }

    let name = match parsed.host() {
        None => return Err(AppError::ValidationError(format!("Refusing to fetch {url}: no host"))),
        Some(Host::Ipv4(ip)) => return reject_reserved(url, IpAddr::V4(ip)),
        Some(Host::Ipv6(ip)) => return reject_reserved(url, IpAddr::V6(ip)),
        Some(Host::Domain(name)) => name.trim_end_matches('.').to_ascii_lowercase(),
    };

    if name == "localhost" || name.ends_with(".localhost") {
        return Err(AppError::ValidationError(format!(
            "Refusing to fetch {url}: {name} is a local name"
        )));
    }
    if via_proxy {
        return Ok(());
    }

    let port = parsed.port_or_known_default().unwrap_or(80);
    let mut resolved = tokio::net::lookup_host((name.as_str(), port))
        .await
        .map_err(|e| AppError::NetworkError(format!("Could not resolve {name}: {e}")))?
        .peekable();
    if resolved.peek().is_none() {
        return Err(AppError::NetworkError(format!("{name} resolved to no addresses")));
    }
    resolved.try_for_each(|addr| reject_reserved(url, addr.ip()))
}

fn reject_reserved(url: &str, ip: IpAddr) -> Result<(), AppError> {
    if is_reserved(ip) {
        Err(AppError::ValidationError(format!(
            "Refusing to fetch {url}: {ip} is not a public address"
        )))
    } else {
        Ok(())
    }
}

/// Loopback, private, link-local, shared (CGNAT), documentation and
/// unspecified ranges. IPv4-mapped IPv6 is judged by its IPv4 part.
fn is_reserved(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [first, second, ..] = v4.octets();
            first == 0
                || v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_documentation()
                || (first == 100 && (64..128).contains(&second))
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_reserved(IpAddr::V4(v4));
            }
            let prefix = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || prefix & 0xffc0 == 0xfe80
                || prefix & 0xfe00 == 0xfc00
        }
    }
}
