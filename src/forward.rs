//! Forwarding inbound requests to the backend
//!
//! Requests are buffered, rewritten to target the backend authority and sent
//! through a pooled hyper-util client. Redirects that stay on the backend's
//! origin are followed here so the caller only ever sees the final response.

use crate::config::{BackendConfig, ServerConfig};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Headers describing a request body, dropped when a redirect turns the
/// request into a bodiless GET
const CONTENT_HEADERS: [header::HeaderName; 5] = [
    header::CONTENT_LENGTH,
    header::CONTENT_TYPE,
    header::CONTENT_ENCODING,
    header::CONTENT_LANGUAGE,
    header::CONTENT_LOCATION,
];

/// A fully buffered request received from a caller
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    /// Origin-form target, e.g. `/items?id=5`
    pub path_and_query: String,
    /// One value per header name (last one wins, cookies joined)
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Error)]
pub enum InboundError {
    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("failed to read request body: {0}")]
    Body(Box<dyn std::error::Error + Send + Sync>),
}

impl InboundRequest {
    pub fn new(method: Method, path_and_query: impl Into<String>) -> Self {
        Self {
            method,
            path_and_query: path_and_query.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Read the whole request, rejecting bodies larger than `max_body_bytes`
    pub async fn from_request<B>(req: Request<B>, max_body_bytes: usize) -> Result<Self, InboundError>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = req.into_parts();

        let body = match Limited::new(body, max_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                return Err(InboundError::TooLarge { limit: max_body_bytes });
            }
            Err(e) => return Err(InboundError::Body(e)),
        };

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();

        Ok(Self {
            method: parts.method,
            path_and_query,
            headers: collapse_headers(&parts.headers),
            body,
        })
    }
}

/// Keep one value per header name. Repeated headers keep their last value,
/// except `Cookie`, whose crumbs are joined back into a single header.
fn collapse_headers(headers: &HeaderMap) -> HeaderMap {
    let mut collapsed = HeaderMap::with_capacity(headers.keys_len());

    for name in headers.keys() {
        let values = headers.get_all(name);

        if *name == header::COOKIE {
            let crumbs: Vec<&[u8]> = values.iter().map(|v| v.as_bytes()).collect();
            if let Ok(joined) = HeaderValue::from_bytes(&crumbs.join(&b"; "[..])) {
                collapsed.insert(name.clone(), joined);
            }
        } else if let Some(last) = values.iter().last() {
            collapsed.insert(name.clone(), last.clone());
        }
    }

    collapsed
}

/// The backend's final answer to a forwarded request
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Error)]
pub enum ForwardError {
    /// Connection refused, timed out or broke mid-transfer
    #[error("backend unreachable: {0}")]
    BackendUnreachable(#[source] BackendFailure),
    #[error("backend redirected more than {0} times")]
    TooManyRedirects(usize),
    /// The inbound target cannot be expressed as a backend URI
    #[error("invalid backend target: {0}")]
    InvalidTarget(String),
}

impl ForwardError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ForwardError::BackendUnreachable(BackendFailure::Timeout(_)))
    }
}

#[derive(Debug, Error)]
pub enum BackendFailure {
    #[error("no complete response within {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("request failed: {0}")]
    Connect(#[from] hyper_util::client::legacy::Error),
    #[error("response body failed: {0}")]
    Body(#[from] hyper::Error),
}

/// Counters for forwarded traffic
#[derive(Debug, Default)]
pub struct ForwardStats {
    /// Inbound requests forwarded
    pub requests: AtomicU64,
    /// Redirect hops followed on behalf of callers
    pub redirects: AtomicU64,
    /// Forwards that ended in an error
    pub failures: AtomicU64,
}

impl ForwardStats {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_redirect(&self) {
        self.redirects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn get_redirects(&self) -> u64 {
        self.redirects.load(Ordering::Relaxed)
    }

    pub fn get_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Settings for [`RequestForwarder`]
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// `http://host:port` of the backend
    pub base_url: String,
    /// Bound on the whole exchange, redirects and body included
    pub timeout: Duration,
    pub max_redirects: usize,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
}

impl ForwarderConfig {
    pub fn from_config(server: &ServerConfig, backend: &BackendConfig) -> Self {
        Self {
            base_url: backend.base_url(),
            timeout: server.request_timeout(),
            max_redirects: server.max_redirects,
            pool_max_idle_per_host: server.pool_max_idle_per_host,
            pool_idle_timeout: server.pool_idle_timeout(),
        }
    }
}

/// Sends inbound requests to the backend over pooled connections
pub struct RequestForwarder {
    client: Client<HttpConnector, Full<Bytes>>,
    origin: Url,
    base_url: String,
    authority: HeaderValue,
    timeout: Duration,
    max_redirects: usize,
    stats: Arc<ForwardStats>,
}

impl RequestForwarder {
    pub fn new(config: ForwarderConfig) -> Result<Self, ForwardError> {
        let origin = Url::parse(&config.base_url)
            .map_err(|e| ForwardError::InvalidTarget(format!("{}: {}", config.base_url, e)))?;

        let host = origin
            .host_str()
            .ok_or_else(|| ForwardError::InvalidTarget(format!("{}: missing host", config.base_url)))?;
        let authority = match origin.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let authority = HeaderValue::from_str(&authority)
            .map_err(|e| ForwardError::InvalidTarget(e.to_string()))?;

        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout)
            .build(connector);

        debug!(
            base_url = %config.base_url,
            timeout_ms = config.timeout.as_millis(),
            max_redirects = config.max_redirects,
            "Request forwarder initialized"
        );

        Ok(Self {
            client,
            origin,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            authority,
            timeout: config.timeout,
            max_redirects: config.max_redirects,
            stats: Arc::new(ForwardStats::default()),
        })
    }

    /// Get forwarding statistics
    pub fn stats(&self) -> Arc<ForwardStats> {
        Arc::clone(&self.stats)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Forward `inbound` to the backend and return its final response.
    ///
    /// A single attempt is made; there are no retries.
    pub async fn forward(&self, inbound: InboundRequest) -> Result<ProxyResponse, ForwardError> {
        self.stats.record_request();

        let result = match tokio::time::timeout(self.timeout, self.exchange(inbound)).await {
            Ok(result) => result,
            Err(_) => Err(ForwardError::BackendUnreachable(BackendFailure::Timeout(
                self.timeout,
            ))),
        };

        if result.is_err() {
            self.stats.record_failure();
        }
        result
    }

    async fn exchange(&self, inbound: InboundRequest) -> Result<ProxyResponse, ForwardError> {
        let InboundRequest {
            mut method,
            path_and_query,
            mut headers,
            mut body,
        } = inbound;

        // The body is re-framed from the buffered bytes
        headers.remove(header::TRANSFER_ENCODING);
        headers.insert(header::HOST, self.authority.clone());

        let mut target = self.backend_uri(&path_and_query)?;
        let mut redirects = 0;
        // Cookies set by hops followed here still belong to the caller
        let mut hop_cookies = Vec::new();

        loop {
            let mut request = Request::builder()
                .method(method.clone())
                .uri(target.clone())
                .body(Full::new(body.clone()))
                .map_err(|e| ForwardError::InvalidTarget(e.to_string()))?;
            *request.headers_mut() = headers.clone();

            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| ForwardError::BackendUnreachable(e.into()))?;

            let status = response.status();
            if let Some(next) = self.redirect_target(&target, status, response.headers()) {
                if redirects >= self.max_redirects {
                    return Err(ForwardError::TooManyRedirects(self.max_redirects));
                }
                redirects += 1;
                self.stats.record_redirect();
                hop_cookies.extend(response.headers().get_all(header::SET_COOKIE).iter().cloned());

                if redirect_switches_to_get(status, &method) {
                    method = Method::GET;
                    body = Bytes::new();
                    for name in &CONTENT_HEADERS {
                        headers.remove(name);
                    }
                }

                debug!(from = %target, to = %next, status = status.as_u16(), %method, "Following backend redirect");
                target = next;
                continue;
            }

            let (mut parts, incoming) = response.into_parts();
            let body = incoming
                .collect()
                .await
                .map_err(|e| ForwardError::BackendUnreachable(e.into()))?
                .to_bytes();

            prepend_cookies(&mut parts.headers, hop_cookies);

            return Ok(ProxyResponse {
                status: parts.status,
                headers: parts.headers,
                body,
            });
        }
    }

    /// Base URL plus the inbound path and query, kept verbatim
    fn backend_uri(&self, path_and_query: &str) -> Result<Uri, ForwardError> {
        if !path_and_query.starts_with('/') {
            return Err(ForwardError::InvalidTarget(format!(
                "unsupported request target: {}",
                path_and_query
            )));
        }
        format!("{}{}", self.base_url, path_and_query)
            .parse::<Uri>()
            .map_err(|e| ForwardError::InvalidTarget(e.to_string()))
    }

    /// Where a redirect response points, if it should be followed here
    fn redirect_target(&self, current: &Uri, status: StatusCode, headers: &HeaderMap) -> Option<Uri> {
        if !is_followed_redirect(status) {
            return None;
        }

        let location = headers.get(header::LOCATION)?.to_str().ok()?;
        let next = Url::parse(&current.to_string()).ok()?.join(location).ok()?;

        if !same_origin(&self.origin, &next) {
            debug!(location, "Backend redirected off-origin, relaying as-is");
            return None;
        }

        next.as_str().parse::<Uri>().ok()
    }
}

/// Put `Set-Cookie` values from followed redirects ahead of the final
/// response's own, so the final response wins when a name repeats
fn prepend_cookies(headers: &mut HeaderMap, hop_cookies: Vec<HeaderValue>) {
    if hop_cookies.is_empty() {
        return;
    }

    let own: Vec<HeaderValue> = headers.get_all(header::SET_COOKIE).iter().cloned().collect();
    headers.remove(header::SET_COOKIE);

    for cookie in hop_cookies.into_iter().chain(own) {
        headers.append(header::SET_COOKIE, cookie);
    }
}

fn is_followed_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// 303 turns anything but GET/HEAD into GET; 301/302 do so for POST.
/// 307/308 always replay method and body.
fn redirect_switches_to_get(status: StatusCode, method: &Method) -> bool {
    match status {
        StatusCode::SEE_OTHER => *method != Method::GET && *method != Method::HEAD,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND => *method == Method::POST,
        _ => false,
    }
}

fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port_or_known_default() == b.port_or_known_default()
}
