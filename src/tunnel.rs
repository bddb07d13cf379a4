//! HTTP forwarding through a shared connection pool
//!
//! One pooled client lives for the whole gateway lifetime so asset requests
//! reuse upstream connections instead of paying a handshake each time.

use crate::error::{BoxError, ProxyBody, UpstreamError};
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, SizeHint};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep};
use tracing::{debug, warn};
use uuid::Uuid;

/// Header name for request ID
pub const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers scoped to a single transport connection
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
];

/// Remove hop-by-hop headers, including any listed in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Statistics for the tunnel
#[derive(Debug, Default)]
pub struct TunnelStats {
    /// Total number of requests forwarded
    pub total_requests: AtomicU64,
    /// Requests that failed to reach the upstream
    pub failed_requests: AtomicU64,
}

impl TunnelStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the tunnel's connection pool
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// Upstream connect timeout
    pub connect_timeout: Duration,
    /// Deadline for the whole exchange, response body included
    pub request_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-request information about the client side of the connection
#[derive(Debug, Clone, Copy)]
pub struct ClientInfo {
    pub addr: Option<SocketAddr>,
    pub is_tls: bool,
}

impl ClientInfo {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr: Some(addr),
            is_tls: false,
        }
    }
}

/// Forwards single request/response pairs to an upstream base URL
pub struct HttpProxyTunnel {
    client: Client<HttpConnector, ProxyBody>,
    stats: Arc<TunnelStats>,
    config: TunnelConfig,
}

impl HttpProxyTunnel {
    pub fn new(config: TunnelConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(Some(config.connect_timeout));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            connect_timeout_ms = config.connect_timeout.as_millis() as u64,
            "Upstream connection pool initialized"
        );

        Self {
            client,
            stats: Arc::new(TunnelStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<TunnelStats> {
        Arc::clone(&self.stats)
    }

    /// Forward `req` to `upstream_base`, keeping its path and query.
    ///
    /// The response body is streamed back as it arrives. Dropping the returned
    /// future or body cancels the upstream exchange.
    pub async fn forward<B>(
        &self,
        req: Request<B>,
        upstream_base: &str,
        client: ClientInfo,
    ) -> Result<Response<ProxyBody>, UpstreamError>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        let target = join_url(upstream_base, &path_and_query);
        let uri: Uri = target.parse().map_err(|e: hyper::http::uri::InvalidUri| {
            UpstreamError::InvalidUpstream {
                url: target.clone(),
                reason: e.to_string(),
            }
        })?;
        if uri.scheme_str() != Some("http") {
            return Err(UpstreamError::InvalidUpstream {
                url: target,
                reason: "only http:// upstreams are supported".to_string(),
            });
        }

        let (mut parts, body) = req.into_parts();
        let original_host = parts.headers.get(hyper::header::HOST).cloned().or_else(|| {
            parts
                .uri
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
        });

        strip_hop_by_hop(&mut parts.headers);
        set_forwarded_headers(&mut parts.headers, original_host, client);
        if let Some(authority) = uri.authority() {
            if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                parts.headers.insert(hyper::header::HOST, value);
            }
        }
        parts.uri = uri;
        parts.version = hyper::Version::HTTP_11;

        let body = body.map_err(|e| -> BoxError { e.into() }).boxed();
        let upstream_req = Request::from_parts(parts, body);

        self.stats.record_request();

        let deadline = Instant::now() + self.config.request_timeout;
        let exchange = tokio::time::timeout_at(deadline, self.client.request(upstream_req));
        let response = match exchange.await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.stats.record_failure();
                return Err(UpstreamError::Connect {
                    url: target,
                    source: Box::new(e),
                });
            }
            Err(_) => {
                self.stats.record_failure();
                return Err(UpstreamError::Timeout {
                    url: target,
                    timeout: self.config.request_timeout,
                });
            }
        };

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        let body = body.map_err(|e| -> BoxError { Box::new(e) }).boxed();
        let body = DeadlineBody::new(body, deadline, target, self.config.request_timeout).boxed();

        Ok(Response::from_parts(parts, body))
    }
}

/// Response body that fails once the request deadline passes.
///
/// The timeout covers the whole exchange, so an upstream that sends a head
/// and then stalls mid-body still releases the client connection.
pub struct DeadlineBody {
    inner: ProxyBody,
    sleep: Pin<Box<Sleep>>,
    url: String,
    timeout: Duration,
}

impl DeadlineBody {
    pub fn new(inner: ProxyBody, deadline: Instant, url: String, timeout: Duration) -> Self {
        Self {
            inner,
            sleep: Box::pin(tokio::time::sleep_until(deadline)),
            url,
            timeout,
        }
    }
}

impl Body for DeadlineBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if let Poll::Ready(frame) = Pin::new(&mut this.inner).poll_frame(cx) {
            return Poll::Ready(frame);
        }
        if this.sleep.as_mut().poll(cx).is_ready() {
            warn!(
                url = %this.url,
                timeout_secs = this.timeout.as_secs(),
                "Upstream response body timed out"
            );
            return Poll::Ready(Some(Err(Box::new(UpstreamError::Timeout {
                url: this.url.clone(),
                timeout: this.timeout,
            }))));
        }
        Poll::Pending
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// `scheme://authority` of an upstream URL; any path it carries is dropped
pub fn upstream_origin(base: &str) -> &str {
    let base = base.trim_end_matches('/');
    match base.split_once("://") {
        Some((scheme, rest)) => match rest.find(['/', '?']) {
            Some(i) => &base[..scheme.len() + 3 + i],
            None => base,
        },
        None => base,
    }
}

/// Join an upstream origin with a request path and query.
///
/// Request paths already carry any base path the dev server was started with,
/// so a path on `base` is not repeated.
pub fn join_url(base: &str, path_and_query: &str) -> String {
    let base = upstream_origin(base);
    if path_and_query.starts_with('/') {
        format!("{}{}", base, path_and_query)
    } else {
        format!("{}/{}", base, path_and_query)
    }
}

/// Set X-Request-ID and X-Forwarded-* headers.
///
/// X-Forwarded-* values are overwritten rather than appended: the gateway is
/// assumed to be the first trusted hop.
fn set_forwarded_headers(
    headers: &mut HeaderMap,
    original_host: Option<HeaderValue>,
    client: ClientInfo,
) {
    if !headers.contains_key(X_REQUEST_ID) {
        if let Ok(value) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
            headers.insert(X_REQUEST_ID, value);
        }
    }

    if let Some(addr) = client.addr {
        if let Ok(value) = HeaderValue::from_str(&addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }

    if let Some(host) = original_host {
        headers.insert(X_FORWARDED_HOST, host);
    }

    let proto = if client.is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
}
