//! WebSocket relay for hot-reload traffic
//!
//! The upstream connection is opened before the client is answered, so a dead
//! dev server produces a 502 instead of a client socket that closes right after
//! the upgrade. Messages are relayed one by one, keeping text/binary type and
//! message boundaries intact.

use crate::error::{full_body, ProxyBody, UpstreamError};
use crate::tunnel::upstream_origin;
use futures_util::{SinkExt, StreamExt};
use hyper::body::Body;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Headers the WebSocket client library generates itself
const HANDSHAKE_HEADERS: &[&str] = &[
    "host",
    "connection",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "content-length",
    "transfer-encoding",
    "keep-alive",
    "te",
    "trailer",
    "proxy-authorization",
    "proxy-authenticate",
];

/// Which side ended a relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    UpstreamClosed,
    ClientError,
    UpstreamError,
    IdleTimeout,
}

/// Summary of a finished relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    pub reason: CloseReason,
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Relays upgraded connections to the dev server
#[derive(Debug, Clone)]
pub struct WebSocketTunnel {
    connect_timeout: Duration,
    idle_timeout: Option<Duration>,
}

impl WebSocketTunnel {
    pub fn new(connect_timeout: Duration, idle_timeout: Option<Duration>) -> Self {
        Self {
            connect_timeout,
            idle_timeout,
        }
    }

    /// Connect upstream, answer the client with `101 Switching Protocols` and
    /// spawn the relay task. `guard` is held until the tunnel is torn down.
    pub async fn upgrade<B, G>(
        &self,
        mut req: Request<B>,
        upstream_base: &str,
        request_id: &str,
        guard: G,
    ) -> Result<Response<ProxyBody>, UpstreamError>
    where
        B: Body + Send + 'static,
        G: Send + 'static,
    {
        let Some(client_key) = req
            .headers()
            .get("sec-websocket-key")
            .map(|v| v.as_bytes().to_vec())
        else {
            warn!(request_id, "Upgrade request without Sec-WebSocket-Key");
            return Ok(bad_request("Missing Sec-WebSocket-Key"));
        };

        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        let url = websocket_url(upstream_base, &path)?;

        let mut upstream_req = url
            .as_str()
            .into_client_request()
            .map_err(|source| UpstreamError::Handshake {
                url: url.clone(),
                source,
            })?;
        for (name, value) in req.headers() {
            if HANDSHAKE_HEADERS.contains(&name.as_str()) {
                continue;
            }
            upstream_req.headers_mut().append(name.clone(), value.clone());
        }

        let connect = tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(upstream_req),
        )
        .await;
        let (upstream, upstream_response) = match connect {
            Ok(Ok(pair)) => pair,
            Ok(Err(tungstenite::Error::Io(e))) => {
                return Err(UpstreamError::Connect {
                    url,
                    source: Box::new(e),
                })
            }
            Ok(Err(source)) => return Err(UpstreamError::Handshake { url, source }),
            Err(_) => {
                return Err(UpstreamError::Timeout {
                    url,
                    timeout: self.connect_timeout,
                })
            }
        };

        let protocol = upstream_response
            .headers()
            .get("sec-websocket-protocol")
            .cloned();

        let on_upgrade = hyper::upgrade::on(&mut req);
        let idle_timeout = self.idle_timeout;
        let request_id = request_id.to_string();
        let task_url = url.clone();

        tokio::spawn(async move {
            let _guard = guard;
            match on_upgrade.await {
                Ok(upgraded) => {
                    let client =
                        WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
                            .await;
                    debug!(request_id, url = %task_url, "Client upgrade complete, relaying frames");
                    let outcome = relay(client, upstream, idle_timeout).await;
                    debug!(
                        request_id,
                        url = %task_url,
                        reason = ?outcome.reason,
                        client_to_upstream = outcome.client_to_upstream,
                        upstream_to_client = outcome.upstream_to_client,
                        "WebSocket tunnel closed"
                    );
                }
                Err(e) => {
                    error!(request_id, error = %e, "Failed to upgrade client connection");
                    let mut upstream = upstream;
                    let _ = upstream.close(None).await;
                }
            }
        });

        info!(url = %url, "WebSocket upgrade accepted by upstream");

        let mut response = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(hyper::header::UPGRADE, "websocket")
            .header(hyper::header::CONNECTION, "Upgrade")
            .header("sec-websocket-accept", derive_accept_key(&client_key));
        if let Some(protocol) = protocol {
            response = response.header(HeaderName::from_static("sec-websocket-protocol"), protocol);
        }
        Ok(response
            .body(full_body(""))
            .expect("valid switching protocols response"))
    }
}

/// Check if a request asks for a WebSocket upgrade
pub fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")));

    let is_websocket = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    has_upgrade_connection && is_websocket
}

/// Map an http(s) upstream base plus request path to a ws(s) URL
pub fn websocket_url(base: &str, path_and_query: &str) -> Result<String, UpstreamError> {
    let base = upstream_origin(base);
    let ws_base = if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if let Some(rest) = base.strip_prefix("ws://") {
        format!("ws://{}", rest)
    } else {
        return Err(UpstreamError::InvalidUpstream {
            url: base.to_string(),
            reason: "only http:// upstreams are supported".to_string(),
        });
    };
    Ok(format!("{}{}", ws_base, path_and_query))
}

fn bad_request(message: &'static str) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .header(hyper::header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))
        .body(full_body(message))
        .expect("valid bad request response")
}

async fn idle_expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Relay messages between two WebSocket connections until either side closes.
///
/// A close or error on one side closes the other side. Ping/pong is answered
/// per connection by the WebSocket library and not forwarded.
pub async fn relay<C, U>(
    client: WebSocketStream<C>,
    upstream: WebSocketStream<U>,
    idle_timeout: Option<Duration>,
) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();
    let mut client_to_upstream = 0u64;
    let mut upstream_to_client = 0u64;
    let mut last_activity = Instant::now();

    let reason = loop {
        let deadline = idle_timeout.map(|d| last_activity + d);
        tokio::select! {
            msg = client_rx.next() => match msg {
                Some(Ok(Message::Close(frame))) => {
                    let _ = upstream_tx.send(Message::Close(frame)).await;
                    break CloseReason::ClientClosed;
                }
                Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                    if upstream_tx.send(msg).await.is_err() {
                        break CloseReason::UpstreamError;
                    }
                    client_to_upstream += 1;
                    last_activity = Instant::now();
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break CloseReason::ClientError,
            },
            msg = upstream_rx.next() => match msg {
                Some(Ok(Message::Close(frame))) => {
                    let _ = client_tx.send(Message::Close(frame)).await;
                    break CloseReason::UpstreamClosed;
                }
                Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                    if client_tx.send(msg).await.is_err() {
                        break CloseReason::ClientError;
                    }
                    upstream_to_client += 1;
                    last_activity = Instant::now();
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break CloseReason::UpstreamError,
            },
            _ = idle_expired(deadline) => break CloseReason::IdleTimeout,
        }
    };

    // Both halves are torn down together
    let _ = client_tx.close().await;
    let _ = upstream_tx.close().await;

    RelayOutcome {
        reason,
        client_to_upstream,
        upstream_to_client,
    }
}
