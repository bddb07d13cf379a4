//! HTTP listener fronting the host application with the gateway

use crate::config::GatewayMode;
use crate::error::{full_body, json_error_response, GatewayErrorCode, ProxyBody};
use crate::gateway::{Dispatch, Gateway};
use crate::tunnel::ClientInfo;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Accepts connections and runs every request through the gateway
pub struct GatewayServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    gateway: Arc<Gateway>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub async fn bind(
        addr: SocketAddr,
        gateway: Arc<Gateway>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            gateway,
            shutdown_rx,
        })
    }

    /// Bind the listener, then bring the gateway up.
    ///
    /// A port clash fails here before any dev server is spawned, so nothing
    /// is left behind in the hotfile.
    pub async fn launch(
        addr: SocketAddr,
        gateway: Arc<Gateway>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let server = Self::bind(addr, Arc::clone(&gateway), shutdown_rx).await?;
        gateway.start().await?;
        Ok(server)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.local_addr, "Gateway listening (HTTP/1.1 and HTTP/2)");
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = Arc::clone(&self.gateway);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, gateway).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    // A dropped sender counts as shutdown
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Gateway server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    addr: SocketAddr,
    gateway: Arc<Gateway>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = Arc::clone(&gateway);
        async move { Ok::<_, Infallible>(handle_request(req, gateway, addr).await) }
    });

    // HTTP/1.1 connections can still be upgraded to WebSockets
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    gateway: Arc<Gateway>,
    addr: SocketAddr,
) -> Response<ProxyBody> {
    if req.uri().path() == gateway.config().server.discovery_path {
        return discovery_response(&gateway).await;
    }

    let client = ClientInfo::new(addr);
    match gateway.dispatch(req, client).await {
        Dispatch::Response(response) => response,
        Dispatch::PassThrough(req) => match gateway.config().server.app_upstream.clone() {
            Some(app) => gateway.pass_through(req, &app, client).await,
            None => json_error_response(
                GatewayErrorCode::NoUpstream,
                GatewayErrorCode::NoUpstream.public_message(),
            ),
        },
        Dispatch::Asset { file } => serve_asset(&gateway.config().assets.bundle_dir, &file).await,
    }
}

/// Tells client-side tooling where the dev server lives
async fn discovery_response(gateway: &Gateway) -> Response<ProxyBody> {
    let url = match gateway.mode() {
        GatewayMode::DevProxied | GatewayMode::DevDirect => match gateway.dev_server_url().await {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "Failed to read dev server address");
                None
            }
        },
        _ => None,
    };

    let body = serde_json::json!({
        "name": crate::PKG_NAME,
        "version": crate::VERSION,
        "mode": gateway.mode(),
        "url": url,
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header(hyper::header::CACHE_CONTROL, "no-store")
        .body(full_body(body.to_string()))
        .expect("valid response builder")
}

/// Serve a build output file; only paths present in the manifest reach here
async fn serve_asset(bundle_dir: &Path, file: &str) -> Response<ProxyBody> {
    let path = bundle_dir.join(file);
    match tokio::fs::read(&path).await {
        Ok(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, HeaderValue::from_static(content_type_for(file)))
            .header(hyper::header::CACHE_CONTROL, "public, max-age=31536000, immutable")
            .body(full_body(bytes))
            .expect("valid response builder"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(
                path = %path.display(),
                "Manifest lists a file missing from the bundle directory"
            );
            json_error_response(
                GatewayErrorCode::AssetNotInManifest,
                GatewayErrorCode::AssetNotInManifest.public_message(),
            )
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to read asset");
            json_error_response(
                GatewayErrorCode::InternalError,
                GatewayErrorCode::InternalError.public_message(),
            )
        }
    }
}

/// Content type by file extension
pub fn content_type_for(file: &str) -> &'static str {
    let ext = Path::new(file)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("js") | Some("mjs") => "text/javascript; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("json") | Some("map") => "application/json",
        Some("html") => "text/html; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("avif") => "image/avif",
        Some("ico") => "image/x-icon",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        Some("wasm") => "application/wasm",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}
