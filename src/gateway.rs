//! The gateway: mode selection and per-request decisions
//!
//! A `Gateway` owns every other component. The host calls [`Gateway::handle`]
//! to learn what to do with a request, or [`Gateway::dispatch`] to have the
//! proxy actions executed directly.

use crate::config::{Config, GatewayMode};
use crate::error::{BoxError, GatewayError, ProxyBody};
use crate::hotfile::HotFileStore;
use crate::manifest::Manifest;
use crate::router::ProxyRouter;
use crate::supervisor::DevServerSupervisor;
use crate::tunnel::{ClientInfo, HttpProxyTunnel, TunnelConfig, TunnelStats, X_REQUEST_ID};
use crate::websocket::{is_websocket_upgrade, WebSocketTunnel};
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame};
use hyper::header::HeaderValue;
use hyper::{Request, Response};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Interval for polling drain status during shutdown (in milliseconds)
const DRAIN_POLL_INTERVAL_MS: u64 = 50;

/// What the host should do with a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Not the gateway's business; let the application handle it
    PassThrough,
    /// Forward over HTTP to the dev server
    ProxyHttp { upstream: String },
    /// Tunnel a WebSocket upgrade to the dev server
    ProxyWebSocketUpgrade { upstream: String },
    /// Serve a file emitted by the production build, relative to the bundle directory
    ResolveManifestAsset { file: String },
}

/// Result of [`Gateway::dispatch`]
pub enum Dispatch<B> {
    /// The gateway produced the response (proxied or error)
    Response(Response<ProxyBody>),
    /// The request is returned untouched for the application
    PassThrough(Request<B>),
    /// A production asset to be served from the bundle directory
    Asset { file: String },
}

/// URLs a page needs to load one entry point
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssetUrls {
    pub scripts: Vec<String>,
    pub styles: Vec<String>,
    pub preloads: Vec<String>,
}

#[derive(Debug, Clone)]
struct CachedUpstream {
    url: Option<String>,
    fetched_at: Instant,
}

/// Decrements the in-flight counter when dropped
#[derive(Debug)]
pub struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Mode selector wiring the supervisor, router, tunnels and manifest together
pub struct Gateway {
    config: Config,
    state: RwLock<GatewayMode>,
    draining: AtomicBool,
    in_flight: Arc<AtomicUsize>,
    router: ProxyRouter,
    http: HttpProxyTunnel,
    websocket: WebSocketTunnel,
    hotfile: HotFileStore,
    supervisor: DevServerSupervisor,
    manifest: Option<Arc<Manifest>>,
    upstream_cache: RwLock<Option<CachedUpstream>>,
    /// Held while re-reading the hotfile so a burst of requests probes once
    refresh_lock: tokio::sync::Mutex<()>,
}

impl Gateway {
    /// Validate `config` and build the gateway.
    ///
    /// In production mode the manifest is loaded here; a missing or invalid
    /// manifest fails construction.
    pub fn new(config: Config) -> Result<Arc<Self>, GatewayError> {
        config
            .validate()
            .map_err(|e| GatewayError::Config(format!("{:#}", e)))?;

        let manifest = if config.mode == GatewayMode::Production {
            Some(Arc::new(Manifest::load(&config.assets.manifest)?))
        } else {
            None
        };

        let hotfile =
            HotFileStore::new(config.assets.hotfile.clone(), config.assets.probe_timeout());
        let supervisor = DevServerSupervisor::new(config.dev_server.clone(), hotfile.clone());
        let http = HttpProxyTunnel::new(TunnelConfig {
            max_idle_per_host: config.server.pool_max_idle_per_host,
            idle_timeout: config.server.pool_idle_timeout(),
            connect_timeout: config.proxy.connect_timeout(),
            request_timeout: config.proxy.request_timeout(),
        });
        let websocket = WebSocketTunnel::new(
            config.proxy.connect_timeout(),
            config.proxy.websocket_idle_timeout(),
        );

        Ok(Arc::new(Self {
            router: ProxyRouter::from_config(&config),
            state: RwLock::new(GatewayMode::Disabled),
            draining: AtomicBool::new(false),
            in_flight: Arc::new(AtomicUsize::new(0)),
            http,
            websocket,
            hotfile,
            supervisor,
            manifest,
            upstream_cache: RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
            config,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current state; `Disabled` before `start()` and after `shutdown()`
    pub fn mode(&self) -> GatewayMode {
        *self.state.read()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn hotfile(&self) -> &HotFileStore {
        &self.hotfile
    }

    pub fn supervisor(&self) -> &DevServerSupervisor {
        &self.supervisor
    }

    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_deref()
    }

    pub fn tunnel_stats(&self) -> Arc<TunnelStats> {
        self.http.stats()
    }

    /// Enter the configured mode, starting or adopting the dev server if needed
    pub async fn start(&self) -> Result<(), GatewayError> {
        let mode = self.config.mode;

        if mode.is_dev() {
            if self.config.dev_server.start {
                let handle = self.supervisor.start().await?;
                info!(url = %handle.url(), owned = handle.is_owned(), "Dev server available");
            } else {
                match self.hotfile.read_live().await? {
                    Some(url) => info!(url = %url, "Using dev server from hotfile"),
                    None => warn!(
                        hotfile = %self.hotfile.path().display(),
                        "No dev server recorded yet, proxied requests will fail until one starts"
                    ),
                }
            }
        }

        self.draining.store(false, Ordering::SeqCst);
        *self.state.write() = mode;
        info!(mode = mode.as_str(), "Gateway started");
        Ok(())
    }

    /// Drain in-flight proxy traffic, stop the dev server and return to `Disabled`
    pub async fn shutdown(&self) {
        self.draining.store(true, Ordering::SeqCst);
        let drain_timeout = self.config.proxy.drain_timeout();

        let drain_start = Instant::now();
        while self.in_flight() > 0 {
            if drain_start.elapsed() > drain_timeout {
                warn!(
                    remaining = self.in_flight(),
                    "Drain timeout exceeded, proceeding with shutdown"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(DRAIN_POLL_INTERVAL_MS)).await;
        }
        let drained_in = drain_start.elapsed();
        if drained_in > Duration::from_millis(100) {
            info!(drained_in_ms = drained_in.as_millis() as u64, "Drained in-flight requests");
        }

        if self.config.mode.is_dev() {
            self.supervisor.stop_current().await;
        }
        self.invalidate_upstream();
        *self.state.write() = GatewayMode::Disabled;
        info!("Gateway stopped");
    }

    /// Decide what to do with `req`
    pub async fn handle<B>(&self, req: &Request<B>) -> Result<Action, GatewayError> {
        match self.mode() {
            GatewayMode::Disabled | GatewayMode::DevDirect => Ok(Action::PassThrough),
            GatewayMode::DevProxied => self.handle_dev_proxied(req).await,
            GatewayMode::Production => self.handle_production(req.uri().path()),
        }
    }

    async fn handle_dev_proxied<B>(&self, req: &Request<B>) -> Result<Action, GatewayError> {
        let class = self.router.classify(req.uri().path());
        if !class.proxied {
            return Ok(Action::PassThrough);
        }
        if self.is_draining() {
            return Err(GatewayError::ShuttingDown);
        }

        let upstream = self
            .current_upstream()
            .await?
            .ok_or_else(|| GatewayError::DevServerUnavailable {
                hotfile: self.hotfile.path().to_path_buf(),
            })?;

        if class.upgrade && is_websocket_upgrade(req) {
            Ok(Action::ProxyWebSocketUpgrade { upstream })
        } else {
            Ok(Action::ProxyHttp { upstream })
        }
    }

    fn handle_production(&self, path: &str) -> Result<Action, GatewayError> {
        let Some(manifest) = self.manifest.as_deref() else {
            return Ok(Action::PassThrough);
        };
        let base = self.config.assets.normalized_base();
        let Some(rest) = path.strip_prefix(base.as_str()) else {
            return Ok(Action::PassThrough);
        };
        let file = match urlencoding::decode(rest) {
            Ok(file) => file.into_owned(),
            Err(_) => rest.to_string(),
        };

        if manifest.contains_file(&file) {
            return Ok(Action::ResolveManifestAsset { file });
        }
        // With a root base every application route is "under" it
        if base == "/" {
            return Ok(Action::PassThrough);
        }
        Err(GatewayError::AssetNotInManifest(crate::error::AssetNotFound(file)))
    }

    /// Dev server URL as currently known, probing the hotfile when the cache is old
    pub async fn dev_server_url(&self) -> Result<Option<String>, GatewayError> {
        if !self.config.mode.is_dev() {
            return Ok(None);
        }
        self.current_upstream().await
    }

    fn fresh_upstream(&self) -> Option<Option<String>> {
        let cache = self.upstream_cache.read();
        cache
            .as_ref()
            .filter(|c| c.fetched_at.elapsed() < self.config.proxy.hotfile_refresh())
            .map(|c| c.url.clone())
    }

    async fn current_upstream(&self) -> Result<Option<String>, GatewayError> {
        if let Some(url) = self.fresh_upstream() {
            return Ok(url);
        }

        let _refresh = self.refresh_lock.lock().await;
        // Another request may have refreshed while we waited
        if let Some(url) = self.fresh_upstream() {
            return Ok(url);
        }

        let url = self.hotfile.read_live().await?;
        *self.upstream_cache.write() = Some(CachedUpstream {
            url: url.clone(),
            fetched_at: Instant::now(),
        });
        Ok(url)
    }

    /// Forget the cached dev server URL so the next request re-probes
    pub fn invalidate_upstream(&self) {
        *self.upstream_cache.write() = None;
    }

    /// Script, stylesheet and preload URLs for a logical entry
    pub async fn asset_urls(&self, entry: &str) -> Result<AssetUrls, GatewayError> {
        let base = self.config.assets.normalized_base();
        match self.config.mode {
            GatewayMode::Production => {
                let manifest = self
                    .manifest
                    .as_deref()
                    .ok_or(GatewayError::WrongMode("production"))?;
                let resolved = manifest.resolve(entry)?;
                let url = |file: &String| format!("{}{}", base, file);
                Ok(AssetUrls {
                    scripts: vec![url(&resolved.file)],
                    styles: resolved.css_files.iter().map(url).collect(),
                    preloads: resolved.preload_files.iter().map(url).collect(),
                })
            }
            GatewayMode::DevProxied => Ok(dev_asset_urls("", &base, entry)),
            GatewayMode::DevDirect => {
                let origin = self
                    .dev_server_url()
                    .await?
                    .ok_or_else(|| GatewayError::DevServerUnavailable {
                        hotfile: self.hotfile.path().to_path_buf(),
                    })?;
                Ok(dev_asset_urls(&origin, &base, entry))
            }
            GatewayMode::Disabled => Err(GatewayError::WrongMode("an asset-serving")),
        }
    }

    fn track(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(Arc::clone(&self.in_flight))
    }

    /// Decide and execute: proxy actions are carried out here, everything else
    /// is handed back to the caller.
    pub async fn dispatch<B>(&self, mut req: Request<B>, client: ClientInfo) -> Dispatch<B>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let request_id = ensure_request_id(&mut req);

        let action = match self.handle(&req).await {
            Ok(action) => action,
            Err(e) => {
                return Dispatch::Response(self.error_response(e, req.uri().path(), &request_id));
            }
        };

        match action {
            Action::PassThrough => Dispatch::PassThrough(req),
            Action::ResolveManifestAsset { file } => Dispatch::Asset { file },
            Action::ProxyHttp { upstream } => {
                Dispatch::Response(self.proxy_http(req, &upstream, client, &request_id).await)
            }
            Action::ProxyWebSocketUpgrade { upstream } => {
                Dispatch::Response(self.proxy_websocket(req, &upstream, &request_id).await)
            }
        }
    }

    /// Forward a pass-through request to the host application
    pub async fn pass_through<B>(
        &self,
        mut req: Request<B>,
        app_upstream: &str,
        client: ClientInfo,
    ) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let request_id = ensure_request_id(&mut req);
        let path = req.uri().path().to_string();

        match self.http.forward(req, app_upstream, client).await {
            Ok(response) => response,
            Err(e) => self.error_response(e.into(), &path, &request_id),
        }
    }

    async fn proxy_http<B>(
        &self,
        req: Request<B>,
        upstream: &str,
        client: ClientInfo,
        request_id: &str,
    ) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let path = req.uri().path().to_string();
        let guard = self.track();

        match self.http.forward(req, upstream, client).await {
            Ok(response) => {
                debug!(
                    request_id,
                    path = %path,
                    status = %response.status(),
                    "Proxied to dev server"
                );
                let (parts, body) = response.into_parts();
                // The guard lives as long as the streamed body
                let body = body
                    .map_frame(move |frame: Frame<Bytes>| {
                        let _held = &guard;
                        frame
                    })
                    .boxed();
                Response::from_parts(parts, body)
            }
            Err(e) => {
                self.invalidate_upstream();
                self.error_response(e.into(), &path, request_id)
            }
        }
    }

    async fn proxy_websocket<B>(
        &self,
        req: Request<B>,
        upstream: &str,
        request_id: &str,
    ) -> Response<ProxyBody>
    where
        B: Body + Send + 'static,
    {
        let path = req.uri().path().to_string();
        let guard = self.track();

        match self.websocket.upgrade(req, upstream, request_id, guard).await {
            Ok(response) => response,
            Err(e) => {
                self.invalidate_upstream();
                self.error_response(e.into(), &path, request_id)
            }
        }
    }

    fn error_response(
        &self,
        err: GatewayError,
        path: &str,
        request_id: &str,
    ) -> Response<ProxyBody> {
        match &err {
            GatewayError::Upstream(_) | GatewayError::HotFile(_) | GatewayError::Startup(_) => {
                error!(request_id, path, error = %err, "Gateway request failed");
            }
            _ => {
                warn!(request_id, path, error = %err, "Gateway request rejected");
            }
        }

        let mut response = err.into_response();
        if let Ok(value) = HeaderValue::from_str(request_id) {
            response.headers_mut().insert(X_REQUEST_ID, value);
        }
        response
    }
}

fn dev_asset_urls(origin: &str, base: &str, entry: &str) -> AssetUrls {
    let origin = origin.trim_end_matches('/');
    AssetUrls {
        scripts: vec![
            format!("{}{}@vite/client", origin, base),
            format!("{}{}{}", origin, base, entry.trim_start_matches('/')),
        ],
        styles: Vec::new(),
        preloads: Vec::new(),
    }
}

/// Reuse the client's request id or assign a new one
fn ensure_request_id<B>(req: &mut Request<B>) -> String {
    if let Some(id) = req.headers().get(X_REQUEST_ID).and_then(|v| v.to_str().ok()) {
        return id.to_string();
    }
    let id = Uuid::new_v4().to_string();
    if let Ok(value) = HeaderValue::from_str(&id) {
        req.headers_mut().insert(X_REQUEST_ID, value);
    }
    id
}
