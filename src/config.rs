use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Operating mode of the gateway, fixed for the lifetime of the process
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GatewayMode {
    /// Gateway does nothing, every request passes through
    #[default]
    Disabled,
    /// Dev server traffic is proxied through the gateway's port
    DevProxied,
    /// Clients talk to the dev server directly; the gateway only publishes its address
    DevDirect,
    /// Assets are resolved through the build manifest
    Production,
}

impl GatewayMode {
    pub fn is_dev(&self) -> bool {
        matches!(self, GatewayMode::DevProxied | GatewayMode::DevDirect)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayMode::Disabled => "disabled",
            GatewayMode::DevProxied => "dev-proxied",
            GatewayMode::DevDirect => "dev-direct",
            GatewayMode::Production => "production",
        }
    }
}

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Mode selected at startup
    #[serde(default)]
    pub mode: GatewayMode,

    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// How to launch the frontend dev server
    #[serde(default)]
    pub dev_server: DevServerConfig,

    /// Proxy behaviour in dev-proxied mode
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Hotfile, manifest and bundle locations
    #[serde(default)]
    pub assets: AssetsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Port the gateway listens on (default: 8000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Host application that receives pass-through requests
    pub app_upstream: Option<String>,

    /// Path that answers with the current mode and dev server URL
    #[serde(default = "default_discovery_path")]
    pub discovery_path: String,

    /// Maximum idle connections per upstream host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            app_upstream: None,
            discovery_path: default_discovery_path(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

/// Launch contract for the dev server process
///
/// # Security Warning
///
/// `command` is executed directly with the permissions of the gateway.
/// Configuration files must come from a trusted source.
#[derive(Debug, Deserialize, Clone)]
pub struct DevServerConfig {
    /// Full command line, split with shell quoting rules (e.g. "npm run dev")
    pub command: Option<String>,

    /// Working directory for the command
    pub working_dir: Option<String>,

    /// Whether the gateway spawns the dev server. When false, only a live
    /// server recorded in the hotfile is used.
    #[serde(default = "default_true")]
    pub start: bool,

    /// Explicit host the dev server should bind to
    pub host: Option<String>,

    /// Explicit port the dev server should bind to
    pub port: Option<u16>,

    /// Extra environment variables for the child
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Maximum time to wait for the dev server to become reachable
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Window after spawn during which an exit counts as a startup failure
    #[serde(default = "default_startup_grace")]
    pub startup_grace_ms: u64,

    /// Grace period between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Number of output lines kept for diagnostics
    #[serde(default = "default_output_lines")]
    pub output_lines: usize,
}

impl Default for DevServerConfig {
    fn default() -> Self {
        Self {
            command: None,
            working_dir: None,
            start: true,
            host: None,
            port: None,
            env: HashMap::new(),
            startup_timeout_secs: default_startup_timeout(),
            startup_grace_ms: default_startup_grace(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            output_lines: default_output_lines(),
        }
    }
}

impl DevServerConfig {
    /// Create a config that runs the given command line
    pub fn command(command: &str) -> Self {
        Self {
            command: Some(command.to_string()),
            ..Self::default()
        }
    }

    /// Set working directory (builder pattern)
    pub fn with_working_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_dir = Some(dir.as_ref().to_string_lossy().into_owned());
        self
    }

    /// Set environment overrides (builder pattern)
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Pin the dev server to a host and port (builder pattern)
    pub fn with_address(mut self, host: &str, port: u16) -> Self {
        self.host = Some(host.to_string());
        self.port = Some(port);
        self
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// URL implied by an explicit host/port, if both are set
    pub fn explicit_url(&self) -> Option<String> {
        match (&self.host, self.port) {
            (Some(host), Some(port)) => Some(format!("http://{}:{}", connect_host(host), port)),
            (None, Some(port)) => Some(format!("http://127.0.0.1:{}", port)),
            _ => None,
        }
    }
}

/// Host to connect to for a bind host; wildcard binds are reached over loopback
pub fn connect_host(host: &str) -> &str {
    match host {
        "0.0.0.0" | "::" | "[::]" => "127.0.0.1",
        other => other,
    }
}

/// An additional path prefix routed to the dev server
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct PrefixConfig {
    pub prefix: String,
    #[serde(default)]
    pub upgrade: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Path of the hot-reload WebSocket endpoint
    #[serde(default = "default_hmr_path")]
    pub hmr_path: String,

    /// Source directory roots served by the dev server
    #[serde(default = "default_source_dirs")]
    pub source_dirs: Vec<String>,

    /// Additional prefixes to route to the dev server
    #[serde(default)]
    pub extra_prefixes: Vec<PrefixConfig>,

    /// Upstream connect timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Full request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// How long a hotfile lookup is trusted before re-validation
    #[serde(default = "default_hotfile_refresh")]
    pub hotfile_refresh_ms: u64,

    /// Maximum time to wait for in-flight proxy traffic during shutdown
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Close WebSocket tunnels idle for this long (0 disables)
    #[serde(default)]
    pub websocket_idle_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            hmr_path: default_hmr_path(),
            source_dirs: default_source_dirs(),
            extra_prefixes: Vec::new(),
            connect_timeout_ms: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            hotfile_refresh_ms: default_hotfile_refresh(),
            drain_timeout_secs: default_drain_timeout(),
            websocket_idle_timeout_secs: 0,
        }
    }
}

impl ProxyConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn hotfile_refresh(&self) -> Duration {
        Duration::from_millis(self.hotfile_refresh_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn websocket_idle_timeout(&self) -> Option<Duration> {
        (self.websocket_idle_timeout_secs > 0)
            .then(|| Duration::from_secs(self.websocket_idle_timeout_secs))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AssetsConfig {
    /// Marker file holding the live dev server URL
    #[serde(default = "default_hotfile")]
    pub hotfile: PathBuf,

    /// Build manifest produced by the frontend build
    #[serde(default = "default_manifest")]
    pub manifest: PathBuf,

    /// Directory holding the emitted build files
    #[serde(default = "default_bundle_dir")]
    pub bundle_dir: PathBuf,

    /// URL prefix under which built assets are served
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Timeout for the hotfile liveness probe in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            hotfile: default_hotfile(),
            manifest: default_manifest(),
            bundle_dir: default_bundle_dir(),
            base_url: default_base_url(),
            probe_timeout_ms: default_probe_timeout(),
        }
    }
}

impl AssetsConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Base URL normalised to start and end with '/'
    pub fn normalized_base(&self) -> String {
        let trimmed = self.base_url.trim_matches('/');
        if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("/{}/", trimmed)
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_listen_port() -> u16 {
    8000
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_discovery_path() -> String {
    "/__assetgate".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_startup_grace() -> u64 {
    1500
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_output_lines() -> usize {
    50
}

fn default_hmr_path() -> String {
    "/vite-hmr".to_string()
}

fn default_source_dirs() -> Vec<String> {
    vec!["/src/".to_string(), "/resources/".to_string()]
}

fn default_connect_timeout() -> u64 {
    2000
}

fn default_request_timeout() -> u64 {
    30
}

fn default_hotfile_refresh() -> u64 {
    1000
}

fn default_drain_timeout() -> u64 {
    10
}

fn default_hotfile() -> PathBuf {
    PathBuf::from("public/hot")
}

fn default_manifest() -> PathBuf {
    PathBuf::from("public/dist/.vite/manifest.json")
}

fn default_bundle_dir() -> PathBuf {
    PathBuf::from("public/dist")
}

fn default_base_url() -> String {
    "/static/".to_string()
}

fn default_probe_timeout() -> u64 {
    500
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Create a config for the given mode with all other settings defaulted
    pub fn for_mode(mode: GatewayMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.mode.is_dev() && self.dev_server.start {
            match self.dev_server.command.as_deref() {
                None => errors.push(
                    "dev_server.command is required when dev_server.start is true".to_string(),
                ),
                Some(cmd) => match shell_words::split(cmd) {
                    Ok(parts) if parts.is_empty() => {
                        errors.push("dev_server.command must not be empty".to_string())
                    }
                    Ok(_) => {}
                    Err(e) => errors.push(format!("dev_server.command cannot be parsed: {}", e)),
                },
            }
        }

        if self.dev_server.port == Some(0) {
            errors.push("dev_server.port must be greater than 0".to_string());
        }

        if self.dev_server.output_lines == 0 {
            errors.push("dev_server.output_lines must be greater than 0".to_string());
        }

        if !self.server.discovery_path.starts_with('/') {
            errors.push("server.discovery_path must start with '/'".to_string());
        }

        if let Some(ref upstream) = self.server.app_upstream {
            if !upstream.starts_with("http://") {
                errors.push(format!(
                    "server.app_upstream must be an http:// URL, got '{}'",
                    upstream
                ));
            }
        }

        if !self.proxy.hmr_path.starts_with('/') {
            errors.push("proxy.hmr_path must start with '/'".to_string());
        }

        for dir in &self.proxy.source_dirs {
            if !dir.starts_with('/') {
                errors.push(format!("proxy.source_dirs entry '{}' must start with '/'", dir));
            }
        }

        for extra in &self.proxy.extra_prefixes {
            if !extra.prefix.starts_with('/') {
                errors.push(format!(
                    "proxy.extra_prefixes entry '{}' must start with '/'",
                    extra.prefix
                ));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
