//! Error taxonomy and JSON error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Boxed error used for streamed bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type of every response produced by the gateway
pub type ProxyBody = BoxBody<Bytes, BoxError>;

/// The dev server failed or exited before becoming ready
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("no dev server command configured")]
    MissingCommand,

    #[error("invalid dev server command '{command}': {reason}")]
    InvalidCommand { command: String, reason: String },

    #[error("failed to spawn dev server `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "dev server `{command}` exited during startup with {}{}",
        exit_label(.exit_code),
        output_block(.output)
    )]
    Exited {
        command: String,
        exit_code: Option<i32>,
        output: Vec<String>,
    },

    #[error(
        "dev server `{command}` not reachable after {}s{}",
        .timeout.as_secs_f64(),
        output_block(.output)
    )]
    Timeout {
        command: String,
        timeout: Duration,
        output: Vec<String>,
    },

    #[error("failed to record dev server address: {0}")]
    HotFile(#[from] HotFileError),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

fn output_block(lines: &[String]) -> String {
    if lines.is_empty() {
        return "; no output captured".to_string();
    }
    format!("; last {} output lines:\n  {}", lines.len(), lines.join("\n  "))
}

/// The dev server (or host application) did not answer a forwarded request
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("failed to reach upstream {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: BoxError,
    },

    #[error("upstream {url} did not respond within {}s", .timeout.as_secs())]
    Timeout { url: String, timeout: Duration },

    #[error("invalid upstream URL '{url}': {reason}")]
    InvalidUpstream { url: String, reason: String },

    #[error("WebSocket handshake with {url} failed: {source}")]
    Handshake {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
}

/// The production manifest could not be loaded
#[derive(Debug, thiserror::Error)]
pub enum ManifestLoadError {
    #[error("failed to read manifest {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("import cycle in manifest: {}", .cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },

    #[error("manifest entry '{entry}' imports unknown entry '{import}'")]
    DanglingImport { entry: String, import: String },
}

/// A logical entry is not present in the manifest
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("asset '{0}' not in manifest")]
pub struct AssetNotFound(pub String);

/// Hotfile failures
#[derive(Debug, thiserror::Error)]
pub enum HotFileError {
    #[error("hotfile {} I/O error: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Record points at a server that no longer answers
    #[error("hotfile records {url} but nothing is listening")]
    Stale { url: String },
}

/// Errors surfaced by the gateway entry points
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Startup(#[from] StartupError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    ManifestLoad(#[from] ManifestLoadError),

    #[error(transparent)]
    HotFile(#[from] HotFileError),

    #[error(transparent)]
    AssetNotInManifest(#[from] AssetNotFound),

    #[error("no live dev server recorded in {}", .hotfile.display())]
    DevServerUnavailable { hotfile: PathBuf },

    #[error("gateway is shutting down")]
    ShuttingDown,

    #[error("no upstream configured for pass-through requests")]
    NoAppUpstream,

    #[error("gateway is not running in {0} mode")]
    WrongMode(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl GatewayError {
    /// Error code reported to clients
    pub fn code(&self) -> GatewayErrorCode {
        match self {
            GatewayError::Startup(_) => GatewayErrorCode::DevServerStartFailed,
            GatewayError::Upstream(UpstreamError::Timeout { .. }) => {
                GatewayErrorCode::UpstreamTimeout
            }
            GatewayError::Upstream(UpstreamError::Handshake { .. }) => {
                GatewayErrorCode::WebSocketHandshakeFailed
            }
            GatewayError::Upstream(_) => GatewayErrorCode::UpstreamConnectFailed,
            GatewayError::ManifestLoad(_) | GatewayError::HotFile(_) => {
                GatewayErrorCode::InternalError
            }
            GatewayError::AssetNotInManifest(_) => GatewayErrorCode::AssetNotInManifest,
            GatewayError::DevServerUnavailable { .. } => GatewayErrorCode::DevServerUnavailable,
            GatewayError::ShuttingDown => GatewayErrorCode::ShuttingDown,
            GatewayError::NoAppUpstream => GatewayErrorCode::NoUpstream,
            GatewayError::WrongMode(_) | GatewayError::Config(_) => GatewayErrorCode::InternalError,
        }
    }

    /// Convert into a JSON response with a generic client-facing message
    pub fn into_response(self) -> Response<ProxyBody> {
        let code = self.code();
        json_error_response(code, code.public_message())
    }
}

/// Error codes for gateway error responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// No live dev server is known
    DevServerUnavailable,
    /// The dev server could not be started
    DevServerStartFailed,
    /// Connecting to the upstream failed
    UpstreamConnectFailed,
    /// The upstream did not answer in time
    UpstreamTimeout,
    /// The upstream refused the WebSocket upgrade
    WebSocketHandshakeFailed,
    /// Gateway is draining
    ShuttingDown,
    /// Requested file is not part of the build
    AssetNotInManifest,
    /// Nothing to forward pass-through traffic to
    NoUpstream,
    /// Internal gateway error
    InternalError,
}

impl GatewayErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::DevServerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::DevServerStartFailed => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::UpstreamConnectFailed => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayErrorCode::WebSocketHandshakeFailed => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::AssetNotInManifest => StatusCode::NOT_FOUND,
            GatewayErrorCode::NoUpstream => StatusCode::NOT_FOUND,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::DevServerUnavailable => "DEV_SERVER_UNAVAILABLE",
            GatewayErrorCode::DevServerStartFailed => "DEV_SERVER_START_FAILED",
            GatewayErrorCode::UpstreamConnectFailed => "UPSTREAM_CONNECT_FAILED",
            GatewayErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            GatewayErrorCode::WebSocketHandshakeFailed => "WEBSOCKET_HANDSHAKE_FAILED",
            GatewayErrorCode::ShuttingDown => "SHUTTING_DOWN",
            GatewayErrorCode::AssetNotInManifest => "ASSET_NOT_IN_MANIFEST",
            GatewayErrorCode::NoUpstream => "NO_UPSTREAM",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Message shown to clients; details stay in the logs
    pub fn public_message(&self) -> &'static str {
        match self {
            GatewayErrorCode::DevServerUnavailable => "Dev server is not running",
            GatewayErrorCode::DevServerStartFailed => "Dev server unavailable",
            GatewayErrorCode::UpstreamConnectFailed => "Failed to connect to upstream",
            GatewayErrorCode::UpstreamTimeout => "Upstream timed out",
            GatewayErrorCode::WebSocketHandshakeFailed => "Upstream rejected WebSocket upgrade",
            GatewayErrorCode::ShuttingDown => "Gateway is shutting down, please retry later",
            GatewayErrorCode::AssetNotInManifest => "Asset not in manifest",
            GatewayErrorCode::NoUpstream => "Not found",
            GatewayErrorCode::InternalError => "Internal gateway error",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: GatewayErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Wrap a fully buffered payload as a gateway body
pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<ProxyBody> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Gateway-Error", code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}
