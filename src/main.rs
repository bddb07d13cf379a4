use assetgate::config::Config;
use assetgate::gateway::Gateway;
use assetgate::server::GatewayServer;
use assetgate::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("assetgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("assetgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(
                bind = %config.server.bind,
                port = config.server.port,
                error = %e,
                "Invalid bind address"
            );
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let gateway = Gateway::new(config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = GatewayServer::launch(addr, Arc::clone(&gateway), shutdown_rx)
        .await
        .map_err(|e| {
            error!(addr = %addr, error = %e, "Gateway failed to start");
            e
        })?;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    wait_for_signal().await;

    // Stop accepting, then drain and stop the dev server
    let _ = shutdown_tx.send(true);
    gateway.shutdown().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config) {
    info!(
        name = PKG_NAME,
        version = VERSION,
        mode = config.mode.as_str(),
        "Starting asset gateway"
    );
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        app_upstream = ?config.server.app_upstream,
        discovery_path = %config.server.discovery_path,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    if config.mode.is_dev() {
        info!(
            command = ?config.dev_server.command,
            working_dir = ?config.dev_server.working_dir,
            start = config.dev_server.start,
            startup_timeout_secs = config.dev_server.startup_timeout_secs,
            "Dev server settings"
        );
        info!(
            hmr_path = %config.proxy.hmr_path,
            source_dirs = ?config.proxy.source_dirs,
            extra_prefixes = config.proxy.extra_prefixes.len(),
            "Proxy settings"
        );
    }
    info!(
        hotfile = %config.assets.hotfile.display(),
        manifest = %config.assets.manifest.display(),
        base_url = %config.assets.base_url,
        "Asset settings"
    );
}
