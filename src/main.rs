use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use wakegate::config::Config;
use wakegate::forward::{ForwarderConfig, RequestForwarder};
use wakegate::proxy::{ProxyHandler, ProxyServer};
use wakegate::supervisor::BackendSupervisor;
use wakegate::{PKG_NAME, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wakegate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("wakegate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    let bind_addr = config.server.bind_addr()?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervisor = BackendSupervisor::new(config.backend.clone());
    let forwarder = Arc::new(RequestForwarder::new(ForwarderConfig::from_config(
        &config.server,
        &config.backend,
    ))?);
    let stats = forwarder.stats();

    let handler = Arc::new(ProxyHandler::new(
        supervisor,
        forwarder,
        config.server.max_body_bytes,
    ));
    let proxy = ProxyServer::new(bind_addr, handler, shutdown_rx);

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

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
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown; the backend is left running
    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), proxy_handle).await;

    info!(
        requests = stats.get_requests(),
        redirects = stats.get_redirects(),
        failures = stats.get_failures(),
        "Forwarding statistics"
    );
    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        request_timeout_secs = config.server.request_timeout_secs,
        max_redirects = config.server.max_redirects,
        max_body_bytes = config.server.max_body_bytes,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        command = %config.backend.command,
        args = ?config.backend.args,
        working_dir = ?config.backend.working_dir,
        target = %config.backend.base_url(),
        log_file = ?config.backend.log_file,
        "Backend configuration"
    );
    info!(
        ready_timeout_ms = config.backend.ready_timeout_ms,
        respawn_backoff_ms = config.backend.respawn_backoff_ms,
        "Backend launch settings"
    );
}
