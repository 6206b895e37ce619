use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use switchgate::config::{AppStore, Config};
use switchgate::control::ShellController;
use switchgate::manager::{ManagerSettings, ProcessManager};
use switchgate::pool::PoolConfig;
use switchgate::proxy::{GatewayOptions, ProxyServer};
use switchgate::readiness::{HttpProbe, ReadinessPolicy};
use switchgate::{PKG_NAME, VERSION};
use tokio::sync::watch;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("switchgate=debug".parse()?),
        )
        .init();

    // Load configuration
    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = if explicit_path.is_none() && !config_path.exists() {
        warn!(path = %config_path.display(), "No configuration file, starting with defaults and no apps");
        Config::default()
    } else {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    };

    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let apps = AppStore::new(config.apps_document());

    let process_manager = ProcessManager::new(
        ShellController,
        HttpProbe::new(ReadinessPolicy::from(&config.manager)),
        ManagerSettings::from(&config.manager),
        shutdown_rx.clone(),
    );

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let proxy = ProxyServer::with_pool_config(
        bind_addr,
        Arc::clone(&process_manager),
        apps.clone(),
        shutdown_rx.clone(),
        PoolConfig::from(&config.server),
    )
    .with_options(GatewayOptions::from(&config.server));

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    wait_for_shutdown_signal(&config_path, &apps).await?;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!("Stopping active app...");
    process_manager.shutdown().await;

    // Wait for the listener to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), proxy_handle).await;

    info!("Shutdown complete");
    Ok(())
}

/// Block until Ctrl+C or SIGTERM; SIGHUP reloads the app list in between
#[cfg(unix)]
async fn wait_for_shutdown_signal(config_path: &Path, apps: &AppStore) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
                return Ok(());
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                return Ok(());
            }
            _ = sighup.recv() => {
                info!(path = %config_path.display(), "Received SIGHUP, reloading app list...");
                reload_apps(config_path, apps);
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal(_config_path: &Path, _apps: &AppStore) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    Ok(())
}

/// Replace the app list with the one in the file; listener settings are not reloaded
#[cfg_attr(not(unix), allow(dead_code))]
fn reload_apps(config_path: &Path, apps: &AppStore) {
    match Config::load(config_path) {
        Ok(config) => {
            let doc = config.apps_document();
            info!(
                app_count = doc.apps.len(),
                apps = ?doc.apps.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
                "App list reloaded"
            );
            apps.replace(doc);
        }
        Err(e) => {
            error!(error = %e, "Failed to reload configuration, keeping the current app list");
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        selector_param = %config.server.selector_param,
        request_timeout_secs = config.server.request_timeout_secs,
        max_buffered_body_bytes = config.server.max_buffered_body_bytes,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        queue_capacity = config.manager.queue_capacity,
        shutdown_grace_period_secs = config.manager.shutdown_grace_period_secs,
        "Process manager settings"
    );
    info!(
        readiness_path = %config.manager.readiness_path,
        readiness_attempts = config.manager.readiness_attempts,
        readiness_timeout_secs = config.manager.readiness_timeout_secs,
        readiness_interval_ms = config.manager.readiness_interval_ms,
        "Readiness settings"
    );
    info!(
        app_count = config.apps.len(),
        apps = ?config.apps.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
        "Configured apps"
    );
}
