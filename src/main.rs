use mirrorgate::auth::{AllowAll, Authorizer, LicenseAuthorizer};
use mirrorgate::config::{Config, LogFormat};
use mirrorgate::content::MirrorContent;
use mirrorgate::proxy::{Mirror, ProxyServer};
use mirrorgate::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path)
        .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", config_path.display(), e))?;

    init_logging(config.logging.format);
    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    let authorizer = load_authorizer(&config)?;

    let mirror = Arc::new(Mirror::from_config(&config, authorizer)?);
    info!(sites = ?mirror.registry().domains(), "Sites registered");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let server = ProxyServer::new(
        addr,
        Arc::clone(&mirror),
        config.server.max_connections,
        shutdown_rx,
    );
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Mirror server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or config reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, reloading configuration...");
                    if let Err(e) = reload(&mirror, &config_path) {
                        error!(error = %e, "Failed to reload configuration");
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mirrorgate=info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

/// License check for the configured license file, or allow-all without one
fn load_authorizer(config: &Config) -> anyhow::Result<Arc<dyn Authorizer>> {
    match &config.license.file {
        Some(path) => {
            let authorizer = LicenseAuthorizer::load(path)?;
            info!(
                path = %path.display(),
                expires = %authorizer.license().date,
                licensed_addresses = authorizer.license().ip_list.len(),
                "License loaded"
            );
            Ok(Arc::new(authorizer))
        }
        None => {
            warn!("No license file configured, all requests are authorized");
            Ok(Arc::new(AllowAll))
        }
    }
}

/// Re-read the configuration file, license and content sources and swap
/// them in. An unreadable license keeps the previous one.
fn reload(mirror: &Mirror, path: &Path) -> anyhow::Result<()> {
    let config = Config::load(path)?;
    let content = MirrorContent::load(&config.content)?;
    match load_authorizer(&config) {
        Ok(authorizer) => mirror.set_authorizer(authorizer),
        Err(e) => error!(error = %e, "Failed to reload license, keeping previous license"),
    }
    let result = mirror.reload(&config, content);

    info!(
        added = result.added.len(),
        removed = result.removed.len(),
        updated = result.updated.len(),
        rejected = result.rejected.len(),
        "Configuration reloaded successfully"
    );
    if !result.added.is_empty() {
        info!(sites = ?result.added, "New sites available");
    }
    if !result.removed.is_empty() {
        info!(sites = ?result.removed, "Sites removed");
    }
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting mirror server");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        scheme_header = %config.server.scheme_header,
        max_connections = config.server.max_connections,
        "Server configuration"
    );
    info!(
        root = %config.cache.root.display(),
        max_pooled_bytes = config.cache.max_pooled_bytes,
        "Cache settings"
    );
    info!(
        connect_timeout_secs = config.origin.connect_timeout_secs,
        keepalive_secs = config.origin.keepalive_secs,
        pool_max_idle = config.origin.pool_max_idle_per_host,
        egress_addresses = ?config.origin.egress_addresses,
        user_agent_override = config.origin.user_agent.is_some(),
        "Origin settings"
    );
    info!(
        spiders = config.crawler.spiders.len(),
        good_spiders = config.crawler.good_spiders.len(),
        "Crawler lists"
    );
    info!(
        site_count = config.sites.len(),
        sites = ?config.sites.keys().collect::<Vec<_>>(),
        "Configured sites"
    );
}
