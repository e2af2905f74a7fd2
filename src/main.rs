use anyhow::Context;
use apprelay::config::AppsConfig;
use apprelay::proxy::ProxyServer;
use apprelay::registry::Registry;
use apprelay::scheduler::RunScheduler;
use apprelay::staging::{self, Git};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("apprelay=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("multi-app.yaml"));

    let config = AppsConfig::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let cwd = std::env::current_dir().context("Failed to determine working directory")?;

    staging::stage_repos(&Git::default(), &config.repos, &cwd).await?;

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;
    let ui_assets = config.server.ui_assets.clone();
    let max_running = config.server.max_running;

    let registry = Arc::new(Registry::from_config_in(config, &cwd)?);

    if let Some(assets) = ui_assets {
        let src = resolve_against(&cwd, &assets);
        staging::stage_ui(&src, registry.management().root_dir())?;
    }

    let scheduler = Arc::new(RunScheduler::new(max_running));
    scheduler
        .run_app(registry.management())
        .context("Failed to start management app")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = ProxyServer::new(
        bind_addr,
        Arc::clone(&registry),
        Arc::clone(&scheduler),
        shutdown_rx,
    );
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Relay server error");
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

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
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    info!(active = scheduler.active_count(), "Stopping all apps...");
    scheduler.stop_all();

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn resolve_against(cwd: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

fn print_startup_banner(config: &AppsConfig) {
    info!(name = PKG_NAME, version = VERSION, "Starting relay");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        management_port = config.server.management_port,
        base_port = config.server.base_port,
        max_running = config.server.max_running,
        "Server configuration"
    );
    info!(
        app_count = config.apps.len(),
        apps = ?config.apps.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
        repos = config.repos.len(),
        "Configured apps"
    );
}
