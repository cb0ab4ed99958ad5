//! Broker Relay - Main Entry Point
//!
//! Relays files between directories and message brokers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use broker_relay::api::{self, AppState};
use broker_relay::broker::backend_for;
use broker_relay::relay::Supervisor;
use broker_relay::types::{LogSettings, Settings};

#[derive(Debug, Parser)]
#[command(name = "broker-relay", version, about)]
struct Args {
    /// Directory holding the settings file
    #[arg(long, env = "RELAY_CONFIG_PATH", default_value = ".")]
    config_path: PathBuf,

    /// Settings file name inside the config path
    #[arg(long, env = "RELAY_CONFIG_FILE", default_value = "appsettings.toml")]
    config_file: String,
}

fn init_tracing(settings: &LogSettings) {
    let default_filter = settings
        .filter
        .clone()
        .unwrap_or_else(|| "broker_relay=info,tower_http=info".into());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let registry = tracing_subscriber::registry().with(filter);
    if settings.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    // Load configuration
    let path = args.config_path.join(&args.config_file);
    let settings = Settings::load(&path)
        .with_context(|| format!("failed to load settings from {}", path.display()))?;

    init_tracing(&settings.log);
    info!("Starting Broker Relay v{}", env!("CARGO_PKG_VERSION"));
    info!(settings = %path.display(), "Configuration loaded");

    let supervisor = Arc::new(Supervisor::from_settings(&settings, backend_for)?);
    if supervisor.is_empty() {
        warn!("No consumers or publishers configured");
    }

    let cancel = CancellationToken::new();

    if let Some(addr) = settings.health.listen {
        let app = api::router(Arc::new(AppState {
            supervisor: supervisor.clone(),
        }));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind health endpoint on {}", addr))?;
        info!("Health endpoint listening on http://{}", addr);

        let shutdown = cancel.clone();
        tokio::spawn(async move {
            let server = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = server.await {
                error!(error = %e, "Health endpoint failed");
            }
        });
    }

    let workers = {
        let supervisor = supervisor.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { supervisor.run(cancel).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Shutdown requested");
    cancel.cancel();

    workers.await.context("worker supervisor panicked")?;
    info!("Broker Relay stopped");
    Ok(())
}
