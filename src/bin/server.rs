use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bridgewatch::{api, AnalyticsService, Config, PgEventStore};

/// HTTP analytics over logged presence events.
#[derive(Parser)]
#[command(name = "bridgewatch-server", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Overrides `server.address`
    #[arg(long)]
    address: Option<String>,

    /// Overrides `server.port`
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let store = PgEventStore::connect(&config.datastore)
        .await
        .context("connecting to datastore")?;
    store.ensure_schema().await.context("preparing schema")?;

    let service = AnalyticsService::new(
        Arc::new(store),
        config.reference_timezone,
        config.analytics.max_list_rows,
    );

    let address = args.address.unwrap_or(config.server.address);
    let port = args.port.unwrap_or(config.server.port);
    let figment = rocket::Config::figment()
        .merge(("address", address.as_str()))
        .merge(("port", port));

    info!(%address, port, timezone = %config.reference_timezone, "starting analytics server");
    api::build(service, figment)
        .launch()
        .await
        .map_err(|e| anyhow::anyhow!("analytics server failed: {e}"))?;
    Ok(())
}
