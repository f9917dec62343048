//! Event relay entry point.
//!
//! 1. **Wire observability**: JSON logs filtered by `RUST_LOG`, plus OTLP
//!    export when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
//! 2. **Load settings** from `appsettings.json` (or `EVENT_RELAY_SETTINGS`)
//!    and `Section__Key` environment overrides.
//! 3. **Start the relay** and run until Ctrl-C, then shut down gracefully.

use anyhow::Context;
use cli::{observability, Relay, RelaySettings};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let telemetry = observability::init()?;

    let result = run().await;
    if let Err(err) = &result {
        error!(error = %format!("{err:#}"), "Event relay failed");
    }

    telemetry.shutdown();
    result
}

async fn run() -> anyhow::Result<()> {
    let settings = RelaySettings::load()?;
    let relay = Relay::start(&settings).await?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    relay.shutdown().await;
    Ok(())
}
