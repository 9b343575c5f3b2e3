//! Zero Fundamentals - Fundamental data change detection and bias scoring
//! for the Zero ecosystem.

use anyhow::{Context, Result};
use zero_common::config::Config;
use zero_common::logging::init_logging_with_exclusions;
use zero_fundamentals::build_service;

#[tokio::main]
async fn main() -> Result<()> {
    // Start timing immediately for cold-start measurement
    let startup_start = std::time::Instant::now();

    let config = Config::load_with_env().context("Failed to load configuration")?;

    init_logging_with_exclusions(
        &config.observability.log_level,
        &config.observability.log_format,
        &config.observability.excluded_targets,
    );

    tracing::info!("Zero Fundamentals v{}", env!("CARGO_PKG_VERSION"));

    let service = build_service(&config)?;
    service.start().await?;

    let startup_duration = startup_start.elapsed();
    tracing::info!(
        duration_ms = startup_duration.as_millis() as u64,
        "Service initialized in {:?}",
        startup_duration
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    service.stop().await;
    Ok(())
}
