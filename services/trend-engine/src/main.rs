//! Trend Engine - status report for the local market-data store.
//!
//! Opens the configured database, rebuilds the symbol pool from stored ETF
//! configs and prints the completeness report as JSON. Live providers are
//! registered by embedding applications through the library API.

use anyhow::{Context, Result};
use std::sync::Arc;
use trend_common::config::Config;
use trend_common::logging::init_logging_with_exclusions;
use trend_engine::{MarketDataEngine, SqliteStorage, Storage};

#[tokio::main]
async fn main() -> Result<()> {
    let startup_start = std::time::Instant::now();

    let config = Config::load_with_env()?;

    init_logging_with_exclusions(
        &config.observability.log_level,
        &config.observability.log_format,
        &config.observability.excluded_targets,
    );

    tracing::info!("Trend Engine v{}", env!("CARGO_PKG_VERSION"));

    let db_path = config.storage.resolved_db_path();
    let sqlite = Arc::new(
        SqliteStorage::open(&db_path)
            .with_context(|| format!("Failed to open database at {}", db_path.display()))?,
    );
    let storage: Arc<dyn Storage> = sqlite.clone();
    let engine = MarketDataEngine::new(config, storage.clone());

    if storage.list_etf_configs().await?.is_empty() {
        tracing::warn!("No ETF configs stored; completeness report will be empty");
    } else {
        let pool = engine.sync_configured_pool().await?;
        let persisted = sqlite.pool_tickers().await?;
        tracing::info!(
            symbols = pool.len(),
            persisted = persisted.len(),
            etfs = pool.etfs.len(),
            estimated_seconds = pool.estimated_update_seconds(),
            "Pool ready"
        );
    }

    let report = engine.get_completeness(None);
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Some(regime) = engine.market_regime().await? {
        tracing::info!(
            regime = %regime.regime,
            exposure = regime.exposure,
            breadth = regime.breadth,
            "Market regime"
        );
    }

    tracing::info!(
        duration_ms = startup_start.elapsed().as_millis() as u64,
        "Report complete"
    );
    Ok(())
}
