//! Relational store access (authoritative configuration, jobs, results).

pub mod batches;
pub mod jobs;
pub mod strategies;
pub mod system_indicators;
pub mod tickers;

pub use batches::{BatchStore, ChildOutcome};
pub use jobs::BacktestJobStore;
pub use strategies::StrategyStore;
pub use system_indicators::SystemIndicatorStore;
pub use tickers::TickerStore;

use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .context("Failed to connect to PostgreSQL")?;
    info!("Connected to PostgreSQL ({} connections max)", max_connections);
    Ok(pool)
}
