// Backtest jobs, batches, simulation config, trades, metrics
pub mod config;
pub mod job;
pub mod metrics;
pub mod trade;

pub use config::BacktestConfig;
pub use job::{BacktestJobDetails, BatchStatus, JobStatus};
pub use metrics::BacktestMetrics;
pub use trade::{ExitReason, PositionSide, TradeRecord};
