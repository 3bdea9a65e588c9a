//! Analytical column store access (bulk candles + indicator series).

pub mod candles;
pub mod indicators;
pub mod pool;

pub use candles::CandleStore;
pub use indicators::IndicatorStore;
pub use pool::{AnalyticsClientGuard, AnalyticsPool};
