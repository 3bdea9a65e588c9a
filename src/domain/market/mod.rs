// Market data domain
pub mod candle;
pub mod ticker;
pub mod timeframe;

pub use candle::Candle;
pub use ticker::{Ticker, TickerInfo};
pub use timeframe::Timeframe;

/// All candle timestamps on the platform are Moscow exchange time.
pub const MOSCOW_TZ: chrono_tz::Tz = chrono_tz::Europe::Moscow;
