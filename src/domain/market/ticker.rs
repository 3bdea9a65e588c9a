use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Instrument metadata from the relational store. Immutable for the life of
/// a backtest; cached with a TTL by the ticker repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub market_id: Uuid,
    pub lot_size: i64,
    pub min_step: f64,
    pub decimals: i16,
    pub currency: String,
    pub is_active: bool,
    /// Exchange popularity tier (1 = most liquid).
    pub list_level: i16,
}

/// The slice of ticker metadata the simulator needs for position sizing.
#[derive(Debug, Clone)]
pub struct TickerInfo {
    pub symbol: String,
    pub lot_size: i64,
    pub min_step: f64,
    pub decimals: i16,
}

impl From<&Ticker> for TickerInfo {
    fn from(t: &Ticker) -> Self {
        TickerInfo {
            symbol: t.symbol.clone(),
            lot_size: t.lot_size,
            min_step: t.min_step,
            decimals: t.decimals,
        }
    }
}
