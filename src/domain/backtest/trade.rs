use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl PositionSide {
    pub fn opposite(&self) -> PositionSide {
        match self {
            PositionSide::Buy => PositionSide::Sell,
            PositionSide::Sell => PositionSide::Buy,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Buy => write!(f, "BUY"),
            PositionSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Why a position was closed, in descending evaluation priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    ExitSignal,
    EndOfData,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "STOP_LOSS"),
            ExitReason::TakeProfit => write!(f, "TAKE_PROFIT"),
            ExitReason::ExitSignal => write!(f, "EXIT_SIGNAL"),
            ExitReason::EndOfData => write!(f, "END_OF_DATA"),
        }
    }
}

/// One simulated trade with full capital accounting. Persisted verbatim into
/// the result ledger; the derived percentage fields are computed once at
/// construction so readers never re-derive them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub position: PositionSide,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_time: DateTime<Utc>,
    pub exit_price: f64,
    /// Exit reason label; carries a ` (FLIP)` suffix on reversals.
    pub exit_reason: String,
    pub is_flip: bool,

    pub quantity: i64,
    pub lot_size: i64,
    pub num_lots: i64,
    pub position_cost: f64,

    pub entry_capital: f64,
    pub exit_capital: f64,
    /// Capital deployed relative to the balance, e.g. 300.0 for 3x.
    pub position_size_pct: f64,

    pub initial_stop_loss: Option<f64>,
    pub final_stop_loss: Option<f64>,
    pub take_profit: Option<f64>,

    pub gross_profit_abs: f64,
    pub commission_cost: f64,
    pub net_profit_abs: f64,

    pub duration_hours: f64,
    pub duration_candles: usize,

    pub gross_profit_pct_on_position: f64,
    pub gross_profit_pct_on_capital: f64,
    pub net_profit_pct_on_position: f64,
    pub net_profit_pct_on_capital: f64,
}

pub struct TradeBuilder {
    pub position: PositionSide,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_time: DateTime<Utc>,
    pub exit_price: f64,
    pub exit_reason: ExitReason,
    pub is_flip: bool,
    pub quantity: i64,
    pub lot_size: i64,
    pub num_lots: i64,
    pub entry_capital: f64,
    pub initial_stop_loss: f64,
    pub final_stop_loss: f64,
    pub take_profit: f64,
    pub duration_candles: usize,
    pub commission_rate: f64,
    pub position_size_multiplier: f64,
}

impl TradeBuilder {
    /// Finalizes the capital math. Gross PnL is price delta times quantity,
    /// commission applies to both legs on the position cost, and
    /// `exit_capital == entry_capital + net_profit_abs` exactly.
    pub fn build(self) -> TradeRecord {
        let quantity_f = self.quantity as f64;
        let position_cost = self.entry_price * quantity_f;

        let gross_profit_abs = match self.position {
            PositionSide::Buy => (self.exit_price - self.entry_price) * quantity_f,
            PositionSide::Sell => (self.entry_price - self.exit_price) * quantity_f,
        };
        let commission_cost = 2.0 * position_cost * self.commission_rate;
        let net_profit_abs = gross_profit_abs - commission_cost;
        let exit_capital = self.entry_capital + net_profit_abs;

        let pct = |num: f64, denom: f64| if denom != 0.0 { num / denom * 100.0 } else { 0.0 };

        let exit_reason = if self.is_flip {
            format!("{} (FLIP)", self.exit_reason)
        } else {
            self.exit_reason.to_string()
        };

        TradeRecord {
            position: self.position,
            entry_time: self.entry_time,
            entry_price: self.entry_price,
            exit_time: self.exit_time,
            exit_price: self.exit_price,
            exit_reason,
            is_flip: self.is_flip,
            quantity: self.quantity,
            lot_size: self.lot_size,
            num_lots: self.num_lots,
            position_cost,
            entry_capital: self.entry_capital,
            exit_capital,
            position_size_pct: self.position_size_multiplier * 100.0,
            initial_stop_loss: nan_to_none(self.initial_stop_loss),
            final_stop_loss: nan_to_none(self.final_stop_loss),
            take_profit: nan_to_none(self.take_profit),
            gross_profit_abs,
            commission_cost,
            net_profit_abs,
            duration_hours: (self.exit_time - self.entry_time).num_seconds() as f64 / 3600.0,
            duration_candles: self.duration_candles,
            gross_profit_pct_on_position: pct(gross_profit_abs, position_cost),
            gross_profit_pct_on_capital: pct(gross_profit_abs, self.entry_capital),
            net_profit_pct_on_position: pct(net_profit_abs, position_cost),
            net_profit_pct_on_capital: pct(net_profit_abs, self.entry_capital),
        }
    }
}

fn nan_to_none(v: f64) -> Option<f64> {
    if v.is_nan() { None } else { Some(v) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn builder() -> TradeBuilder {
        TradeBuilder {
            position: PositionSide::Buy,
            entry_time: Utc.with_ymd_and_hms(2024, 1, 3, 10, 0, 0).unwrap(),
            entry_price: 100.0,
            exit_time: Utc.with_ymd_and_hms(2024, 1, 3, 15, 0, 0).unwrap(),
            exit_price: 110.0,
            exit_reason: ExitReason::ExitSignal,
            is_flip: false,
            quantity: 100,
            lot_size: 10,
            num_lots: 10,
            entry_capital: 100_000.0,
            initial_stop_loss: 95.0,
            final_stop_loss: 102.0,
            take_profit: f64::NAN,
            duration_candles: 5,
            commission_rate: 0.0003,
            position_size_multiplier: 1.0,
        }
    }

    #[test]
    fn test_capital_identity() {
        let trade = builder().build();
        assert_eq!(trade.gross_profit_abs, 1000.0);
        assert_eq!(trade.commission_cost, 2.0 * 10_000.0 * 0.0003);
        assert_eq!(
            trade.exit_capital,
            trade.entry_capital + trade.net_profit_abs
        );
    }

    #[test]
    fn test_short_pnl_sign() {
        let mut b = builder();
        b.position = PositionSide::Sell;
        let trade = b.build();
        assert_eq!(trade.gross_profit_abs, -1000.0);
    }

    #[test]
    fn test_flip_suffix() {
        let mut b = builder();
        b.is_flip = true;
        let trade = b.build();
        assert_eq!(trade.exit_reason, "EXIT_SIGNAL (FLIP)");
    }

    #[test]
    fn test_nan_levels_become_none() {
        let trade = builder().build();
        assert_eq!(trade.take_profit, None);
        assert_eq!(trade.initial_stop_loss, Some(95.0));
    }

    #[test]
    fn test_duration_hours() {
        let trade = builder().build();
        assert_eq!(trade.duration_hours, 5.0);
    }
}
