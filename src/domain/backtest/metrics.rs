use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use super::trade::TradeRecord;

/// Performance summary computed from a finished trade ledger.
///
/// Sharpe and stability follow the platform's historical definitions: no
/// risk-free rate and no annualization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestMetrics {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate_pct: f64,

    pub initial_balance: f64,
    pub final_balance: f64,
    pub gross_total_profit_pct: f64,
    pub net_total_profit_pct: f64,

    pub max_drawdown_pct: f64,
    pub avg_win_pct: f64,
    pub avg_loss_pct: f64,
    pub net_profit_std_dev: f64,
    /// Sum of winning PnL over absolute sum of losing PnL. Absent when the
    /// ledger has no losing trades.
    pub profit_factor: Option<f64>,
    /// Mean over std of per-trade returns on capital.
    pub sharpe_ratio: f64,
    /// R-squared of a linear fit of the equity curve against trade index.
    pub stability_score: f64,
    pub max_consecutive_wins: usize,
    pub max_consecutive_losses: usize,
}

impl BacktestMetrics {
    pub fn from_trades(initial_balance: f64, trades: &[TradeRecord]) -> BacktestMetrics {
        let total_trades = trades.len();
        let final_balance = trades
            .last()
            .map(|t| t.exit_capital)
            .unwrap_or(initial_balance);

        let wins: Vec<&TradeRecord> =
            trades.iter().filter(|t| t.net_profit_abs > 0.0).collect();
        let losses: Vec<&TradeRecord> =
            trades.iter().filter(|t| t.net_profit_abs <= 0.0).collect();

        let gross_total: f64 = trades.iter().map(|t| t.gross_profit_abs).sum();
        let returns: Vec<f64> = trades
            .iter()
            .map(|t| t.net_profit_pct_on_capital)
            .collect();

        let equity_curve: Vec<f64> = std::iter::once(initial_balance)
            .chain(trades.iter().map(|t| t.exit_capital))
            .collect();

        let win_sum: f64 = wins.iter().map(|t| t.net_profit_abs).sum();
        let loss_sum: f64 = losses.iter().map(|t| t.net_profit_abs).sum();
        let profit_factor = if loss_sum.abs() > 0.0 {
            Some(win_sum / loss_sum.abs())
        } else {
            None
        };

        let net_profit_std_dev = if returns.len() > 1 {
            Statistics::population_std_dev(&returns)
        } else {
            0.0
        };
        let sharpe_ratio = if net_profit_std_dev > 0.0 {
            Statistics::mean(&returns) / net_profit_std_dev
        } else {
            0.0
        };

        let (max_consecutive_wins, max_consecutive_losses) = consecutive_streaks(trades);

        BacktestMetrics {
            total_trades,
            winning_trades: wins.len(),
            losing_trades: losses.len(),
            win_rate_pct: if total_trades > 0 {
                wins.len() as f64 / total_trades as f64 * 100.0
            } else {
                0.0
            },
            initial_balance,
            final_balance,
            gross_total_profit_pct: gross_total / initial_balance * 100.0,
            net_total_profit_pct: (final_balance - initial_balance) / initial_balance * 100.0,
            max_drawdown_pct: max_drawdown_pct(&equity_curve),
            avg_win_pct: mean_or_zero(wins.iter().map(|t| t.net_profit_pct_on_capital)),
            avg_loss_pct: mean_or_zero(losses.iter().map(|t| t.net_profit_pct_on_capital)),
            net_profit_std_dev,
            profit_factor,
            sharpe_ratio,
            stability_score: stability_score(&equity_curve),
            max_consecutive_wins,
            max_consecutive_losses,
        }
    }
}

fn mean_or_zero(values: impl Iterator<Item = f64>) -> f64 {
    let collected: Vec<f64> = values.collect();
    if collected.is_empty() {
        0.0
    } else {
        Statistics::mean(&collected)
    }
}

/// Largest peak-to-trough decline of the equity curve, in percent of peak.
fn max_drawdown_pct(equity_curve: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut max_drawdown = 0.0_f64;
    for &equity in equity_curve {
        peak = peak.max(equity);
        if peak > 0.0 {
            let drawdown = (peak - equity) / peak * 100.0;
            max_drawdown = max_drawdown.max(drawdown);
        }
    }
    max_drawdown
}

/// R-squared of the least-squares line through `(index, equity)`.
fn stability_score(equity_curve: &[f64]) -> f64 {
    let n = equity_curve.len();
    if n < 2 {
        return 0.0;
    }

    let xs: Vec<f64> = (0..n).map(|i| i as f64).collect();
    let mean_x = Statistics::mean(&xs);
    let mean_y = Statistics::mean(equity_curve);

    let mut ss_xy = 0.0;
    let mut ss_xx = 0.0;
    for (x, y) in xs.iter().zip(equity_curve) {
        ss_xy += (x - mean_x) * (y - mean_y);
        ss_xx += (x - mean_x) * (x - mean_x);
    }
    if ss_xx == 0.0 {
        return 0.0;
    }

    let slope = ss_xy / ss_xx;
    let intercept = mean_y - slope * mean_x;

    let mut ss_res = 0.0;
    let mut ss_tot = 0.0;
    for (x, y) in xs.iter().zip(equity_curve) {
        let predicted = intercept + slope * x;
        ss_res += (y - predicted) * (y - predicted);
        ss_tot += (y - mean_y) * (y - mean_y);
    }
    if ss_tot == 0.0 {
        // A perfectly flat curve is perfectly explained by a flat line.
        return 1.0;
    }
    1.0 - ss_res / ss_tot
}

fn consecutive_streaks(trades: &[TradeRecord]) -> (usize, usize) {
    let mut max_wins = 0usize;
    let mut max_losses = 0usize;
    let mut wins = 0usize;
    let mut losses = 0usize;
    for trade in trades {
        if trade.net_profit_abs > 0.0 {
            wins += 1;
            losses = 0;
        } else {
            losses += 1;
            wins = 0;
        }
        max_wins = max_wins.max(wins);
        max_losses = max_losses.max(losses);
    }
    (max_wins, max_losses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::backtest::trade::{ExitReason, PositionSide, TradeBuilder};
    use chrono::{TimeZone, Utc};

    fn trade(entry_capital: f64, entry: f64, exit: f64) -> TradeRecord {
        TradeBuilder {
            position: PositionSide::Buy,
            entry_time: Utc.with_ymd_and_hms(2024, 1, 3, 10, 0, 0).unwrap(),
            entry_price: entry,
            exit_time: Utc.with_ymd_and_hms(2024, 1, 3, 12, 0, 0).unwrap(),
            exit_price: exit,
            exit_reason: ExitReason::ExitSignal,
            is_flip: false,
            quantity: 100,
            lot_size: 10,
            num_lots: 10,
            entry_capital,
            initial_stop_loss: f64::NAN,
            final_stop_loss: f64::NAN,
            take_profit: f64::NAN,
            duration_candles: 2,
            commission_rate: 0.0,
            position_size_multiplier: 1.0,
        }
        .build()
    }

    #[test]
    fn test_empty_ledger() {
        let m = BacktestMetrics::from_trades(100_000.0, &[]);
        assert_eq!(m.total_trades, 0);
        assert_eq!(m.final_balance, 100_000.0);
        assert_eq!(m.net_total_profit_pct, 0.0);
        assert_eq!(m.profit_factor, None);
    }

    #[test]
    fn test_win_loss_accounting() {
        let t1 = trade(100_000.0, 100.0, 110.0); // +1000
        let t2 = trade(t1.exit_capital, 100.0, 95.0); // -500
        let t3 = trade(t2.exit_capital, 100.0, 105.0); // +500
        let m = BacktestMetrics::from_trades(100_000.0, &[t1, t2, t3]);

        assert_eq!(m.total_trades, 3);
        assert_eq!(m.winning_trades, 2);
        assert_eq!(m.losing_trades, 1);
        assert!((m.win_rate_pct - 66.666).abs() < 0.01);
        assert_eq!(m.final_balance, 101_000.0);
        assert_eq!(m.profit_factor, Some(1500.0 / 500.0));
        assert_eq!(m.max_consecutive_wins, 1);
        assert_eq!(m.max_consecutive_losses, 1);
    }

    #[test]
    fn test_max_drawdown_from_peak() {
        // 100k -> 110k -> 99k -> 104.5k: trough is 10% below the 110k peak.
        let curve = vec![100_000.0, 110_000.0, 99_000.0, 104_500.0];
        assert!((max_drawdown_pct(&curve) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_stability_of_linear_curve() {
        let curve: Vec<f64> = (0..10).map(|i| 100_000.0 + 500.0 * i as f64).collect();
        assert!((stability_score(&curve) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_streaks() {
        let mut trades = Vec::new();
        let mut capital = 100_000.0;
        for exit in [110.0, 105.0, 101.0, 95.0, 96.0, 104.0] {
            let t = trade(capital, 100.0, exit);
            capital = t.exit_capital;
            trades.push(t);
        }
        let (wins, losses) = consecutive_streaks(&trades);
        assert_eq!(wins, 3);
        assert_eq!(losses, 2);
    }
}
