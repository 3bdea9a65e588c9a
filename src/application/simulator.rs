//! Candle-by-candle backtest simulation.
//!
//! Signals are pre-vectorized by the evaluator; the loop below then applies
//! them with strict per-candle ordering:
//!
//! 1. exit checks for the open position (stop loss, then take profit, then
//!    exit signal; first hit wins),
//! 2. flip detection and immediate re-entry on the opposite side,
//! 3. trailing-stop tightening for positions that survived,
//! 4. entry evaluation when flat,
//! 5. periodic wall-clock timeout guard.
//!
//! For fixed inputs the ledger and metrics are bit-identical across runs;
//! the clock is only consulted to abort, never to trade.

use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::application::evaluator::{SignalBatch, StrategyEvaluator};
use crate::application::frame::CandleFrame;
use crate::domain::backtest::config::{
    BacktestConfig, PROGRESS_LOG_INTERVAL, SIMULATION_TIMEOUT_SECS, TIMEOUT_CHECK_INTERVAL,
};
use crate::domain::backtest::metrics::BacktestMetrics;
use crate::domain::backtest::trade::{ExitReason, PositionSide, TradeBuilder, TradeRecord};
use crate::domain::errors::{SimulationError, StrategyError};
use crate::domain::market::TickerInfo;
use crate::domain::strategy::ast::{StrategyDefinition, TakeProfitConfig};

/// Finished simulation: the trade ledger plus its metrics summary.
#[derive(Debug, Clone)]
pub struct SimulationOutcome {
    pub trades: Vec<TradeRecord>,
    pub metrics: BacktestMetrics,
}

/// Currently open position.
#[derive(Debug, Clone)]
struct OpenPosition {
    side: PositionSide,
    entry_price: f64,
    entry_time: DateTime<Utc>,
    entry_index: usize,
    entry_capital: f64,
    num_lots: i64,
    quantity: i64,
    initial_stop_loss: f64,
    current_stop_loss: f64,
    take_profit: f64,
}

#[derive(Debug, Clone, Copy)]
struct ExitDecision {
    reason: ExitReason,
    price: f64,
}

struct TradingState {
    position: Option<OpenPosition>,
    capital: f64,
}

pub struct Simulator {
    config: BacktestConfig,
    ticker: TickerInfo,
    timeout: Duration,
    timeout_check_interval: usize,
}

impl Simulator {
    pub fn new(config: BacktestConfig, ticker: TickerInfo) -> Self {
        Simulator {
            config,
            ticker,
            timeout: Duration::from_secs(SIMULATION_TIMEOUT_SECS),
            timeout_check_interval: TIMEOUT_CHECK_INTERVAL,
        }
    }

    /// Overrides the wall-clock guard.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs one backtest over `frame`. Rows before `start` are warm-up for
    /// indicator and crossover references only; rows inside `[start, end]`
    /// trade.
    pub fn run(
        &self,
        frame: &CandleFrame,
        definition: &StrategyDefinition,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<SimulationOutcome, SimulationError> {
        if frame.is_empty() {
            return Err(SimulationError::InvalidInput(
                "candle frame is empty".to_string(),
            ));
        }

        let signals = StrategyEvaluator::new(frame, definition)
            .evaluate()
            .map_err(|e: StrategyError| SimulationError::InvalidInput(e.to_string()))?;

        // The very first candle stays a crossover reference only.
        let sim_start = frame.first_index_at_or_after(start).max(1);
        let sim_end = frame.first_index_after(end);
        if sim_start >= sim_end {
            return Err(SimulationError::InvalidInput(format!(
                "no candles inside the simulation window {start} - {end}"
            )));
        }

        let started_at = Instant::now();
        let mut state = TradingState {
            position: None,
            capital: self.config.initial_balance,
        };
        let mut trades: Vec<TradeRecord> = Vec::new();
        let total_candles = sim_end - sim_start;
        let mut next_progress = PROGRESS_LOG_INTERVAL;

        for i in sim_start..sim_end {
            if i > sim_start && (i - sim_start) % self.timeout_check_interval == 0 {
                let elapsed = started_at.elapsed();
                if elapsed > self.timeout {
                    warn!(
                        "Simulation timed out for {} after {} candles",
                        self.ticker.symbol,
                        i - sim_start
                    );
                    return Err(SimulationError::Timeout {
                        elapsed_secs: elapsed.as_secs_f64(),
                        processed: i - sim_start,
                        total: total_candles,
                    });
                }
            }

            if state.position.is_some() {
                if let Some(exit) =
                    check_exit(state.position.as_ref().unwrap(), frame, &signals, i)
                {
                    let position = state.position.take().unwrap();
                    let is_flip = opposite_entry_fires(&position, &signals, i);
                    let flip_side = position.side.opposite();
                    let trade = self.close_position(
                        position, frame, i, exit.reason, exit.price, is_flip,
                    );
                    state.capital = trade.exit_capital;
                    trades.push(trade);

                    if is_flip {
                        // Reversal: the opposite side opens on this candle
                        // unconditionally, even if the same-side entry
                        // signal happens to fire too.
                        self.open_position(&mut state, frame, &signals, definition, i, flip_side);
                    }
                } else {
                    update_trailing_stop(state.position.as_mut().unwrap(), &signals, i);
                }
            } else {
                self.try_open_position(&mut state, frame, &signals, definition, i);
            }

            let progress = (i - sim_start + 1) as f64 / total_candles as f64;
            if progress >= next_progress {
                debug!(
                    "Simulation {} at {:.0}%: {} trades, capital {:.2}",
                    self.ticker.symbol,
                    progress * 100.0,
                    trades.len(),
                    state.capital
                );
                next_progress += PROGRESS_LOG_INTERVAL;
            }
        }

        // Force-close anything still open on the last simulated candle.
        if let Some(position) = state.position.take() {
            let last = sim_end - 1;
            let trade = self.close_position(
                position,
                frame,
                last,
                ExitReason::EndOfData,
                frame.close[last],
                false,
            );
            state.capital = trade.exit_capital;
            trades.push(trade);
        }

        let elapsed = started_at.elapsed().as_secs_f64();
        info!(
            "Simulation finished for {}: {} candles, {} trades, final capital {:.2} ({:.0} candles/s)",
            self.ticker.symbol,
            total_candles,
            trades.len(),
            state.capital,
            if elapsed > 0.0 { total_candles as f64 / elapsed } else { 0.0 }
        );

        let metrics = BacktestMetrics::from_trades(self.config.initial_balance, &trades);
        Ok(SimulationOutcome { trades, metrics })
    }

    /// Opens a position at the candle close when exactly one entry signal
    /// fires.
    fn try_open_position(
        &self,
        state: &mut TradingState,
        frame: &CandleFrame,
        signals: &SignalBatch,
        definition: &StrategyDefinition,
        i: usize,
    ) {
        let buy = signals.entry_buy[i];
        let sell = signals.entry_sell[i];

        let side = match (buy, sell) {
            (true, true) => {
                warn!(
                    "Ambiguous entry signals at {} for {}; candle skipped",
                    frame.begin[i], self.ticker.symbol
                );
                return;
            }
            (true, false) => PositionSide::Buy,
            (false, true) => PositionSide::Sell,
            (false, false) => return,
        };

        self.open_position(state, frame, signals, definition, i, side);
    }

    /// Opens `side` at the candle close, provided the capital sizes to at
    /// least one lot.
    fn open_position(
        &self,
        state: &mut TradingState,
        frame: &CandleFrame,
        signals: &SignalBatch,
        definition: &StrategyDefinition,
        i: usize,
        side: PositionSide,
    ) {
        let price = frame.close[i];
        let lot_cost = price * self.ticker.lot_size as f64;
        let num_lots =
            ((state.capital * self.config.position_size_multiplier) / lot_cost).floor() as i64;
        if num_lots < 1 {
            warn!(
                "Capital {:.2} sizes to zero lots of {} at {:.4}; entry skipped",
                state.capital, self.ticker.symbol, price
            );
            return;
        }

        let stop_loss = match side {
            PositionSide::Buy => signals.sl_long[i],
            PositionSide::Sell => signals.sl_short[i],
        };
        let take_profit = take_profit_level(definition, side, price, stop_loss);

        state.position = Some(OpenPosition {
            side,
            entry_price: price,
            entry_time: frame.begin[i],
            entry_index: i,
            entry_capital: state.capital,
            num_lots,
            quantity: num_lots * self.ticker.lot_size,
            initial_stop_loss: stop_loss,
            current_stop_loss: stop_loss,
            take_profit,
        });

        debug!(
            "Opened {} {} x{} lots at {:.4}",
            side, self.ticker.symbol, num_lots, price
        );
    }

    fn close_position(
        &self,
        position: OpenPosition,
        frame: &CandleFrame,
        i: usize,
        reason: ExitReason,
        price: f64,
        is_flip: bool,
    ) -> TradeRecord {
        TradeBuilder {
            position: position.side,
            entry_time: position.entry_time,
            entry_price: position.entry_price,
            exit_time: frame.begin[i],
            exit_price: price,
            exit_reason: reason,
            is_flip,
            quantity: position.quantity,
            lot_size: self.ticker.lot_size,
            num_lots: position.num_lots,
            entry_capital: position.entry_capital,
            initial_stop_loss: position.initial_stop_loss,
            final_stop_loss: position.current_stop_loss,
            take_profit: position.take_profit,
            duration_candles: i - position.entry_index,
            commission_rate: self.config.commission_rate,
            position_size_multiplier: self.config.position_size_multiplier,
        }
        .build()
    }
}

/// Exit checks in priority order; the first satisfied rule wins.
fn check_exit(
    position: &OpenPosition,
    frame: &CandleFrame,
    signals: &SignalBatch,
    i: usize,
) -> Option<ExitDecision> {
    let sl = position.current_stop_loss;
    let tp = position.take_profit;

    match position.side {
        PositionSide::Buy => {
            if !sl.is_nan() && frame.low[i] <= sl {
                return Some(ExitDecision {
                    reason: ExitReason::StopLoss,
                    price: sl,
                });
            }
            if !tp.is_nan() && frame.high[i] >= tp {
                return Some(ExitDecision {
                    reason: ExitReason::TakeProfit,
                    price: tp,
                });
            }
            if signals.exit_long[i] {
                return Some(ExitDecision {
                    reason: ExitReason::ExitSignal,
                    price: frame.close[i],
                });
            }
        }
        PositionSide::Sell => {
            if !sl.is_nan() && frame.high[i] >= sl {
                return Some(ExitDecision {
                    reason: ExitReason::StopLoss,
                    price: sl,
                });
            }
            if !tp.is_nan() && frame.low[i] <= tp {
                return Some(ExitDecision {
                    reason: ExitReason::TakeProfit,
                    price: tp,
                });
            }
            if signals.exit_short[i] {
                return Some(ExitDecision {
                    reason: ExitReason::ExitSignal,
                    price: frame.close[i],
                });
            }
        }
    }
    None
}

/// A flip is an exit whose candle also carries the opposite entry signal.
fn opposite_entry_fires(position: &OpenPosition, signals: &SignalBatch, i: usize) -> bool {
    match position.side {
        PositionSide::Buy => signals.entry_sell[i],
        PositionSide::Sell => signals.entry_buy[i],
    }
}

/// Tightens the stop toward price, never widening: a long stop only rises, a
/// short stop only falls.
fn update_trailing_stop(position: &mut OpenPosition, signals: &SignalBatch, i: usize) {
    match position.side {
        PositionSide::Buy => {
            let candidate = signals.sl_long[i];
            if !candidate.is_nan()
                && (position.current_stop_loss.is_nan()
                    || candidate > position.current_stop_loss)
            {
                position.current_stop_loss = candidate;
            }
        }
        PositionSide::Sell => {
            let candidate = signals.sl_short[i];
            if !candidate.is_nan()
                && (position.current_stop_loss.is_nan()
                    || candidate < position.current_stop_loss)
            {
                position.current_stop_loss = candidate;
            }
        }
    }
}

/// Take-profit level at entry, or NaN when not configured / not derivable.
fn take_profit_level(
    definition: &StrategyDefinition,
    side: PositionSide,
    entry_price: f64,
    stop_loss: f64,
) -> f64 {
    match &definition.take_profit {
        None => f64::NAN,
        Some(TakeProfitConfig::Percentage { percentage }) => {
            let fraction = percentage / 100.0;
            match side {
                PositionSide::Buy => entry_price * (1.0 + fraction),
                PositionSide::Sell => entry_price * (1.0 - fraction),
            }
        }
        Some(TakeProfitConfig::RiskReward { risk_reward_ratio }) => {
            if stop_loss.is_nan() {
                return f64::NAN;
            }
            let risk = (entry_price - stop_loss).abs();
            match side {
                PositionSide::Buy => entry_price + risk * risk_reward_ratio,
                PositionSide::Sell => entry_price - risk * risk_reward_ratio,
            }
        }
    }
}
