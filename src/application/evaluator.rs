//! Vectorized strategy evaluator.
//!
//! Turns the strategy AST into six aligned series over a candle frame in a
//! single pass: entry buy/sell, exit long/short, and stop-loss levels per
//! side. The simulator then only does index arithmetic.

use crate::application::frame::CandleFrame;
use crate::domain::errors::StrategyError;
use crate::domain::strategy::ast::{
    ConditionNode, StopLossConfig, StrategyDefinition, ValueNode,
};
use crate::domain::strategy::indicator_key::IndicatorDef;

/// Position side a condition tree is evaluated for. Position-aware nodes
/// (`SUPER_TREND_FLIP`, `MACD_CROSSOVER_FLIP`) are only defined in the
/// `Long`/`Short` contexts used by the exit path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PositionContext {
    Entry,
    Long,
    Short,
}

/// All pre-computed signals for one simulation run, aligned with the frame.
#[derive(Debug, Clone)]
pub struct SignalBatch {
    pub entry_buy: Vec<bool>,
    pub entry_sell: Vec<bool>,
    pub exit_long: Vec<bool>,
    pub exit_short: Vec<bool>,
    pub sl_long: Vec<f64>,
    pub sl_short: Vec<f64>,
}

pub struct StrategyEvaluator<'a> {
    frame: &'a CandleFrame,
    definition: &'a StrategyDefinition,
}

impl<'a> StrategyEvaluator<'a> {
    pub fn new(frame: &'a CandleFrame, definition: &'a StrategyDefinition) -> Self {
        StrategyEvaluator { frame, definition }
    }

    /// Evaluates every series the simulator needs. Pure: no I/O, no clock.
    pub fn evaluate(&self) -> Result<SignalBatch, StrategyError> {
        let n = self.frame.len();

        let entry_buy = self.optional_condition(
            self.definition.entry_buy_conditions.as_ref(),
            PositionContext::Entry,
        )?;
        let entry_sell = self.optional_condition(
            self.definition.entry_sell_conditions.as_ref(),
            PositionContext::Entry,
        )?;
        // Without an exit tree the opposite entry signal is the exit signal,
        // which is what lets symmetric strategies flip.
        let exit_long = match self.definition.exit_tree_long() {
            Some(tree) => self.condition(tree, PositionContext::Long)?,
            None => entry_sell.clone(),
        };
        let exit_short = match self.definition.exit_tree_short() {
            Some(tree) => self.condition(tree, PositionContext::Short)?,
            None => entry_buy.clone(),
        };

        let (sl_long, sl_short) = self.stop_loss_series()?;

        tracing::debug!(
            "Signals evaluated over {} candles: {} buy, {} sell, {} exit-long, {} exit-short",
            n,
            entry_buy.iter().filter(|b| **b).count(),
            entry_sell.iter().filter(|b| **b).count(),
            exit_long.iter().filter(|b| **b).count(),
            exit_short.iter().filter(|b| **b).count(),
        );

        Ok(SignalBatch {
            entry_buy,
            entry_sell,
            exit_long,
            exit_short,
            sl_long,
            sl_short,
        })
    }

    fn optional_condition(
        &self,
        node: Option<&ConditionNode>,
        ctx: PositionContext,
    ) -> Result<Vec<bool>, StrategyError> {
        match node {
            Some(node) => self.condition(node, ctx),
            None => Ok(vec![false; self.frame.len()]),
        }
    }

    fn condition(
        &self,
        node: &ConditionNode,
        ctx: PositionContext,
    ) -> Result<Vec<bool>, StrategyError> {
        let n = self.frame.len();
        match node {
            ConditionNode::GreaterThan { left, right } => {
                self.compare(left, right, |l, r| l > r)
            }
            ConditionNode::LessThan { left, right } => self.compare(left, right, |l, r| l < r),
            ConditionNode::Equals { left, right } => self.compare(left, right, |l, r| l == r),
            ConditionNode::CrossoverUp { line1, line2 } => {
                let l1 = self.value(line1)?;
                let l2 = self.value(line2)?;
                Ok(crossover(&l1, &l2))
            }
            ConditionNode::CrossoverDown { line1, line2 } => {
                // line1 crossing below line2 is line2 crossing above line1.
                let l1 = self.value(line1)?;
                let l2 = self.value(line2)?;
                Ok(crossover(&l2, &l1))
            }
            ConditionNode::SuperTrendFlip { indicator_key, .. } => {
                let direction = self.column(indicator_key)?;
                match ctx {
                    PositionContext::Entry => {
                        Err(StrategyError::FlipNodeInEntry("SUPER_TREND_FLIP"))
                    }
                    // Long positions exit on a flip to bearish, shorts on a
                    // flip to bullish.
                    PositionContext::Long => Ok(sign_flip(direction, -1.0)),
                    PositionContext::Short => Ok(sign_flip(direction, 1.0)),
                }
            }
            ConditionNode::MacdCrossoverFlip {
                indicator_key,
                signal_key,
                ..
            } => {
                let macd = self.column(indicator_key)?;
                let derived;
                let signal_key = match signal_key {
                    Some(key) => key.as_str(),
                    None => {
                        derived = sibling_output_key(indicator_key, "signal")?;
                        derived.as_str()
                    }
                };
                let signal = self.column(signal_key)?;
                match ctx {
                    PositionContext::Entry => {
                        Err(StrategyError::FlipNodeInEntry("MACD_CROSSOVER_FLIP"))
                    }
                    PositionContext::Long => Ok(crossover(signal, macd)),
                    PositionContext::Short => Ok(crossover(macd, signal)),
                }
            }
            ConditionNode::And { conditions } => {
                let mut acc = vec![true; n];
                for child in conditions {
                    let series = self.condition(child, ctx)?;
                    for (a, s) in acc.iter_mut().zip(series) {
                        *a = *a && s;
                    }
                }
                if conditions.is_empty() {
                    acc.fill(false);
                }
                Ok(acc)
            }
            ConditionNode::Or { conditions } => {
                let mut acc = vec![false; n];
                for child in conditions {
                    let series = self.condition(child, ctx)?;
                    for (a, s) in acc.iter_mut().zip(series) {
                        *a = *a || s;
                    }
                }
                Ok(acc)
            }
        }
    }

    fn compare(
        &self,
        left: &ValueNode,
        right: &ValueNode,
        op: impl Fn(f64, f64) -> bool,
    ) -> Result<Vec<bool>, StrategyError> {
        let l = self.value(left)?;
        let r = self.value(right)?;
        Ok(l.iter()
            .zip(&r)
            .map(|(&a, &b)| !a.is_nan() && !b.is_nan() && op(a, b))
            .collect())
    }

    /// Materializes a value node as a series of frame length.
    fn value(&self, node: &ValueNode) -> Result<Vec<f64>, StrategyError> {
        let n = self.frame.len();
        match node {
            ValueNode::Value { value } => Ok(vec![*value; n]),
            ValueNode::Indicator { key } => Ok(self.column(key)?.to_vec()),
            ValueNode::PrevIndicator { key } => {
                let column = self.column(key)?;
                let mut shifted = Vec::with_capacity(n);
                shifted.push(f64::NAN);
                shifted.extend_from_slice(&column[..n.saturating_sub(1)]);
                Ok(shifted)
            }
        }
    }

    fn column(&self, key: &str) -> Result<&[f64], StrategyError> {
        self.frame
            .column(key)
            .ok_or_else(|| StrategyError::UnknownColumn(key.to_string()))
    }

    /// Per-side stop-loss level series from the stop-loss config.
    fn stop_loss_series(&self) -> Result<(Vec<f64>, Vec<f64>), StrategyError> {
        let n = self.frame.len();
        match &self.definition.stop_loss {
            None => Ok((vec![f64::NAN; n], vec![f64::NAN; n])),
            Some(StopLossConfig::IndicatorBased {
                buy_value_key,
                sell_value_key,
            }) => {
                let sl_long = match buy_value_key {
                    Some(key) => self.column(key)?.to_vec(),
                    None => vec![f64::NAN; n],
                };
                let sl_short = match sell_value_key {
                    Some(key) => self.column(key)?.to_vec(),
                    None => vec![f64::NAN; n],
                };
                Ok((sl_long, sl_short))
            }
            Some(StopLossConfig::Percentage { percentage }) => {
                let fraction = percentage / 100.0;
                let sl_long = self.frame.close.iter().map(|c| c * (1.0 - fraction)).collect();
                let sl_short = self.frame.close.iter().map(|c| c * (1.0 + fraction)).collect();
                Ok((sl_long, sl_short))
            }
        }
    }
}

/// True at `t` when `line1` closes above `line2` having been at or below it
/// at `t-1`. Index 0 has no reference candle and is always false.
fn crossover(line1: &[f64], line2: &[f64]) -> Vec<bool> {
    let n = line1.len();
    let mut out = vec![false; n];
    for t in 1..n {
        let prev_ok = !line1[t - 1].is_nan() && !line2[t - 1].is_nan();
        let now_ok = !line1[t].is_nan() && !line2[t].is_nan();
        out[t] = prev_ok && now_ok && line1[t - 1] <= line2[t - 1] && line1[t] > line2[t];
    }
    out
}

/// True at `t` when a direction column changes sign to `target` (+1 or -1).
fn sign_flip(direction: &[f64], target: f64) -> Vec<bool> {
    let n = direction.len();
    let mut out = vec![false; n];
    for t in 1..n {
        let prev = direction[t - 1];
        let now = direction[t];
        out[t] = !prev.is_nan()
            && !now.is_nan()
            && prev.signum() != target.signum()
            && now.signum() == target.signum();
    }
    out
}

/// Replaces the output suffix of a canonical indicator key, e.g. the MACD
/// line key with its signal-line sibling.
fn sibling_output_key(key: &str, output: &str) -> Result<String, StrategyError> {
    let def = IndicatorDef::parse(key)?
        .ok_or_else(|| StrategyError::MalformedIndicatorKey(key.to_string()))?;
    Ok(IndicatorDef {
        output: output.to_string(),
        ..def
    }
    .canonical_key())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::{Candle, Timeframe};
    use crate::domain::strategy::ast::TargetDirection;
    use chrono::{TimeZone, Utc};

    fn frame_with(closes: &[f64]) -> CandleFrame {
        let candles: Vec<Candle> = closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                ticker: "SBER".to_string(),
                timeframe: Timeframe::OneHour,
                begin: Utc.with_ymd_and_hms(2024, 1, 3, 10, 0, 0).unwrap()
                    + chrono::Duration::hours(i as i64),
                open: close,
                high: close + 1.0,
                low: close - 1.0,
                close,
                volume: 1.0,
                value: None,
            })
            .collect();
        CandleFrame::from_candles(&candles)
    }

    fn indicator(key: &str) -> ValueNode {
        ValueNode::Indicator { key: key.to_string() }
    }

    #[test]
    fn test_crossover_up_fires_once() {
        let mut frame = frame_with(&[100.0, 100.0, 100.0, 100.0]);
        frame.set_column("fast", vec![1.0, 2.0, 4.0, 5.0]);
        frame.set_column("slow", vec![3.0, 3.0, 3.0, 3.0]);

        let def = StrategyDefinition {
            entry_buy_conditions: Some(ConditionNode::CrossoverUp {
                line1: indicator("fast"),
                line2: indicator("slow"),
            }),
            ..Default::default()
        };
        let batch = StrategyEvaluator::new(&frame, &def).evaluate().unwrap();
        assert_eq!(batch.entry_buy, vec![false, false, true, false]);
    }

    #[test]
    fn test_comparison_with_nan_is_false() {
        let mut frame = frame_with(&[100.0, 100.0]);
        frame.set_column("rsi_timeperiod_14_value", vec![f64::NAN, 80.0]);

        let def = StrategyDefinition {
            entry_buy_conditions: Some(ConditionNode::GreaterThan {
                left: indicator("rsi_timeperiod_14_value"),
                right: ValueNode::Value { value: 70.0 },
            }),
            ..Default::default()
        };
        let batch = StrategyEvaluator::new(&frame, &def).evaluate().unwrap();
        assert_eq!(batch.entry_buy, vec![false, true]);
    }

    #[test]
    fn test_prev_indicator_shifts() {
        let mut frame = frame_with(&[100.0, 100.0, 100.0]);
        frame.set_column("x", vec![1.0, 2.0, 3.0]);

        let def = StrategyDefinition {
            entry_buy_conditions: Some(ConditionNode::GreaterThan {
                left: indicator("x"),
                right: ValueNode::PrevIndicator { key: "x".to_string() },
            }),
            ..Default::default()
        };
        let batch = StrategyEvaluator::new(&frame, &def).evaluate().unwrap();
        // Index 0 has no previous value.
        assert_eq!(batch.entry_buy, vec![false, true, true]);
    }

    #[test]
    fn test_supertrend_flip_is_position_aware() {
        let mut frame = frame_with(&[100.0; 4]);
        frame.set_column(
            "supertrend_length_10_multiplier_3.0_direction",
            vec![1.0, 1.0, -1.0, -1.0],
        );

        let def = StrategyDefinition {
            entry_buy_conditions: Some(ConditionNode::GreaterThan {
                left: indicator("close"),
                right: ValueNode::Value { value: 0.0 },
            }),
            exit_conditions: Some(ConditionNode::SuperTrendFlip {
                indicator_key: "supertrend_length_10_multiplier_3.0_direction".to_string(),
                target_direction: TargetDirection::OppositeToPosition,
            }),
            ..Default::default()
        };
        let batch = StrategyEvaluator::new(&frame, &def).evaluate().unwrap();
        assert_eq!(batch.exit_long, vec![false, false, true, false]);
        assert_eq!(batch.exit_short, vec![false, false, false, false]);
    }

    #[test]
    fn test_macd_flip_uses_sibling_signal_key() {
        let mut frame = frame_with(&[100.0; 4]);
        frame.set_column(
            "macd_fastperiod_12_signalperiod_9_slowperiod_26_macd",
            vec![1.0, 1.0, -1.0, -1.0],
        );
        frame.set_column(
            "macd_fastperiod_12_signalperiod_9_slowperiod_26_signal",
            vec![0.0, 0.0, 0.0, 0.0],
        );

        let def = StrategyDefinition {
            entry_buy_conditions: Some(ConditionNode::GreaterThan {
                left: indicator("close"),
                right: ValueNode::Value { value: 0.0 },
            }),
            exit_conditions: Some(ConditionNode::MacdCrossoverFlip {
                indicator_key: "macd_fastperiod_12_signalperiod_9_slowperiod_26_macd"
                    .to_string(),
                signal_key: None,
                target_direction: TargetDirection::OppositeToPosition,
            }),
            ..Default::default()
        };
        let batch = StrategyEvaluator::new(&frame, &def).evaluate().unwrap();
        // MACD drops below the signal line at index 2: long exit only.
        assert_eq!(batch.exit_long, vec![false, false, true, false]);
        assert_eq!(batch.exit_short, vec![false, false, false, false]);
    }

    #[test]
    fn test_percentage_stop_series_follows_close() {
        let frame = frame_with(&[100.0, 200.0]);
        let def = StrategyDefinition {
            entry_buy_conditions: Some(ConditionNode::GreaterThan {
                left: indicator("close"),
                right: ValueNode::Value { value: 0.0 },
            }),
            stop_loss: Some(StopLossConfig::Percentage { percentage: 5.0 }),
            ..Default::default()
        };
        let batch = StrategyEvaluator::new(&frame, &def).evaluate().unwrap();
        assert_eq!(batch.sl_long, vec![95.0, 190.0]);
        assert_eq!(batch.sl_short, vec![105.0, 210.0]);
    }

    #[test]
    fn test_unknown_column_is_an_error() {
        let frame = frame_with(&[100.0]);
        let def = StrategyDefinition {
            entry_buy_conditions: Some(ConditionNode::GreaterThan {
                left: indicator("missing_timeperiod_9_value"),
                right: ValueNode::Value { value: 0.0 },
            }),
            ..Default::default()
        };
        assert_eq!(
            StrategyEvaluator::new(&frame, &def).evaluate().unwrap_err(),
            StrategyError::UnknownColumn("missing_timeperiod_9_value".to_string())
        );
    }
}
