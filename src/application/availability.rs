//! Data-availability assessment for backtest pre-flight.
//!
//! The analytical store answers one aggregate query per job (period bounds,
//! capped lookback count, per-indicator coverage); this module turns that
//! snapshot into a runnability decision and, when warm-up is short, the
//! user-facing message.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::application::resolver::ResolvedIndicators;
use crate::domain::market::MOSCOW_TZ;
use crate::domain::strategy::indicator_key::IndicatorDef;

/// Raw counts returned by the analytical store for one `(ticker, timeframe,
/// window)` combination.
#[derive(Debug, Clone, Default)]
pub struct AvailabilitySnapshot {
    /// First base candle inside `[start, end]`, if any.
    pub period_first_candle: Option<DateTime<Utc>>,
    /// Last base candle inside `[start, end]`, if any.
    pub period_last_candle: Option<DateTime<Utc>>,
    /// Base candles strictly before `start`, capped at the required lookback.
    pub lookback_candles_count: u64,
    /// Base candles in the whole `[start - lookback_window, end]` window;
    /// the coverage target for every indicator series.
    pub window_candle_count: u64,
    /// Earliest base candle on record for the pair, for error messages.
    pub first_available: Option<DateTime<Utc>>,
    /// Distinct covered `begin`s per indicator key over the window.
    pub indicator_coverage: BTreeMap<String, u64>,
}

/// Outcome of the pre-flight check.
#[derive(Debug, Clone)]
pub enum AvailabilityReport {
    /// Base candles and every indicator series cover the window.
    Runnable,
    /// Base candles are fine but some indicator series need to be computed
    /// first; carries the exact definitions to request.
    MissingIndicators(Vec<IndicatorDef>),
    /// The job can never run on current data; carries the user-facing reason.
    Insufficient { user_message: String },
}

/// Applies the runnability rules: both period bounds present, lookback at
/// least `max_lookback`, and full per-indicator coverage.
pub fn assess(
    snapshot: &AvailabilitySnapshot,
    resolved: &ResolvedIndicators,
    ticker: &str,
    timeframe: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> AvailabilityReport {
    if snapshot.period_first_candle.is_none() || snapshot.period_last_candle.is_none() {
        return AvailabilityReport::Insufficient {
            user_message: format!(
                "No historical data for '{}' ({}) between {} and {}.",
                ticker,
                timeframe,
                format_msk(start),
                format_msk(end)
            ),
        };
    }

    if (snapshot.lookback_candles_count as usize) < resolved.max_lookback {
        let earliest = match snapshot.first_available {
            Some(first) => format!("Earliest candle is {}.", format_msk(first)),
            None => "No earlier candles are on record.".to_string(),
        };
        return AvailabilityReport::Insufficient {
            user_message: format!(
                "Insufficient warm-up data: required {}, available {}. {}",
                resolved.max_lookback, snapshot.lookback_candles_count, earliest
            ),
        };
    }

    let missing: Vec<IndicatorDef> = resolved
        .defs
        .iter()
        .filter(|def| {
            let covered = snapshot
                .indicator_coverage
                .get(&def.canonical_key())
                .copied()
                .unwrap_or(0);
            covered < snapshot.window_candle_count
        })
        .cloned()
        .collect();

    if missing.is_empty() {
        AvailabilityReport::Runnable
    } else {
        AvailabilityReport::MissingIndicators(missing)
    }
}

fn format_msk(t: DateTime<Utc>) -> String {
    t.with_timezone(&MOSCOW_TZ)
        .format("%Y-%m-%dT%H:%M:%S%z")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::resolver::resolve_indicators;
    use crate::domain::strategy::ast::{ConditionNode, StrategyDefinition, ValueNode};
    use chrono::TimeZone;

    fn ema_strategy(period: u32) -> ResolvedIndicators {
        let def = StrategyDefinition {
            entry_buy_conditions: Some(ConditionNode::GreaterThan {
                left: ValueNode::Indicator {
                    key: format!("ema_timeperiod_{period}_value"),
                },
                right: ValueNode::Value { value: 0.0 },
            }),
            ..Default::default()
        };
        resolve_indicators(&def).unwrap()
    }

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 6, 30, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_runnable_when_everything_covered() {
        let resolved = ema_strategy(50);
        let (start, end) = window();
        let snapshot = AvailabilitySnapshot {
            period_first_candle: Some(start),
            period_last_candle: Some(end),
            lookback_candles_count: 100,
            window_candle_count: 500,
            first_available: Some(start),
            indicator_coverage: BTreeMap::from([("ema_timeperiod_50_value".to_string(), 500)]),
        };
        assert!(matches!(
            assess(&snapshot, &resolved, "SBER", "1h", start, end),
            AvailabilityReport::Runnable
        ));
    }

    #[test]
    fn test_missing_period_bounds_fail() {
        let resolved = ema_strategy(50);
        let (start, end) = window();
        let snapshot = AvailabilitySnapshot::default();
        match assess(&snapshot, &resolved, "SBER", "1h", start, end) {
            AvailabilityReport::Insufficient { user_message } => {
                assert!(user_message.contains("No historical data"));
                assert!(user_message.contains("SBER"));
            }
            other => panic!("expected Insufficient, got {other:?}"),
        }
    }

    #[test]
    fn test_short_lookback_names_requirements() {
        // ema_200 needs 400 warm-up candles; only one is available.
        let resolved = ema_strategy(200);
        let (start, end) = window();
        let first = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let snapshot = AvailabilitySnapshot {
            period_first_candle: Some(start),
            period_last_candle: Some(end),
            lookback_candles_count: 1,
            window_candle_count: 30,
            first_available: Some(first),
            indicator_coverage: BTreeMap::new(),
        };
        match assess(&snapshot, &resolved, "SBER", "1d", start, end) {
            AvailabilityReport::Insufficient { user_message } => {
                assert!(user_message.contains("required 400"));
                assert!(user_message.contains("available 1"));
                assert!(user_message.contains("2024-06-01"));
            }
            other => panic!("expected Insufficient, got {other:?}"),
        }
    }

    #[test]
    fn test_partial_indicator_coverage_requests_fill() {
        let resolved = ema_strategy(50);
        let (start, end) = window();
        let snapshot = AvailabilitySnapshot {
            period_first_candle: Some(start),
            period_last_candle: Some(end),
            lookback_candles_count: 100,
            window_candle_count: 500,
            first_available: Some(start),
            indicator_coverage: BTreeMap::from([("ema_timeperiod_50_value".to_string(), 123)]),
        };
        match assess(&snapshot, &resolved, "SBER", "1h", start, end) {
            AvailabilityReport::MissingIndicators(missing) => {
                assert_eq!(missing.len(), 1);
                assert_eq!(missing[0].canonical_key(), "ema_timeperiod_50_value");
            }
            other => panic!("expected MissingIndicators, got {other:?}"),
        }
    }
}
