//! Column-oriented candle window.
//!
//! The simulator and evaluator work over contiguous `f64` slices aligned by
//! candle index; building this struct-of-arrays once per job keeps the inner
//! candle loop down to index arithmetic.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::domain::market::Candle;

/// OHLCV window joined with indicator columns, ordered by `begin` ascending.
/// Missing indicator values are `NaN`.
#[derive(Debug, Clone, Default)]
pub struct CandleFrame {
    pub begin: Vec<DateTime<Utc>>,
    pub open: Vec<f64>,
    pub high: Vec<f64>,
    pub low: Vec<f64>,
    pub close: Vec<f64>,
    pub volume: Vec<f64>,
    indicators: BTreeMap<String, Vec<f64>>,
}

impl CandleFrame {
    pub fn from_candles(candles: &[Candle]) -> CandleFrame {
        let mut frame = CandleFrame {
            begin: Vec::with_capacity(candles.len()),
            open: Vec::with_capacity(candles.len()),
            high: Vec::with_capacity(candles.len()),
            low: Vec::with_capacity(candles.len()),
            close: Vec::with_capacity(candles.len()),
            volume: Vec::with_capacity(candles.len()),
            indicators: BTreeMap::new(),
        };
        for candle in candles {
            frame.begin.push(candle.begin);
            frame.open.push(candle.open);
            frame.high.push(candle.high);
            frame.low.push(candle.low);
            frame.close.push(candle.close);
            frame.volume.push(candle.volume);
        }
        frame
    }

    pub fn len(&self) -> usize {
        self.begin.len()
    }

    pub fn is_empty(&self) -> bool {
        self.begin.is_empty()
    }

    /// Attaches an indicator column. The column is padded/truncated to the
    /// frame length; padding is `NaN` at the front (warm-up side).
    pub fn set_column(&mut self, key: impl Into<String>, mut values: Vec<f64>) {
        let n = self.len();
        if values.len() > n {
            values.drain(..values.len() - n);
        } else if values.len() < n {
            let mut padded = vec![f64::NAN; n - values.len()];
            padded.extend(values);
            values = padded;
        }
        self.indicators.insert(key.into(), values);
    }

    /// Resolves a column by name; OHLCV reserved words resolve to the base
    /// arrays, anything else to an attached indicator column.
    pub fn column(&self, key: &str) -> Option<&[f64]> {
        match key {
            "open" => Some(&self.open),
            "high" => Some(&self.high),
            "low" => Some(&self.low),
            "close" => Some(&self.close),
            "volume" => Some(&self.volume),
            _ => self.indicators.get(key).map(Vec::as_slice),
        }
    }

    pub fn indicator_keys(&self) -> impl Iterator<Item = &String> {
        self.indicators.keys()
    }

    /// Index of the first candle at or after `t`, or `len()` when past the end.
    pub fn first_index_at_or_after(&self, t: DateTime<Utc>) -> usize {
        self.begin.partition_point(|b| *b < t)
    }

    /// Index one past the last candle at or before `t`.
    pub fn first_index_after(&self, t: DateTime<Utc>) -> usize {
        self.begin.partition_point(|b| *b <= t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::Timeframe;
    use chrono::TimeZone;

    fn candles(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                ticker: "SBER".to_string(),
                timeframe: Timeframe::OneHour,
                begin: Utc.with_ymd_and_hms(2024, 1, 3, 10, 0, 0).unwrap()
                    + chrono::Duration::hours(i as i64),
                open: close,
                high: close,
                low: close,
                close,
                volume: 1.0,
                value: None,
            })
            .collect()
    }

    #[test]
    fn test_column_resolution() {
        let mut frame = CandleFrame::from_candles(&candles(&[1.0, 2.0, 3.0]));
        frame.set_column("ema_timeperiod_12_value", vec![1.0, 1.5, 2.0]);

        assert_eq!(frame.column("close"), Some(&[1.0, 2.0, 3.0][..]));
        assert_eq!(
            frame.column("ema_timeperiod_12_value"),
            Some(&[1.0, 1.5, 2.0][..])
        );
        assert_eq!(frame.column("rsi_timeperiod_14_value"), None);
    }

    #[test]
    fn test_short_column_front_padded() {
        let mut frame = CandleFrame::from_candles(&candles(&[1.0, 2.0, 3.0, 4.0]));
        frame.set_column("sma_timeperiod_2_value", vec![1.5, 2.5, 3.5]);
        let col = frame.column("sma_timeperiod_2_value").unwrap();
        assert!(col[0].is_nan());
        assert_eq!(&col[1..], &[1.5, 2.5, 3.5]);
    }

    #[test]
    fn test_first_index_at_or_after() {
        let frame = CandleFrame::from_candles(&candles(&[1.0, 2.0, 3.0]));
        let t = frame.begin[1];
        assert_eq!(frame.first_index_at_or_after(t), 1);
        assert_eq!(
            frame.first_index_at_or_after(t + chrono::Duration::minutes(1)),
            2
        );
        assert_eq!(
            frame.first_index_at_or_after(t + chrono::Duration::days(365)),
            3
        );
    }
}
