use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Timeframe;

/// One time-bucketed OHLCV observation. `(ticker, timeframe, begin)` is the
/// natural key; re-ingestion is upsert-by-key in the analytical store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub ticker: String,
    pub timeframe: Timeframe,
    pub begin: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Turnover in currency units; not every upstream board reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

#[derive(Debug, Error, PartialEq)]
pub enum CandleValidationError {
    #[error("{field} must be positive, got {value}")]
    NonPositivePrice { field: &'static str, value: f64 },

    #[error("volume must be non-negative, got {0}")]
    NegativeVolume(f64),

    #[error("high {high} below max(open, close) {body_top}")]
    HighBelowBody { high: f64, body_top: f64 },

    #[error("low {low} above min(open, close) {body_bottom}")]
    LowAboveBody { low: f64, body_bottom: f64 },
}

impl Candle {
    /// Checks the price-shape invariants:
    /// `high >= max(open, close) >= min(open, close) >= low`, all prices
    /// positive, volume non-negative.
    pub fn validate(&self) -> Result<(), CandleValidationError> {
        for (field, value) in [
            ("open", self.open),
            ("high", self.high),
            ("low", self.low),
            ("close", self.close),
        ] {
            if !(value > 0.0) {
                return Err(CandleValidationError::NonPositivePrice { field, value });
            }
        }

        if !(self.volume >= 0.0) {
            return Err(CandleValidationError::NegativeVolume(self.volume));
        }

        let body_top = self.open.max(self.close);
        let body_bottom = self.open.min(self.close);

        if self.high < body_top {
            return Err(CandleValidationError::HighBelowBody {
                high: self.high,
                body_top,
            });
        }
        if self.low > body_bottom {
            return Err(CandleValidationError::LowAboveBody {
                low: self.low,
                body_bottom,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candle(open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle {
            ticker: "SBER".to_string(),
            timeframe: Timeframe::OneHour,
            begin: Utc.with_ymd_and_hms(2024, 1, 3, 10, 0, 0).unwrap(),
            open,
            high,
            low,
            close,
            volume,
            value: None,
        }
    }

    #[test]
    fn test_valid_candle() {
        assert!(candle(100.0, 105.0, 99.0, 104.0, 1000.0).validate().is_ok());
    }

    #[test]
    fn test_flat_candle_is_valid() {
        assert!(candle(100.0, 100.0, 100.0, 100.0, 0.0).validate().is_ok());
    }

    #[test]
    fn test_high_below_body_rejected() {
        let err = candle(100.0, 101.0, 99.0, 103.0, 10.0).validate().unwrap_err();
        assert!(matches!(err, CandleValidationError::HighBelowBody { .. }));
    }

    #[test]
    fn test_low_above_body_rejected() {
        let err = candle(100.0, 105.0, 101.0, 104.0, 10.0).validate().unwrap_err();
        assert!(matches!(err, CandleValidationError::LowAboveBody { .. }));
    }

    #[test]
    fn test_non_positive_price_rejected() {
        let err = candle(0.0, 105.0, 99.0, 104.0, 10.0).validate().unwrap_err();
        assert!(matches!(
            err,
            CandleValidationError::NonPositivePrice { field: "open", .. }
        ));
        let nan = candle(f64::NAN, 105.0, 99.0, 104.0, 10.0).validate();
        assert!(nan.is_err());
    }

    #[test]
    fn test_negative_volume_rejected() {
        let err = candle(100.0, 105.0, 99.0, 104.0, -1.0).validate().unwrap_err();
        assert_eq!(err, CandleValidationError::NegativeVolume(-1.0));
    }
}
