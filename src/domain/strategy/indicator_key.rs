//! Canonical indicator key grammar.
//!
//! A key is `name`, followed by `param_name_value` pairs in sorted order,
//! followed by the output column suffix: `ema_timeperiod_12_value`,
//! `macd_fastperiod_12_signalperiod_9_slowperiod_26_macd`,
//! `supertrend_length_10_multiplier_3.0_direction`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::domain::errors::StrategyError;

/// Column names reserved for base candle data; never indicator names.
pub const OHLCV_COLUMNS: [&str; 6] = ["open", "high", "low", "close", "volume", "value"];

/// A single indicator parameter value. Integer parameters never carry `.0`;
/// that normalization happens when user input enters the platform, so keys
/// read back from storage round-trip exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    fn parse(raw: &str) -> ParamValue {
        if let Ok(i) = raw.parse::<i64>() {
            return ParamValue::Int(i);
        }
        if let Ok(f) = raw.parse::<f64>() {
            return ParamValue::Float(f);
        }
        ParamValue::Text(raw.to_string())
    }

    /// Numeric view used by the lookback formulae.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(i) => Some(*i as f64),
            ParamValue::Float(f) => Some(*f),
            ParamValue::Text(_) => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(i) => write!(f, "{}", i),
            // {:?} keeps the trailing ".0" on integral floats, matching the
            // pre-normalization wire form.
            ParamValue::Float(v) => write!(f, "{:?}", v),
            ParamValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Parsed indicator definition: family name, sorted parameters, and the
/// output column the key selects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorDef {
    pub name: String,
    pub params: BTreeMap<String, ParamValue>,
    pub output: String,
}

/// Conservative fallback for families without a lookback formula.
pub const DEFAULT_LOOKBACK: usize = 100;

impl IndicatorDef {
    /// Parses a canonical key. Returns `Ok(None)` for OHLCV reserved words,
    /// which are column references rather than indicators.
    pub fn parse(key: &str) -> Result<Option<IndicatorDef>, StrategyError> {
        if OHLCV_COLUMNS.contains(&key) {
            return Ok(None);
        }

        let parts: Vec<&str> = key.split('_').collect();
        if parts.len() < 2 {
            return Err(StrategyError::MalformedIndicatorKey(key.to_string()));
        }

        let name = parts[0].to_string();
        if name.is_empty() || OHLCV_COLUMNS.contains(&name.as_str()) {
            return Err(StrategyError::MalformedIndicatorKey(key.to_string()));
        }

        // Pairs are consumed two at a time; the trailing leftover part is the
        // output column suffix.
        let mut params = BTreeMap::new();
        let mut i = 1;
        while i + 1 < parts.len() - 1 {
            params.insert(parts[i].to_string(), ParamValue::parse(parts[i + 1]));
            i += 2;
        }
        if i != parts.len() - 1 {
            return Err(StrategyError::MalformedIndicatorKey(key.to_string()));
        }
        let output = parts[parts.len() - 1].to_string();

        Ok(Some(IndicatorDef { name, params, output }))
    }

    /// Renders the canonical key: name, sorted `param_value` pairs, output.
    pub fn canonical_key(&self) -> String {
        let mut out = self.name.clone();
        for (param, value) in &self.params {
            out.push('_');
            out.push_str(param);
            out.push('_');
            out.push_str(&value.to_string());
        }
        out.push('_');
        out.push_str(&self.output);
        out
    }

    fn param_usize(&self, name: &str, default: usize) -> usize {
        self.params
            .get(name)
            .and_then(ParamValue::as_f64)
            .map(|v| v.max(0.0) as usize)
            .unwrap_or(default)
    }

    /// Warm-up candle count required before the first valid value, per
    /// indicator family. Unknown families fall back to a conservative 100.
    pub fn lookback(&self) -> usize {
        match self.name.as_str() {
            "rsi" => 2 * self.param_usize("timeperiod", 14),
            "macd" => {
                2 * (self.param_usize("slowperiod", 26) + self.param_usize("signalperiod", 9))
            }
            "sma" | "ema" | "bbands" => 2 * self.param_usize("timeperiod", 20),
            "adx" | "atr" | "mfi" => 2 * self.param_usize("timeperiod", 14),
            "stoch" => {
                2 * (self.param_usize("fastk", 14)
                    + self.param_usize("slowk", 3)
                    + self.param_usize("slowd", 3))
            }
            "supertrend" => 2 * self.param_usize("length", 10),
            "tsi" => 2 * (self.param_usize("slow", 25) + self.param_usize("signal", 13)),
            // Squeeze composes Bollinger and Keltner bands, both period 20.
            "squeeze" => 40,
            "vortex" => 2 * self.param_usize("length", 14),
            "ichimoku" => 2 * self.param_usize("senkou", 52),
            _ => DEFAULT_LOOKBACK,
        }
    }

    /// Compute library that owns this family; travels inside calculation
    /// request payloads.
    pub fn library(&self) -> &'static str {
        match self.name.as_str() {
            "supertrend" | "tsi" | "squeeze" | "vortex" | "ichimoku" => "pandas_ta",
            _ => "talib",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_key() {
        let def = IndicatorDef::parse("ema_timeperiod_12_value").unwrap().unwrap();
        assert_eq!(def.name, "ema");
        assert_eq!(def.params.get("timeperiod"), Some(&ParamValue::Int(12)));
        assert_eq!(def.output, "value");
    }

    #[test]
    fn test_parse_multi_param_key() {
        let def = IndicatorDef::parse("macd_fastperiod_12_signalperiod_9_slowperiod_26_macd")
            .unwrap()
            .unwrap();
        assert_eq!(def.name, "macd");
        assert_eq!(def.params.len(), 3);
        assert_eq!(def.params.get("slowperiod"), Some(&ParamValue::Int(26)));
        assert_eq!(def.output, "macd");
    }

    #[test]
    fn test_roundtrip_is_identity() {
        for key in [
            "ema_timeperiod_12_value",
            "macd_fastperiod_12_signalperiod_9_slowperiod_26_macd",
            "supertrend_length_10_multiplier_3.0_direction",
            "rsi_timeperiod_14_value",
        ] {
            let def = IndicatorDef::parse(key).unwrap().unwrap();
            assert_eq!(def.canonical_key(), key, "round-trip failed for {key}");
        }
    }

    #[test]
    fn test_ohlcv_is_not_an_indicator() {
        assert_eq!(IndicatorDef::parse("close").unwrap(), None);
        assert_eq!(IndicatorDef::parse("volume").unwrap(), None);
    }

    #[test]
    fn test_malformed_keys_rejected() {
        assert!(IndicatorDef::parse("ema").is_err());
        assert!(IndicatorDef::parse("ema_timeperiod_12").is_err());
    }

    #[test]
    fn test_lookback_formulae() {
        let ema200 = IndicatorDef::parse("ema_timeperiod_200_value").unwrap().unwrap();
        assert_eq!(ema200.lookback(), 400);

        let macd = IndicatorDef::parse("macd_fastperiod_12_signalperiod_9_slowperiod_26_macd")
            .unwrap()
            .unwrap();
        assert_eq!(macd.lookback(), 70);

        let st = IndicatorDef::parse("supertrend_length_10_multiplier_3.0_direction")
            .unwrap()
            .unwrap();
        assert_eq!(st.lookback(), 20);

        let unknown = IndicatorDef::parse("mystery_period_5_value").unwrap().unwrap();
        assert_eq!(unknown.lookback(), DEFAULT_LOOKBACK);
    }

    #[test]
    fn test_library_assignment() {
        let st = IndicatorDef::parse("supertrend_length_10_multiplier_3.0_value")
            .unwrap()
            .unwrap();
        assert_eq!(st.library(), "pandas_ta");
        let rsi = IndicatorDef::parse("rsi_timeperiod_14_value").unwrap().unwrap();
        assert_eq!(rsi.library(), "talib");
    }
}
