//! Typed payloads carried by the event log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::domain::market::{Candle, Timeframe};
use crate::domain::strategy::indicator_key::IndicatorDef;

/// Drives the backtest worker. Also the re-entry vehicle: the indicator
/// calculation response arrives on the same topic with `status` set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestRequestMessage {
    pub job_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CalculationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalculationStatus {
    #[serde(rename = "CALCULATION_SUCCESS")]
    Success,
    #[serde(rename = "CALCULATION_FAILURE")]
    Failure,
}

/// Asks the data processor to materialize indicator series for a window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorCalculationRequest {
    pub job_id: Uuid,
    pub ticker: String,
    pub timeframe: Timeframe,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub indicators: Vec<IndicatorSpec>,
}

/// One indicator inside a calculation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorSpec {
    pub indicator_key: String,
    pub name: String,
    pub library: String,
    pub params: Value,
}

impl IndicatorSpec {
    pub fn from_def(def: &IndicatorDef) -> IndicatorSpec {
        IndicatorSpec {
            indicator_key: def.canonical_key(),
            name: def.name.clone(),
            library: def.library().to_string(),
            params: serde_json::to_value(&def.params).unwrap_or(Value::Null),
        }
    }
}

/// Raw candle from the collector, keyed by `ticker:timeframe`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawCandleMessage {
    pub ticker: String,
    pub timeframe: Timeframe,
    pub begin: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl From<&Candle> for RawCandleMessage {
    fn from(c: &Candle) -> Self {
        RawCandleMessage {
            ticker: c.ticker.clone(),
            timeframe: c.timeframe,
            begin: c.begin,
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,
            value: c.value,
        }
    }
}

impl RawCandleMessage {
    pub fn into_candle(self) -> Candle {
        Candle {
            ticker: self.ticker,
            timeframe: self.timeframe,
            begin: self.begin,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            value: self.value,
        }
    }

    pub fn partition_key(&self) -> String {
        format!("{}:{}", self.ticker, self.timeframe)
    }
}

/// Raw candle enriched with hot indicator columns; the RT pipeline output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedCandleMessage {
    #[serde(flatten)]
    pub candle: RawCandleMessage,
    #[serde(flatten)]
    pub indicators: BTreeMap<String, Option<f64>>,
}

/// Collector work item, keyed by `ticker:task_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionTaskMessage {
    pub task_type: String,
    pub ticker: String,
    pub params: CollectionTaskParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionTaskParams {
    pub timeframe: Timeframe,
}

impl CollectionTaskMessage {
    pub fn partition_key(&self) -> String {
        format!("{}:{}", self.ticker, self.task_type)
    }
}

/// Envelope published to `<topic>.failed` when a message is given up on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEnvelope {
    pub payload: Value,
    pub failure_reason: String,
    pub attempts: u32,
    pub last_error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backtest_request_without_status() {
        let msg: BacktestRequestMessage =
            serde_json::from_str(r#"{"job_id": "6f65b1a8-6f05-4df0-8b06-1a6bfae9e8c1"}"#)
                .unwrap();
        assert_eq!(msg.status, None);
    }

    #[test]
    fn test_calculation_status_wire_names() {
        let msg: BacktestRequestMessage = serde_json::from_str(
            r#"{"job_id": "6f65b1a8-6f05-4df0-8b06-1a6bfae9e8c1", "status": "CALCULATION_SUCCESS"}"#,
        )
        .unwrap();
        assert_eq!(msg.status, Some(CalculationStatus::Success));
    }

    #[test]
    fn test_processed_candle_flattens_indicators() {
        let candle = RawCandleMessage {
            ticker: "SBER".to_string(),
            timeframe: Timeframe::OneHour,
            begin: Utc::now(),
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
            value: None,
        };
        let msg = ProcessedCandleMessage {
            candle,
            indicators: BTreeMap::from([
                ("ema_timeperiod_12_value".to_string(), Some(1.2)),
                ("rsi_timeperiod_14_value".to_string(), None),
            ]),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["ticker"], "SBER");
        assert_eq!(json["ema_timeperiod_12_value"], 1.2);
        assert!(json["rsi_timeperiod_14_value"].is_null());
    }

    #[test]
    fn test_collection_task_partition_key() {
        let task = CollectionTaskMessage {
            task_type: "collect_candles".to_string(),
            ticker: "GAZP".to_string(),
            params: CollectionTaskParams {
                timeframe: Timeframe::OneDay,
            },
        };
        assert_eq!(task.partition_key(), "GAZP:collect_candles");
    }

    #[test]
    fn test_indicator_spec_from_def() {
        let def = IndicatorDef::parse("ema_timeperiod_50_value").unwrap().unwrap();
        let spec = IndicatorSpec::from_def(&def);
        assert_eq!(spec.indicator_key, "ema_timeperiod_50_value");
        assert_eq!(spec.name, "ema");
        assert_eq!(spec.library, "talib");
        assert_eq!(spec.params["timeperiod"], 50);
    }
}
