//! Batch indicator writer.
//!
//! Serves the backtest round trip: given a calculation request, load the
//! base candles over the requested window, compute each series and persist
//! it under a per-series advisory lock. Two workers writing the same series
//! unlocked would interleave versions in the last-write-wins tree and leave
//! the stored values dependent on scheduling.

use std::time::Duration;
use tracing::{info, warn};

use crate::application::indicators::IndicatorPipeline;
use crate::domain::errors::ConsumerError;
use crate::domain::strategy::indicator_key::IndicatorDef;
use crate::infrastructure::analytics::indicators::IndicatorPoint;
use crate::infrastructure::analytics::{AnalyticsPool, CandleStore, IndicatorStore};
use crate::infrastructure::cache::DistributedLock;
use crate::infrastructure::kafka::messages::IndicatorCalculationRequest;

const LOCK_TIMEOUT: Duration = Duration::from_secs(60);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);
const LOCK_TTL: Duration = Duration::from_secs(300);

pub struct BatchIndicatorWriter {
    analytics: AnalyticsPool,
    candles: CandleStore,
    indicators: IndicatorStore,
    locks: DistributedLock,
}

impl BatchIndicatorWriter {
    pub fn new(
        analytics: AnalyticsPool,
        candles: CandleStore,
        indicators: IndicatorStore,
        locks: DistributedLock,
    ) -> BatchIndicatorWriter {
        BatchIndicatorWriter {
            analytics,
            candles,
            indicators,
            locks,
        }
    }

    /// Computes and persists every requested series. The caller reports
    /// success/failure back to the requests topic.
    pub async fn process_request(
        &self,
        request: &IndicatorCalculationRequest,
    ) -> Result<(), ConsumerError> {
        let defs = parse_requested_defs(request)?;
        let pipeline =
            IndicatorPipeline::new(defs).map_err(|err| ConsumerError::Validation(err.to_string()))?;

        let client = self.analytics.acquire().await;
        let frame = self
            .candles
            .fetch_frame(
                &client,
                &request.ticker,
                request.timeframe,
                request.start_date,
                request.end_date,
                &[],
            )
            .await
            .map_err(ConsumerError::retryable)?;

        if frame.is_empty() {
            return Err(ConsumerError::Validation(format!(
                "No base candles for {} {} in the requested window",
                request.ticker, request.timeframe
            )));
        }

        let all_series = pipeline
            .compute_all(&frame)
            .map_err(ConsumerError::fatal)?;

        for (key, series) in all_series {
            let points: Vec<IndicatorPoint> = frame
                .begin
                .iter()
                .zip(&series)
                .filter(|(_, value)| !value.is_nan())
                .map(|(begin, value)| IndicatorPoint {
                    begin: *begin,
                    value: *value,
                })
                .collect();

            if points.is_empty() {
                warn!(
                    "Series {} for {} {} produced no values (window too short?)",
                    key, request.ticker, request.timeframe
                );
                continue;
            }

            let lock_key =
                DistributedLock::indicator_lock_key(&request.ticker, request.timeframe, &key);
            let token = self
                .locks
                .acquire(&lock_key, LOCK_TIMEOUT, LOCK_POLL_INTERVAL, LOCK_TTL)
                .await
                .map_err(ConsumerError::retryable)?
                .ok_or_else(|| {
                    ConsumerError::Retryable(format!("Timed out acquiring {lock_key}"))
                })?;

            let version = IndicatorStore::next_version();
            let saved = self
                .indicators
                .insert_series(&client, &request.ticker, request.timeframe, &key, &points, version)
                .await;
            // Release before error propagation so a failed insert never
            // pins the series until TTL expiry.
            self.locks
                .release(token)
                .await
                .map_err(ConsumerError::retryable)?;
            saved.map_err(ConsumerError::retryable)?;

            info!(
                "Series {} for {} {}: {} points (version {})",
                key,
                request.ticker,
                request.timeframe,
                points.len(),
                version
            );
        }

        Ok(())
    }
}

fn parse_requested_defs(
    request: &IndicatorCalculationRequest,
) -> Result<Vec<IndicatorDef>, ConsumerError> {
    let mut defs = Vec::with_capacity(request.indicators.len());
    for spec in &request.indicators {
        let def = IndicatorDef::parse(&spec.indicator_key)
            .map_err(|err| ConsumerError::Validation(err.to_string()))?
            .ok_or_else(|| {
                ConsumerError::Validation(format!(
                    "'{}' is a base column, not an indicator",
                    spec.indicator_key
                ))
            })?;
        defs.push(def);
    }
    Ok(defs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::Timeframe;
    use crate::infrastructure::kafka::messages::IndicatorSpec;
    use chrono::Utc;
    use uuid::Uuid;

    fn request_with(keys: &[&str]) -> IndicatorCalculationRequest {
        IndicatorCalculationRequest {
            job_id: Uuid::new_v4(),
            ticker: "SBER".to_string(),
            timeframe: Timeframe::OneHour,
            start_date: Utc::now(),
            end_date: Utc::now(),
            indicators: keys
                .iter()
                .map(|key| {
                    let def = IndicatorDef::parse(key).unwrap().unwrap();
                    IndicatorSpec::from_def(&def)
                })
                .collect(),
        }
    }

    #[test]
    fn test_parse_requested_defs() {
        let request = request_with(&["ema_timeperiod_12_value", "rsi_timeperiod_14_value"]);
        let defs = parse_requested_defs(&request).unwrap();
        assert_eq!(defs.len(), 2);
    }

    #[test]
    fn test_base_column_in_request_is_validation_error() {
        let mut request = request_with(&["ema_timeperiod_12_value"]);
        request.indicators.push(IndicatorSpec {
            indicator_key: "close".to_string(),
            name: "close".to_string(),
            library: "talib".to_string(),
            params: serde_json::Value::Null,
        });
        assert!(matches!(
            parse_requested_defs(&request),
            Err(ConsumerError::Validation(_))
        ));
    }
}
