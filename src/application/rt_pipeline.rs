//! Real-time indicator pipeline.
//!
//! Strictly single-threaded per partition (enforced by consumer
//! configuration): only one writer ever touches a pair's rolling context,
//! so the cache update below needs no locking. Per candle: load context,
//! run the hot pipeline, persist the enriched row, refresh the context,
//! republish downstream.

use tracing::{info, warn};

use crate::application::frame::CandleFrame;
use crate::application::indicators::IndicatorPipeline;
use crate::domain::errors::ConsumerError;
use crate::domain::market::Candle;
use crate::infrastructure::analytics::{AnalyticsPool, CandleStore, IndicatorStore};
use crate::infrastructure::cache::ContextCache;
use crate::infrastructure::kafka::EventProducer;
use crate::infrastructure::kafka::messages::{ProcessedCandleMessage, RawCandleMessage};

pub struct RtIndicatorProcessor {
    pipeline: IndicatorPipeline,
    context: ContextCache,
    analytics: AnalyticsPool,
    candles: CandleStore,
    indicators: IndicatorStore,
    producer: EventProducer,
    processed_topic: String,
    context_size: usize,
}

impl RtIndicatorProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pipeline: IndicatorPipeline,
        context: ContextCache,
        analytics: AnalyticsPool,
        candles: CandleStore,
        indicators: IndicatorStore,
        producer: EventProducer,
        processed_topic: String,
        context_size: usize,
    ) -> RtIndicatorProcessor {
        RtIndicatorProcessor {
            pipeline,
            context,
            analytics,
            candles,
            indicators,
            producer,
            processed_topic,
            context_size,
        }
    }

    pub async fn process_candle(
        &self,
        raw: RawCandleMessage,
        correlation_id: &str,
    ) -> Result<(), ConsumerError> {
        let candle = raw.clone().into_candle();
        candle
            .validate()
            .map_err(|err| ConsumerError::Validation(err.to_string()))?;

        // 1. Rolling context, with the degraded analytical-store path when
        //    the cache tier is down (costs 50-100ms of extra latency).
        let mut window = match self.context.get_context(&candle.ticker, candle.timeframe).await {
            Ok(window) => window,
            Err(err) => {
                warn!(
                    "Context cache unavailable for {} {} ({err}); reading analytical store",
                    candle.ticker, candle.timeframe
                );
                let client = self.analytics.acquire().await;
                self.candles
                    .last_n_candles(&client, &candle.ticker, candle.timeframe, self.context_size)
                    .await
                    .map_err(ConsumerError::retryable)?
            }
        };

        // 2. Compute the hot pipeline over context + incoming candle.
        drop_duplicate_tail(&mut window, &candle);
        window.push(candle.clone());
        let frame = CandleFrame::from_candles(&window);
        let values = self
            .pipeline
            .compute_latest(&frame)
            .map_err(ConsumerError::fatal)?;

        // 3. Persist the enriched row; this is the durability point.
        {
            let client = self.analytics.acquire().await;
            self.indicators
                .insert_rt_row(&client, &candle.ticker, candle.timeframe, candle.begin, &values)
                .await
                .map_err(ConsumerError::retryable)?;
        }

        // 4. Context refresh is best-effort: the row is already durable.
        if let Err(err) = self.context.push_candle(&candle).await {
            warn!(
                "Context update failed for {} {} ({err}); continuing",
                candle.ticker, candle.timeframe
            );
        }

        // 5. Republish for downstream strategy evaluation.
        let processed = ProcessedCandleMessage {
            candle: raw,
            indicators: values,
        };
        self.producer
            .send_json(
                &self.processed_topic,
                &processed.candle.partition_key(),
                &processed,
                correlation_id,
            )
            .await
            .map_err(ConsumerError::retryable)?;

        info!(
            "Processed candle {} {} @ {}",
            processed.candle.ticker, processed.candle.timeframe, processed.candle.begin
        );
        Ok(())
    }
}

/// A redelivered candle must not appear twice in the computation window.
fn drop_duplicate_tail(window: &mut Vec<Candle>, incoming: &Candle) {
    if window
        .last()
        .is_some_and(|last| last.begin == incoming.begin)
    {
        window.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::Timeframe;
    use chrono::{TimeZone, Utc};

    fn candle(hour: u32, close: f64) -> Candle {
        Candle {
            ticker: "SBER".to_string(),
            timeframe: Timeframe::OneHour,
            begin: Utc.with_ymd_and_hms(2024, 6, 3, hour, 0, 0).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            value: None,
        }
    }

    #[test]
    fn test_redelivered_candle_replaces_tail() {
        let mut window = vec![candle(10, 100.0), candle(11, 101.0)];
        let incoming = candle(11, 102.0);
        drop_duplicate_tail(&mut window, &incoming);
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].begin, candle(10, 0.0).begin);
    }

    #[test]
    fn test_fresh_candle_keeps_window() {
        let mut window = vec![candle(10, 100.0), candle(11, 101.0)];
        let incoming = candle(12, 102.0);
        drop_duplicate_tail(&mut window, &incoming);
        assert_eq!(window.len(), 2);
    }
}
