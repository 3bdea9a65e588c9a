//! Candle collection worker service.
//!
//! One invocation fetches a single upstream page: read the checkpoint, pull
//! candles after it, upsert them, advance the checkpoint, and report how
//! many arrived. The consumer republishes the task while the count stays
//! positive, which turns long backfills into cooperative self-scheduling
//! instead of head-of-line blocking other tickers.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use crate::domain::errors::ConsumerError;
use crate::domain::market::{MOSCOW_TZ, Timeframe};
use crate::infrastructure::analytics::{AnalyticsPool, CandleStore};
use crate::infrastructure::cache::CheckpointStore;
use crate::infrastructure::kafka::EventProducer;
use crate::infrastructure::kafka::messages::RawCandleMessage;
use crate::infrastructure::moex::MoexClient;

pub struct CandlesCollectorService {
    moex: Arc<MoexClient>,
    checkpoints: CheckpointStore,
    analytics: AnalyticsPool,
    candles: CandleStore,
    producer: Option<EventProducer>,
    raw_candles_topic: String,
    default_start: DateTime<Utc>,
}

impl CandlesCollectorService {
    pub fn new(
        moex: Arc<MoexClient>,
        checkpoints: CheckpointStore,
        analytics: AnalyticsPool,
        candles: CandleStore,
        producer: Option<EventProducer>,
        raw_candles_topic: String,
        default_start: &str,
    ) -> CandlesCollectorService {
        CandlesCollectorService {
            moex,
            checkpoints,
            analytics,
            candles,
            producer,
            raw_candles_topic,
            default_start: parse_default_start(default_start),
        }
    }

    /// Collects one upstream page for the pair. Returns the number of
    /// candles fetched; a positive count tells the consumer to republish
    /// the task and keep paging.
    pub async fn collect_candles(
        &self,
        ticker: &str,
        timeframe: Timeframe,
        correlation_id: &str,
    ) -> Result<u64, ConsumerError> {
        let checkpoint = self
            .checkpoints
            .last_candle_begin(ticker, timeframe)
            .await
            .map_err(ConsumerError::retryable)?;

        // The checkpointed candle itself is already stored; resume just
        // past it.
        let from = checkpoint
            .map(|last| last + chrono::Duration::seconds(1))
            .unwrap_or(self.default_start);

        let candles = self
            .moex
            .get_candles(ticker, timeframe, from)
            .await
            .map_err(ConsumerError::retryable)?;

        if candles.is_empty() {
            debug!("No new candles for {} {} from {}", ticker, timeframe, from);
            return Ok(0);
        }

        {
            let client = self.analytics.acquire().await;
            self.candles
                .insert_candles(&client, &candles)
                .await
                .map_err(ConsumerError::retryable)?;
        }

        let max_begin = candles
            .iter()
            .map(|c| c.begin)
            .max()
            .expect("non-empty batch");
        self.checkpoints
            .update_last_candle_begin(ticker, timeframe, max_begin)
            .await
            .map_err(ConsumerError::retryable)?;

        if let Some(producer) = &self.producer {
            for candle in &candles {
                let message = RawCandleMessage::from(candle);
                producer
                    .send_json(
                        &self.raw_candles_topic,
                        &message.partition_key(),
                        &message,
                        correlation_id,
                    )
                    .await
                    .map_err(ConsumerError::retryable)?;
            }
        }

        info!(
            "Collected {} candles for {} {} (checkpoint now {})",
            candles.len(),
            ticker,
            timeframe,
            max_begin
        );
        Ok(candles.len() as u64)
    }
}

fn parse_default_start(raw: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .and_then(|naive| MOSCOW_TZ.from_local_datetime(&naive).earliest())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.with_ymd_and_hms(2014, 1, 1, 0, 0, 0).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_start_parses_moscow_wall_clock() {
        let parsed = parse_default_start("2020-06-01 10:00:00");
        assert_eq!(parsed, Utc.with_ymd_and_hms(2020, 6, 1, 7, 0, 0).unwrap());
    }

    #[test]
    fn test_default_start_falls_back_on_garbage() {
        let parsed = parse_default_start("whenever");
        assert_eq!(parsed, Utc.with_ymd_and_hms(2014, 1, 1, 0, 0, 0).unwrap());
    }
}
