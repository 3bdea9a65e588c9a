//! Collector checkpoint state (`candles_collector:{ticker}_{timeframe}`).
//!
//! The cache holds the `begin` of the last collected candle per pair; the
//! analytical store's `max(begin)` is the fallback and the sync source
//! after cache downtime.

use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use redis::{AsyncCommands, aio::ConnectionManager};
use tracing::{debug, info, warn};

use crate::domain::market::{MOSCOW_TZ, Timeframe};
use crate::infrastructure::analytics::{AnalyticsPool, CandleStore};

/// Checkpoint values are stored as naive Moscow wall-clock strings.
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Clone)]
pub struct CheckpointStore {
    redis: ConnectionManager,
    candles: CandleStore,
    analytics: AnalyticsPool,
}

impl CheckpointStore {
    pub fn new(
        redis: ConnectionManager,
        candles: CandleStore,
        analytics: AnalyticsPool,
    ) -> CheckpointStore {
        CheckpointStore {
            redis,
            candles,
            analytics,
        }
    }

    fn key(ticker: &str, timeframe: Timeframe) -> String {
        format!("candles_collector:{}_{}", ticker, timeframe)
    }

    fn encode(t: DateTime<Utc>) -> String {
        t.with_timezone(&MOSCOW_TZ).format(TIME_FORMAT).to_string()
    }

    fn decode(raw: &str) -> Option<DateTime<Utc>> {
        let naive = NaiveDateTime::parse_from_str(raw, TIME_FORMAT).ok()?;
        MOSCOW_TZ
            .from_local_datetime(&naive)
            .earliest()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Last collected candle `begin`, falling back to the analytical store
    /// when the cache tier is unavailable.
    pub async fn last_candle_begin(
        &self,
        ticker: &str,
        timeframe: Timeframe,
    ) -> Result<Option<DateTime<Utc>>> {
        let mut redis = self.redis.clone();
        match redis.get::<_, Option<String>>(Self::key(ticker, timeframe)).await {
            Ok(Some(raw)) => {
                if let Some(begin) = Self::decode(&raw) {
                    debug!("Checkpoint for {} {} from cache: {}", ticker, timeframe, raw);
                    return Ok(Some(begin));
                }
                warn!(
                    "Unparseable checkpoint '{}' for {} {}; falling back to analytics",
                    raw, ticker, timeframe
                );
            }
            Ok(None) => return Ok(None),
            Err(err) => {
                warn!(
                    "Cache unavailable for checkpoint {} {} ({err}); falling back to analytics",
                    ticker, timeframe
                );
            }
        }

        let client = self.analytics.acquire().await;
        self.candles.latest_begin(&client, ticker, timeframe).await
    }

    /// Advances the checkpoint. The value never moves backwards; a stale
    /// write attempt is dropped with a warning.
    pub async fn update_last_candle_begin(
        &self,
        ticker: &str,
        timeframe: Timeframe,
        begin: DateTime<Utc>,
    ) -> Result<()> {
        let key = Self::key(ticker, timeframe);
        let mut redis = self.redis.clone();

        match redis.get::<_, Option<String>>(&key).await {
            Ok(Some(raw)) => {
                if let Some(current) = Self::decode(&raw) {
                    if begin < current {
                        warn!(
                            "Refusing to lower checkpoint {} from {} to {}",
                            key,
                            raw,
                            Self::encode(begin)
                        );
                        return Ok(());
                    }
                }
            }
            Ok(None) => {}
            Err(err) => {
                // Candles are already durable in the analytical store; a
                // missed checkpoint write only costs a re-fetch.
                warn!("Cache unavailable, checkpoint {} not updated: {err}", key);
                return Ok(());
            }
        }

        if let Err(err) = redis.set::<_, _, ()>(&key, Self::encode(begin)).await {
            warn!("Checkpoint write failed for {}: {err}", key);
        }
        Ok(())
    }

    /// Rewrites stale or missing cache checkpoints from the analytical
    /// store's `max(begin)` per pair. Returns the number of keys updated.
    pub async fn sync_from_analytics(&self) -> Result<usize> {
        let latest = {
            let client = self.analytics.acquire().await;
            self.candles.latest_begins(&client).await?
        };
        if latest.is_empty() {
            info!("Checkpoint sync: analytical store has no candles yet");
            return Ok(0);
        }

        let keys: Vec<String> = latest
            .iter()
            .map(|(ticker, timeframe, _)| Self::key(ticker, *timeframe))
            .collect();
        let mut redis = self.redis.clone();
        let current: Vec<Option<String>> = redis.mget(&keys).await.unwrap_or_else(|err| {
            warn!("Checkpoint sync mget failed ({err}); treating all as missing");
            vec![None; keys.len()]
        });

        let mut updates: Vec<(String, String)> = Vec::new();
        for ((key, cached), (_, _, begin)) in keys.iter().zip(current).zip(&latest) {
            let fresh = Self::encode(*begin);
            if cached.as_deref() != Some(fresh.as_str()) {
                updates.push((key.clone(), fresh));
            }
        }

        if updates.is_empty() {
            info!("Checkpoint sync: cache already up to date");
            return Ok(0);
        }

        redis.mset::<_, _, ()>(&updates).await?;
        info!("Checkpoint sync: updated {} keys", updates.len());
        Ok(updates.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip_moscow() {
        let utc = Utc.with_ymd_and_hms(2024, 6, 3, 7, 0, 0).unwrap();
        let encoded = CheckpointStore::encode(utc);
        // 07:00 UTC is 10:00 in Moscow.
        assert_eq!(encoded, "2024-06-03 10:00:00");
        assert_eq!(CheckpointStore::decode(&encoded), Some(utc));
    }

    #[test]
    fn test_decode_garbage_is_none() {
        assert_eq!(CheckpointStore::decode("not-a-date"), None);
    }
}
