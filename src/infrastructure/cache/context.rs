//! Rolling candle context (`candles_context:{ticker}_{timeframe}`).
//!
//! A bounded FIFO of the most recent candles per pair, enough to warm up
//! every hot indicator. Only the single RT consumer of a partition mutates
//! a given key, so no locking is involved.

use anyhow::{Context as _, Result};
use redis::{AsyncCommands, aio::ConnectionManager};
use tracing::debug;

use crate::domain::market::{Candle, Timeframe};

/// Default context depth; matches the hot indicators' deepest warm-up.
pub const DEFAULT_CONTEXT_SIZE: usize = 500;

#[derive(Clone)]
pub struct ContextCache {
    redis: ConnectionManager,
    max_len: usize,
}

impl ContextCache {
    pub fn new(redis: ConnectionManager, max_len: usize) -> ContextCache {
        ContextCache {
            redis,
            max_len: max_len.max(1),
        }
    }

    fn key(ticker: &str, timeframe: Timeframe) -> String {
        format!("candles_context:{}_{}", ticker, timeframe)
    }

    /// Full context window, oldest first. Errors bubble up so the caller
    /// can fall back to the analytical store.
    pub async fn get_context(&self, ticker: &str, timeframe: Timeframe) -> Result<Vec<Candle>> {
        let mut redis = self.redis.clone();
        let raw: Vec<String> = redis
            .lrange(Self::key(ticker, timeframe), 0, -1)
            .await
            .context("Failed to read context window")?;

        let mut candles = Vec::with_capacity(raw.len());
        for item in raw {
            candles.push(
                serde_json::from_str::<Candle>(&item)
                    .context("Corrupt candle in context window")?,
            );
        }
        debug!(
            "Loaded {} context candles for {} {}",
            candles.len(),
            ticker,
            timeframe
        );
        Ok(candles)
    }

    /// Appends a candle and trims the window to its bound.
    pub async fn push_candle(&self, candle: &Candle) -> Result<()> {
        let key = Self::key(&candle.ticker, candle.timeframe);
        let serialized = serde_json::to_string(candle).context("Failed to serialize candle")?;

        let mut redis = self.redis.clone();
        redis::pipe()
            .rpush(&key, serialized)
            .ltrim(&key, -(self.max_len as isize), -1)
            .query_async::<()>(&mut redis)
            .await
            .context("Failed to update context window")?;
        Ok(())
    }
}
