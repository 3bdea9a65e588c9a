//! Advisory distributed locks (`indicator_lock:{ticker}:{timeframe}:{key}`).
//!
//! Writer exclusivity for batch indicator persistence: without the lock,
//! interleaved writes into the last-write-wins merge tree would leave a
//! series dependent on scheduling. Expiry is enforced by the cache TTL,
//! never by client clocks.

use anyhow::{Context as _, Result};
use redis::aio::ConnectionManager;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::market::Timeframe;

#[derive(Clone)]
pub struct DistributedLock {
    redis: ConnectionManager,
}

/// A held lock. Release checks the unique value so an expired lock taken
/// over by another writer is never deleted from under it.
#[derive(Debug)]
pub struct LockToken {
    key: String,
    value: String,
}

impl DistributedLock {
    pub fn new(redis: ConnectionManager) -> DistributedLock {
        DistributedLock { redis }
    }

    pub fn indicator_lock_key(ticker: &str, timeframe: Timeframe, indicator_key: &str) -> String {
        format!("indicator_lock:{}:{}:{}", ticker, timeframe, indicator_key)
    }

    /// Blocks up to `timeout`, polling every `poll_interval`; the lock key
    /// lives for `ttl` regardless of what the holder does afterwards.
    pub async fn acquire(
        &self,
        lock_key: &str,
        timeout: Duration,
        poll_interval: Duration,
        ttl: Duration,
    ) -> Result<Option<LockToken>> {
        let value = Uuid::new_v4().to_string();
        let deadline = Instant::now() + timeout;

        loop {
            let mut redis = self.redis.clone();
            let acquired: bool = redis::cmd("SET")
                .arg(lock_key)
                .arg(&value)
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async::<Option<String>>(&mut redis)
                .await
                .context("Lock acquire command failed")?
                .is_some();

            if acquired {
                debug!("Acquired lock {}", lock_key);
                return Ok(Some(LockToken {
                    key: lock_key.to_string(),
                    value,
                }));
            }

            if Instant::now() + poll_interval > deadline {
                warn!("Timed out waiting for lock {}", lock_key);
                return Ok(None);
            }
            sleep(poll_interval).await;
        }
    }

    /// Check-and-delete: only removes the key while it still carries the
    /// token's unique value.
    pub async fn release(&self, token: LockToken) -> Result<()> {
        const RELEASE_SCRIPT: &str = r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            else
                return 0
            end
        "#;

        let mut redis = self.redis.clone();
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&token.key)
            .arg(&token.value)
            .invoke_async(&mut redis)
            .await
            .context("Lock release script failed")?;

        if deleted == 0 {
            warn!("Lock {} already expired or taken over", token.key);
        } else {
            debug!("Released lock {}", token.key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_shape() {
        assert_eq!(
            DistributedLock::indicator_lock_key("SBER", Timeframe::OneHour, "ema_timeperiod_12_value"),
            "indicator_lock:SBER:1h:ema_timeperiod_12_value"
        );
    }
}
