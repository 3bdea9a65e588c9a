//! Backtest quota counters (`rate_limit:{dimension}:{bucket}`).

use anyhow::{Context as _, Result};
use chrono::Utc;
use redis::{AsyncCommands, aio::ConnectionManager};
use tracing::debug;
use uuid::Uuid;

/// Two-day retention keeps yesterday's bucket visible for audits while the
/// key still expires on its own.
const DAILY_TTL_SECS: i64 = 2 * 86_400;

#[derive(Clone)]
pub struct QuotaCounters {
    redis: ConnectionManager,
}

/// Result of a reservation attempt against the daily budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Granted,
    /// Not enough budget left; carries what remained before the attempt.
    Exhausted { remaining: u32 },
}

impl QuotaCounters {
    pub fn new(redis: ConnectionManager) -> QuotaCounters {
        QuotaCounters { redis }
    }

    fn daily_key(user_id: Uuid) -> String {
        format!(
            "rate_limit:backtests_daily:{}:{}",
            user_id,
            Utc::now().format("%Y%m%d")
        )
    }

    /// Reserves `amount` units of the user's daily backtest budget in one
    /// round trip: increment first, roll back when the limit is overshot.
    pub async fn reserve_daily(
        &self,
        user_id: Uuid,
        amount: u32,
        limit: u32,
    ) -> Result<QuotaDecision> {
        let key = Self::daily_key(user_id);
        let mut redis = self.redis.clone();

        let after: i64 = redis
            .incr(&key, amount as i64)
            .await
            .context("Quota increment failed")?;
        // Keep the bucket from living forever even when the limit check
        // below rolls the increment back.
        let _: bool = redis
            .expire(&key, DAILY_TTL_SECS)
            .await
            .context("Quota expire failed")?;

        if after > limit as i64 {
            let _: i64 = redis
                .decr(&key, amount as i64)
                .await
                .context("Quota rollback failed")?;
            let remaining = (limit as i64 - (after - amount as i64)).max(0) as u32;
            debug!(
                "Daily quota exhausted for {}: requested {}, remaining {}",
                user_id, amount, remaining
            );
            return Ok(QuotaDecision::Exhausted { remaining });
        }

        Ok(QuotaDecision::Granted)
    }

    /// Returns `amount` units to the daily budget (submission rolled back).
    pub async fn release_daily(&self, user_id: Uuid, amount: u32) -> Result<()> {
        let mut redis = self.redis.clone();
        let _: i64 = redis
            .decr(Self::daily_key(user_id), amount as i64)
            .await
            .context("Quota release failed")?;
        Ok(())
    }
}
