//! Batch rows and the atomic counter transition.

use anyhow::{Context, Result};
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Row, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::domain::backtest::job::BatchStatus;

#[derive(Clone)]
pub struct BatchStore {
    pool: PgPool,
}

/// Terminal outcome of one child job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildOutcome {
    Completed,
    Failed,
}

/// Counters after a recorded outcome.
#[derive(Debug, Clone)]
pub struct BatchProgress {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub total_count: i32,
    pub completed_count: i32,
    pub failed_count: i32,
}

impl BatchProgress {
    /// Terminal children over total, clamped to 100.
    pub fn progress_pct(&self) -> f64 {
        if self.total_count <= 0 {
            return 0.0;
        }
        let done = (self.completed_count + self.failed_count) as f64;
        (done * 100.0 / self.total_count as f64).min(100.0)
    }
}

impl BatchStore {
    pub fn new(pool: PgPool) -> BatchStore {
        BatchStore { pool }
    }

    /// Inserts the batch row inside the caller's transaction.
    pub async fn insert_batch(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        batch_id: Uuid,
        user_id: Uuid,
        description: &str,
        total_count: i32,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO backtest_batches \
               (id, user_id, description, status, total_count, completed_count, failed_count, \
                created_at, updated_at) \
             VALUES ($1, $2, $3, 'PENDING', $4, 0, 0, now(), now())",
        )
        .bind(batch_id)
        .bind(user_id)
        .bind(description)
        .bind(total_count)
        .execute(&mut **tx)
        .await
        .context("Failed to insert batch")?;
        Ok(())
    }

    /// Applies one child outcome: increments the right counter and
    /// re-derives the status in a single conditional statement, so parallel
    /// children can never lose an update or overshoot `total_count`.
    pub async fn record_outcome(
        &self,
        batch_id: Uuid,
        outcome: ChildOutcome,
    ) -> Result<Option<BatchProgress>> {
        let (completed_delta, failed_delta): (i32, i32) = match outcome {
            ChildOutcome::Completed => (1, 0),
            ChildOutcome::Failed => (0, 1),
        };

        let row = sqlx::query(
            "UPDATE backtest_batches SET \
               completed_count = completed_count + $2, \
               failed_count = failed_count + $3, \
               status = CASE \
                 WHEN completed_count + $2 + failed_count + $3 >= total_count THEN \
                   CASE \
                     WHEN failed_count + $3 >= total_count THEN 'FAILED' \
                     WHEN completed_count + $2 >= total_count THEN 'COMPLETED' \
                     ELSE 'PARTIALLY_FAILED' \
                   END \
                 ELSE 'RUNNING' \
               END, \
               updated_at = now() \
             WHERE id = $1 \
               AND completed_count + failed_count + 1 <= total_count \
             RETURNING status, total_count, completed_count, failed_count",
        )
        .bind(batch_id)
        .bind(completed_delta)
        .bind(failed_delta)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to record batch outcome")?;

        let Some(row) = row else {
            // Unknown batch or counters already saturated; either way the
            // aggregate must not move.
            return Ok(None);
        };

        let status: String = row.try_get("status")?;
        let progress = BatchProgress {
            batch_id,
            status: status.parse()?,
            total_count: row.try_get("total_count")?,
            completed_count: row.try_get("completed_count")?,
            failed_count: row.try_get("failed_count")?,
        };

        info!(
            "Batch {}: {} ({}/{} completed, {} failed, {:.0}%)",
            batch_id,
            progress.status,
            progress.completed_count,
            progress.total_count,
            progress.failed_count,
            progress.progress_pct()
        );
        Ok(Some(progress))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_percentage() {
        let progress = BatchProgress {
            batch_id: Uuid::nil(),
            status: BatchStatus::Running,
            total_count: 3,
            completed_count: 1,
            failed_count: 1,
        };
        assert!((progress.progress_pct() - 66.666).abs() < 0.01);

        let empty = BatchProgress {
            batch_id: Uuid::nil(),
            status: BatchStatus::Pending,
            total_count: 0,
            completed_count: 0,
            failed_count: 0,
        };
        assert_eq!(empty.progress_pct(), 0.0);
    }
}
