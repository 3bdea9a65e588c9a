//! Backtest job and result rows.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::backtest::job::{BacktestJobDetails, JobStatus};
use crate::domain::backtest::metrics::BacktestMetrics;
use crate::domain::backtest::trade::TradeRecord;
use crate::domain::market::Timeframe;
use crate::domain::strategy::StrategyDefinition;

#[derive(Clone)]
pub struct BacktestJobStore {
    pool: PgPool,
}

/// Everything needed to insert one job row at batch submission.
pub struct NewJob<'a> {
    pub id: Uuid,
    pub user_id: Uuid,
    pub strategy_id: Uuid,
    pub ticker: &'a str,
    pub timeframe: Timeframe,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub status: JobStatus,
    pub strategy_definition: &'a StrategyDefinition,
    pub simulation_params: &'a serde_json::Value,
    pub batch_id: Option<Uuid>,
    pub counts_towards_limit: bool,
    pub error_message: Option<&'a str>,
}

impl BacktestJobStore {
    pub fn new(pool: PgPool) -> BacktestJobStore {
        BacktestJobStore { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn fetch_job(&self, job_id: Uuid) -> Result<Option<BacktestJobDetails>> {
        let row = sqlx::query(
            "SELECT id, user_id, strategy_id, ticker, timeframe, start_date, end_date, \
                    status, strategy_definition_snapshot, simulation_params, batch_id, \
                    counts_towards_limit, error_message \
             FROM backtest_jobs WHERE id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load backtest job")?;

        let Some(row) = row else { return Ok(None) };

        let timeframe: String = row.try_get("timeframe")?;
        let status: String = row.try_get("status")?;
        let definition: serde_json::Value = row.try_get("strategy_definition_snapshot")?;

        Ok(Some(BacktestJobDetails {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            strategy_id: row.try_get("strategy_id")?,
            ticker: row.try_get("ticker")?,
            timeframe: timeframe.parse()?,
            start_date: row.try_get("start_date")?,
            end_date: row.try_get("end_date")?,
            status: status.parse()?,
            strategy_definition: serde_json::from_value(definition)
                .context("Corrupt strategy definition snapshot")?,
            simulation_params: row.try_get("simulation_params")?,
            batch_id: row.try_get("batch_id")?,
            counts_towards_limit: row.try_get("counts_towards_limit")?,
            error_message: row.try_get("error_message")?,
        }))
    }

    /// Transitions the job status. Terminal states are sticky: the update
    /// refuses to leave COMPLETED or FAILED and reports whether the row
    /// actually moved, so redelivered events cannot double-notify a batch.
    pub async fn update_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE backtest_jobs \
             SET status = $2, error_message = COALESCE($3, error_message), updated_at = now() \
             WHERE id = $1 AND status NOT IN ('COMPLETED', 'FAILED')",
        )
        .bind(job_id)
        .bind(status.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await
        .context("Failed to update job status")?;

        debug!(
            "Job {} -> {} ({} row(s))",
            job_id,
            status,
            updated.rows_affected()
        );
        Ok(updated.rows_affected() > 0)
    }

    /// Marks a job failed without it consuming the user's quota (jobs that
    /// never became runnable).
    pub async fn mark_failed_not_counted(&self, job_id: Uuid, error_message: &str) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE backtest_jobs \
             SET status = 'FAILED', counts_towards_limit = FALSE, error_message = $2, \
                 updated_at = now() \
             WHERE id = $1 AND status NOT IN ('COMPLETED', 'FAILED')",
        )
        .bind(job_id)
        .bind(error_message)
        .execute(&self.pool)
        .await
        .context("Failed to mark job as failed")?;
        Ok(updated.rows_affected() > 0)
    }

    /// Writes the result row and completes the job in one transaction.
    /// Returns false when the job had already reached a terminal state.
    pub async fn save_result(
        &self,
        job_id: Uuid,
        metrics: &BacktestMetrics,
        trades: &[TradeRecord],
    ) -> Result<bool> {
        let metrics_json = serde_json::to_value(metrics).context("Failed to encode metrics")?;
        let trades_json = serde_json::to_value(trades).context("Failed to encode trades")?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO backtest_results (job_id, metrics, trades, created_at) \
             VALUES ($1, $2, $3, now()) \
             ON CONFLICT (job_id) DO UPDATE SET metrics = $2, trades = $3",
        )
        .bind(job_id)
        .bind(&metrics_json)
        .bind(&trades_json)
        .execute(&mut *tx)
        .await
        .context("Failed to insert backtest result")?;

        let completed = sqlx::query(
            "UPDATE backtest_jobs SET status = 'COMPLETED', updated_at = now() \
             WHERE id = $1 AND status NOT IN ('COMPLETED', 'FAILED')",
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .context("Failed to complete job")?;
        tx.commit().await?;

        info!(
            "Result saved for job {}: {} trades, net {:.2}%",
            job_id, metrics.total_trades, metrics.net_total_profit_pct
        );
        Ok(completed.rows_affected() > 0)
    }

    /// Inserts a job row inside the caller's transaction (batch submission).
    pub async fn insert_job(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job: &NewJob<'_>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO backtest_jobs \
               (id, user_id, strategy_id, ticker, timeframe, start_date, end_date, status, \
                strategy_definition_snapshot, simulation_params, batch_id, \
                counts_towards_limit, error_message, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, now(), now())",
        )
        .bind(job.id)
        .bind(job.user_id)
        .bind(job.strategy_id)
        .bind(job.ticker)
        .bind(job.timeframe.as_str())
        .bind(job.start_date)
        .bind(job.end_date)
        .bind(job.status.as_str())
        .bind(serde_json::to_value(job.strategy_definition)?)
        .bind(job.simulation_params)
        .bind(job.batch_id)
        .bind(job.counts_towards_limit)
        .bind(job.error_message)
        .execute(&mut **tx)
        .await
        .context("Failed to insert backtest job")?;
        Ok(())
    }

    /// PENDING/RUNNING jobs that count towards the user's concurrency cap.
    pub async fn count_active_jobs(&self, user_id: Uuid) -> Result<i64> {
        let row = sqlx::query(
            "SELECT count(*) AS active FROM backtest_jobs \
             WHERE user_id = $1 AND status IN ('PENDING', 'RUNNING') \
               AND counts_towards_limit",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count active jobs")?;
        Ok(row.try_get("active")?)
    }
}
