//! Batch backtest coordination.
//!
//! Submission: size and tier checks, quota reservation, one transaction for
//! the batch row plus all child jobs, then one request event per runnable
//! child. Children that fail pre-validation are created terminal and folded
//! into the batch counters through the same atomic transition the workers
//! use, so the aggregate invariant holds from the first moment.

use anyhow::Result;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::backtest::config::BacktestConfig;
use crate::domain::backtest::job::JobStatus;
use crate::domain::market::Timeframe;
use crate::infrastructure::cache::QuotaCounters;
use crate::infrastructure::cache::quota::QuotaDecision;
use crate::infrastructure::kafka::EventProducer;
use crate::infrastructure::kafka::messages::BacktestRequestMessage;
use crate::infrastructure::persistence::jobs::NewJob;
use crate::infrastructure::persistence::{
    BacktestJobStore, BatchStore, ChildOutcome, StrategyStore, TickerStore,
};

/// Hard cap on children per batch.
pub const MAX_BATCH_SIZE: usize = 50;

/// Per-tier submission limits.
#[derive(Debug, Clone, Copy)]
pub struct TierLimits {
    pub max_years_per_child: f64,
    pub daily_backtests: u32,
    pub concurrent_backtests: u32,
}

impl TierLimits {
    pub fn for_tier(tier: &str) -> TierLimits {
        match tier {
            "premium" => TierLimits {
                max_years_per_child: 10.0,
                daily_backtests: 500,
                concurrent_backtests: 20,
            },
            "pro" => TierLimits {
                max_years_per_child: 5.0,
                daily_backtests: 100,
                concurrent_backtests: 10,
            },
            _ => TierLimits {
                max_years_per_child: 1.0,
                daily_backtests: 20,
                concurrent_backtests: 3,
            },
        }
    }
}

/// One child backtest inside a submission.
#[derive(Debug, Clone)]
pub struct BacktestSpec {
    pub strategy_id: Uuid,
    pub ticker: String,
    pub timeframe: Timeframe,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub simulation_params: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct BatchSubmission {
    pub batch_id: Uuid,
    pub job_ids: Vec<Uuid>,
    pub accepted: usize,
    pub rejected: usize,
}

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("batch must contain between 1 and {MAX_BATCH_SIZE} backtests, got {0}")]
    InvalidSize(usize),

    #[error("backtest #{index} ({ticker}): range of {years:.1} years exceeds the {max_years:.1}-year tier limit")]
    DateRangeExceeded {
        index: usize,
        ticker: String,
        years: f64,
        max_years: f64,
    },

    #[error("daily backtest quota exhausted: requested {requested}, remaining {remaining}")]
    DailyQuotaExceeded { requested: u32, remaining: u32 },

    #[error("concurrent backtest limit reached: {active} active, limit {limit}")]
    ConcurrencyExceeded { active: i64, limit: u32 },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub struct BatchCoordinator {
    jobs: BacktestJobStore,
    batches: BatchStore,
    strategies: StrategyStore,
    tickers: std::sync::Arc<TickerStore>,
    quotas: QuotaCounters,
    producer: EventProducer,
    requests_topic: String,
}

impl BatchCoordinator {
    pub fn new(
        jobs: BacktestJobStore,
        batches: BatchStore,
        strategies: StrategyStore,
        tickers: std::sync::Arc<TickerStore>,
        quotas: QuotaCounters,
        producer: EventProducer,
        requests_topic: String,
    ) -> BatchCoordinator {
        BatchCoordinator {
            jobs,
            batches,
            strategies,
            tickers,
            quotas,
            producer,
            requests_topic,
        }
    }

    pub async fn submit(
        &self,
        user_id: Uuid,
        description: &str,
        specs: Vec<BacktestSpec>,
        tier: &str,
    ) -> Result<BatchSubmission, SubmissionError> {
        let limits = TierLimits::for_tier(tier);
        validate_specs(&specs, &limits)?;

        // Concurrency first: it needs no rollback.
        let active = self.jobs.count_active_jobs(user_id).await?;
        if active + specs.len() as i64 > limits.concurrent_backtests as i64 {
            return Err(SubmissionError::ConcurrencyExceeded {
                active,
                limit: limits.concurrent_backtests,
            });
        }

        match self
            .quotas
            .reserve_daily(user_id, specs.len() as u32, limits.daily_backtests)
            .await?
        {
            QuotaDecision::Granted => {}
            QuotaDecision::Exhausted { remaining } => {
                return Err(SubmissionError::DailyQuotaExceeded {
                    requested: specs.len() as u32,
                    remaining,
                });
            }
        }

        match self.create_rows(user_id, description, &specs).await {
            Ok(submission) => {
                // Pre-failed children never consumed compute; hand their
                // share of the daily budget back.
                if submission.rejected > 0 {
                    if let Err(err) = self
                        .quotas
                        .release_daily(user_id, submission.rejected as u32)
                        .await
                    {
                        warn!("Failed to return {} quota units: {err}", submission.rejected);
                    }
                }
                Ok(submission)
            }
            Err(err) => {
                if let Err(release_err) = self
                    .quotas
                    .release_daily(user_id, specs.len() as u32)
                    .await
                {
                    warn!("Failed to roll back quota reservation: {release_err}");
                }
                Err(err.into())
            }
        }
    }

    async fn create_rows(
        &self,
        user_id: Uuid,
        description: &str,
        specs: &[BacktestSpec],
    ) -> Result<BatchSubmission> {
        let batch_id = Uuid::new_v4();
        let mut prepared = Vec::with_capacity(specs.len());

        // Resolve strategies and tickers before the transaction so the
        // write path stays short.
        for spec in specs {
            let definition = self
                .strategies
                .fetch_definition(spec.strategy_id, user_id)
                .await?;
            let ticker = self.tickers.get_ticker(&spec.ticker).await?;
            let rejection = prevalidate(spec, definition.as_ref(), ticker.is_some());
            prepared.push((spec, definition, rejection));
        }

        let mut tx = self.jobs.pool().begin().await?;
        self.batches
            .insert_batch(&mut tx, batch_id, user_id, description, specs.len() as i32)
            .await?;

        let mut job_ids = Vec::with_capacity(specs.len());
        let mut rejected = Vec::new();
        // Children rejected because the strategy is gone snapshot an empty
        // definition.
        let empty_definition = crate::domain::strategy::StrategyDefinition::default();
        for (spec, definition, rejection) in &prepared {
            let job_id = Uuid::new_v4();
            job_ids.push(job_id);

            self.jobs
                .insert_job(
                    &mut tx,
                    &NewJob {
                        id: job_id,
                        user_id,
                        strategy_id: spec.strategy_id,
                        ticker: &spec.ticker,
                        timeframe: spec.timeframe,
                        start_date: spec.start_date,
                        end_date: spec.end_date,
                        status: if rejection.is_some() {
                            JobStatus::Failed
                        } else {
                            JobStatus::Pending
                        },
                        strategy_definition: definition.as_ref().unwrap_or(&empty_definition),
                        simulation_params: &spec.simulation_params,
                        batch_id: Some(batch_id),
                        counts_towards_limit: rejection.is_none(),
                        error_message: rejection.as_deref(),
                    },
                )
                .await?;
            if rejection.is_some() {
                rejected.push(job_id);
            }
        }
        tx.commit().await?;

        // Fold the pre-failed children into the aggregate through the same
        // conditional update workers use, keeping the counter invariant.
        for _ in &rejected {
            self.batches
                .record_outcome(batch_id, ChildOutcome::Failed)
                .await?;
        }

        // Emit one request event per runnable child.
        for (job_id, (_, _, rejection)) in job_ids.iter().zip(&prepared) {
            if rejection.is_some() {
                continue;
            }
            let request = BacktestRequestMessage {
                job_id: *job_id,
                status: None,
                error: None,
            };
            self.producer
                .send_json(
                    &self.requests_topic,
                    &job_id.to_string(),
                    &request,
                    &batch_id.to_string(),
                )
                .await?;
        }

        info!(
            "Batch {} submitted: {} children, {} rejected pre-flight",
            batch_id,
            specs.len(),
            rejected.len()
        );
        Ok(BatchSubmission {
            batch_id,
            accepted: specs.len() - rejected.len(),
            rejected: rejected.len(),
            job_ids,
        })
    }
}

fn validate_specs(specs: &[BacktestSpec], limits: &TierLimits) -> Result<(), SubmissionError> {
    if specs.is_empty() || specs.len() > MAX_BATCH_SIZE {
        return Err(SubmissionError::InvalidSize(specs.len()));
    }

    for (index, spec) in specs.iter().enumerate() {
        let years = (spec.end_date - spec.start_date).num_days() as f64 / 365.0;
        if years > limits.max_years_per_child {
            return Err(SubmissionError::DateRangeExceeded {
                index: index + 1,
                ticker: spec.ticker.clone(),
                years,
                max_years: limits.max_years_per_child,
            });
        }
    }
    Ok(())
}

/// Reason string when a child can be rejected without ever running.
fn prevalidate(
    spec: &BacktestSpec,
    definition: Option<&crate::domain::strategy::StrategyDefinition>,
    ticker_exists: bool,
) -> Option<String> {
    if spec.start_date >= spec.end_date {
        return Some(format!(
            "start_date {} is not before end_date {}",
            spec.start_date, spec.end_date
        ));
    }
    if !ticker_exists {
        return Some(format!("Unknown ticker '{}'", spec.ticker));
    }
    let Some(definition) = definition else {
        return Some("Strategy not found or deleted".to_string());
    };
    if let Err(err) = definition.validate() {
        return Some(format!("Invalid strategy definition: {err}"));
    }
    if let Err(err) = BacktestConfig::from_simulation_params(&spec.simulation_params) {
        return Some(format!("Invalid simulation parameters: {err}"));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::strategy::StrategyDefinition;
    use crate::domain::strategy::ast::{ConditionNode, ValueNode};
    use chrono::TimeZone;
    use serde_json::json;

    fn spec(ticker: &str, years: i64) -> BacktestSpec {
        let start = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        BacktestSpec {
            strategy_id: Uuid::new_v4(),
            ticker: ticker.to_string(),
            timeframe: Timeframe::OneHour,
            start_date: start,
            end_date: start + chrono::Duration::days(365 * years),
            simulation_params: json!({}),
        }
    }

    fn valid_definition() -> StrategyDefinition {
        StrategyDefinition {
            entry_buy_conditions: Some(ConditionNode::GreaterThan {
                left: ValueNode::Indicator {
                    key: "close".to_string(),
                },
                right: ValueNode::Value { value: 0.0 },
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_batch_size_bounds() {
        let limits = TierLimits::for_tier("premium");
        assert!(matches!(
            validate_specs(&[], &limits),
            Err(SubmissionError::InvalidSize(0))
        ));
        let oversized: Vec<BacktestSpec> = (0..51).map(|_| spec("SBER", 1)).collect();
        assert!(matches!(
            validate_specs(&oversized, &limits),
            Err(SubmissionError::InvalidSize(51))
        ));
    }

    #[test]
    fn test_tier_date_range_enforced() {
        let free = TierLimits::for_tier("free");
        let err = validate_specs(&[spec("SBER", 1), spec("GAZP", 3)], &free).unwrap_err();
        match err {
            SubmissionError::DateRangeExceeded { index, ticker, .. } => {
                assert_eq!(index, 2);
                assert_eq!(ticker, "GAZP");
            }
            other => panic!("expected DateRangeExceeded, got {other}"),
        }
        assert!(validate_specs(&[spec("SBER", 1)], &free).is_ok());
    }

    #[test]
    fn test_prevalidation_reasons() {
        let definition = valid_definition();
        let good = spec("SBER", 1);
        assert_eq!(prevalidate(&good, Some(&definition), true), None);

        assert!(prevalidate(&good, Some(&definition), false)
            .unwrap()
            .contains("Unknown ticker"));
        assert!(prevalidate(&good, None, true).unwrap().contains("not found"));

        let mut inverted = spec("SBER", 1);
        std::mem::swap(&mut inverted.start_date, &mut inverted.end_date);
        assert!(prevalidate(&inverted, Some(&definition), true)
            .unwrap()
            .contains("not before"));

        let mut bad_params = spec("SBER", 1);
        bad_params.simulation_params = json!({"commission_rate": 0.5});
        assert!(prevalidate(&bad_params, Some(&definition), true)
            .unwrap()
            .contains("simulation parameters"));
    }
}
