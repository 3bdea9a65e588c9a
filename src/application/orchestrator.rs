//! Backtest job orchestration.
//!
//! Drives one job through load → data check → (optional indicator fill
//! round trip) → simulate → persist → batch notify. The machine never
//! blocks waiting for the indicator response: it publishes the calculation
//! request and returns, and the response event re-enters the same job with
//! the indicator check skipped.
//!
//! Collaborators sit behind small ports so the sequencing and the
//! re-entrance/redelivery rules are testable without live stores.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clickhouse::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::application::availability::{AvailabilityReport, AvailabilitySnapshot, assess};
use crate::application::frame::CandleFrame;
use crate::application::resolver::{ResolvedIndicators, resolve_indicators};
use crate::application::simulator::{SimulationOutcome, Simulator};
use crate::domain::backtest::config::BacktestConfig;
use crate::domain::backtest::job::{BacktestJobDetails, JobStatus};
use crate::domain::backtest::metrics::BacktestMetrics;
use crate::domain::backtest::trade::TradeRecord;
use crate::domain::errors::{ConsumerError, SimulationError};
use crate::domain::market::{Ticker, TickerInfo, Timeframe};
use crate::domain::strategy::indicator_key::IndicatorDef;
use crate::infrastructure::analytics::CandleStore;
use crate::infrastructure::kafka::EventProducer;
use crate::infrastructure::kafka::messages::{IndicatorCalculationRequest, IndicatorSpec};
use crate::infrastructure::persistence::{BacktestJobStore, BatchStore, ChildOutcome, TickerStore};

/// Job rows as the orchestrator needs them. Status transitions report
/// whether the row actually moved; terminal states are sticky underneath.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn fetch_job(&self, job_id: Uuid) -> Result<Option<BacktestJobDetails>>;
    async fn update_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<bool>;
    async fn mark_failed_not_counted(&self, job_id: Uuid, error_message: &str) -> Result<bool>;
    async fn save_result(
        &self,
        job_id: Uuid,
        metrics: &BacktestMetrics,
        trades: &[TradeRecord],
    ) -> Result<bool>;
}

/// Batch counter aggregation for child terminal events.
#[async_trait]
pub trait BatchLedger: Send + Sync {
    async fn record_outcome(&self, batch_id: Uuid, outcome: ChildOutcome) -> Result<()>;
}

/// Instrument metadata lookup.
#[async_trait]
pub trait TickerDirectory: Send + Sync {
    async fn get_ticker(&self, symbol: &str) -> Result<Option<Ticker>>;
}

/// Analytical-store reads the orchestrator performs with its pooled client.
#[async_trait]
pub trait MarketDataReader: Send + Sync {
    async fn lookback_start(
        &self,
        client: &Client,
        ticker: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        lookback: usize,
    ) -> Result<Option<DateTime<Utc>>>;

    #[allow(clippy::too_many_arguments)]
    async fn availability_snapshot(
        &self,
        client: &Client,
        ticker: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        lookback_start: Option<DateTime<Utc>>,
        max_lookback: usize,
        indicator_keys: &[String],
    ) -> Result<AvailabilitySnapshot>;

    #[allow(clippy::too_many_arguments)]
    async fn fetch_frame(
        &self,
        client: &Client,
        ticker: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        indicator_keys: &[String],
    ) -> Result<CandleFrame>;
}

/// Outbound leg of the indicator round trip.
#[async_trait]
pub trait CalculationRequestSink: Send + Sync {
    async fn publish_request(
        &self,
        request: &IndicatorCalculationRequest,
        correlation_id: &str,
    ) -> Result<()>;
}

#[async_trait]
impl JobRepository for BacktestJobStore {
    async fn fetch_job(&self, job_id: Uuid) -> Result<Option<BacktestJobDetails>> {
        BacktestJobStore::fetch_job(self, job_id).await
    }

    async fn update_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        BacktestJobStore::update_status(self, job_id, status, error_message).await
    }

    async fn mark_failed_not_counted(&self, job_id: Uuid, error_message: &str) -> Result<bool> {
        BacktestJobStore::mark_failed_not_counted(self, job_id, error_message).await
    }

    async fn save_result(
        &self,
        job_id: Uuid,
        metrics: &BacktestMetrics,
        trades: &[TradeRecord],
    ) -> Result<bool> {
        BacktestJobStore::save_result(self, job_id, metrics, trades).await
    }
}

#[async_trait]
impl BatchLedger for BatchStore {
    async fn record_outcome(&self, batch_id: Uuid, outcome: ChildOutcome) -> Result<()> {
        BatchStore::record_outcome(self, batch_id, outcome).await?;
        Ok(())
    }
}

#[async_trait]
impl TickerDirectory for TickerStore {
    async fn get_ticker(&self, symbol: &str) -> Result<Option<Ticker>> {
        TickerStore::get_ticker(self, symbol).await
    }
}

#[async_trait]
impl MarketDataReader for CandleStore {
    async fn lookback_start(
        &self,
        client: &Client,
        ticker: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        lookback: usize,
    ) -> Result<Option<DateTime<Utc>>> {
        CandleStore::lookback_start(self, client, ticker, timeframe, start, lookback).await
    }

    async fn availability_snapshot(
        &self,
        client: &Client,
        ticker: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        lookback_start: Option<DateTime<Utc>>,
        max_lookback: usize,
        indicator_keys: &[String],
    ) -> Result<AvailabilitySnapshot> {
        CandleStore::availability_snapshot(
            self,
            client,
            ticker,
            timeframe,
            start,
            end,
            lookback_start,
            max_lookback,
            indicator_keys,
        )
        .await
    }

    async fn fetch_frame(
        &self,
        client: &Client,
        ticker: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        indicator_keys: &[String],
    ) -> Result<CandleFrame> {
        CandleStore::fetch_frame(self, client, ticker, timeframe, from, to, indicator_keys).await
    }
}

/// Publishes calculation requests to the event log, keyed by job id.
pub struct CalculationRequestPublisher {
    producer: EventProducer,
    topic: String,
}

impl CalculationRequestPublisher {
    pub fn new(producer: EventProducer, topic: String) -> CalculationRequestPublisher {
        CalculationRequestPublisher { producer, topic }
    }
}

#[async_trait]
impl CalculationRequestSink for CalculationRequestPublisher {
    async fn publish_request(
        &self,
        request: &IndicatorCalculationRequest,
        correlation_id: &str,
    ) -> Result<()> {
        self.producer
            .send_json(&self.topic, &request.job_id.to_string(), request, correlation_id)
            .await
    }
}

pub struct BacktestOrchestrator {
    jobs: Arc<dyn JobRepository>,
    batches: Arc<dyn BatchLedger>,
    tickers: Arc<dyn TickerDirectory>,
    market_data: Arc<dyn MarketDataReader>,
    requests: Arc<dyn CalculationRequestSink>,
    simulation_timeout: Duration,
}

impl BacktestOrchestrator {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        batches: Arc<dyn BatchLedger>,
        tickers: Arc<dyn TickerDirectory>,
        market_data: Arc<dyn MarketDataReader>,
        requests: Arc<dyn CalculationRequestSink>,
        simulation_timeout: Duration,
    ) -> BacktestOrchestrator {
        BacktestOrchestrator {
            jobs,
            batches,
            tickers,
            market_data,
            requests,
            simulation_timeout,
        }
    }

    /// One pass of the state machine for `job_id`. `skip_indicator_check`
    /// is set on the pass triggered by a successful calculation response.
    pub async fn process(
        &self,
        client: &Client,
        job_id: Uuid,
        correlation_id: &str,
        skip_indicator_check: bool,
    ) -> Result<(), ConsumerError> {
        // LOAD
        let job = self
            .jobs
            .fetch_job(job_id)
            .await
            .map_err(ConsumerError::retryable)?
            .ok_or_else(|| ConsumerError::fatal(format!("Unknown backtest job {job_id}")))?;

        if job.status.is_terminal() {
            warn!("Job {} is already {}; message ignored", job_id, job.status);
            return Ok(());
        }
        if job.status == JobStatus::Pending {
            self.jobs
                .update_status(job_id, JobStatus::Running, None)
                .await
                .map_err(ConsumerError::retryable)?;
        }

        let ticker = self
            .tickers
            .get_ticker(&job.ticker)
            .await
            .map_err(ConsumerError::retryable)?;
        let Some(ticker) = ticker else {
            return self
                .fail_job(&job, &format!("Unknown ticker '{}'", job.ticker))
                .await;
        };

        if let Err(err) = job.strategy_definition.validate() {
            return self
                .fail_job(&job, &format!("Invalid strategy definition: {err}"))
                .await;
        }

        let config = match BacktestConfig::from_simulation_params(&job.simulation_params) {
            Ok(config) => config,
            Err(err) => {
                return self
                    .fail_job(&job, &format!("Invalid simulation parameters: {err}"))
                    .await;
            }
        };

        let resolved = match resolve_indicators(&job.strategy_definition) {
            Ok(resolved) => resolved,
            Err(err) => {
                return self
                    .fail_job(&job, &format!("Invalid indicator reference: {err}"))
                    .await;
            }
        };

        // CHECK_DATA
        if !skip_indicator_check {
            match self.check_data(client, &job, &resolved).await? {
                CheckOutcome::Proceed => {}
                CheckOutcome::Requested => return Ok(()),
                CheckOutcome::Failed(message) => {
                    return self.fail_job_not_counted(&job, &message).await;
                }
            }
        } else {
            info!("Job {}: indicator check skipped after calculation", job_id);
        }

        // SIMULATE
        let outcome = self
            .simulate(client, &job, &resolved, config, (&ticker).into())
            .await?;

        // PERSIST
        let transitioned = self
            .jobs
            .save_result(job_id, &outcome.metrics, &outcome.trades)
            .await
            .map_err(ConsumerError::retryable)?;

        // NOTIFY_BATCH only on the pass that actually completed the job;
        // redeliveries must not move the batch counters twice.
        if transitioned {
            self.notify_batch(&job, ChildOutcome::Completed).await?;
        }

        info!(
            "Job {} completed: {} trades, net {:.2}% (correlation {})",
            job_id, outcome.metrics.total_trades, outcome.metrics.net_total_profit_pct,
            correlation_id
        );
        Ok(())
    }

    /// Marks the job failed after a calculation-failure response.
    pub async fn fail_after_calculation(
        &self,
        job_id: Uuid,
        error: Option<&str>,
    ) -> Result<(), ConsumerError> {
        let job = self
            .jobs
            .fetch_job(job_id)
            .await
            .map_err(ConsumerError::retryable)?
            .ok_or_else(|| ConsumerError::fatal(format!("Unknown backtest job {job_id}")))?;

        let message = match error {
            Some(detail) => format!("Indicator calculation failed: {detail}"),
            None => "Indicator calculation failed".to_string(),
        };
        self.fail_job(&job, &message).await
    }

    async fn check_data(
        &self,
        client: &Client,
        job: &BacktestJobDetails,
        resolved: &ResolvedIndicators,
    ) -> Result<CheckOutcome, ConsumerError> {
        let lookback_start = self
            .market_data
            .lookback_start(client, &job.ticker, job.timeframe, job.start_date, resolved.max_lookback)
            .await
            .map_err(ConsumerError::retryable)?;

        let snapshot = self
            .market_data
            .availability_snapshot(
                client,
                &job.ticker,
                job.timeframe,
                job.start_date,
                job.end_date,
                lookback_start,
                resolved.max_lookback,
                &resolved.keys(),
            )
            .await
            .map_err(ConsumerError::retryable)?;

        match assess(
            &snapshot,
            resolved,
            &job.ticker,
            job.timeframe.as_str(),
            job.start_date,
            job.end_date,
        ) {
            AvailabilityReport::Runnable => Ok(CheckOutcome::Proceed),
            AvailabilityReport::Insufficient { user_message } => {
                Ok(CheckOutcome::Failed(user_message))
            }
            AvailabilityReport::MissingIndicators(missing) => {
                self.request_calculation(job, &missing, lookback_start).await?;
                Ok(CheckOutcome::Requested)
            }
        }
    }

    /// REQUEST_INDICATORS: publish the fill request keyed by job id and
    /// leave the job RUNNING; the response event drives the next pass.
    async fn request_calculation(
        &self,
        job: &BacktestJobDetails,
        missing: &[IndicatorDef],
        lookback_start: Option<DateTime<Utc>>,
    ) -> Result<(), ConsumerError> {
        let request = IndicatorCalculationRequest {
            job_id: job.id,
            ticker: job.ticker.clone(),
            timeframe: job.timeframe,
            start_date: lookback_start.unwrap_or(job.start_date),
            end_date: job.end_date,
            indicators: missing.iter().map(IndicatorSpec::from_def).collect(),
        };

        self.requests
            .publish_request(&request, &job.id.to_string())
            .await
            .map_err(ConsumerError::retryable)?;

        info!(
            "Job {}: requested calculation of {} indicator series",
            job.id,
            missing.len()
        );
        Ok(())
    }

    async fn simulate(
        &self,
        client: &Client,
        job: &BacktestJobDetails,
        resolved: &ResolvedIndicators,
        config: BacktestConfig,
        ticker: TickerInfo,
    ) -> Result<SimulationOutcome, ConsumerError> {
        let lookback_start = self
            .market_data
            .lookback_start(client, &job.ticker, job.timeframe, job.start_date, resolved.max_lookback)
            .await
            .map_err(ConsumerError::retryable)?
            .unwrap_or(job.start_date);

        let frame = self
            .market_data
            .fetch_frame(
                client,
                &job.ticker,
                job.timeframe,
                lookback_start,
                job.end_date,
                &resolved.keys(),
            )
            .await
            .map_err(ConsumerError::retryable)?;

        // The candle loop is CPU-bound and may run for minutes; it must not
        // hold the cooperative scheduler.
        let definition = job.strategy_definition.clone();
        let start = job.start_date;
        let end = job.end_date;
        let timeout = self.simulation_timeout;
        let result = tokio::task::spawn_blocking(move || {
            Simulator::new(config, ticker)
                .with_timeout(timeout)
                .run(&frame, &definition, start, end)
        })
        .await
        .map_err(|join_err| ConsumerError::fatal(format!("Simulation task panicked: {join_err}")))?;

        match result {
            Ok(outcome) => Ok(outcome),
            Err(err @ SimulationError::Timeout { .. }) => {
                Err(ConsumerError::Retryable(err.to_string()))
            }
            Err(SimulationError::InvalidInput(detail)) => {
                self.fail_job(job, &format!("Simulation rejected input: {detail}"))
                    .await?;
                Err(ConsumerError::Fatal(detail))
            }
        }
    }

    async fn fail_job(
        &self,
        job: &BacktestJobDetails,
        message: &str,
    ) -> Result<(), ConsumerError> {
        error!("Job {} failed: {}", job.id, message);
        let transitioned = self
            .jobs
            .update_status(job.id, JobStatus::Failed, Some(message))
            .await
            .map_err(ConsumerError::retryable)?;
        if transitioned {
            self.notify_batch(job, ChildOutcome::Failed).await?;
        }
        Ok(())
    }

    /// Failure that never became runnable; it does not consume quota.
    async fn fail_job_not_counted(
        &self,
        job: &BacktestJobDetails,
        message: &str,
    ) -> Result<(), ConsumerError> {
        error!("Job {} failed pre-flight: {}", job.id, message);
        let transitioned = self
            .jobs
            .mark_failed_not_counted(job.id, message)
            .await
            .map_err(ConsumerError::retryable)?;
        if transitioned {
            self.notify_batch(job, ChildOutcome::Failed).await?;
        }
        Ok(())
    }

    async fn notify_batch(
        &self,
        job: &BacktestJobDetails,
        outcome: ChildOutcome,
    ) -> Result<(), ConsumerError> {
        let Some(batch_id) = job.batch_id else {
            return Ok(());
        };
        self.batches
            .record_outcome(batch_id, outcome)
            .await
            .map_err(ConsumerError::retryable)?;
        Ok(())
    }
}

enum CheckOutcome {
    Proceed,
    Requested,
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::{Candle, Timeframe};
    use crate::domain::strategy::ast::{ConditionNode, StrategyDefinition, ValueNode};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    const EMA_KEY: &str = "ema_timeperiod_12_value";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 7, 0, 0).unwrap()
    }

    fn strategy() -> StrategyDefinition {
        StrategyDefinition {
            entry_buy_conditions: Some(ConditionNode::GreaterThan {
                left: ValueNode::Indicator {
                    key: EMA_KEY.to_string(),
                },
                right: ValueNode::Value { value: 0.0 },
            }),
            ..Default::default()
        }
    }

    fn job_details(job_id: Uuid, batch_id: Uuid) -> BacktestJobDetails {
        BacktestJobDetails {
            id: job_id,
            user_id: Uuid::new_v4(),
            strategy_id: Uuid::new_v4(),
            ticker: "SBER".to_string(),
            timeframe: Timeframe::OneHour,
            start_date: t0(),
            end_date: t0() + ChronoDuration::hours(9),
            status: JobStatus::Pending,
            strategy_definition: strategy(),
            simulation_params: json!({}),
            batch_id: Some(batch_id),
            counts_towards_limit: true,
            error_message: None,
        }
    }

    fn test_ticker() -> Ticker {
        Ticker {
            symbol: "SBER".to_string(),
            market_id: Uuid::new_v4(),
            lot_size: 10,
            min_step: 0.01,
            decimals: 2,
            currency: "SUR".to_string(),
            is_active: true,
            list_level: 1,
        }
    }

    fn frame_with_ema() -> CandleFrame {
        let candles: Vec<Candle> = (0..10)
            .map(|i| Candle {
                ticker: "SBER".to_string(),
                timeframe: Timeframe::OneHour,
                begin: t0() + ChronoDuration::hours(i),
                open: 100.0,
                high: 100.5,
                low: 99.5,
                close: 100.0,
                volume: 1000.0,
                value: None,
            })
            .collect();
        let mut frame = CandleFrame::from_candles(&candles);
        frame.set_column(EMA_KEY, vec![50.0; 10]);
        frame
    }

    fn snapshot(coverage: BTreeMap<String, u64>) -> AvailabilitySnapshot {
        AvailabilitySnapshot {
            period_first_candle: Some(t0()),
            period_last_candle: Some(t0() + ChronoDuration::hours(9)),
            lookback_candles_count: 24,
            window_candle_count: 10,
            first_available: Some(t0() - ChronoDuration::days(30)),
            indicator_coverage: coverage,
        }
    }

    /// Job rows in memory with the store's sticky-terminal semantics. With
    /// `stale_reads` set, reads keep serving the submission-time snapshot,
    /// imitating a redelivered event racing the first pass.
    struct MockJobs {
        details: BacktestJobDetails,
        stale_reads: bool,
        status: Mutex<JobStatus>,
        counts_towards_limit: Mutex<bool>,
        error_message: Mutex<Option<String>>,
        results_saved: Mutex<u32>,
    }

    impl MockJobs {
        fn new(details: BacktestJobDetails, stale_reads: bool) -> MockJobs {
            let status = details.status;
            MockJobs {
                details,
                stale_reads,
                status: Mutex::new(status),
                counts_towards_limit: Mutex::new(true),
                error_message: Mutex::new(None),
                results_saved: Mutex::new(0),
            }
        }

        fn status(&self) -> JobStatus {
            *self.status.lock().unwrap()
        }
    }

    #[async_trait]
    impl JobRepository for MockJobs {
        async fn fetch_job(&self, _job_id: Uuid) -> Result<Option<BacktestJobDetails>> {
            let mut details = self.details.clone();
            if !self.stale_reads {
                details.status = self.status();
            }
            Ok(Some(details))
        }

        async fn update_status(
            &self,
            _job_id: Uuid,
            status: JobStatus,
            error_message: Option<&str>,
        ) -> Result<bool> {
            let mut current = self.status.lock().unwrap();
            if current.is_terminal() {
                return Ok(false);
            }
            *current = status;
            if let Some(message) = error_message {
                *self.error_message.lock().unwrap() = Some(message.to_string());
            }
            Ok(true)
        }

        async fn mark_failed_not_counted(
            &self,
            _job_id: Uuid,
            error_message: &str,
        ) -> Result<bool> {
            let mut current = self.status.lock().unwrap();
            if current.is_terminal() {
                return Ok(false);
            }
            *current = JobStatus::Failed;
            *self.counts_towards_limit.lock().unwrap() = false;
            *self.error_message.lock().unwrap() = Some(error_message.to_string());
            Ok(true)
        }

        async fn save_result(
            &self,
            _job_id: Uuid,
            _metrics: &BacktestMetrics,
            _trades: &[TradeRecord],
        ) -> Result<bool> {
            let mut current = self.status.lock().unwrap();
            if current.is_terminal() {
                return Ok(false);
            }
            *current = JobStatus::Completed;
            *self.results_saved.lock().unwrap() += 1;
            Ok(true)
        }
    }

    #[derive(Default)]
    struct MockBatches {
        outcomes: Mutex<Vec<(Uuid, ChildOutcome)>>,
    }

    #[async_trait]
    impl BatchLedger for MockBatches {
        async fn record_outcome(&self, batch_id: Uuid, outcome: ChildOutcome) -> Result<()> {
            self.outcomes.lock().unwrap().push((batch_id, outcome));
            Ok(())
        }
    }

    struct MockTickers;

    #[async_trait]
    impl TickerDirectory for MockTickers {
        async fn get_ticker(&self, _symbol: &str) -> Result<Option<Ticker>> {
            Ok(Some(test_ticker()))
        }
    }

    struct MockMarketData {
        snapshot: AvailabilitySnapshot,
        frame: CandleFrame,
    }

    #[async_trait]
    impl MarketDataReader for MockMarketData {
        async fn lookback_start(
            &self,
            _client: &Client,
            _ticker: &str,
            _timeframe: Timeframe,
            start: DateTime<Utc>,
            _lookback: usize,
        ) -> Result<Option<DateTime<Utc>>> {
            Ok(Some(start))
        }

        async fn availability_snapshot(
            &self,
            _client: &Client,
            _ticker: &str,
            _timeframe: Timeframe,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
            _lookback_start: Option<DateTime<Utc>>,
            _max_lookback: usize,
            _indicator_keys: &[String],
        ) -> Result<AvailabilitySnapshot> {
            Ok(self.snapshot.clone())
        }

        async fn fetch_frame(
            &self,
            _client: &Client,
            _ticker: &str,
            _timeframe: Timeframe,
            _from: DateTime<Utc>,
            _to: DateTime<Utc>,
            _indicator_keys: &[String],
        ) -> Result<CandleFrame> {
            Ok(self.frame.clone())
        }
    }

    #[derive(Default)]
    struct MockRequests {
        sent: Mutex<Vec<IndicatorCalculationRequest>>,
    }

    #[async_trait]
    impl CalculationRequestSink for MockRequests {
        async fn publish_request(
            &self,
            request: &IndicatorCalculationRequest,
            _correlation_id: &str,
        ) -> Result<()> {
            self.sent.lock().unwrap().push(request.clone());
            Ok(())
        }
    }

    struct Harness {
        orchestrator: BacktestOrchestrator,
        jobs: Arc<MockJobs>,
        batches: Arc<MockBatches>,
        requests: Arc<MockRequests>,
        client: Client,
        job_id: Uuid,
        batch_id: Uuid,
    }

    fn harness(coverage: BTreeMap<String, u64>, stale_reads: bool) -> Harness {
        let job_id = Uuid::new_v4();
        let batch_id = Uuid::new_v4();
        let jobs = Arc::new(MockJobs::new(job_details(job_id, batch_id), stale_reads));
        let batches = Arc::new(MockBatches::default());
        let requests = Arc::new(MockRequests::default());
        let market_data = Arc::new(MockMarketData {
            snapshot: snapshot(coverage),
            frame: frame_with_ema(),
        });

        let orchestrator = BacktestOrchestrator::new(
            jobs.clone(),
            batches.clone(),
            Arc::new(MockTickers),
            market_data,
            requests.clone(),
            Duration::from_secs(300),
        );

        Harness {
            orchestrator,
            jobs,
            batches,
            requests,
            // Never connected; the mocks ignore it.
            client: Client::default(),
            job_id,
            batch_id,
        }
    }

    /// S5: the first pass finds the indicator series missing, publishes a
    /// calculation request and leaves the job RUNNING; the response-driven
    /// pass skips the check and completes normally.
    #[tokio::test]
    async fn test_round_trip_re_entrance() {
        let h = harness(BTreeMap::new(), false);

        h.orchestrator
            .process(&h.client, h.job_id, "corr", false)
            .await
            .unwrap();

        let sent = h.requests.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].job_id, h.job_id);
        assert_eq!(sent[0].indicators.len(), 1);
        assert_eq!(sent[0].indicators[0].indicator_key, EMA_KEY);
        assert_eq!(h.jobs.status(), JobStatus::Running);
        assert_eq!(*h.jobs.results_saved.lock().unwrap(), 0);
        assert!(h.batches.outcomes.lock().unwrap().is_empty());

        h.orchestrator
            .process(&h.client, h.job_id, "corr", true)
            .await
            .unwrap();

        assert_eq!(h.jobs.status(), JobStatus::Completed);
        assert_eq!(*h.jobs.results_saved.lock().unwrap(), 1);
        // No second calculation request on the re-entry pass.
        assert_eq!(h.requests.sent.lock().unwrap().len(), 1);
        let outcomes = h.batches.outcomes.lock().unwrap().clone();
        assert_eq!(outcomes, vec![(h.batch_id, ChildOutcome::Completed)]);
    }

    /// A redelivered request racing the first pass sees a stale PENDING row,
    /// runs through simulation again, but must not move the batch counters:
    /// the store reports no transition and the notify step is skipped.
    #[tokio::test]
    async fn test_redelivered_completion_counts_batch_once() {
        let coverage = BTreeMap::from([(EMA_KEY.to_string(), 10u64)]);
        let h = harness(coverage, true);

        h.orchestrator
            .process(&h.client, h.job_id, "corr", false)
            .await
            .unwrap();
        h.orchestrator
            .process(&h.client, h.job_id, "corr", false)
            .await
            .unwrap();

        assert_eq!(*h.jobs.results_saved.lock().unwrap(), 1);
        assert_eq!(h.batches.outcomes.lock().unwrap().len(), 1);
    }

    /// A redelivery that reads the terminal row is ignored at LOAD.
    #[tokio::test]
    async fn test_terminal_job_is_ignored() {
        let coverage = BTreeMap::from([(EMA_KEY.to_string(), 10u64)]);
        let h = harness(coverage, false);

        h.orchestrator
            .process(&h.client, h.job_id, "corr", false)
            .await
            .unwrap();
        assert_eq!(h.jobs.status(), JobStatus::Completed);

        h.orchestrator
            .process(&h.client, h.job_id, "corr", false)
            .await
            .unwrap();

        assert_eq!(*h.jobs.results_saved.lock().unwrap(), 1);
        assert_eq!(h.batches.outcomes.lock().unwrap().len(), 1);
    }

    /// Insufficient warm-up fails the job pre-flight with the user-facing
    /// message, does not count it towards the quota, and records exactly
    /// one failed child on the batch.
    #[tokio::test]
    async fn test_insufficient_lookback_fails_without_quota() {
        let coverage = BTreeMap::from([(EMA_KEY.to_string(), 10u64)]);
        let mut short = snapshot(coverage);
        short.lookback_candles_count = 1;

        let job_id = Uuid::new_v4();
        let batch_id = Uuid::new_v4();
        let jobs = Arc::new(MockJobs::new(job_details(job_id, batch_id), false));
        let batches = Arc::new(MockBatches::default());
        let orchestrator = BacktestOrchestrator::new(
            jobs.clone(),
            batches.clone(),
            Arc::new(MockTickers),
            Arc::new(MockMarketData {
                snapshot: short,
                frame: frame_with_ema(),
            }),
            Arc::new(MockRequests::default()),
            Duration::from_secs(300),
        );

        orchestrator
            .process(&Client::default(), job_id, "corr", false)
            .await
            .unwrap();

        assert_eq!(jobs.status(), JobStatus::Failed);
        assert!(!*jobs.counts_towards_limit.lock().unwrap());
        let message = jobs.error_message.lock().unwrap().clone().unwrap();
        // ema_12 needs 24 warm-up candles; only 1 is on record.
        assert!(message.contains("required 24"));
        assert!(message.contains("available 1"));
        assert_eq!(
            batches.outcomes.lock().unwrap().clone(),
            vec![(batch_id, ChildOutcome::Failed)]
        );
    }
}
