//! Data processor worker: the real-time indicator pipeline and the batch
//! indicator writer serving backtest calculation requests.

use anyhow::Result;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use futures::FutureExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tradeforge::application::batch_calc::BatchIndicatorWriter;
use tradeforge::application::indicators::IndicatorPipeline;
use tradeforge::application::rt_pipeline::RtIndicatorProcessor;
use tradeforge::config::Config;
use tradeforge::domain::errors::ConsumerError;
use tradeforge::infrastructure::analytics::{AnalyticsPool, CandleStore, IndicatorStore};
use tradeforge::infrastructure::cache::{self, ContextCache, DistributedLock};
use tradeforge::infrastructure::cache::context::DEFAULT_CONTEXT_SIZE;
use tradeforge::infrastructure::health::{self, ReadyProbe};
use tradeforge::infrastructure::kafka::messages::{
    BacktestRequestMessage, CalculationStatus, IndicatorCalculationRequest, RawCandleMessage,
};
use tradeforge::infrastructure::kafka::{
    ConsumedMessage, EventProducer, KafkaConsumerRuntime, MessageHandler,
};
use tradeforge::infrastructure::persistence::{self, SystemIndicatorStore};
use tradeforge::infrastructure::shutdown;

#[derive(Parser)]
#[command(name = "data-processor", about = "Indicator computation worker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Consume raw candles and compute hot indicators online.
    ConsumeRt,
    /// Consume batch calculation requests from the backtest round trip.
    ConsumeBatch,
}

struct RtCandleHandler {
    processor: Arc<RtIndicatorProcessor>,
}

#[async_trait]
impl MessageHandler<RawCandleMessage> for RtCandleHandler {
    async fn handle(&self, message: ConsumedMessage<RawCandleMessage>) -> Result<(), ConsumerError> {
        self.processor
            .process_candle(message.value, &message.correlation_id)
            .await
    }
}

struct BatchCalculationHandler {
    writer: Arc<BatchIndicatorWriter>,
    producer: EventProducer,
    backtests_topic: String,
}

impl BatchCalculationHandler {
    async fn notify(
        &self,
        job_id: uuid::Uuid,
        status: CalculationStatus,
        error: Option<String>,
        correlation_id: &str,
    ) -> Result<(), ConsumerError> {
        let response = BacktestRequestMessage {
            job_id,
            status: Some(status),
            error,
        };
        self.producer
            .send_json(
                &self.backtests_topic,
                &job_id.to_string(),
                &response,
                correlation_id,
            )
            .await
            .map_err(ConsumerError::retryable)
    }
}

#[async_trait]
impl MessageHandler<IndicatorCalculationRequest> for BatchCalculationHandler {
    async fn handle(
        &self,
        message: ConsumedMessage<IndicatorCalculationRequest>,
    ) -> Result<(), ConsumerError> {
        let request = &message.value;
        info!(
            "Calculation request for job {}: {} indicators over {} {}",
            request.job_id,
            request.indicators.len(),
            request.ticker,
            request.timeframe
        );

        match self.writer.process_request(request).await {
            Ok(()) => {
                self.notify(
                    request.job_id,
                    CalculationStatus::Success,
                    None,
                    &message.correlation_id,
                )
                .await?;
                info!("Calculation for job {} finished", request.job_id);
                Ok(())
            }
            Err(err) if err.is_retryable() => Err(err),
            Err(err) => {
                // Non-retryable: tell the trading engine so the job fails
                // instead of hanging in RUNNING forever.
                self.notify(
                    request.job_id,
                    CalculationStatus::Failure,
                    Some(err.to_string()),
                    &message.correlation_id,
                )
                .await?;
                Err(err)
            }
        }
    }

    async fn on_exhausted(
        &self,
        message: &ConsumedMessage<IndicatorCalculationRequest>,
        error: &ConsumerError,
    ) {
        if let Err(notify_err) = self
            .notify(
                message.value.job_id,
                CalculationStatus::Failure,
                Some(error.to_string()),
                &message.correlation_id,
            )
            .await
        {
            error!(
                "Could not report calculation failure for job {}: {notify_err}",
                message.value.job_id
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.tracing_filter())),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::ConsumeRt => consume_rt(config).await,
        Command::ConsumeBatch => consume_batch(config).await,
    }
}

async fn consume_rt(config: Config) -> Result<()> {
    info!("Starting RT indicator consumer");

    let pg = persistence::connect(&config.postgres.url(), config.postgres.max_connections).await?;
    let redis = cache::connect(&config.redis.url()).await?;
    let analytics = AnalyticsPool::new(
        &config.clickhouse.analytics(),
        config.kafka.rt.max_concurrent,
    );
    let candles = CandleStore::new(config.max_partitions_per_insert);
    let indicators = IndicatorStore::new(config.max_partitions_per_insert);
    let producer = EventProducer::new(&config.kafka.producer)?;

    let hot_defs = SystemIndicatorStore::new(pg.clone()).hot_indicator_defs().await?;
    let pipeline = IndicatorPipeline::new(hot_defs)?;
    info!("RT pipeline computes {} series", pipeline.defs().len());

    let processor = Arc::new(RtIndicatorProcessor::new(
        pipeline,
        ContextCache::new(redis.clone(), DEFAULT_CONTEXT_SIZE),
        analytics.clone(),
        candles,
        indicators,
        producer.clone(),
        config.kafka.topics.processed_candles_rt.clone(),
        DEFAULT_CONTEXT_SIZE,
    ));

    let consumer_config = config.kafka.rt.consumer_config(
        &config.kafka.bootstrap_servers,
        &config.kafka.topics.raw_candles,
    );
    let runtime: KafkaConsumerRuntime<RawCandleMessage, _> =
        KafkaConsumerRuntime::new(consumer_config, producer, RtCandleHandler { processor })?;

    spawn_health(&config, analytics_probe(analytics));
    let shutdown = shutdown::shutdown_watch();
    runtime.run(shutdown).await?;

    info!("RT indicator consumer stopped");
    Ok(())
}

async fn consume_batch(config: Config) -> Result<()> {
    info!("Starting batch indicator consumer");

    let redis = cache::connect(&config.redis.url()).await?;
    let analytics = AnalyticsPool::new(
        &config.clickhouse.analytics(),
        config.kafka.batch.max_concurrent,
    );
    let candles = CandleStore::new(config.max_partitions_per_insert);
    let indicators = IndicatorStore::new(config.max_partitions_per_insert);
    let producer = EventProducer::new(&config.kafka.producer)?;

    let writer = Arc::new(BatchIndicatorWriter::new(
        analytics.clone(),
        candles,
        indicators,
        DistributedLock::new(redis),
    ));

    let handler = BatchCalculationHandler {
        writer,
        producer: producer.clone(),
        backtests_topic: config.kafka.topics.backtest_requests.clone(),
    };
    let consumer_config = config.kafka.batch.consumer_config(
        &config.kafka.bootstrap_servers,
        &config.kafka.topics.calculation_requests,
    );
    let runtime: KafkaConsumerRuntime<IndicatorCalculationRequest, _> =
        KafkaConsumerRuntime::new(consumer_config, producer, handler)?;

    spawn_health(&config, analytics_probe(analytics));
    let shutdown = shutdown::shutdown_watch();
    runtime.run(shutdown).await?;

    info!("Batch indicator consumer stopped");
    Ok(())
}

fn analytics_probe(analytics: AnalyticsPool) -> ReadyProbe {
    Arc::new(move || {
        let analytics = analytics.clone();
        async move {
            let client = analytics.acquire().await;
            client.query("SELECT 1").fetch_one::<u8>().await.is_ok()
        }
        .boxed()
    })
}

fn spawn_health(config: &Config, probe: ReadyProbe) {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.health_port));
    tokio::spawn(async move {
        if let Err(err) = health::serve(addr, probe).await {
            tracing::error!("Health listener failed: {err}");
        }
    });
}
