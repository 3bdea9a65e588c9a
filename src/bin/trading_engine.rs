//! Trading engine worker: consumes backtest requests and drives jobs
//! through the orchestrator.

use anyhow::Result;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use futures::FutureExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tradeforge::application::orchestrator::{BacktestOrchestrator, CalculationRequestPublisher};
use tradeforge::config::Config;
use tradeforge::domain::backtest::config::SIMULATION_TIMEOUT_SECS;
use tradeforge::domain::errors::ConsumerError;
use tradeforge::infrastructure::analytics::{AnalyticsPool, CandleStore};
use tradeforge::infrastructure::health::{self, ReadyProbe};
use tradeforge::infrastructure::kafka::messages::{BacktestRequestMessage, CalculationStatus};
use tradeforge::infrastructure::kafka::{
    ConsumedMessage, EventProducer, KafkaConsumerRuntime, MessageHandler,
};
use tradeforge::infrastructure::persistence::{
    self, BacktestJobStore, BatchStore, TickerStore,
};
use tradeforge::infrastructure::shutdown;

#[derive(Parser)]
#[command(name = "trading-engine", about = "Trading engine worker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Consume backtest requests and execute jobs.
    ConsumeBacktest,
}

struct BacktestRequestHandler {
    orchestrator: Arc<BacktestOrchestrator>,
    analytics: AnalyticsPool,
}

#[async_trait]
impl MessageHandler<BacktestRequestMessage> for BacktestRequestHandler {
    async fn handle(
        &self,
        message: ConsumedMessage<BacktestRequestMessage>,
    ) -> Result<(), ConsumerError> {
        let job_id = message.value.job_id;
        info!(
            "Backtest request for job {} (status {:?}, correlation {})",
            job_id, message.value.status, message.correlation_id
        );

        let skip_indicator_check = match message.value.status {
            None => false,
            // The round trip came back: indicators are materialized, go
            // straight to simulation on this pass.
            Some(CalculationStatus::Success) => true,
            Some(CalculationStatus::Failure) => {
                return self
                    .orchestrator
                    .fail_after_calculation(job_id, message.value.error.as_deref())
                    .await;
            }
        };

        let client = self.analytics.acquire().await;
        self.orchestrator
            .process(&client, job_id, &message.correlation_id, skip_indicator_check)
            .await
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
        Command::ConsumeBacktest => consume_backtest(config).await,
    }
}

async fn consume_backtest(config: Config) -> Result<()> {
    info!("Starting backtest worker");

    let pg = persistence::connect(
        &config.postgres.url(),
        config.postgres.max_connections,
    )
    .await?;
    let analytics = AnalyticsPool::new(
        &config.clickhouse.analytics(),
        config.kafka.backtest.max_concurrent,
    );
    let candles = CandleStore::new(config.max_partitions_per_insert);
    let producer = EventProducer::new(&config.kafka.producer)?;

    let jobs = BacktestJobStore::new(pg.clone());
    let batches = BatchStore::new(pg.clone());
    let tickers = Arc::new(TickerStore::new(pg.clone(), Duration::from_secs(3600)));
    let requests = CalculationRequestPublisher::new(
        producer.clone(),
        config.kafka.topics.calculation_requests.clone(),
    );

    let orchestrator = Arc::new(BacktestOrchestrator::new(
        Arc::new(jobs),
        Arc::new(batches),
        tickers,
        Arc::new(candles),
        Arc::new(requests),
        Duration::from_secs(SIMULATION_TIMEOUT_SECS),
    ));

    let handler = BacktestRequestHandler {
        orchestrator,
        analytics: analytics.clone(),
    };
    let consumer_config = config.kafka.backtest.consumer_config(
        &config.kafka.bootstrap_servers,
        &config.kafka.topics.backtest_requests,
    );
    let runtime: KafkaConsumerRuntime<BacktestRequestMessage, _> =
        KafkaConsumerRuntime::new(consumer_config, producer, handler)?;

    spawn_health(&config, readiness_probe(pg, analytics));

    let shutdown = shutdown::shutdown_watch();
    runtime.run(shutdown).await?;

    info!("Backtest worker stopped");
    Ok(())
}

fn readiness_probe(pg: sqlx::PgPool, analytics: AnalyticsPool) -> ReadyProbe {
    Arc::new(move || {
        let pg = pg.clone();
        let analytics = analytics.clone();
        async move {
            let pg_ok = sqlx::query("SELECT 1").execute(&pg).await.is_ok();
            let client = analytics.acquire().await;
            let ch_ok = client.query("SELECT 1").fetch_one::<u8>().await.is_ok();
            pg_ok && ch_ok
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
