//! MOEX collector worker: a cron-invoked scheduler that enqueues collection
//! tasks, and a consumer that pages candles from the exchange.

use anyhow::Result;
use async_trait::async_trait;
use clap::{ArgAction, Parser, Subcommand};
use futures::FutureExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tradeforge::application::collector::scheduler::COLLECT_CANDLES_TASK;
use tradeforge::application::collector::{CandlesCollectorService, CollectionScheduler};
use tradeforge::config::Config;
use tradeforge::domain::errors::ConsumerError;
use tradeforge::domain::market::Timeframe;
use tradeforge::infrastructure::analytics::{AnalyticsPool, CandleStore};
use tradeforge::infrastructure::cache::{self, CheckpointStore};
use tradeforge::infrastructure::health::{self, ReadyProbe};
use tradeforge::infrastructure::kafka::messages::CollectionTaskMessage;
use tradeforge::infrastructure::kafka::{
    ConsumedMessage, EventProducer, KafkaConsumerRuntime, MessageHandler,
};
use tradeforge::infrastructure::moex::MoexClient;
use tradeforge::infrastructure::persistence::{self, TickerStore};
use tradeforge::infrastructure::shutdown;

#[derive(Parser)]
#[command(name = "moex-collector", about = "Market data collector")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enqueue collection tasks for every active ticker. Run from cron.
    Schedule {
        /// Timeframes to collect, e.g. -t 1h -t 1d.
        #[arg(short, long = "timeframe", required = true)]
        timeframes: Vec<Timeframe>,
        /// Refresh the ticker universe from the exchange first.
        #[arg(long, action = ArgAction::Set, default_value_t = true)]
        sync_tickers: bool,
        /// Rebuild cache checkpoints from the analytical store first.
        #[arg(long, action = ArgAction::Set, default_value_t = false)]
        sync_state: bool,
    },
    /// Consume collection tasks and page candles from the exchange.
    Consume,
}

struct CollectionTaskHandler {
    service: Arc<CandlesCollectorService>,
    producer: EventProducer,
    tasks_topic: String,
}

#[async_trait]
impl MessageHandler<CollectionTaskMessage> for CollectionTaskHandler {
    async fn handle(
        &self,
        message: ConsumedMessage<CollectionTaskMessage>,
    ) -> Result<(), ConsumerError> {
        let task = &message.value;

        match task.task_type.as_str() {
            COLLECT_CANDLES_TASK => {
                let fetched = self
                    .service
                    .collect_candles(&task.ticker, task.params.timeframe, &message.correlation_id)
                    .await?;

                // More data upstream: republish the task verbatim (same key,
                // same correlation id) and let the next delivery continue.
                if fetched > 0 {
                    info!(
                        "Republishing {} for {} ({} candles this page)",
                        task.task_type, task.ticker, fetched
                    );
                    self.producer
                        .send_json(
                            &self.tasks_topic,
                            &task.partition_key(),
                            task,
                            &message.correlation_id,
                        )
                        .await
                        .map_err(ConsumerError::retryable)?;
                }
                Ok(())
            }
            other => Err(ConsumerError::fatal(format!("Unknown task_type '{other}'"))),
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
        Command::Schedule {
            timeframes,
            sync_tickers,
            sync_state,
        } => schedule(config, timeframes, sync_tickers, sync_state).await,
        Command::Consume => consume(config).await,
    }
}

async fn schedule(
    config: Config,
    timeframes: Vec<Timeframe>,
    sync_tickers: bool,
    sync_state: bool,
) -> Result<()> {
    info!(
        "Scheduling collection for {:?} (sync_tickers={}, sync_state={})",
        timeframes, sync_tickers, sync_state
    );

    let pg = persistence::connect(&config.postgres.url(), config.postgres.max_connections).await?;
    let redis = cache::connect(&config.redis.url()).await?;
    let analytics = AnalyticsPool::new(&config.clickhouse.analytics(), 2);
    let candles = CandleStore::new(config.max_partitions_per_insert);
    let producer = EventProducer::new(&config.kafka.producer)?;
    let moex = Arc::new(MoexClient::new(&config.moex.client_config())?);
    let tickers = Arc::new(TickerStore::new(pg, Duration::from_secs(3600)));
    let checkpoints = CheckpointStore::new(redis, candles, analytics);

    let scheduler = CollectionScheduler::new(
        moex,
        tickers,
        checkpoints,
        producer,
        config.kafka.topics.collector_tasks.clone(),
        config.collector.market_code.clone(),
    );

    let sent = scheduler
        .schedule_collection(&timeframes, sync_tickers, sync_state)
        .await?;
    println!("Tasks sent: {sent}");
    Ok(())
}

async fn consume(config: Config) -> Result<()> {
    info!("Starting collection consumer");

    let redis = cache::connect(&config.redis.url()).await?;
    let analytics = AnalyticsPool::new(
        &config.clickhouse.analytics(),
        config.kafka.collector.max_concurrent,
    );
    let candles = CandleStore::new(config.max_partitions_per_insert);
    let producer = EventProducer::new(&config.kafka.producer)?;
    let moex = Arc::new(MoexClient::new(&config.moex.client_config())?);
    let checkpoints = CheckpointStore::new(redis.clone(), candles.clone(), analytics.clone());

    let service = Arc::new(CandlesCollectorService::new(
        moex,
        checkpoints,
        analytics.clone(),
        candles,
        config.collector.publish_to_kafka.then(|| producer.clone()),
        config.kafka.topics.raw_candles.clone(),
        &config.collector.default_collection_start,
    ));

    let handler = CollectionTaskHandler {
        service,
        producer: producer.clone(),
        tasks_topic: config.kafka.topics.collector_tasks.clone(),
    };
    let consumer_config = config.kafka.collector.consumer_config(
        &config.kafka.bootstrap_servers,
        &config.kafka.topics.collector_tasks,
    );
    let runtime: KafkaConsumerRuntime<CollectionTaskMessage, _> =
        KafkaConsumerRuntime::new(consumer_config, producer, handler)?;

    spawn_health(&config, probe(analytics, redis));
    let shutdown = shutdown::shutdown_watch();
    runtime.run(shutdown).await?;

    info!("Collection consumer stopped");
    Ok(())
}

fn probe(analytics: AnalyticsPool, redis: redis::aio::ConnectionManager) -> ReadyProbe {
    Arc::new(move || {
        let analytics = analytics.clone();
        let mut redis = redis.clone();
        async move {
            let ch_ok = {
                let client = analytics.acquire().await;
                client.query("SELECT 1").fetch_one::<u8>().await.is_ok()
            };
            let redis_ok = redis::cmd("PING")
                .query_async::<String>(&mut redis)
                .await
                .is_ok();
            ch_ok && redis_ok
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
