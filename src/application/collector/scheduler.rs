//! Collection scheduler.
//!
//! Invoked from cron: optionally syncs the ticker universe and the cache
//! checkpoints, then enqueues one `collect_candles` task per active
//! `(ticker, timeframe)` pair. The tasks topic is keyed by
//! `ticker:task_type`, preserving per-ticker ordering across pages.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::domain::market::Timeframe;
use crate::infrastructure::cache::CheckpointStore;
use crate::infrastructure::kafka::EventProducer;
use crate::infrastructure::kafka::messages::{CollectionTaskMessage, CollectionTaskParams};
use crate::infrastructure::moex::MoexClient;
use crate::infrastructure::persistence::TickerStore;

pub const COLLECT_CANDLES_TASK: &str = "collect_candles";

pub struct CollectionScheduler {
    moex: Arc<MoexClient>,
    tickers: Arc<TickerStore>,
    checkpoints: CheckpointStore,
    producer: EventProducer,
    tasks_topic: String,
    market_code: String,
}

impl CollectionScheduler {
    pub fn new(
        moex: Arc<MoexClient>,
        tickers: Arc<TickerStore>,
        checkpoints: CheckpointStore,
        producer: EventProducer,
        tasks_topic: String,
        market_code: String,
    ) -> CollectionScheduler {
        CollectionScheduler {
            moex,
            tickers,
            checkpoints,
            producer,
            tasks_topic,
            market_code,
        }
    }

    /// One scheduling round. Returns the number of tasks enqueued.
    pub async fn schedule_collection(
        &self,
        timeframes: &[Timeframe],
        sync_tickers: bool,
        sync_state: bool,
    ) -> Result<usize> {
        if sync_tickers {
            self.sync_tickers().await?;
        }
        if sync_state {
            let updated = self.checkpoints.sync_from_analytics().await?;
            info!("Checkpoint state sync updated {} keys", updated);
        }

        let tickers = self.tickers.list_active(&self.market_code).await?;
        let mut sent = 0usize;
        for ticker in &tickers {
            for timeframe in timeframes {
                let task = CollectionTaskMessage {
                    task_type: COLLECT_CANDLES_TASK.to_string(),
                    ticker: ticker.symbol.clone(),
                    params: CollectionTaskParams {
                        timeframe: *timeframe,
                    },
                };
                self.producer
                    .send_json(
                        &self.tasks_topic,
                        &task.partition_key(),
                        &task,
                        &Uuid::new_v4().to_string(),
                    )
                    .await?;
                sent += 1;
            }
        }

        info!(
            "Scheduled {} collection tasks over {} tickers and {} timeframes",
            sent,
            tickers.len(),
            timeframes.len()
        );
        Ok(sent)
    }

    /// Refreshes the ticker universe from the exchange securities list.
    async fn sync_tickers(&self) -> Result<()> {
        // The exchange payload carries no market id; reuse any known row's.
        let existing = self.tickers.list_active(&self.market_code).await?;
        let market_id = existing
            .first()
            .map(|t| t.market_id)
            .unwrap_or_else(Uuid::new_v4);

        let fetched = self.moex.get_securities(market_id).await?;
        if fetched.is_empty() {
            info!("Securities sync returned nothing; keeping current universe");
            return Ok(());
        }
        self.tickers.upsert_tickers(&self.market_code, &fetched).await?;
        Ok(())
    }
}
