//! Ticker metadata with a TTL read cache.

use anyhow::{Context, Result};
use sqlx::Row;
use sqlx::postgres::PgPool;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::domain::market::Ticker;

#[derive(Clone, Copy)]
struct CacheSlot {
    fetched_at: Instant,
}

pub struct TickerStore {
    pool: PgPool,
    ttl: Duration,
    cache: Mutex<HashMap<String, (Ticker, CacheSlot)>>,
}

impl TickerStore {
    pub fn new(pool: PgPool, ttl: Duration) -> TickerStore {
        TickerStore {
            pool,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Ticker by symbol, served from the TTL cache when fresh. Instruments
    /// are immutable for the life of a backtest, so staleness within the
    /// TTL is harmless.
    pub async fn get_ticker(&self, symbol: &str) -> Result<Option<Ticker>> {
        if let Some((ticker, slot)) = self.cache.lock().unwrap().get(symbol) {
            if slot.fetched_at.elapsed() < self.ttl {
                debug!("Ticker {} served from cache", symbol);
                return Ok(Some(ticker.clone()));
            }
        }

        let row = sqlx::query(
            "SELECT symbol, market_id, lot_size, min_step, decimals, currency, \
                    is_active, list_level \
             FROM tickers WHERE symbol = $1",
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load ticker")?;

        let Some(row) = row else { return Ok(None) };
        let ticker = row_to_ticker(&row)?;

        self.cache.lock().unwrap().insert(
            symbol.to_string(),
            (
                ticker.clone(),
                CacheSlot {
                    fetched_at: Instant::now(),
                },
            ),
        );
        Ok(Some(ticker))
    }

    /// Active tickers of one market, for the collector scheduler.
    pub async fn list_active(&self, market_code: &str) -> Result<Vec<Ticker>> {
        let rows = sqlx::query(
            "SELECT t.symbol, t.market_id, t.lot_size, t.min_step, t.decimals, t.currency, \
                    t.is_active, t.list_level \
             FROM tickers t JOIN markets m ON m.id = t.market_id \
             WHERE m.code = $1 AND t.is_active \
             ORDER BY t.symbol",
        )
        .bind(market_code)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list active tickers")?;

        rows.iter().map(row_to_ticker).collect()
    }

    /// Upserts the ticker universe fetched from the exchange.
    pub async fn upsert_tickers(&self, market_code: &str, tickers: &[Ticker]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        for ticker in tickers {
            sqlx::query(
                "INSERT INTO tickers \
                   (symbol, market_id, lot_size, min_step, decimals, currency, is_active, \
                    list_level, updated_at) \
                 SELECT $1, m.id, $3, $4, $5, $6, $7, $8, now() FROM markets m WHERE m.code = $2 \
                 ON CONFLICT (symbol, market_id) DO UPDATE SET \
                   lot_size = $3, min_step = $4, decimals = $5, currency = $6, \
                   is_active = $7, list_level = $8, updated_at = now()",
            )
            .bind(&ticker.symbol)
            .bind(market_code)
            .bind(ticker.lot_size)
            .bind(ticker.min_step)
            .bind(ticker.decimals)
            .bind(&ticker.currency)
            .bind(ticker.is_active)
            .bind(ticker.list_level)
            .execute(&mut *tx)
            .await
            .context("Failed to upsert ticker")?;
        }
        tx.commit().await?;

        info!("Upserted {} tickers for market {}", tickers.len(), market_code);
        Ok(tickers.len())
    }
}

fn row_to_ticker(row: &sqlx::postgres::PgRow) -> Result<Ticker> {
    Ok(Ticker {
        symbol: row.try_get("symbol")?,
        market_id: row.try_get("market_id")?,
        lot_size: row.try_get("lot_size")?,
        min_step: row.try_get("min_step")?,
        decimals: row.try_get("decimals")?,
        currency: row.try_get("currency")?,
        is_active: row.try_get("is_active")?,
        list_level: row.try_get("list_level")?,
    })
}
