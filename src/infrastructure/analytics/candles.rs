//! Base candle storage (`candles_base`).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clickhouse::{Client, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::application::availability::AvailabilitySnapshot;
use crate::application::frame::CandleFrame;
use crate::domain::market::{Candle, Timeframe};

use super::indicators;

#[derive(Debug, Row, Serialize, Deserialize)]
struct CandleRow {
    ticker: String,
    timeframe: String,
    #[serde(with = "clickhouse::serde::chrono::datetime")]
    begin: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    value: Option<f64>,
}

impl CandleRow {
    fn from_candle(c: &Candle) -> CandleRow {
        CandleRow {
            ticker: c.ticker.clone(),
            timeframe: c.timeframe.to_string(),
            begin: c.begin,
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,
            value: c.value,
        }
    }

    fn into_candle(self, timeframe: Timeframe) -> Candle {
        Candle {
            ticker: self.ticker,
            timeframe,
            begin: self.begin,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            value: self.value,
        }
    }
}

#[derive(Debug, Row, Deserialize)]
struct AvailabilityRow {
    #[serde(with = "clickhouse::serde::chrono::datetime::option")]
    period_first: Option<DateTime<Utc>>,
    #[serde(with = "clickhouse::serde::chrono::datetime::option")]
    period_last: Option<DateTime<Utc>>,
    lookback_count: u64,
    window_count: u64,
    #[serde(with = "clickhouse::serde::chrono::datetime::option")]
    first_available: Option<DateTime<Utc>>,
}

#[derive(Debug, Row, Deserialize)]
struct LatestRow {
    ticker: String,
    timeframe: String,
    #[serde(with = "clickhouse::serde::chrono::datetime")]
    latest: DateTime<Utc>,
}

/// Per-insert row cap; large backfills are chunked to stay under the
/// analytical store's parts-per-insert safety limit.
#[derive(Clone)]
pub struct CandleStore {
    max_rows_per_insert: usize,
}

impl CandleStore {
    pub fn new(max_rows_per_insert: usize) -> CandleStore {
        CandleStore {
            max_rows_per_insert: max_rows_per_insert.max(1),
        }
    }

    /// Upsert-by-key batch insert; the table's key collapses duplicates.
    pub async fn insert_candles(&self, client: &Client, candles: &[Candle]) -> Result<()> {
        if candles.is_empty() {
            return Ok(());
        }

        for chunk in candles.chunks(self.max_rows_per_insert) {
            let mut insert = client
                .insert("candles_base")
                .context("Failed to open candles_base insert")?;
            for candle in chunk {
                insert
                    .write(&CandleRow::from_candle(candle))
                    .await
                    .context("Failed to write candle row")?;
            }
            insert.end().await.context("Failed to flush candle insert")?;
        }

        info!(
            "Saved {} candles for {} {}",
            candles.len(),
            candles[0].ticker,
            candles[0].timeframe
        );
        Ok(())
    }

    /// `max(begin)` for one pair, the checkpoint fallback source.
    pub async fn latest_begin(
        &self,
        client: &Client,
        ticker: &str,
        timeframe: Timeframe,
    ) -> Result<Option<DateTime<Utc>>> {
        #[derive(Row, Deserialize)]
        struct MaxRow {
            #[serde(with = "clickhouse::serde::chrono::datetime::option")]
            latest: Option<DateTime<Utc>>,
        }

        let row = client
            .query(
                "SELECT maxOrNull(begin) AS latest FROM candles_base \
                 WHERE ticker = ? AND timeframe = ?",
            )
            .bind(ticker)
            .bind(timeframe.as_str())
            .fetch_one::<MaxRow>()
            .await
            .context("Failed to query latest candle begin")?;
        Ok(row.latest)
    }

    /// `max(begin)` for every pair on record, for checkpoint state sync.
    pub async fn latest_begins(
        &self,
        client: &Client,
    ) -> Result<Vec<(String, Timeframe, DateTime<Utc>)>> {
        let rows = client
            .query(
                "SELECT ticker, timeframe, max(begin) AS latest \
                 FROM candles_base GROUP BY ticker, timeframe",
            )
            .fetch_all::<LatestRow>()
            .await
            .context("Failed to query latest candle begins")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            if let Ok(timeframe) = row.timeframe.parse::<Timeframe>() {
                out.push((row.ticker, timeframe, row.latest));
            }
        }
        Ok(out)
    }

    /// One-scan availability aggregate: period bounds, capped lookback
    /// count, window coverage target and the earliest candle on record.
    /// Per-indicator coverage is filled in by the indicator store.
    #[allow(clippy::too_many_arguments)]
    pub async fn availability_snapshot(
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
        let window_start = lookback_start.unwrap_or(start);
        let row = client
            .query(
                "SELECT \
                   minOrNullIf(begin, begin >= toDateTime(?) AND begin <= toDateTime(?)) AS period_first, \
                   maxOrNullIf(begin, begin >= toDateTime(?) AND begin <= toDateTime(?)) AS period_last, \
                   toUInt64(least(countIf(begin < toDateTime(?)), ?)) AS lookback_count, \
                   countIf(begin >= toDateTime(?) AND begin <= toDateTime(?)) AS window_count, \
                   minOrNull(begin) AS first_available \
                 FROM candles_base \
                 WHERE ticker = ? AND timeframe = ?",
            )
            .bind(start.timestamp())
            .bind(end.timestamp())
            .bind(start.timestamp())
            .bind(end.timestamp())
            .bind(start.timestamp())
            .bind(max_lookback as u64)
            .bind(window_start.timestamp())
            .bind(end.timestamp())
            .bind(ticker)
            .bind(timeframe.as_str())
            .fetch_one::<AvailabilityRow>()
            .await
            .context("Failed to query data availability")?;

        let indicator_coverage = indicators::coverage_counts(
            client,
            ticker,
            timeframe,
            indicator_keys,
            window_start,
            end,
        )
        .await?;

        Ok(AvailabilitySnapshot {
            period_first_candle: row.period_first,
            period_last_candle: row.period_last,
            lookback_candles_count: row.lookback_count,
            window_candle_count: row.window_count,
            first_available: row.first_available,
            indicator_coverage,
        })
    }

    /// `begin` of the earliest candle inside the trailing `lookback`
    /// candles before `start`; defines the warm-up window edge.
    pub async fn lookback_start(
        &self,
        client: &Client,
        ticker: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        lookback: usize,
    ) -> Result<Option<DateTime<Utc>>> {
        #[derive(Row, Deserialize)]
        struct EdgeRow {
            #[serde(with = "clickhouse::serde::chrono::datetime::option")]
            edge: Option<DateTime<Utc>>,
        }

        if lookback == 0 {
            return Ok(Some(start));
        }

        let row = client
            .query(
                "SELECT minOrNull(begin) AS edge FROM ( \
                   SELECT begin FROM candles_base \
                   WHERE ticker = ? AND timeframe = ? AND begin < toDateTime(?) \
                   ORDER BY begin DESC LIMIT ? \
                 )",
            )
            .bind(ticker)
            .bind(timeframe.as_str())
            .bind(start.timestamp())
            .bind(lookback as u64)
            .fetch_one::<EdgeRow>()
            .await
            .context("Failed to query lookback window edge")?;
        Ok(row.edge)
    }

    /// Last `limit` candles in ascending order; the rolling-context
    /// fallback when the cache tier is down.
    pub async fn last_n_candles(
        &self,
        client: &Client,
        ticker: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let mut rows = client
            .query(
                "SELECT ?fields FROM candles_base \
                 WHERE ticker = ? AND timeframe = ? \
                 ORDER BY begin DESC LIMIT ?",
            )
            .bind(ticker)
            .bind(timeframe.as_str())
            .bind(limit as u64)
            .fetch_all::<CandleRow>()
            .await
            .context("Failed to query context candles")?;

        rows.reverse();
        Ok(rows
            .into_iter()
            .map(|row| row.into_candle(timeframe))
            .collect())
    }

    /// Loads the simulation window `[from, to]` as a column frame, joined
    /// with the requested indicator series (last-write-wins per point).
    pub async fn fetch_frame(
        &self,
        client: &Client,
        ticker: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        indicator_keys: &[String],
    ) -> Result<CandleFrame> {
        let rows = client
            .query(
                "SELECT ?fields FROM candles_base \
                 WHERE ticker = ? AND timeframe = ? \
                   AND begin >= toDateTime(?) AND begin <= toDateTime(?) \
                 ORDER BY begin ASC",
            )
            .bind(ticker)
            .bind(timeframe.as_str())
            .bind(from.timestamp())
            .bind(to.timestamp())
            .fetch_all::<CandleRow>()
            .await
            .context("Failed to query candle window")?;

        let candles: Vec<Candle> = rows
            .into_iter()
            .map(|row| row.into_candle(timeframe))
            .collect();
        let mut frame = CandleFrame::from_candles(&candles);

        if !indicator_keys.is_empty() {
            indicators::attach_columns(
                client,
                &mut frame,
                ticker,
                timeframe,
                indicator_keys,
                from,
                to,
            )
            .await?;
        }

        debug!(
            "Loaded frame for {} {}: {} candles, {} indicator columns",
            ticker,
            timeframe,
            frame.len(),
            indicator_keys.len()
        );
        Ok(frame)
    }
}
