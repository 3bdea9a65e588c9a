//! Indicator series storage (`candles_indicators`).
//!
//! The table is a last-write-wins merge tree keyed by
//! `(ticker, timeframe, indicator_key, begin)` with a monotonic `version`;
//! reads always collapse to the highest version per point.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clickhouse::{Client, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::application::frame::CandleFrame;
use crate::domain::market::Timeframe;

#[derive(Debug, Row, Serialize)]
struct IndicatorRow<'a> {
    ticker: &'a str,
    timeframe: &'a str,
    indicator_key: &'a str,
    #[serde(with = "clickhouse::serde::chrono::datetime")]
    begin: DateTime<Utc>,
    value: f64,
    version: u64,
}

#[derive(Debug, Row, Deserialize)]
struct IndicatorPointRow {
    indicator_key: String,
    #[serde(with = "clickhouse::serde::chrono::datetime")]
    begin: DateTime<Utc>,
    value: f64,
}

#[derive(Debug, Row, Deserialize)]
struct CoverageRow {
    indicator_key: String,
    covered: u64,
}

/// One indicator point ready for persistence.
#[derive(Debug, Clone)]
pub struct IndicatorPoint {
    pub begin: DateTime<Utc>,
    pub value: f64,
}

#[derive(Clone)]
pub struct IndicatorStore {
    max_rows_per_insert: usize,
}

impl IndicatorStore {
    pub fn new(max_rows_per_insert: usize) -> IndicatorStore {
        IndicatorStore {
            max_rows_per_insert: max_rows_per_insert.max(1),
        }
    }

    /// Monotonic write version; later writes replace earlier ones per
    /// `(key, begin)` once the merge tree collapses.
    pub fn next_version() -> u64 {
        Utc::now().timestamp_micros().max(0) as u64
    }

    /// Persists one series batch under a shared version.
    pub async fn insert_series(
        &self,
        client: &Client,
        ticker: &str,
        timeframe: Timeframe,
        indicator_key: &str,
        points: &[IndicatorPoint],
        version: u64,
    ) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let timeframe_str = timeframe.to_string();

        for chunk in points.chunks(self.max_rows_per_insert) {
            let mut insert = client
                .insert("candles_indicators")
                .context("Failed to open candles_indicators insert")?;
            for point in chunk {
                insert
                    .write(&IndicatorRow {
                        ticker,
                        timeframe: &timeframe_str,
                        indicator_key,
                        begin: point.begin,
                        value: point.value,
                        version,
                    })
                    .await
                    .context("Failed to write indicator row")?;
            }
            insert.end().await.context("Failed to flush indicator insert")?;
        }

        debug!(
            "Saved {} points of {} for {} {}",
            points.len(),
            indicator_key,
            ticker,
            timeframe
        );
        Ok(())
    }

    /// Persists the enriched values of a single candle (RT path): one row
    /// per indicator key at `begin`.
    pub async fn insert_rt_row(
        &self,
        client: &Client,
        ticker: &str,
        timeframe: Timeframe,
        begin: DateTime<Utc>,
        values: &BTreeMap<String, Option<f64>>,
    ) -> Result<()> {
        let version = Self::next_version();
        let timeframe_str = timeframe.to_string();

        let mut insert = client
            .insert("candles_indicators")
            .context("Failed to open candles_indicators insert")?;
        for (key, value) in values {
            let Some(value) = value else { continue };
            insert
                .write(&IndicatorRow {
                    ticker,
                    timeframe: &timeframe_str,
                    indicator_key: key,
                    begin,
                    value: *value,
                    version,
                })
                .await
                .context("Failed to write rt indicator row")?;
        }
        insert.end().await.context("Failed to flush rt indicator insert")?;
        Ok(())
    }
}

/// Distinct covered `begin`s per key over `[from, to]`. Distinct, because a
/// not-yet-merged tree can hold several versions of one point.
pub async fn coverage_counts(
    client: &Client,
    ticker: &str,
    timeframe: Timeframe,
    indicator_keys: &[String],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<BTreeMap<String, u64>> {
    if indicator_keys.is_empty() {
        return Ok(BTreeMap::new());
    }

    let rows = client
        .query(
            "SELECT indicator_key, uniqExact(begin) AS covered \
             FROM candles_indicators \
             WHERE ticker = ? AND timeframe = ? AND indicator_key IN ? \
               AND begin >= toDateTime(?) AND begin <= toDateTime(?) \
             GROUP BY indicator_key",
        )
        .bind(ticker)
        .bind(timeframe.as_str())
        .bind(indicator_keys)
        .bind(from.timestamp())
        .bind(to.timestamp())
        .fetch_all::<CoverageRow>()
        .await
        .context("Failed to query indicator coverage")?;

    Ok(rows
        .into_iter()
        .map(|row| (row.indicator_key, row.covered))
        .collect())
}

/// Reads the requested series over `[from, to]` (collapsed to the latest
/// version per point) and attaches them to the frame as columns.
pub async fn attach_columns(
    client: &Client,
    frame: &mut CandleFrame,
    ticker: &str,
    timeframe: Timeframe,
    indicator_keys: &[String],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<()> {
    let rows = client
        .query(
            "SELECT indicator_key, begin, argMax(value, version) AS value \
             FROM candles_indicators \
             WHERE ticker = ? AND timeframe = ? AND indicator_key IN ? \
               AND begin >= toDateTime(?) AND begin <= toDateTime(?) \
             GROUP BY indicator_key, begin",
        )
        .bind(ticker)
        .bind(timeframe.as_str())
        .bind(indicator_keys)
        .bind(from.timestamp())
        .bind(to.timestamp())
        .fetch_all::<IndicatorPointRow>()
        .await
        .context("Failed to query indicator series")?;

    let index_of: BTreeMap<DateTime<Utc>, usize> = frame
        .begin
        .iter()
        .enumerate()
        .map(|(i, begin)| (*begin, i))
        .collect();

    let mut columns: BTreeMap<String, Vec<f64>> = indicator_keys
        .iter()
        .map(|key| (key.clone(), vec![f64::NAN; frame.len()]))
        .collect();

    for row in rows {
        if let (Some(column), Some(&index)) =
            (columns.get_mut(&row.indicator_key), index_of.get(&row.begin))
        {
            column[index] = row.value;
        }
    }

    for (key, column) in columns {
        frame.set_column(key, column);
    }
    Ok(())
}
