//! MOEX ISS API client.
//!
//! JSON over HTTPS; responses are a `columns` list plus a `data` matrix.
//! Requests go through a retrying HTTP client behind a per-process token
//! bucket, so paginated crawls cannot exceed the exchange's rate limits no
//! matter how many tasks a worker picks up.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde_json::Value;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain::market::{Candle, MOSCOW_TZ, Ticker, Timeframe};

const SECURITIES_PATH: &str =
    "/iss/engines/stock/markets/shares/boards/TQBR/securities.json";

#[derive(Debug, Clone)]
pub struct MoexClientConfig {
    pub base_url: String,
    pub rate_limit_requests: u32,
    pub rate_limit_seconds: f64,
    pub timeout: Duration,
}

impl Default for MoexClientConfig {
    fn default() -> Self {
        MoexClientConfig {
            base_url: "https://iss.moex.com".to_string(),
            rate_limit_requests: 5,
            rate_limit_seconds: 1.0,
            timeout: Duration::from_secs(10),
        }
    }
}

pub struct MoexClient {
    http: ClientWithMiddleware,
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    base_url: String,
}

impl MoexClient {
    pub fn new(config: &MoexClientConfig) -> Result<MoexClient> {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(5)
            .build()
            .context("Failed to build HTTP client")?;
        let http = ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        let per_request =
            Duration::from_secs_f64(config.rate_limit_seconds / config.rate_limit_requests.max(1) as f64);
        let burst = NonZeroU32::new(config.rate_limit_requests.max(1)).unwrap();
        let quota = Quota::with_period(per_request)
            .ok_or_else(|| anyhow!("Invalid rate limit configuration"))?
            .allow_burst(burst);

        Ok(MoexClient {
            http,
            limiter: RateLimiter::direct(quota),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// All securities listed on the TQBR board, mapped into ticker rows.
    pub async fn get_securities(&self, market_id: uuid::Uuid) -> Result<Vec<Ticker>> {
        let url = format!("{}{}", self.base_url, SECURITIES_PATH);
        let body = self.get_json(&url).await?;

        let records = matrix_records(&body, "securities")?;
        let mut tickers = Vec::with_capacity(records.len());
        for record in records {
            let Some(symbol) = record_str(&record, "SECID") else {
                continue;
            };
            tickers.push(Ticker {
                symbol: symbol.to_string(),
                market_id,
                lot_size: record_i64(&record, "LOTSIZE").unwrap_or(1).max(1),
                min_step: record_f64(&record, "MINSTEP").unwrap_or(0.01),
                decimals: record_i64(&record, "DECIMALS").unwrap_or(2) as i16,
                currency: record_str(&record, "CURRENCYID").unwrap_or("SUR").to_string(),
                is_active: true,
                list_level: record_i64(&record, "LISTLEVEL").unwrap_or(3) as i16,
            });
        }

        debug!("Fetched {} securities from MOEX", tickers.len());
        Ok(tickers)
    }

    /// Candles for one ticker from `from` (inclusive), one upstream page.
    /// Invalid rows are dropped with a warning rather than poisoning the
    /// batch.
    pub async fn get_candles(
        &self,
        ticker: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let from_msk = from.with_timezone(&MOSCOW_TZ).format("%Y-%m-%d %H:%M:%S");
        let url = format!(
            "{}/iss/engines/stock/markets/shares/boards/tqbr/securities/{}/candles.json?interval={}&from={}",
            self.base_url,
            ticker,
            timeframe.to_moex_interval(),
            urlencode(&from_msk.to_string()),
        );
        let body = self.get_json(&url).await?;

        let records = matrix_records(&body, "candles")?;
        let mut candles = Vec::with_capacity(records.len());
        for record in records {
            match record_to_candle(&record, ticker, timeframe) {
                Ok(candle) => match candle.validate() {
                    Ok(()) => candles.push(candle),
                    Err(err) => warn!("Dropping invalid candle for {}: {err}", ticker),
                },
                Err(err) => warn!("Dropping unparsable candle row for {}: {err}", ticker),
            }
        }

        debug!(
            "Fetched {} candles for {} {} from {}",
            candles.len(),
            ticker,
            timeframe,
            from_msk
        );
        Ok(candles)
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        self.limiter.until_ready().await;

        let response = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("MOEX request failed: {url}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("MOEX returned {status} for {url}"));
        }
        response
            .json::<Value>()
            .await
            .context("MOEX response is not valid JSON")
    }
}

/// Zips one `{"columns": [...], "data": [[...]]}` block into records.
fn matrix_records<'a>(body: &'a Value, block: &str) -> Result<Vec<Vec<(&'a str, &'a Value)>>> {
    let section = body
        .get(block)
        .ok_or_else(|| anyhow!("Response has no '{block}' block"))?;
    let columns: Vec<&str> = section
        .get("columns")
        .and_then(Value::as_array)
        .map(|cols| cols.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    let mut records = Vec::new();
    for row in section
        .get("data")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let Some(cells) = row.as_array() else { continue };
        records.push(columns.iter().copied().zip(cells.iter()).collect());
    }
    Ok(records)
}

fn record_value<'a>(record: &'a [(&str, &Value)], column: &str) -> Option<&'a Value> {
    record
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(column))
        .map(|(_, value)| *value)
}

fn record_str<'a>(record: &'a [(&str, &Value)], column: &str) -> Option<&'a str> {
    record_value(record, column).and_then(Value::as_str)
}

fn record_f64(record: &[(&str, &Value)], column: &str) -> Option<f64> {
    record_value(record, column).and_then(Value::as_f64)
}

fn record_i64(record: &[(&str, &Value)], column: &str) -> Option<i64> {
    record_value(record, column).and_then(|value| {
        value
            .as_i64()
            .or_else(|| value.as_f64().map(|f| f as i64))
    })
}

fn record_to_candle(
    record: &[(&str, &Value)],
    ticker: &str,
    timeframe: Timeframe,
) -> Result<Candle> {
    let begin_raw =
        record_str(record, "begin").ok_or_else(|| anyhow!("candle row without 'begin'"))?;
    let begin = parse_moscow_datetime(begin_raw)?;

    let field = |name: &str| {
        record_f64(record, name).ok_or_else(|| anyhow!("candle row without '{name}'"))
    };

    Ok(Candle {
        ticker: ticker.to_string(),
        timeframe,
        begin,
        open: field("open")?,
        high: field("high")?,
        low: field("low")?,
        close: field("close")?,
        volume: field("volume")?,
        value: record_f64(record, "value"),
    })
}

/// MOEX reports naive Moscow wall-clock timestamps.
fn parse_moscow_datetime(raw: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .with_context(|| format!("Bad MOEX timestamp: {raw}"))?;
    MOSCOW_TZ
        .from_local_datetime(&naive)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| anyhow!("Ambiguous MOEX timestamp: {raw}"))
}

fn urlencode(s: &str) -> String {
    let mut encoded = String::new();
    for c in s.chars() {
        match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '_' | '.' | '~' => encoded.push(c),
            _ => {
                for byte in c.to_string().as_bytes() {
                    encoded.push_str(&format!("%{:02X}", byte));
                }
            }
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_matrix_records_zip() {
        let body = json!({
            "candles": {
                "columns": ["open", "close", "high", "low", "value", "volume", "begin", "end"],
                "data": [
                    [100.0, 101.0, 102.0, 99.5, 1000.0, 10.0, "2024-06-03 10:00:00", "2024-06-03 10:59:59"],
                    [101.0, 100.5, 101.5, 100.0, 900.0, 9.0, "2024-06-03 11:00:00", "2024-06-03 11:59:59"]
                ]
            }
        });
        let records = matrix_records(&body, "candles").unwrap();
        assert_eq!(records.len(), 2);

        let candle = record_to_candle(&records[0], "SBER", Timeframe::OneHour).unwrap();
        assert_eq!(candle.open, 100.0);
        assert_eq!(candle.value, Some(1000.0));
        // 10:00 Moscow is 07:00 UTC.
        assert_eq!(candle.begin, Utc.with_ymd_and_hms(2024, 6, 3, 7, 0, 0).unwrap());
    }

    #[test]
    fn test_empty_data_block() {
        let body = json!({"candles": {"columns": [], "data": []}});
        assert!(matrix_records(&body, "candles").unwrap().is_empty());
        assert!(matrix_records(&body, "securities").is_err());
    }

    #[test]
    fn test_urlencode_space_and_colon() {
        assert_eq!(urlencode("2024-06-03 10:00:00"), "2024-06-03%2010%3A00%3A00");
    }
}
