//! Worker-specific configuration: upstream client and collector behavior.

use anyhow::{Result, bail};
use std::time::Duration;

use super::{env_or, env_parse};
use crate::infrastructure::moex::MoexClientConfig;

/// MOEX ISS client tuning.
#[derive(Debug, Clone)]
pub struct MoexEnvConfig {
    pub base_url: String,
    pub rate_limit_requests: u32,
    pub rate_limit_seconds: f64,
    pub timeout_seconds: u64,
}

impl MoexEnvConfig {
    pub fn from_env() -> Result<Self> {
        Ok(MoexEnvConfig {
            base_url: env_or("MOEX_BASE_URL", "https://iss.moex.com"),
            rate_limit_requests: env_parse("MOEX_RATE_LIMIT_REQUESTS", 5)?,
            rate_limit_seconds: env_parse("MOEX_RATE_LIMIT_SECONDS", 1.0)?,
            timeout_seconds: env_parse("MOEX_TIMEOUT_SECONDS", 10)?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.rate_limit_requests == 0 {
            bail!("MOEX_RATE_LIMIT_REQUESTS must be positive");
        }
        if !(self.rate_limit_seconds > 0.0) {
            bail!(
                "MOEX_RATE_LIMIT_SECONDS must be positive, got {}",
                self.rate_limit_seconds
            );
        }
        Ok(())
    }

    pub fn client_config(&self) -> MoexClientConfig {
        MoexClientConfig {
            base_url: self.base_url.clone(),
            rate_limit_requests: self.rate_limit_requests,
            rate_limit_seconds: self.rate_limit_seconds,
            timeout: Duration::from_secs(self.timeout_seconds),
        }
    }
}

/// Collector behavior knobs.
#[derive(Debug, Clone)]
pub struct CollectorEnvConfig {
    /// Where history starts for a pair that has no checkpoint at all.
    pub default_collection_start: String,
    /// Mirror collected candles onto the raw-candles topic.
    pub publish_to_kafka: bool,
    pub market_code: String,
}

impl CollectorEnvConfig {
    pub fn from_env() -> Result<Self> {
        Ok(CollectorEnvConfig {
            default_collection_start: env_or("COLLECTOR_DEFAULT_START", "2014-01-01 00:00:00"),
            publish_to_kafka: env_parse("COLLECTOR_PUBLISH_TO_KAFKA", true)?,
            market_code: env_or("COLLECTOR_MARKET_CODE", "moex_stock"),
        })
    }
}
