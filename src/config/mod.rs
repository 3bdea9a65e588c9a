//! Configuration loading from environment variables, organized by
//! subsystem: stores, event log, upstream client and worker tuning.
//! Out-of-range values are rejected at startup, not at first use.

mod kafka;
mod stores;
mod workers;

pub use kafka::{ConsumerTuning, KafkaEnvConfig, TopicsConfig};
pub use stores::{ClickHouseEnvConfig, PostgresEnvConfig, RedisEnvConfig};
pub use workers::{CollectorEnvConfig, MoexEnvConfig};

use anyhow::{Result, bail};
use std::env;
use std::str::FromStr;

/// Main application configuration shared by all worker binaries.
#[derive(Debug, Clone)]
pub struct Config {
    pub postgres: PostgresEnvConfig,
    pub clickhouse: ClickHouseEnvConfig,
    pub redis: RedisEnvConfig,
    pub kafka: KafkaEnvConfig,
    pub moex: MoexEnvConfig,
    pub collector: CollectorEnvConfig,
    pub log_level: String,
    pub health_port: u16,
    /// Analytical insert safety cap, rows per insert statement.
    pub max_partitions_per_insert: usize,
}

impl Config {
    pub fn from_env() -> Result<Config> {
        let config = Config {
            postgres: PostgresEnvConfig::from_env()?,
            clickhouse: ClickHouseEnvConfig::from_env()?,
            redis: RedisEnvConfig::from_env()?,
            kafka: KafkaEnvConfig::from_env()?,
            moex: MoexEnvConfig::from_env()?,
            collector: CollectorEnvConfig::from_env()?,
            log_level: env_or("LOG_LEVEL", "INFO"),
            health_port: env_parse("HEALTH_PORT", 8080)?,
            max_partitions_per_insert: env_parse("MAX_PARTITIONS_PER_INSERT", 10_000)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let allowed_levels = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"];
        if !allowed_levels.contains(&self.log_level.to_uppercase().as_str()) {
            bail!(
                "LOG_LEVEL must be one of {:?}, got '{}'",
                allowed_levels,
                self.log_level
            );
        }
        if self.max_partitions_per_insert == 0 || self.max_partitions_per_insert > 10_000 {
            bail!(
                "MAX_PARTITIONS_PER_INSERT must be within [1, 10000], got {}",
                self.max_partitions_per_insert
            );
        }
        self.kafka.validate()?;
        self.moex.validate()?;
        Ok(())
    }

    /// `tracing` filter string for the configured level.
    pub fn tracing_filter(&self) -> &'static str {
        match self.log_level.to_uppercase().as_str() {
            "DEBUG" => "debug",
            "WARNING" => "warn",
            "ERROR" | "CRITICAL" => "error",
            _ => "info",
        }
    }
}

pub(crate) fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("Invalid {key}='{raw}': {err}")),
        Err(_) => Ok(default),
    }
}
