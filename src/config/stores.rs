//! Connection coordinates for the three stores.

use anyhow::Result;

use super::{env_or, env_parse};
use crate::infrastructure::analytics::pool::AnalyticsConfig;

/// Relational store (authoritative configuration, jobs, results).
#[derive(Debug, Clone)]
pub struct PostgresEnvConfig {
    pub host: String,
    pub port: u16,
    pub db: String,
    pub user: String,
    pub password: String,
    pub max_connections: u32,
}

impl PostgresEnvConfig {
    pub fn from_env() -> Result<Self> {
        Ok(PostgresEnvConfig {
            host: env_or("POSTGRES_HOST", "localhost"),
            port: env_parse("POSTGRES_PORT", 5432)?,
            db: env_or("POSTGRES_DB", "tradeforge"),
            user: env_or("POSTGRES_USER", "tradeforge"),
            password: env_or("POSTGRES_PASSWORD", ""),
            max_connections: env_parse("POSTGRES_MAX_CONNECTIONS", 5)?,
        })
    }

    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.db
        )
    }
}

/// Analytical column store (bulk candles + indicator series).
#[derive(Debug, Clone)]
pub struct ClickHouseEnvConfig {
    pub host: String,
    pub port: u16,
    pub db: String,
    pub user: String,
    pub password: String,
}

impl ClickHouseEnvConfig {
    pub fn from_env() -> Result<Self> {
        Ok(ClickHouseEnvConfig {
            host: env_or("CLICKHOUSE_HOST", "localhost"),
            port: env_parse("CLICKHOUSE_PORT", 8123)?,
            db: env_or("CLICKHOUSE_DB", "trader"),
            user: env_or("CLICKHOUSE_USER", "default"),
            password: env_or("CLICKHOUSE_PASSWORD", ""),
        })
    }

    pub fn analytics(&self) -> AnalyticsConfig {
        AnalyticsConfig {
            url: format!("http://{}:{}", self.host, self.port),
            database: self.db.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
        }
    }
}

/// Cache tier (checkpoints, context windows, locks, quotas).
#[derive(Debug, Clone)]
pub struct RedisEnvConfig {
    pub host: String,
    pub port: u16,
    pub db: u8,
    pub password: Option<String>,
}

impl RedisEnvConfig {
    pub fn from_env() -> Result<Self> {
        let password = std::env::var("REDIS_PASSWORD").ok().filter(|p| !p.is_empty());
        Ok(RedisEnvConfig {
            host: env_or("REDIS_HOST", "localhost"),
            port: env_parse("REDIS_PORT", 6379)?,
            db: env_parse("REDIS_DB", 0)?,
            password,
        })
    }

    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}
