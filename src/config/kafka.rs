//! Event-log configuration: broker coordinates, topic names, consumer
//! groups and per-consumer tuning.

use anyhow::{Result, bail};
use std::time::Duration;

use super::{env_or, env_parse};
use crate::infrastructure::kafka::{ConsumerConfig, ProducerConfig};

#[derive(Debug, Clone)]
pub struct TopicsConfig {
    pub raw_candles: String,
    pub processed_candles_rt: String,
    pub calculation_requests: String,
    pub backtest_requests: String,
    pub collector_tasks: String,
}

impl TopicsConfig {
    fn from_env() -> TopicsConfig {
        TopicsConfig {
            raw_candles: env_or(
                "KAFKA_TOPIC_RAW_CANDLES",
                "trade-forge.marketdata.candles.raw.v1",
            ),
            processed_candles_rt: env_or(
                "KAFKA_TOPIC_PROCESSED_CANDLES_RT",
                "trade-forge.indicators.candles.processed.rt.v1",
            ),
            calculation_requests: env_or(
                "KAFKA_TOPIC_CALCULATION_REQUESTS",
                "trade-forge.backtesting.indicators.calculation-requested.v1",
            ),
            backtest_requests: env_or(
                "KAFKA_TOPIC_BACKTEST_REQUESTS",
                "trade-forge.backtests.requests.v1",
            ),
            collector_tasks: env_or(
                "KAFKA_TOPIC_COLLECTOR_TASKS",
                "trade-forge.market-collectors.tasks",
            ),
        }
    }
}

/// Tuning knobs for one consumer class.
#[derive(Debug, Clone)]
pub struct ConsumerTuning {
    pub group_id: String,
    pub max_concurrent: usize,
    pub max_retries: u32,
    pub use_dlq: bool,
    pub handler_timeout: Duration,
    pub slow_handler_threshold: Duration,
}

impl ConsumerTuning {
    fn from_env(
        prefix: &str,
        default_group: &str,
        default_concurrent: usize,
        default_timeout_secs: u64,
        default_slow_secs: u64,
    ) -> Result<ConsumerTuning> {
        Ok(ConsumerTuning {
            group_id: env_or(&format!("KAFKA_{prefix}_CONSUMER_GROUP"), default_group),
            max_concurrent: env_parse(
                &format!("KAFKA_{prefix}_CONSUMER_MAX_CONCURRENT"),
                default_concurrent,
            )?,
            max_retries: env_parse(&format!("KAFKA_{prefix}_CONSUMER_MAX_RETRIES"), 3)?,
            use_dlq: env_parse(&format!("KAFKA_{prefix}_CONSUMER_USE_DLQ"), true)?,
            handler_timeout: Duration::from_secs(env_parse(
                &format!("KAFKA_{prefix}_CONSUMER_TIMEOUT_SECONDS"),
                default_timeout_secs,
            )?),
            slow_handler_threshold: Duration::from_secs(env_parse(
                &format!("KAFKA_{prefix}_CONSUMER_SLOW_SECONDS"),
                default_slow_secs,
            )?),
        })
    }

    /// Materializes the runtime config for `topic`.
    pub fn consumer_config(&self, bootstrap_servers: &str, topic: &str) -> ConsumerConfig {
        let mut config = ConsumerConfig::new(bootstrap_servers, topic, &self.group_id);
        config.max_concurrent_messages = self.max_concurrent;
        config.max_retries = self.max_retries;
        config.use_dlq = self.use_dlq;
        config.handler_timeout = self.handler_timeout;
        config.slow_handler_threshold = self.slow_handler_threshold;
        config
    }
}

#[derive(Debug, Clone)]
pub struct KafkaEnvConfig {
    pub bootstrap_servers: String,
    pub producer: ProducerConfig,
    pub topics: TopicsConfig,
    pub backtest: ConsumerTuning,
    pub rt: ConsumerTuning,
    pub batch: ConsumerTuning,
    pub collector: ConsumerTuning,
}

impl KafkaEnvConfig {
    pub fn from_env() -> Result<KafkaEnvConfig> {
        let bootstrap_servers = env_or("KAFKA_BOOTSTRAP_SERVERS", "localhost:9092");

        let producer = ProducerConfig {
            bootstrap_servers: bootstrap_servers.clone(),
            acks: env_or("KAFKA_PRODUCER_ACKS", "all"),
            compression: env_or("KAFKA_PRODUCER_COMPRESSION", "gzip"),
            batch_size: env_parse("KAFKA_PRODUCER_BATCH_SIZE", 16_384)?,
            linger_ms: env_parse("KAFKA_PRODUCER_LINGER_MS", 10)?,
        };

        Ok(KafkaEnvConfig {
            bootstrap_servers,
            producer,
            topics: TopicsConfig::from_env(),
            // The backtest handler may legitimately run for minutes; its
            // timeout tracks the simulation guard plus I/O headroom.
            backtest: ConsumerTuning::from_env(
                "BACKTEST",
                "trading-engine-backtest-worker-group",
                5,
                420,
                15,
            )?,
            rt: ConsumerTuning::from_env(
                "RT",
                "data-processor-rt-group",
                1,
                30,
                5,
            )?,
            batch: ConsumerTuning::from_env(
                "BATCH",
                "data-processor-batch-group",
                4,
                600,
                10,
            )?,
            collector: ConsumerTuning::from_env(
                "COLLECTOR",
                "moex-collector-group",
                4,
                120,
                30,
            )?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        // The rolling-context cache contract assumes a single writer per
        // partition; RT consumers must stay strictly sequential.
        if self.rt.max_concurrent != 1 {
            bail!(
                "KAFKA_RT_CONSUMER_MAX_CONCURRENT must be 1, got {}",
                self.rt.max_concurrent
            );
        }
        for (name, tuning) in [
            ("BACKTEST", &self.backtest),
            ("BATCH", &self.batch),
            ("COLLECTOR", &self.collector),
        ] {
            if tuning.max_concurrent == 0 || tuning.max_concurrent > 20 {
                bail!(
                    "KAFKA_{name}_CONSUMER_MAX_CONCURRENT must be within [1, 20], got {}",
                    tuning.max_concurrent
                );
            }
        }

        let allowed_acks = ["all", "-1", "0", "1"];
        if !allowed_acks.contains(&self.producer.acks.as_str()) {
            bail!(
                "KAFKA_PRODUCER_ACKS must be one of {:?}, got '{}'",
                allowed_acks,
                self.producer.acks
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> KafkaEnvConfig {
        KafkaEnvConfig {
            bootstrap_servers: "localhost:9092".to_string(),
            producer: ProducerConfig::default(),
            topics: TopicsConfig::from_env(),
            backtest: ConsumerTuning {
                group_id: "g".to_string(),
                max_concurrent: 5,
                max_retries: 3,
                use_dlq: true,
                handler_timeout: Duration::from_secs(420),
                slow_handler_threshold: Duration::from_secs(15),
            },
            rt: ConsumerTuning {
                group_id: "g".to_string(),
                max_concurrent: 1,
                max_retries: 3,
                use_dlq: true,
                handler_timeout: Duration::from_secs(30),
                slow_handler_threshold: Duration::from_secs(5),
            },
            batch: ConsumerTuning {
                group_id: "g".to_string(),
                max_concurrent: 4,
                max_retries: 3,
                use_dlq: true,
                handler_timeout: Duration::from_secs(600),
                slow_handler_threshold: Duration::from_secs(10),
            },
            collector: ConsumerTuning {
                group_id: "g".to_string(),
                max_concurrent: 4,
                max_retries: 3,
                use_dlq: true,
                handler_timeout: Duration::from_secs(120),
                slow_handler_threshold: Duration::from_secs(30),
            },
        }
    }

    #[test]
    fn test_rt_concurrency_must_be_one() {
        let mut config = base_config();
        assert!(config.validate().is_ok());
        config.rt.max_concurrent = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_batch_concurrency_capped() {
        let mut config = base_config();
        config.batch.max_concurrent = 21;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_acks_rejected() {
        let mut config = base_config();
        config.producer.acks = "two".to_string();
        assert!(config.validate().is_err());
    }
}
