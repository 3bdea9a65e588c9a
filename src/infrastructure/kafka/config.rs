use std::time::Duration;

/// Shared producer settings. `acks=all` is the durability default; weaker
/// settings are accepted with a startup warning.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub bootstrap_servers: String,
    pub acks: String,
    pub compression: String,
    pub batch_size: u32,
    pub linger_ms: u32,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        ProducerConfig {
            bootstrap_servers: "localhost:9092".to_string(),
            acks: "all".to_string(),
            compression: "gzip".to_string(),
            batch_size: 16_384,
            linger_ms: 10,
        }
    }
}

/// Per-consumer runtime tuning.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub bootstrap_servers: String,
    pub topic: String,
    pub group_id: String,
    /// In-flight handler bound. RT-class consumers must use 1.
    pub max_concurrent_messages: usize,
    /// Additional delivery attempts after the first failure.
    pub max_retries: u32,
    /// Backoff schedule; the last entry repeats when retries outnumber it.
    pub retry_delays: Vec<Duration>,
    pub use_dlq: bool,
    pub dlq_topic_suffix: String,
    /// Wall-clock budget for one handler invocation.
    pub handler_timeout: Duration,
    /// Handlers slower than this are logged even on success.
    pub slow_handler_threshold: Duration,
    pub auto_offset_reset: String,
}

impl ConsumerConfig {
    pub fn new(bootstrap_servers: &str, topic: &str, group_id: &str) -> ConsumerConfig {
        ConsumerConfig {
            bootstrap_servers: bootstrap_servers.to_string(),
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            max_concurrent_messages: 1,
            max_retries: 3,
            retry_delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(5),
            ],
            use_dlq: true,
            dlq_topic_suffix: ".failed".to_string(),
            handler_timeout: Duration::from_secs(60),
            slow_handler_threshold: Duration::from_secs(15),
            auto_offset_reset: "earliest".to_string(),
        }
    }

    pub fn dlq_topic(&self) -> String {
        format!("{}{}", self.topic, self.dlq_topic_suffix)
    }

    /// Backoff before retry attempt `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let index = (attempt.saturating_sub(1)) as usize;
        self.retry_delays
            .get(index)
            .or(self.retry_delays.last())
            .copied()
            .unwrap_or(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_schedule() {
        let config = ConsumerConfig::new("localhost:9092", "topic", "group");
        assert_eq!(config.retry_delay(1), Duration::from_secs(1));
        assert_eq!(config.retry_delay(2), Duration::from_secs(2));
        assert_eq!(config.retry_delay(3), Duration::from_secs(5));
        // Past the schedule the last delay repeats.
        assert_eq!(config.retry_delay(7), Duration::from_secs(5));
    }

    #[test]
    fn test_dlq_topic_name() {
        let config = ConsumerConfig::new("localhost:9092", "trade-forge.backtests.requests.v1", "g");
        assert_eq!(
            config.dlq_topic(),
            "trade-forge.backtests.requests.v1.failed"
        );
    }
}
