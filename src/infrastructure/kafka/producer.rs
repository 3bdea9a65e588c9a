use anyhow::{Context, Result};
use rdkafka::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::config::ProducerConfig;

pub const CORRELATION_ID_HEADER: &str = "correlation_id";

/// Shared, thread-safe producer. One instance per worker process.
#[derive(Clone)]
pub struct EventProducer {
    inner: FutureProducer,
    send_timeout: Duration,
}

impl EventProducer {
    pub fn new(config: &ProducerConfig) -> Result<EventProducer> {
        if config.acks == "0" || config.acks == "1" {
            warn!(
                "KAFKA_PRODUCER_ACKS='{}' risks losing acknowledged events; 'all' is recommended",
                config.acks
            );
        }

        let inner: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("acks", &config.acks)
            .set("compression.type", &config.compression)
            .set("batch.size", config.batch_size.to_string())
            .set("linger.ms", config.linger_ms.to_string())
            .create()
            .context("Failed to create Kafka producer")?;

        Ok(EventProducer {
            inner,
            send_timeout: Duration::from_secs(30),
        })
    }

    /// Serializes `payload` as JSON and publishes it under `key`, carrying
    /// the correlation id as a message header.
    pub async fn send_json<T: Serialize>(
        &self,
        topic: &str,
        key: &str,
        payload: &T,
        correlation_id: &str,
    ) -> Result<()> {
        let body = serde_json::to_vec(payload).context("Failed to serialize payload")?;

        let headers = OwnedHeaders::new().insert(Header {
            key: CORRELATION_ID_HEADER,
            value: Some(correlation_id.as_bytes()),
        });

        let record = FutureRecord::to(topic)
            .key(key)
            .payload(&body)
            .headers(headers);

        self.inner
            .send(record, self.send_timeout)
            .await
            .map_err(|(err, _msg)| anyhow::anyhow!("Kafka delivery failed: {err}"))?;

        debug!("Published {} bytes to {} (key {})", body.len(), topic, key);
        Ok(())
    }
}
