//! Generic consumer runtime.
//!
//! Wraps a Kafka stream consumer with the platform's delivery semantics:
//! schema validation straight to DLQ, bounded handler concurrency,
//! correlation-id propagation, per-attempt timeout and slow-handler logging,
//! retry with backoff, dead-lettering on exhaustion, and monotonic offset
//! commits (an offset is only stored once every earlier offset of the same
//! partition has finished).

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use rdkafka::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message};
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::ConsumerConfig;
use super::messages::DeadLetterEnvelope;
use super::producer::{CORRELATION_ID_HEADER, EventProducer};
use crate::domain::errors::ConsumerError;

/// A validated message handed to a handler.
#[derive(Debug, Clone)]
pub struct ConsumedMessage<M> {
    pub value: M,
    pub correlation_id: String,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// One message-processing unit. Implementations classify their failures into
/// `ConsumerError` kinds; the runtime owns retry and DLQ policy.
#[async_trait]
pub trait MessageHandler<M>: Send + Sync {
    async fn handle(&self, message: ConsumedMessage<M>) -> Result<(), ConsumerError>;

    /// Called once when the retry budget for a message is spent, before the
    /// runtime dead-letters it. Lets a handler notify interested parties
    /// (e.g. answer a request topic) about the give-up.
    async fn on_exhausted(&self, _message: &ConsumedMessage<M>, _error: &ConsumerError) {}
}

pub struct KafkaConsumerRuntime<M, H> {
    config: ConsumerConfig,
    consumer: Arc<StreamConsumer>,
    producer: EventProducer,
    handler: Arc<H>,
    _marker: std::marker::PhantomData<fn() -> M>,
}

impl<M, H> KafkaConsumerRuntime<M, H>
where
    M: DeserializeOwned + Clone + Send + Sync + 'static,
    H: MessageHandler<M> + 'static,
{
    pub fn new(
        config: ConsumerConfig,
        producer: EventProducer,
        handler: H,
    ) -> Result<KafkaConsumerRuntime<M, H>> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.group_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "true")
            // Offsets are stored by the runtime, strictly in completion
            // order per partition.
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .create()
            .context("Failed to create Kafka consumer")?;

        consumer
            .subscribe(&[config.topic.as_str()])
            .with_context(|| format!("Failed to subscribe to {}", config.topic))?;

        Ok(KafkaConsumerRuntime {
            config,
            consumer: Arc::new(consumer),
            producer,
            handler: Arc::new(handler),
            _marker: std::marker::PhantomData,
        })
    }

    /// Consume until `shutdown` flips to true, then drain in-flight handlers
    /// within a bounded window and commit.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            "Consumer started: topic {}, group {}, concurrency {}",
            self.config.topic, self.config.group_id, self.config.max_concurrent_messages
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_messages));
        let offsets = Arc::new(Mutex::new(OffsetTracker::default()));
        let abort: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        loop {
            if let Some(reason) = abort.lock().unwrap().take() {
                self.drain(&semaphore).await;
                return Err(anyhow!("consumer aborted: {reason}"));
            }

            // Back-pressure: a permit is held before the next poll, so at
            // most `max_concurrent_messages` handlers run at once and a
            // concurrency of 1 is strictly sequential.
            let permit = tokio::select! {
                _ = shutdown.changed() => break,
                permit = semaphore.clone().acquire_owned() => permit.expect("semaphore closed"),
            };

            let message = tokio::select! {
                _ = shutdown.changed() => break,
                received = self.consumer.recv() => match received {
                    Ok(message) => message,
                    Err(err) => {
                        warn!("Kafka poll error: {err}");
                        drop(permit);
                        sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                },
            };

            let topic = message.topic().to_string();
            let partition = message.partition();
            let offset = message.offset();
            let payload = message.payload().unwrap_or_default().to_vec();
            let key = message
                .key()
                .map(|k| String::from_utf8_lossy(k).to_string())
                .unwrap_or_default();
            let correlation_id = extract_correlation_id(&message);

            offsets.lock().unwrap().begin(&topic, partition, offset);

            let parsed: Result<M, serde_json::Error> = serde_json::from_slice(&payload);
            let value = match parsed {
                Ok(value) => value,
                Err(err) => {
                    // Invalid payloads skip the retry machinery entirely.
                    warn!(
                        "Invalid payload on {}[{}]@{}: {err}",
                        topic, partition, offset
                    );
                    self.dead_letter(&key, &payload, "schema validation failed", 0, &err.to_string())
                        .await;
                    self.finish(&offsets, &topic, partition, offset);
                    drop(permit);
                    continue;
                }
            };

            let consumed = ConsumedMessage {
                value,
                correlation_id: correlation_id.clone(),
                topic: topic.clone(),
                partition,
                offset,
            };

            let runtime = self.clone_task_context(&offsets, &abort);
            tokio::spawn(async move {
                let _permit = permit;
                runtime.process(consumed, key, payload, correlation_id).await;
            });
        }

        info!("Consumer stopping: draining in-flight handlers");
        self.drain(&semaphore).await;
        if let Err(err) = self.consumer.commit_consumer_state(CommitMode::Sync) {
            warn!("Final offset commit failed: {err}");
        }
        info!("Consumer stopped: topic {}", self.config.topic);
        Ok(())
    }

    fn clone_task_context(
        &self,
        offsets: &Arc<Mutex<OffsetTracker>>,
        abort: &Arc<Mutex<Option<String>>>,
    ) -> TaskContext<M, H> {
        TaskContext {
            config: self.config.clone(),
            consumer: Arc::clone(&self.consumer),
            producer: self.producer.clone(),
            handler: Arc::clone(&self.handler),
            offsets: Arc::clone(offsets),
            abort: Arc::clone(abort),
            _marker: std::marker::PhantomData,
        }
    }

    async fn drain(&self, semaphore: &Arc<Semaphore>) {
        let all = self.config.max_concurrent_messages as u32;
        if timeout(Duration::from_secs(30), semaphore.acquire_many(all))
            .await
            .is_err()
        {
            warn!("In-flight handlers did not drain within 30s");
        }
    }

    async fn dead_letter(
        &self,
        key: &str,
        payload: &[u8],
        reason: &str,
        attempts: u32,
        last_error: &str,
    ) {
        dead_letter(
            &self.producer,
            &self.config,
            key,
            payload,
            reason,
            attempts,
            last_error,
        )
        .await;
    }

    fn finish(&self, offsets: &Arc<Mutex<OffsetTracker>>, topic: &str, partition: i32, offset: i64) {
        store_completed(&self.consumer, offsets, topic, partition, offset);
    }
}

/// Everything a spawned handler task needs, detached from the runtime borrow.
struct TaskContext<M, H> {
    config: ConsumerConfig,
    consumer: Arc<StreamConsumer>,
    producer: EventProducer,
    handler: Arc<H>,
    offsets: Arc<Mutex<OffsetTracker>>,
    abort: Arc<Mutex<Option<String>>>,
    _marker: std::marker::PhantomData<fn() -> M>,
}

impl<M, H> TaskContext<M, H>
where
    M: Clone + Send + Sync + 'static,
    H: MessageHandler<M>,
{
    async fn process(
        &self,
        message: ConsumedMessage<M>,
        key: String,
        payload: Vec<u8>,
        correlation_id: String,
    ) {
        let topic = message.topic.clone();
        let partition = message.partition;
        let offset = message.offset;

        let failure = self.attempt_with_retries(message.clone(), &correlation_id).await;

        if let Some(err @ ConsumerError::MaxRetriesExceeded { .. }) = &failure {
            self.handler.on_exhausted(&message, err).await;
        }

        match failure {
            None => {
                store_completed(&self.consumer, &self.offsets, &topic, partition, offset);
            }
            Some(err) if self.config.use_dlq => {
                let attempts = match &err {
                    ConsumerError::MaxRetriesExceeded { attempts, .. } => *attempts,
                    _ => 1,
                };
                error!(
                    "Message {}[{}]@{} dead-lettered (correlation {}): {err}",
                    topic, partition, offset, correlation_id
                );
                dead_letter(
                    &self.producer,
                    &self.config,
                    &key,
                    &payload,
                    "handler failed",
                    attempts,
                    &err.to_string(),
                )
                .await;
                store_completed(&self.consumer, &self.offsets, &topic, partition, offset);
            }
            Some(err) => {
                // Without a DLQ the offset must not move past the message;
                // stop the consumer and surface the failure to the operator.
                error!(
                    "Message {}[{}]@{} failed with no DLQ configured: {err}",
                    topic, partition, offset
                );
                *self.abort.lock().unwrap() = Some(err.to_string());
            }
        }
    }

    /// Runs the handler with timeout and slow-op accounting; retries
    /// retryable failures per the backoff schedule.
    async fn attempt_with_retries(
        &self,
        message: ConsumedMessage<M>,
        correlation_id: &str,
    ) -> Option<ConsumerError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let started = Instant::now();
            let outcome = timeout(self.config.handler_timeout, self.handler.handle(message.clone()))
                .await;
            let elapsed = started.elapsed();

            if elapsed > self.config.slow_handler_threshold {
                warn!(
                    "Slow handler on {}@{} (correlation {}): {:.1}s",
                    message.topic,
                    message.offset,
                    correlation_id,
                    elapsed.as_secs_f64()
                );
            }

            let err = match outcome {
                Ok(Ok(())) => return None,
                Ok(Err(err)) => err,
                Err(_) => ConsumerError::Retryable(format!(
                    "handler timed out after {:.0}s",
                    self.config.handler_timeout.as_secs_f64()
                )),
            };

            if err.is_retryable() && attempt <= self.config.max_retries {
                let delay = self.config.retry_delay(attempt);
                warn!(
                    "Retryable failure on {}@{} (attempt {}/{}), backing off {:?}: {err}",
                    message.topic, message.offset, attempt, self.config.max_retries, delay
                );
                sleep(delay).await;
                continue;
            }

            if err.is_retryable() {
                return Some(ConsumerError::MaxRetriesExceeded {
                    attempts: attempt,
                    last_error: err.to_string(),
                });
            }
            return Some(err);
        }
    }
}

async fn dead_letter(
    producer: &EventProducer,
    config: &ConsumerConfig,
    key: &str,
    payload: &[u8],
    reason: &str,
    attempts: u32,
    last_error: &str,
) {
    let envelope = DeadLetterEnvelope {
        payload: serde_json::from_slice(payload)
            .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(payload).into())),
        failure_reason: reason.to_string(),
        attempts,
        last_error: last_error.to_string(),
    };

    if let Err(err) = producer
        .send_json(&config.dlq_topic(), key, &envelope, &Uuid::new_v4().to_string())
        .await
    {
        error!("Failed to publish to DLQ {}: {err}", config.dlq_topic());
    }
}

fn store_completed(
    consumer: &StreamConsumer,
    offsets: &Arc<Mutex<OffsetTracker>>,
    topic: &str,
    partition: i32,
    offset: i64,
) {
    let committable = offsets.lock().unwrap().complete(topic, partition, offset);
    if let Some(committable) = committable {
        if let Err(err) = consumer.store_offset(topic, partition, committable) {
            warn!("Failed to store offset {}[{}]@{}: {err}", topic, partition, committable);
        } else {
            debug!("Stored offset {}[{}]@{}", topic, partition, committable);
        }
    }
}

fn extract_correlation_id(message: &rdkafka::message::BorrowedMessage<'_>) -> String {
    if let Some(headers) = message.headers() {
        for header in headers.iter() {
            if header.key == CORRELATION_ID_HEADER {
                if let Some(value) = header.value {
                    if let Ok(text) = std::str::from_utf8(value) {
                        return text.to_string();
                    }
                }
            }
        }
    }
    Uuid::new_v4().to_string()
}

/// Tracks in-flight offsets per partition so commits stay monotonic: an
/// offset becomes committable only once every earlier in-flight offset of
/// the same partition has completed.
#[derive(Default)]
struct OffsetTracker {
    partitions: HashMap<(String, i32), BTreeMap<i64, bool>>,
}

impl OffsetTracker {
    fn begin(&mut self, topic: &str, partition: i32, offset: i64) {
        self.partitions
            .entry((topic.to_string(), partition))
            .or_default()
            .insert(offset, false);
    }

    /// Marks `offset` done. Returns the highest offset of the contiguous
    /// completed prefix, if the prefix advanced.
    fn complete(&mut self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let pending = self
            .partitions
            .get_mut(&(topic.to_string(), partition))?;
        if let Some(done) = pending.get_mut(&offset) {
            *done = true;
        }

        let mut advanced = None;
        while let Some((&first, &done)) = pending.iter().next() {
            if !done {
                break;
            }
            pending.remove(&first);
            advanced = Some(first);
        }
        advanced
    }
}
