//! Event-log plumbing: producer wrapper, typed consumer runtime, message
//! schemas and the per-consumer configuration they share.

pub mod config;
pub mod consumer;
pub mod messages;
pub mod producer;

pub use config::{ConsumerConfig, ProducerConfig};
pub use consumer::{ConsumedMessage, KafkaConsumerRuntime, MessageHandler};
pub use producer::EventProducer;
