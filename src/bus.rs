//! Message bus plumbing over `rdkafka` (the Kafka client the
//! retrieval pack's `estuary-flow` crate depends on for the same
//! general purpose — durable, partitioned, replayable event
//! transport). Topics and consumer groups match spec.md §6 exactly.

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;

use crate::error::{EngageFeedError, Result};

pub const TOPIC_COUNTER_EVENTS: &str = "counter-events";
pub const TOPIC_CANAL_OUTBOX: &str = "canal-outbox";

pub const GROUP_COUNTER_AGG: &str = "counter-agg";
pub const GROUP_COUNTER_REBUILD: &str = "counter-rebuild";
pub const GROUP_RELATION_OUTBOX_CONSUMER: &str = "relation-outbox-consumer";

pub fn producer(brokers: &str) -> Result<FutureProducer> {
    ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("message.timeout.ms", "5000")
        .create()
        .map_err(|e| EngageFeedError::Bus(e.to_string()))
}

pub fn consumer(brokers: &str, group_id: &str, start_from_earliest: bool) -> Result<StreamConsumer> {
    let offset_reset = if start_from_earliest { "earliest" } else { "latest" };
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("group.id", group_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", offset_reset)
        .create()
        .map_err(|e| EngageFeedError::Bus(e.to_string()))?;
    Ok(consumer)
}

pub fn subscribe(consumer: &StreamConsumer, topic: &str) -> Result<()> {
    consumer
        .subscribe(&[topic])
        .map_err(|e| EngageFeedError::Bus(e.to_string()))
}

/// Publishes `payload` to `topic`, keyed by `key` so same-entity
/// events land on the same partition and preserve per-entity order
/// (spec.md §5 "Ordering guarantees").
pub async fn publish(producer: &FutureProducer, topic: &str, key: &str, payload: &str) -> Result<()> {
    let record = FutureRecord::to(topic).key(key).payload(payload);
    producer
        .send(record, Timeout::After(Duration::from_secs(5)))
        .await
        .map_err(|(e, _)| EngageFeedError::Bus(e.to_string()))?;
    Ok(())
}
