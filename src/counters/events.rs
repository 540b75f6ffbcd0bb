//! Counter event stream (spec.md §4.E): the aggregation consumer
//! that folds `counter-events` deltas into a per-entity hash bucket,
//! the 1-second flusher that drains buckets into packed-counter
//! snapshots, and the opt-in replay consumer used for disaster
//! recovery.

use futures_util::StreamExt;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{TopicPartitionList, Offset};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{debug, error, warn};

use crate::counters::packed;
use crate::error::EngageFeedError;

#[derive(Debug, Deserialize)]
struct CounterEventWire {
    #[serde(rename = "entityType")]
    entity_type: String,
    #[serde(rename = "entityId")]
    entity_id: String,
    idx: usize,
    delta: i64,
}

fn agg_key(etype: &str, eid: &str) -> String {
    format!("agg:entity:{etype}:{eid}")
}

fn agg_bucket_index_key() -> &'static str {
    "agg:entity:idx"
}

fn snapshot_key(etype: &str, eid: &str) -> String {
    format!("cnt:v1:{etype}:{eid}")
}

/// Consumer group `counter-agg`: decodes each event and atomically
/// increments the aggregation bucket hash field, acking only after
/// the bucket write succeeds so a crash mid-decode retries instead of
/// losing the delta (spec.md §4.E).
pub async fn run_aggregation_consumer(
    consumer: StreamConsumer,
    mut redis: ConnectionManager,
    running: Arc<AtomicBool>,
) {
    let mut stream = consumer.stream();
    while running.load(Ordering::Relaxed) {
        let Some(message) = stream.next().await else { break };
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                warn!("counter-agg consumer error: {e}");
                continue;
            }
        };

        let Some(payload) = message.payload() else { continue };
        let event: CounterEventWire = match serde_json::from_slice(payload) {
            Ok(e) => e,
            Err(e) => {
                error!("malformed counter event, skipping: {e}");
                continue;
            }
        };

        let bucket = agg_key(&event.entity_type, &event.entity_id);
        let field = event.idx.to_string();

        let result: Result<i64, _> = redis.hincr(&bucket, &field, event.delta).await;
        match result {
            Ok(_) => {
                let _: Result<(), _> = redis.sadd(agg_bucket_index_key(), &bucket).await;
                if let Err(e) = consumer.commit_message(&message, rdkafka::consumer::CommitMode::Async) {
                    warn!("failed to commit counter-agg offset: {e}");
                }
            }
            Err(e) => {
                warn!("failed to fold counter event into {bucket}, leaving un-acked: {e}");
            }
        }
    }
}

/// Fixed-delay flusher (spec.md §4.E): drains every known aggregation
/// bucket into its packed-counter snapshot. Fold and field-delete run
/// inside one EVAL (`add_segment_and_drain`) so a crash between the
/// two can no longer double-count a delta (spec.md §9 Open Question
/// 1 -- this implementation closes it rather than accepting it).
pub async fn run_aggregation_flusher(mut redis: ConnectionManager, running: Arc<AtomicBool>) {
    let mut ticker = interval(Duration::from_secs(1));
    while running.load(Ordering::Relaxed) {
        ticker.tick().await;
        if let Err(e) = flush_once(&mut redis).await {
            warn!("aggregation flush failed: {e}");
        }
    }
}

async fn flush_once(redis: &mut ConnectionManager) -> crate::error::Result<()> {
    let buckets: Vec<String> = redis.smembers(agg_bucket_index_key()).await.map_err(EngageFeedError::Redis)?;

    for bucket in buckets {
        let Some((etype, eid)) = parse_bucket(&bucket) else { continue };
        let fields: std::collections::HashMap<String, i64> =
            redis.hgetall(&bucket).await.map_err(EngageFeedError::Redis)?;

        if fields.is_empty() {
            let _: () = redis.srem(agg_bucket_index_key(), &bucket).await.map_err(EngageFeedError::Redis)?;
            let _: () = redis.del(&bucket).await.map_err(EngageFeedError::Redis)?;
            continue;
        }

        for (field, delta) in fields {
            let idx: usize = match field.parse() {
                Ok(v) => v,
                Err(_) => continue,
            };
            packed::add_segment_and_drain(redis, &snapshot_key(&etype, &eid), &bucket, &field, idx, delta).await?;
        }

        let remaining: std::collections::HashMap<String, i64> =
            redis.hgetall(&bucket).await.map_err(EngageFeedError::Redis)?;
        if remaining.is_empty() {
            let _: () = redis.srem(agg_bucket_index_key(), &bucket).await.map_err(EngageFeedError::Redis)?;
            let _: () = redis.del(&bucket).await.map_err(EngageFeedError::Redis)?;
        }
    }
    debug!("aggregation flush complete");
    Ok(())
}

fn parse_bucket(bucket: &str) -> Option<(String, String)> {
    // "agg:entity:{etype}:{eid}"
    let mut parts = bucket.splitn(4, ':');
    parts.next()?; // "agg"
    parts.next()?; // "entity"
    let etype = parts.next()?.to_string();
    let eid = parts.next()?.to_string();
    Some((etype, eid))
}

/// Opt-in disaster-recovery consumer (group `counter-rebuild`,
/// configured to start from the earliest offset): folds deltas
/// directly into the snapshot, bypassing the aggregation bucket
/// entirely, and acks after each successful fold.
pub async fn run_replay_consumer(consumer: StreamConsumer, mut redis: ConnectionManager, running: Arc<AtomicBool>) {
    // Ensure this consumer genuinely starts from the earliest offset
    // regardless of any committed progress from a prior run.
    if let Ok(metadata) = consumer.fetch_metadata(None, Duration::from_secs(5)) {
        let mut tpl = TopicPartitionList::new();
        for topic in metadata.topics() {
            for partition in topic.partitions() {
                let _ = tpl.add_partition_offset(topic.name(), partition.id(), Offset::Beginning);
            }
        }
        let _ = consumer.assign(&tpl);
    }

    let mut stream = consumer.stream();
    while running.load(Ordering::Relaxed) {
        let Some(message) = stream.next().await else { break };
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                warn!("counter-rebuild consumer error: {e}");
                continue;
            }
        };

        let Some(payload) = message.payload() else { continue };
        let event: CounterEventWire = match serde_json::from_slice(payload) {
            Ok(e) => e,
            Err(e) => {
                error!("malformed replay event, skipping: {e}");
                continue;
            }
        };

        let key = snapshot_key(&event.entity_type, &event.entity_id);
        match packed::add_segment(&mut redis, &key, event.idx, event.delta).await {
            Ok(_) => {
                if let Err(e) = consumer.commit_message(&message, rdkafka::consumer::CommitMode::Async) {
                    warn!("failed to commit counter-rebuild offset: {e}");
                }
            }
            Err(e) => warn!("replay fold failed for {key}, leaving un-acked: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_key_round_trips() {
        let key = agg_key("knowpost", "77");
        assert_eq!(parse_bucket(&key), Some(("knowpost".to_string(), "77".to_string())));
    }
}
