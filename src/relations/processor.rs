//! Relation event processor (spec.md §4.H): consumes `canal-outbox`,
//! dedupes by a deterministic function of the payload (`SETNX` + TTL,
//! the same idempotency-key shape `harborgrid-justin-caddy`'s
//! scheduler uses for lock values), maintains the `uf:flws`/`uf:fans`
//! sorted-set read caches Module I serves from, and applies the
//! follow/unfollow side effects to the user-dimension counters. A
//! fold failure retries the same message in place instead of silently
//! advancing past it (spec.md §9 Open Question 3).

use futures_util::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, warn};

use crate::counters::user::UserCounterService;

const DEDUP_TTL_SECONDS: u64 = 600;
const RETRY_BACKOFF_MS: u64 = 500;
const RELATION_SET_TTL_SECONDS: i64 = 2 * 60 * 60;

#[derive(Debug, Deserialize)]
struct RelationEventWire {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(rename = "fromUserId")]
    from_user_id: i64,
    #[serde(rename = "toUserId")]
    to_user_id: i64,
    id: Option<i64>,
}

pub fn following_set_key(user_id: i64) -> String {
    format!("uf:flws:{user_id}")
}

pub fn follower_set_key(user_id: i64) -> String {
    format!("uf:fans:{user_id}")
}

fn dedup_key(event: &RelationEventWire) -> String {
    format!(
        "dedup:rel:{}:{}:{}:{}",
        event.event_type,
        event.from_user_id,
        event.to_user_id,
        event.id.unwrap_or(0)
    )
}

pub async fn run(
    consumer: StreamConsumer,
    mut redis: ConnectionManager,
    user_counters: UserCounterService,
    running: Arc<AtomicBool>,
) {
    let mut stream = consumer.stream();
    while running.load(Ordering::Relaxed) {
        let Some(message) = stream.next().await else { break };
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                warn!("relation-outbox-consumer error: {e}");
                continue;
            }
        };

        let Some(payload) = message.payload() else { continue };
        let event: RelationEventWire = match serde_json::from_slice(payload) {
            Ok(e) => e,
            Err(e) => {
                error!("malformed relation event, skipping: {e}");
                continue;
            }
        };

        loop {
            match apply(&mut redis, &user_counters, &event).await {
                Ok(()) => {
                    if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                        warn!("failed to commit relation-outbox offset: {e}");
                    }
                    break;
                }
                Err(e) => {
                    warn!("relation event fold failed, retrying in place: {e}");
                    sleep(Duration::from_millis(RETRY_BACKOFF_MS)).await;
                    if !running.load(Ordering::Relaxed) {
                        return;
                    }
                }
            }
        }
    }
}

async fn apply(
    redis: &mut ConnectionManager,
    user_counters: &UserCounterService,
    event: &RelationEventWire,
) -> crate::error::Result<()> {
    let key = dedup_key(event);
    let claimed: bool = redis.set_nx(&key, 1).await.map_err(crate::error::EngageFeedError::Redis)?;
    if !claimed {
        return Ok(());
    }
    let _: () = redis
        .expire(&key, DEDUP_TTL_SECONDS as i64)
        .await
        .map_err(crate::error::EngageFeedError::Redis)?;

    let flws = following_set_key(event.from_user_id);
    let fans = follower_set_key(event.to_user_id);

    let delta: i64 = match event.event_type.as_str() {
        "FollowCreated" => {
            let now_ms = chrono::Utc::now().timestamp_millis();
            let _: () = redis.zadd(&flws, event.to_user_id, now_ms).await.map_err(crate::error::EngageFeedError::Redis)?;
            let _: () =
                redis.zadd(&fans, event.from_user_id, now_ms).await.map_err(crate::error::EngageFeedError::Redis)?;
            let _: () =
                redis.pexpire(&flws, RELATION_SET_TTL_SECONDS * 1000).await.map_err(crate::error::EngageFeedError::Redis)?;
            let _: () =
                redis.pexpire(&fans, RELATION_SET_TTL_SECONDS * 1000).await.map_err(crate::error::EngageFeedError::Redis)?;
            1
        }
        "FollowCanceled" => {
            let _: () = redis.zrem(&flws, event.to_user_id).await.map_err(crate::error::EngageFeedError::Redis)?;
            let _: () = redis.zrem(&fans, event.from_user_id).await.map_err(crate::error::EngageFeedError::Redis)?;
            let _: () =
                redis.pexpire(&flws, RELATION_SET_TTL_SECONDS * 1000).await.map_err(crate::error::EngageFeedError::Redis)?;
            let _: () =
                redis.pexpire(&fans, RELATION_SET_TTL_SECONDS * 1000).await.map_err(crate::error::EngageFeedError::Redis)?;
            -1
        }
        other => {
            warn!("unrecognized relation event type {other}, ignoring");
            return Ok(());
        }
    };

    user_counters.increment_followings(event.from_user_id, delta).await?;
    user_counters.increment_followers(event.to_user_id, delta).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_key_uses_type_from_to_and_id() {
        let event = RelationEventWire { event_type: "FollowCreated".into(), from_user_id: 1, to_user_id: 2, id: Some(9) };
        assert_eq!(dedup_key(&event), "dedup:rel:FollowCreated:1:2:9");
    }

    #[test]
    fn dedup_key_falls_back_to_zero_id() {
        let event = RelationEventWire { event_type: "FollowCanceled".into(), from_user_id: 1, to_user_id: 2, id: None };
        assert_eq!(dedup_key(&event), "dedup:rel:FollowCanceled:1:2:0");
    }

    #[test]
    fn set_keys_match_read_path_shape() {
        assert_eq!(following_set_key(1), "uf:flws:1");
        assert_eq!(follower_set_key(2), "uf:fans:2");
    }
}
