//! Entity counter service (spec.md §4.C): composes the bitmap fact
//! layer (Module B) and the packed-counter snapshot (Module A) behind
//! `like`/`unlike`/`fav`/`unfav`, `getCounts`/`getCountsBatch`, and
//! the corruption-triggered rebuild protocol (distributed lock +
//! rate limiter + exponential backoff).
//!
//! The distributed lock is grounded on
//! `caddy::scheduling::scheduler::DistributedLock`'s `SET NX EX` /
//! Lua-checked release, generalized with a watchdog task that
//! re-`EXPIRE`s the lock periodically so a slow rebuild is never cut
//! off mid-flight (Redisson's watchdog semantics, which spec.md §6
//! names as the preferred alternative to a fixed `lock.ttl-ms`).

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use crate::config::RebuildSettings;
use crate::counters::bitmap::{self, ToggleOp, ToggleOutcome};
use crate::counters::packed::{self, EntityMetric, PackedCounter, BLOB_LEN};
use crate::error::{EngageFeedError, Result};

/// Delivered synchronously, on the same task as the mutation, before
/// the mutating call returns — spec.md §4.C requires listeners to
/// observe the delta before the write completes.
#[derive(Debug, Clone)]
pub struct CounterDelta {
    pub entity_type: String,
    pub entity_id: String,
    pub metric: EntityMetric,
    pub user_id: i64,
    pub delta: i64,
}

fn snapshot_key(etype: &str, eid: &str) -> String {
    format!("cnt:v1:{etype}:{eid}")
}

fn agg_key(etype: &str, eid: &str) -> String {
    format!("agg:entity:{etype}:{eid}")
}

fn rebuild_backoff_exp_key(etype: &str, eid: &str) -> String {
    format!("backoff:sds-rebuild:exp:{etype}:{eid}")
}

fn rebuild_backoff_until_key(etype: &str, eid: &str) -> String {
    format!("backoff:sds-rebuild:until:{etype}:{eid}")
}

fn rebuild_rate_key(etype: &str, eid: &str) -> String {
    format!("rl:sds-rebuild:{etype}:{eid}")
}

fn rebuild_lock_key(etype: &str, eid: &str) -> String {
    format!("lock:sds-rebuild:{etype}:{eid}")
}

const FIXED_WINDOW_PERMIT_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local count = redis.call('INCR', key)
if count == 1 then
    redis.call('EXPIRE', key, window)
end
if count > limit then
    return 0
else
    return 1
end
"#;

const LOCK_RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

const LOCK_EXTEND_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

struct RebuildLock {
    redis: ConnectionManager,
    key: String,
    value: String,
    watchdog: tokio::task::JoinHandle<()>,
}

impl RebuildLock {
    async fn try_acquire(mut redis: ConnectionManager, key: &str, ttl_ms: u64) -> Result<Option<Self>> {
        let value = Uuid::new_v4().to_string();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut redis)
            .await
            .map_err(EngageFeedError::Redis)?;

        if acquired.is_none() {
            return Ok(None);
        }

        let watchdog = {
            let mut redis = redis.clone();
            let key = key.to_string();
            let value = value.clone();
            tokio::spawn(async move {
                loop {
                    sleep(Duration::from_millis(ttl_ms / 3)).await;
                    let extended: std::result::Result<i32, _> = redis::cmd("EVAL")
                        .arg(LOCK_EXTEND_SCRIPT)
                        .arg(1)
                        .arg(&key)
                        .arg(&value)
                        .arg(ttl_ms)
                        .query_async(&mut redis)
                        .await;
                    if !matches!(extended, Ok(1)) {
                        break;
                    }
                }
            })
        };

        Ok(Some(Self { redis, key: key.to_string(), value, watchdog }))
    }

    async fn release(self) {
        self.watchdog.abort();
        let mut redis = self.redis;
        let _: std::result::Result<i32, _> = redis::cmd("EVAL")
            .arg(LOCK_RELEASE_SCRIPT)
            .arg(1)
            .arg(&self.key)
            .arg(&self.value)
            .query_async(&mut redis)
            .await;
    }
}

#[derive(Clone)]
pub struct EntityCounterService {
    redis: ConnectionManager,
    settings: RebuildSettings,
    notifications: broadcast::Sender<CounterDelta>,
    producer: Option<Arc<rdkafka::producer::FutureProducer>>,
}

impl EntityCounterService {
    pub fn new(
        redis: ConnectionManager,
        settings: RebuildSettings,
        producer: Option<Arc<rdkafka::producer::FutureProducer>>,
    ) -> Self {
        let (notifications, _) = broadcast::channel(1024);
        Self { redis, settings, notifications, producer }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CounterDelta> {
        self.notifications.subscribe()
    }

    async fn apply_toggle(
        &self,
        etype: &str,
        eid: &str,
        metric: EntityMetric,
        metric_name: &str,
        user_id: i64,
        op: ToggleOp,
    ) -> Result<bool> {
        let mut redis = self.redis.clone();
        let outcome = bitmap::toggle(&mut redis, metric_name, etype, eid, user_id, op).await?;

        let delta = match outcome {
            ToggleOutcome::Added => 1i64,
            ToggleOutcome::Removed => -1i64,
            ToggleOutcome::Unchanged => return Ok(false),
        };

        let event = CounterDelta {
            entity_type: etype.to_string(),
            entity_id: eid.to_string(),
            metric,
            user_id,
            delta,
        };

        // Local listeners (feed invalidation) observe the delta
        // before this call returns -- send before any awaited bus
        // publish so ordering matches spec.md's same-task guarantee.
        let _ = self.notifications.send(event.clone());

        if let Some(producer) = &self.producer {
            let payload = serde_json::json!({
                "entityType": event.entity_type,
                "entityId": event.entity_id,
                "metric": metric_name,
                "idx": metric as i64,
                "userId": event.user_id,
                "delta": event.delta,
            })
            .to_string();
            if let Err(e) = crate::bus::publish(producer, crate::bus::TOPIC_COUNTER_EVENTS, eid, &payload).await {
                tracing::warn!("counter event publish failed for {etype}:{eid}: {e}");
            }
        }

        Ok(true)
    }

    pub async fn like(&self, etype: &str, eid: &str, user_id: i64) -> Result<bool> {
        self.apply_toggle(etype, eid, EntityMetric::Like, "like", user_id, ToggleOp::Add).await
    }

    pub async fn unlike(&self, etype: &str, eid: &str, user_id: i64) -> Result<bool> {
        self.apply_toggle(etype, eid, EntityMetric::Like, "like", user_id, ToggleOp::Remove).await
    }

    pub async fn fav(&self, etype: &str, eid: &str, user_id: i64) -> Result<bool> {
        self.apply_toggle(etype, eid, EntityMetric::Fav, "fav", user_id, ToggleOp::Add).await
    }

    pub async fn unfav(&self, etype: &str, eid: &str, user_id: i64) -> Result<bool> {
        self.apply_toggle(etype, eid, EntityMetric::Fav, "fav", user_id, ToggleOp::Remove).await
    }

    pub async fn is_liked(&self, etype: &str, eid: &str, user_id: i64) -> Result<bool> {
        let mut redis = self.redis.clone();
        bitmap::get_bit(&mut redis, "like", etype, eid, user_id).await
    }

    pub async fn is_faved(&self, etype: &str, eid: &str, user_id: i64) -> Result<bool> {
        let mut redis = self.redis.clone();
        bitmap::get_bit(&mut redis, "fav", etype, eid, user_id).await
    }

    async fn in_backoff(&self, etype: &str, eid: &str) -> Result<bool> {
        let mut redis = self.redis.clone();
        let until: Option<i64> = redis
            .get(rebuild_backoff_until_key(etype, eid))
            .await
            .map_err(EngageFeedError::Redis)?;
        let Some(until) = until else { return Ok(false) };
        let now = chrono::Utc::now().timestamp_millis();
        Ok(now < until)
    }

    async fn escalate_backoff(&self, etype: &str, eid: &str) -> Result<()> {
        let mut redis = self.redis.clone();
        let exp_key = rebuild_backoff_exp_key(etype, eid);
        let level: i64 = redis.incr(&exp_key, 1).await.map_err(EngageFeedError::Redis)?;
        let level = level.min(10);
        let _: () = redis.set(&exp_key, level).await.map_err(EngageFeedError::Redis)?;

        let delay_ms = (self.settings.backoff_base_ms.saturating_mul(1u64 << level.max(0)))
            .min(self.settings.backoff_max_ms);
        let until = chrono::Utc::now().timestamp_millis() + delay_ms as i64;

        let until_key = rebuild_backoff_until_key(etype, eid);
        let _: () = redis.set(&until_key, until).await.map_err(EngageFeedError::Redis)?;
        let ttl_seconds = (delay_ms / 1000).max(1) + 1;
        let _: () = redis.expire(&until_key, ttl_seconds as i64).await.map_err(EngageFeedError::Redis)?;
        Ok(())
    }

    async fn reset_backoff(&self, etype: &str, eid: &str) -> Result<()> {
        let mut redis = self.redis.clone();
        let _: () = redis
            .del(&[rebuild_backoff_exp_key(etype, eid), rebuild_backoff_until_key(etype, eid)])
            .await
            .map_err(EngageFeedError::Redis)?;
        Ok(())
    }

    async fn acquire_rebuild_permit(&self, etype: &str, eid: &str) -> Result<bool> {
        let mut redis = self.redis.clone();
        let key = rebuild_rate_key(etype, eid);
        let allowed: i32 = redis::cmd("EVAL")
            .arg(FIXED_WINDOW_PERMIT_SCRIPT)
            .arg(1)
            .arg(&key)
            .arg(self.settings.rate_permits)
            .arg(self.settings.rate_window_seconds)
            .query_async(&mut redis)
            .await
            .map_err(EngageFeedError::Redis)?;
        Ok(allowed == 1)
    }

    /// Rebuilds the snapshot for `(etype, eid)` from the bitmap fact
    /// layer, under a try-acquire distributed lock, and drains the
    /// aggregation bucket so already-folded deltas aren't re-applied.
    /// Returns zeros (without doing any work) when in backoff or when
    /// the rate limiter / lock refuse -- spec.md §4.C step 1-3.
    async fn rebuild(&self, etype: &str, eid: &str) -> Result<PackedCounter> {
        if self.in_backoff(etype, eid).await? {
            return Ok(PackedCounter::zero());
        }

        if !self.acquire_rebuild_permit(etype, eid).await? {
            self.escalate_backoff(etype, eid).await?;
            return Ok(PackedCounter::zero());
        }

        let lock_key = rebuild_lock_key(etype, eid);
        let lock = RebuildLock::try_acquire(self.redis.clone(), &lock_key, self.settings.lock_ttl_ms).await?;
        let Some(lock) = lock else {
            self.escalate_backoff(etype, eid).await?;
            return Ok(PackedCounter::zero());
        };

        let mut redis = self.redis.clone();
        let mut counter = PackedCounter::zero();
        for metric in [EntityMetric::Like, EntityMetric::Fav] {
            let metric_name = if metric == EntityMetric::Like { "like" } else { "fav" };
            let count = bitmap::population_count(&mut redis, metric_name, etype, eid).await?;
            counter.set(metric as usize, count);
        }

        let _: () = redis.set(snapshot_key(etype, eid), counter.encode()).await.map_err(EngageFeedError::Redis)?;

        let agg = agg_key(etype, eid);
        for metric in [EntityMetric::Like, EntityMetric::Fav] {
            let _: () = redis
                .hdel(&agg, (metric as usize).to_string())
                .await
                .map_err(EngageFeedError::Redis)?;
        }

        lock.release().await;
        self.reset_backoff(etype, eid).await?;

        Ok(counter)
    }

    /// Returns the requested metrics, rebuilding the snapshot first
    /// if it is absent or has an unexpected length.
    pub async fn get_counts(&self, etype: &str, eid: &str, metrics: &[EntityMetric]) -> Result<HashMap<&'static str, u32>> {
        let mut redis = self.redis.clone();
        let blob = packed::read_blob(&mut redis, &snapshot_key(etype, eid)).await?;

        let counter = match blob {
            Some(bytes) if bytes.len() == BLOB_LEN => PackedCounter::decode(&bytes).unwrap(),
            _ => self.rebuild(etype, eid).await?,
        };

        Ok(metrics
            .iter()
            .map(|m| (metric_name(*m), counter.get(*m as usize)))
            .collect())
    }

    /// Pipelined batch read across many entities. Entities with a
    /// missing or malformed snapshot return zero rather than
    /// triggering a rebuild, keeping list-rendering latency bounded
    /// (spec.md §4.C "batch read").
    pub async fn get_counts_batch(
        &self,
        etype: &str,
        ids: &[String],
        metrics: &[EntityMetric],
    ) -> Result<HashMap<String, HashMap<&'static str, u32>>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut redis = self.redis.clone();
        let keys: Vec<String> = ids.iter().map(|id| snapshot_key(etype, id)).collect();
        let blobs: Vec<Option<Vec<u8>>> = redis.get(&keys).await.map_err(EngageFeedError::Redis)?;

        let mut out = HashMap::new();
        for (id, blob) in ids.iter().zip(blobs) {
            let counter = blob
                .filter(|b| b.len() == BLOB_LEN)
                .and_then(|b| PackedCounter::decode(&b))
                .unwrap_or_default();
            let entry = metrics.iter().map(|m| (metric_name(*m), counter.get(*m as usize))).collect();
            out.insert(id.clone(), entry);
        }
        Ok(out)
    }
}

fn metric_name(metric: EntityMetric) -> &'static str {
    match metric {
        EntityMetric::Like => "like",
        EntityMetric::Fav => "fav",
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn backoff_delay_doubles_and_clamps() {
        let base = 500u64;
        let max = 30_000u64;
        let delay = |level: u32| base.saturating_mul(1u64 << level).min(max);
        assert_eq!(delay(0), 500);
        assert_eq!(delay(3), 4_000);
        assert_eq!(delay(10), 30_000);
        assert_eq!(delay(20), 30_000);
    }
}
