//! Relation read path (spec.md §4.I): reads the `uf:flws`/`uf:fans`
//! sorted-set caches Module H maintains, falling back to the DB and
//! backfilling the set on a miss; a small in-process top-K cache for
//! "big-V" accounts whose follower sorted set would otherwise be
//! rebuilt on every cold cache; three-state `relationStatus`; and the
//! throttled counter self-healing check.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::counters::entity::EntityCounterService;
use crate::counters::packed::UserMetric;
use crate::counters::user::UserCounterService;
use crate::error::{EngageFeedError, Result};
use crate::relations::processor::{follower_set_key, following_set_key};

/// Followers segment threshold (spec.md §4.I) above which the reader
/// consults the top-K cache instead of rebuilding the full sorted set
/// on every cold read.
pub const BIG_V_THRESHOLD: u32 = 500_000;
const TOP_K: isize = 500;
const TOP_K_TTL: Duration = Duration::from_secs(600);
const RELATION_SET_TTL_SECONDS: i64 = 2 * 60 * 60;

#[derive(Debug, Clone)]
pub struct RelationPage {
    pub user_ids: Vec<i64>,
    pub next_cursor: Option<i64>,
}

/// `following`/`followedBy`/`mutual` per spec.md §4.I's two
/// isFollowing checks, ANDed for mutuality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationStatus {
    pub following: bool,
    pub followed_by: bool,
    pub mutual: bool,
}

struct TopKEntry {
    ids: Vec<i64>,
    fetched_at: Instant,
}

/// Bespoke in-process cache of the top `TOP_K` member ids for accounts
/// over `BIG_V_THRESHOLD` followers, keyed by user id. `dashmap` alone
/// has no eviction, so this wraps a plain mutex-guarded map with a
/// size cap and drops the oldest entry once full -- the same tradeoff
/// the retrieval pack's `sharded_metrics` module accepts for a small,
/// frequently-read hot set.
struct TopKCache {
    entries: Mutex<HashMap<i64, TopKEntry>>,
    capacity: usize,
}

impl TopKCache {
    fn new(capacity: usize) -> Self {
        Self { entries: Mutex::new(HashMap::new()), capacity }
    }

    fn get(&self, user_id: i64) -> Option<Vec<i64>> {
        let entries = self.entries.lock().unwrap();
        entries.get(&user_id).filter(|e| e.fetched_at.elapsed() < TOP_K_TTL).map(|e| e.ids.clone())
    }

    fn put(&self, user_id: i64, ids: Vec<i64>) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.capacity && !entries.contains_key(&user_id)
            && let Some(&oldest) = entries.iter().min_by_key(|(_, v)| v.fetched_at).map(|(k, _)| k) {
                entries.remove(&oldest);
            }
        entries.insert(user_id, TopKEntry { ids, fetched_at: Instant::now() });
    }
}

#[derive(Clone)]
pub struct RelationReader {
    db: PgPool,
    redis: ConnectionManager,
    user_counters: UserCounterService,
    top_k: std::sync::Arc<TopKCache>,
    self_heal_throttle_seconds: u64,
}

impl RelationReader {
    pub fn new(
        db: PgPool,
        redis: ConnectionManager,
        user_counters: UserCounterService,
        self_heal_throttle_seconds: u64,
    ) -> Self {
        Self { db, redis, user_counters, top_k: std::sync::Arc::new(TopKCache::new(1000)), self_heal_throttle_seconds }
    }

    async fn is_following_db(&self, from_user_id: i64, to_user_id: i64) -> Result<bool> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM following WHERE from_user_id = $1 AND to_user_id = $2 AND rel_status = 1",
        )
        .bind(from_user_id)
        .bind(to_user_id)
        .fetch_one(&self.db)
        .await
        .map_err(EngageFeedError::Database)?;
        Ok(row.0 > 0)
    }

    pub async fn relation_status(&self, a: i64, b: i64) -> Result<RelationStatus> {
        let following = self.is_following_db(a, b).await?;
        let followed_by = self.is_following_db(b, a).await?;
        Ok(RelationStatus { following, followed_by, mutual: following && followed_by })
    }

    pub async fn list_following(&self, user_id: i64, limit: i64, offset: i64) -> Result<RelationPage> {
        self.list(user_id, limit, offset, &following_set_key(user_id), "following", "from_user_id", "to_user_id").await
    }

    pub async fn list_followers(&self, user_id: i64, limit: i64, offset: i64) -> Result<RelationPage> {
        self.list(user_id, limit, offset, &follower_set_key(user_id), "follower", "to_user_id", "from_user_id").await
    }

    /// Implements spec.md §4.I steps 1-3 for a single sorted set:
    /// ZREVRANGE hit returns directly; a big-V miss tries the top-K
    /// cache; an outright miss falls back to the DB, backfills the
    /// sorted set (and the top-K cache, if applicable), and re-issues
    /// the ZREVRANGE.
    #[allow(clippy::too_many_arguments)]
    async fn list(
        &self,
        user_id: i64,
        limit: i64,
        offset: i64,
        set_key: &str,
        table: &str,
        filter_col: &str,
        select_col: &str,
    ) -> Result<RelationPage> {
        let limit = limit.clamp(1, 200);
        let offset = offset.max(0);

        let mut redis = self.redis.clone();
        let cached: Vec<i64> =
            redis.zrevrange(set_key, offset as isize, (offset + limit - 1) as isize).await.map_err(EngageFeedError::Redis)?;
        if !cached.is_empty() {
            return Ok(RelationPage { user_ids: cached, next_cursor: None });
        }

        let followers = self.user_counters.read(user_id).await?.get(UserMetric::Followers as usize);
        let is_big_v = followers >= BIG_V_THRESHOLD;
        if is_big_v
            && let Some(top) = self.top_k.get(user_id)
        {
            let start = (offset as usize).min(top.len());
            let end = ((offset + limit) as usize).min(top.len());
            return Ok(RelationPage { user_ids: top[start..end].to_vec(), next_cursor: None });
        }

        let backfill_limit = (limit + offset).min(1000);
        let rows: Vec<(i64, i64, chrono::DateTime<chrono::Utc>)> = sqlx::query_as(&format!(
            "SELECT id, {select_col}, created_at FROM {table} \
             WHERE {filter_col} = $1 AND rel_status = 1 ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(user_id)
        .bind(backfill_limit)
        .fetch_all(&self.db)
        .await
        .map_err(EngageFeedError::Database)?;

        if !rows.is_empty() {
            let members: Vec<(i64, i64)> =
                rows.iter().map(|(_, member, created_at)| (created_at.timestamp_millis(), *member)).collect();
            let _: () = redis.zadd_multiple(set_key, &members).await.map_err(EngageFeedError::Redis)?;
            let _: () = redis.pexpire(set_key, RELATION_SET_TTL_SECONDS * 1000).await.map_err(EngageFeedError::Redis)?;
        }

        if is_big_v {
            let top_ids: Vec<i64> = rows.iter().take(TOP_K as usize).map(|(_, member, _)| *member).collect();
            self.top_k.put(user_id, top_ids);
        }

        let ids: Vec<i64> =
            redis.zrevrange(set_key, offset as isize, (offset + limit - 1) as isize).await.map_err(EngageFeedError::Redis)?;
        Ok(RelationPage { user_ids: ids, next_cursor: None })
    }

    /// Score-cursor pagination (spec.md §4.I `followingCursor`):
    /// `ZREVRANGEBYSCORE (-inf, cursor] LIMIT limit`, falling through
    /// to the DB and constraining the backfill to entries at or before
    /// the cursor timestamp.
    pub async fn list_following_cursor(&self, user_id: i64, limit: i64, cursor: Option<i64>) -> Result<RelationPage> {
        self.list_cursor(user_id, limit, cursor, &following_set_key(user_id), "following", "from_user_id", "to_user_id")
            .await
    }

    pub async fn list_followers_cursor(&self, user_id: i64, limit: i64, cursor: Option<i64>) -> Result<RelationPage> {
        self.list_cursor(user_id, limit, cursor, &follower_set_key(user_id), "follower", "to_user_id", "from_user_id")
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn list_cursor(
        &self,
        user_id: i64,
        limit: i64,
        cursor: Option<i64>,
        set_key: &str,
        table: &str,
        filter_col: &str,
        select_col: &str,
    ) -> Result<RelationPage> {
        let limit = limit.clamp(1, 200);
        let max_score = cursor.unwrap_or(i64::MAX);

        let mut redis = self.redis.clone();
        let ids_with_scores: Vec<(i64, i64)> = redis
            .zrevrangebyscore_limit_withscores(set_key, max_score, i64::MIN, 0, limit as isize)
            .await
            .map_err(EngageFeedError::Redis)?;

        if !ids_with_scores.is_empty() {
            let next_cursor = ids_with_scores.last().map(|(_, score)| *score);
            return Ok(RelationPage { user_ids: ids_with_scores.into_iter().map(|(id, _)| id).collect(), next_cursor });
        }

        let rows: Vec<(i64, chrono::DateTime<chrono::Utc>)> = match cursor {
            Some(c) => sqlx::query_as(&format!(
                "SELECT {select_col}, created_at FROM {table} \
                 WHERE {filter_col} = $1 AND rel_status = 1 AND created_at <= to_timestamp($2::double precision / 1000) \
                 ORDER BY created_at DESC LIMIT $3"
            ))
            .bind(user_id)
            .bind(c)
            .bind(limit)
            .fetch_all(&self.db)
            .await,
            None => sqlx::query_as(&format!(
                "SELECT {select_col}, created_at FROM {table} \
                 WHERE {filter_col} = $1 AND rel_status = 1 ORDER BY created_at DESC LIMIT $2"
            ))
            .bind(user_id)
            .bind(limit)
            .fetch_all(&self.db)
            .await,
        }
        .map_err(EngageFeedError::Database)?;

        if !rows.is_empty() {
            let members: Vec<(i64, i64)> = rows.iter().map(|(member, created_at)| (created_at.timestamp_millis(), *member)).collect();
            let _: () = redis.zadd_multiple(set_key, &members).await.map_err(EngageFeedError::Redis)?;
            let _: () = redis.pexpire(set_key, RELATION_SET_TTL_SECONDS * 1000).await.map_err(EngageFeedError::Redis)?;
        }

        let next_cursor = rows.last().map(|(_, created_at)| created_at.timestamp_millis());
        Ok(RelationPage { user_ids: rows.into_iter().map(|(member, _)| member).collect(), next_cursor })
    }

    /// Throttled self-healing check (spec.md §4.I): at most once per
    /// `SELF_HEAL_THROTTLE_SECONDS` per user, recomputes active
    /// following/follower counts from the DB and compares them against
    /// the packed user counter, triggering a full rebuild on mismatch.
    pub fn maybe_self_heal(&self, user_id: i64, entity_counters: EntityCounterService) {
        let reader = self.clone();
        tokio::spawn(async move {
            if let Err(e) = reader.self_heal_once(user_id, entity_counters).await {
                tracing::warn!("self-heal check failed for user {user_id}: {e}");
            }
        });
    }

    async fn self_heal_once(&self, user_id: i64, entity_counters: EntityCounterService) -> Result<()> {
        let mut redis = self.redis.clone();
        let throttle_key = format!("ucnt:chk:{user_id}");
        let claimed: bool = redis.set_nx(&throttle_key, 1).await.map_err(EngageFeedError::Redis)?;
        if !claimed {
            return Ok(());
        }
        let _: () = redis
            .expire(&throttle_key, self.self_heal_throttle_seconds as i64)
            .await
            .map_err(EngageFeedError::Redis)?;

        let followings = self.user_counters.count_active_followings(user_id).await?;
        let followers = self.user_counters.count_active_followers(user_id).await?;
        let snapshot = self.user_counters.read(user_id).await?;

        let mismatch = snapshot.get(UserMetric::Followings as usize) as i64 != followings
            || snapshot.get(UserMetric::Followers as usize) as i64 != followers;

        if mismatch {
            self.user_counters.rebuild_all_counters(user_id, &entity_counters).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_k_cache_evicts_oldest_when_full() {
        let cache = TopKCache::new(2);
        cache.put(1, vec![1]);
        std::thread::sleep(Duration::from_millis(5));
        cache.put(2, vec![2]);
        std::thread::sleep(Duration::from_millis(5));
        cache.put(3, vec![3]);
        assert!(cache.get(1).is_none());
        assert!(cache.get(3).is_some());
    }

    #[test]
    fn mutual_requires_both_directions() {
        let status = RelationStatus { following: true, followed_by: false, mutual: false };
        assert!(!status.mutual);
    }
}
