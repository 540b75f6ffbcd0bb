//! User-dimension packed counter (spec.md §4.D): five segments
//! (followings, followers, posts, likesReceived, favsReceived) keyed
//! `ucnt:{uid}`, incremented atomically via Module A's script and
//! periodically rebuilt from authoritative sources.

use redis::aio::ConnectionManager;
use sqlx::PgPool;

use crate::counters::entity::EntityCounterService;
use crate::counters::packed::{self, PackedCounter, UserMetric, BLOB_LEN};
use crate::error::{EngageFeedError, Result};

fn user_counter_key(user_id: i64) -> String {
    format!("ucnt:{user_id}")
}

#[derive(Clone)]
pub struct UserCounterService {
    redis: ConnectionManager,
    db: PgPool,
}

impl UserCounterService {
    pub fn new(redis: ConnectionManager, db: PgPool) -> Self {
        Self { redis, db }
    }

    async fn increment(&self, user_id: i64, metric: UserMetric, delta: i64) -> Result<u32> {
        let mut redis = self.redis.clone();
        packed::add_segment(&mut redis, &user_counter_key(user_id), metric as usize, delta).await
    }

    pub async fn increment_followings(&self, user_id: i64, delta: i64) -> Result<u32> {
        self.increment(user_id, UserMetric::Followings, delta).await
    }

    pub async fn increment_followers(&self, user_id: i64, delta: i64) -> Result<u32> {
        self.increment(user_id, UserMetric::Followers, delta).await
    }

    pub async fn increment_posts(&self, user_id: i64, delta: i64) -> Result<u32> {
        self.increment(user_id, UserMetric::Posts, delta).await
    }

    pub async fn increment_likes_received(&self, user_id: i64, delta: i64) -> Result<u32> {
        self.increment(user_id, UserMetric::LikesReceived, delta).await
    }

    pub async fn increment_favs_received(&self, user_id: i64, delta: i64) -> Result<u32> {
        self.increment(user_id, UserMetric::FavsReceived, delta).await
    }

    pub async fn read(&self, user_id: i64) -> Result<PackedCounter> {
        let mut redis = self.redis.clone();
        let blob = packed::read_blob(&mut redis, &user_counter_key(user_id)).await?;
        Ok(blob.filter(|b| b.len() == BLOB_LEN).and_then(|b| PackedCounter::decode(&b)).unwrap_or_default())
    }

    pub async fn count_active_followings(&self, user_id: i64) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM following WHERE from_user_id = $1 AND rel_status = 1",
        )
        .bind(user_id)
        .fetch_one(&self.db)
        .await
        .map_err(EngageFeedError::Database)?;
        Ok(row.0)
    }

    pub async fn count_active_followers(&self, user_id: i64) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM follower WHERE to_user_id = $1 AND rel_status = 1",
        )
        .bind(user_id)
        .fetch_one(&self.db)
        .await
        .map_err(EngageFeedError::Database)?;
        Ok(row.0)
    }

    /// Full rebuild from authoritative sources (spec.md §4.D): counts
    /// active relations from the DB and sums per-post like/fav counts
    /// via the entity counter service, then overwrites all five
    /// segments in a single SET.
    pub async fn rebuild_all_counters(&self, user_id: i64, entity_counters: &EntityCounterService) -> Result<PackedCounter> {
        let followings = self.count_active_followings(user_id).await?;
        let followers = self.count_active_followers(user_id).await?;

        let post_ids: Vec<(i64,)> = sqlx::query_as(
            "SELECT id FROM know_post WHERE author_id = $1 AND published = true AND deleted = false",
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await
        .map_err(EngageFeedError::Database)?;

        let post_id_strings: Vec<String> = post_ids.iter().map(|(id,)| id.to_string()).collect();
        let batch = entity_counters
            .get_counts_batch(
                "knowpost",
                &post_id_strings,
                &[crate::counters::packed::EntityMetric::Like, crate::counters::packed::EntityMetric::Fav],
            )
            .await?;

        let mut likes_received = 0u32;
        let mut favs_received = 0u32;
        for counts in batch.values() {
            likes_received += counts.get("like").copied().unwrap_or(0);
            favs_received += counts.get("fav").copied().unwrap_or(0);
        }

        let mut counter = PackedCounter::zero();
        counter.set(UserMetric::Followings as usize, followings as u32);
        counter.set(UserMetric::Followers as usize, followers as u32);
        counter.set(UserMetric::Posts as usize, post_ids.len() as u32);
        counter.set(UserMetric::LikesReceived as usize, likes_received);
        counter.set(UserMetric::FavsReceived as usize, favs_received);

        let mut redis = self.redis.clone();
        let _: () = redis::AsyncCommands::set(&mut redis, user_counter_key(user_id), counter.encode())
            .await
            .map_err(EngageFeedError::Redis)?;

        Ok(counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_counter_key_format() {
        assert_eq!(user_counter_key(42), "ucnt:42");
    }
}
