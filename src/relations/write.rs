//! Relation write path (spec.md §4.F): token-bucket admission, then
//! a DB transaction that writes the relation row and its outbox row
//! together. The scripted token bucket is grounded on
//! `caddy::enterprise::ratelimit::distributed`'s Lua token-bucket
//! EVAL, adapted to the fixed capacity=100/refill=1-per-second the
//! spec hard-codes.

use redis::aio::ConnectionManager;
use serde_json::json;
use sqlx::PgPool;

use crate::config::FollowRateLimitSettings;
use crate::error::{EngageFeedError, Result};

const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local now_seconds = tonumber(ARGV[3])

local tokens = tonumber(redis.call('HGET', key, 'tokens'))
local last = tonumber(redis.call('HGET', key, 'ts'))
if tokens == nil then
    tokens = capacity
    last = now_seconds
end

local elapsed = math.max(0, now_seconds - last)
tokens = math.min(capacity, tokens + elapsed * refill_rate)

local allowed = 0
if tokens >= 1 then
    tokens = tokens - 1
    allowed = 1
end

redis.call('HSET', key, 'tokens', tokens, 'ts', now_seconds)
redis.call('PEXPIRE', key, 60000)
return allowed
"#;

fn bucket_key(from_user_id: i64) -> String {
    format!("rl:follow:{from_user_id}")
}

async fn admit(redis: &mut ConnectionManager, from_user_id: i64, settings: &FollowRateLimitSettings) -> Result<bool> {
    let now_seconds = chrono::Utc::now().timestamp() as f64;
    let allowed: i32 = redis::cmd("EVAL")
        .arg(TOKEN_BUCKET_SCRIPT)
        .arg(1)
        .arg(bucket_key(from_user_id))
        .arg(settings.capacity)
        .arg(settings.refill_per_second)
        .arg(now_seconds)
        .query_async(redis)
        .await
        .map_err(EngageFeedError::Redis)?;
    Ok(allowed == 1)
}

#[derive(Clone)]
pub struct RelationWriter {
    redis: ConnectionManager,
    db: PgPool,
    rate_limit: FollowRateLimitSettings,
}

impl RelationWriter {
    pub fn new(redis: ConnectionManager, db: PgPool, rate_limit: FollowRateLimitSettings) -> Self {
        Self { redis, db, rate_limit }
    }

    /// Returns `Ok(false)` when the rate limiter refuses admission,
    /// `Ok(true)` once the relation and outbox rows have committed.
    pub async fn follow(&self, from_user_id: i64, to_user_id: i64) -> Result<bool> {
        let mut redis = self.redis.clone();
        if !admit(&mut redis, from_user_id, &self.rate_limit).await? {
            return Ok(false);
        }

        let mut tx = self.db.begin().await.map_err(EngageFeedError::Database)?;

        let inserted: (i64,) = sqlx::query_as(
            "INSERT INTO following (from_user_id, to_user_id, rel_status) VALUES ($1, $2, 1) RETURNING id",
        )
        .bind(from_user_id)
        .bind(to_user_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(EngageFeedError::Database)?;

        sqlx::query(
            "INSERT INTO follower (from_user_id, to_user_id, rel_status) VALUES ($1, $2, 1)",
        )
        .bind(from_user_id)
        .bind(to_user_id)
        .execute(&mut *tx)
        .await
        .map_err(EngageFeedError::Database)?;

        let payload = json!({
            "type": "FollowCreated",
            "fromUserId": from_user_id,
            "toUserId": to_user_id,
            "id": inserted.0,
        })
        .to_string();

        sqlx::query(
            "INSERT INTO outbox (aggregate_type, aggregate_id, type, payload) VALUES ('relation', $1, 'FollowCreated', $2)",
        )
        .bind(inserted.0.to_string())
        .bind(payload)
        .execute(&mut *tx)
        .await
        .map_err(EngageFeedError::Database)?;

        tx.commit().await.map_err(EngageFeedError::Database)?;
        Ok(true)
    }

    pub async fn unfollow(&self, from_user_id: i64, to_user_id: i64) -> Result<bool> {
        let mut tx = self.db.begin().await.map_err(EngageFeedError::Database)?;

        let updated: Option<(i64,)> = sqlx::query_as(
            "UPDATE following SET rel_status = 0 WHERE from_user_id = $1 AND to_user_id = $2 AND rel_status = 1 \
             RETURNING id",
        )
        .bind(from_user_id)
        .bind(to_user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(EngageFeedError::Database)?;

        let Some((relation_id,)) = updated else {
            tx.rollback().await.map_err(EngageFeedError::Database)?;
            return Ok(false);
        };

        sqlx::query(
            "UPDATE follower SET rel_status = 0 WHERE from_user_id = $1 AND to_user_id = $2 AND rel_status = 1",
        )
        .bind(from_user_id)
        .bind(to_user_id)
        .execute(&mut *tx)
        .await
        .map_err(EngageFeedError::Database)?;

        let payload = json!({
            "type": "FollowCanceled",
            "fromUserId": from_user_id,
            "toUserId": to_user_id,
            "id": relation_id,
        })
        .to_string();

        sqlx::query(
            "INSERT INTO outbox (aggregate_type, aggregate_id, type, payload) VALUES ('relation', $1, 'FollowCanceled', $2)",
        )
        .bind(format!("{from_user_id}:{to_user_id}"))
        .bind(payload)
        .execute(&mut *tx)
        .await
        .map_err(EngageFeedError::Database)?;

        tx.commit().await.map_err(EngageFeedError::Database)?;
        Ok(true)
    }

    pub async fn is_following(&self, from_user_id: i64, to_user_id: i64) -> Result<bool> {
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_key_format() {
        assert_eq!(bucket_key(1), "rl:follow:1");
    }
}
