//! Feed invalidation bridge (spec.md §4.L): listens on the entity
//! counter service's broadcast channel and, for every like/fav delta
//! on a post, credits the post owner's user counter, overlays the
//! delta onto the post's count fragment, and patches every
//! currently-cached page referencing it in place. Subscribing to a
//! `tokio::sync::broadcast` channel is this crate's substitute for the
//! source system's same-thread synchronous local notification
//! callback (spec.md §9): the sender fires before the mutating call
//! returns, so this task observes the delta as soon as it is
//! scheduled.

use sqlx::PgPool;
use tokio::sync::broadcast;
use tracing::warn;

use crate::counters::entity::CounterDelta;
use crate::counters::packed::EntityMetric;
use crate::counters::user::UserCounterService;
use crate::feed::cache::FeedCache;

const KNOW_POST_ENTITY_TYPE: &str = "knowpost";

async fn post_owner(db: &PgPool, post_id: i64) -> crate::error::Result<Option<i64>> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT author_id FROM know_post WHERE id = $1")
        .bind(post_id)
        .fetch_optional(db)
        .await
        .map_err(crate::error::EngageFeedError::Database)?;
    Ok(row.map(|(id,)| id))
}

pub async fn run(
    mut notifications: broadcast::Receiver<CounterDelta>,
    cache: FeedCache,
    db: PgPool,
    user_counters: UserCounterService,
) {
    loop {
        match notifications.recv().await {
            Ok(delta) => {
                if delta.entity_type != KNOW_POST_ENTITY_TYPE {
                    continue;
                }
                let Ok(post_id) = delta.entity_id.parse::<i64>() else { continue };

                match post_owner(&db, post_id).await {
                    Ok(Some(owner_id)) => {
                        let result = match delta.metric {
                            EntityMetric::Like => user_counters.increment_likes_received(owner_id, delta.delta).await,
                            EntityMetric::Fav => user_counters.increment_favs_received(owner_id, delta.delta).await,
                        };
                        if let Err(e) = result {
                            warn!("failed to credit owner counter for post {post_id}: {e}");
                        }
                    }
                    Ok(None) => warn!("counter delta for unknown post {post_id}, skipping owner credit"),
                    Err(e) => warn!("post owner lookup failed for post {post_id}: {e}"),
                }

                if let Err(e) = cache.apply_like_fav_delta(post_id, delta.metric, delta.delta).await {
                    warn!("feed fragment/page patch failed for post {post_id}: {e}");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("feed invalidation lagged, missed {skipped} counter deltas");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
