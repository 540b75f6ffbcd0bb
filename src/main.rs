use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::info;
use warp::{Filter, Reply};

use engagefeed::bus;
use engagefeed::config::AppConfig;
use engagefeed::counters::entity::EntityCounterService;
use engagefeed::counters::packed::EntityMetric;
use engagefeed::counters::user::UserCounterService;
use engagefeed::db;
use engagefeed::error::EngageFeedError;
use engagefeed::feed::cache::FeedCache;
use engagefeed::feed::hotkey::HotKeyDetector;
use engagefeed::feed::invalidation;
use engagefeed::relations::cdc;
use engagefeed::relations::processor;
use engagefeed::relations::read::RelationReader;
use engagefeed::relations::write::RelationWriter;

#[derive(Clone)]
struct AppState {
    entity_counters: EntityCounterService,
    user_counters: UserCounterService,
    relation_writer: RelationWriter,
    relation_reader: RelationReader,
    feed_cache: FeedCache,
    db_pool: PgPool,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
struct SuccessResponse {
    success: bool,
}

#[derive(Debug, Deserialize)]
struct FollowBody {
    target_user_id: i64,
}

#[derive(Debug, Deserialize)]
struct LikeBody {
    post_id: i64,
}

#[derive(Debug, Serialize)]
struct CountsResponse {
    counts: HashMap<&'static str, u32>,
}

#[derive(Debug)]
struct AuthError;
impl warp::reject::Reject for AuthError {}

fn extract_user_id(auth_token: Option<String>) -> Result<i64, warp::Rejection> {
    match auth_token.and_then(|t| t.trim_start_matches("user_").parse::<i64>().ok()) {
        Some(id) => Ok(id),
        None => Err(warp::reject::custom(AuthError)),
    }
}

async fn handle_rejection(err: warp::Rejection) -> Result<impl Reply, std::convert::Infallible> {
    if err.find::<AuthError>().is_some() {
        Ok(warp::reply::with_status(
            warp::reply::json(&ErrorResponse { error: "unauthorized".into() }),
            warp::http::StatusCode::UNAUTHORIZED,
        ))
    } else {
        Ok(warp::reply::with_status(
            warp::reply::json(&ErrorResponse { error: "internal error".into() }),
            warp::http::StatusCode::INTERNAL_SERVER_ERROR,
        ))
    }
}

fn map_err(e: EngageFeedError) -> warp::Rejection {
    tracing::error!("request failed: {e}");
    warp::reject::reject()
}

async fn follow_handler(user_id: i64, body: FollowBody, state: AppState) -> Result<impl Reply, warp::Rejection> {
    let ok = state.relation_writer.follow(user_id, body.target_user_id).await.map_err(map_err)?;
    Ok(warp::reply::json(&SuccessResponse { success: ok }))
}

async fn unfollow_handler(user_id: i64, body: FollowBody, state: AppState) -> Result<impl Reply, warp::Rejection> {
    let ok = state.relation_writer.unfollow(user_id, body.target_user_id).await.map_err(map_err)?;
    Ok(warp::reply::json(&SuccessResponse { success: ok }))
}

async fn like_handler(user_id: i64, body: LikeBody, state: AppState) -> Result<impl Reply, warp::Rejection> {
    let ok = state
        .entity_counters
        .like("knowpost", &body.post_id.to_string(), user_id)
        .await
        .map_err(map_err)?;
    Ok(warp::reply::json(&SuccessResponse { success: ok }))
}

async fn unlike_handler(user_id: i64, body: LikeBody, state: AppState) -> Result<impl Reply, warp::Rejection> {
    let ok = state
        .entity_counters
        .unlike("knowpost", &body.post_id.to_string(), user_id)
        .await
        .map_err(map_err)?;
    Ok(warp::reply::json(&SuccessResponse { success: ok }))
}

async fn post_counts_handler(post_id: i64, state: AppState) -> Result<impl Reply, warp::Rejection> {
    let counts = state
        .entity_counters
        .get_counts("knowpost", &post_id.to_string(), &[EntityMetric::Like, EntityMetric::Fav])
        .await
        .map_err(map_err)?;
    Ok(warp::reply::json(&CountsResponse { counts }))
}

async fn user_counts_handler(user_id: i64, state: AppState) -> Result<impl Reply, warp::Rejection> {
    let counter = state.user_counters.read(user_id).await.map_err(map_err)?;
    Ok(warp::reply::json(&CountsResponse {
        counts: HashMap::from([
            ("followings", counter.get(engagefeed::counters::packed::UserMetric::Followings as usize)),
            ("followers", counter.get(engagefeed::counters::packed::UserMetric::Followers as usize)),
            ("posts", counter.get(engagefeed::counters::packed::UserMetric::Posts as usize)),
        ]),
    }))
}

async fn get_feed_handler(user_id: i64, state: AppState) -> Result<impl Reply, warp::Rejection> {
    let reader = state.relation_reader.clone();
    let entity_counters = state.entity_counters.clone();
    state.relation_reader.maybe_self_heal(user_id, entity_counters);
    let page = state
        .feed_cache
        .get_my_feed(user_id, 1, 50, move |page, size| async move {
            let offset = (page - 1) * size;
            let following = reader.list_following(user_id, size, offset).await?;
            Ok(following.user_ids)
        })
        .await
        .map_err(map_err)?;
    Ok(warp::reply::json(&page))
}

async fn get_public_feed_handler(viewer_id: Option<i64>, state: AppState) -> Result<impl Reply, warp::Rejection> {
    let db = state.db_pool.clone();
    let page = state
        .feed_cache
        .get_public_feed(1, 20, viewer_id, move |page, size| async move {
            let offset = (page - 1) * size;
            let rows: Vec<(i64,)> = sqlx::query_as(
                "SELECT id FROM know_post WHERE published = true AND deleted = false \
                 ORDER BY created_at DESC LIMIT $1 OFFSET $2",
            )
            .bind(size + 1)
            .bind(offset)
            .fetch_all(&db)
            .await
            .map_err(EngageFeedError::Database)?;
            Ok(rows.into_iter().map(|(id,)| id).collect())
        })
        .await
        .map_err(map_err)?;
    Ok(warp::reply::json(&page))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let config = AppConfig::load().expect("failed to load configuration");

    let db_pool = db::connect(&config.database_url).await.expect("failed to connect to postgres");
    db::ensure_schema(&db_pool).await.expect("failed to ensure schema");

    let redis_client = redis::Client::open(config.redis_url.clone()).expect("invalid redis url");
    let redis: ConnectionManager = redis_client.get_connection_manager().await.expect("failed to connect to redis");

    let producer = bus::producer(&config.kafka_brokers).expect("failed to create kafka producer");
    let producer = Arc::new(producer);

    let entity_counters = EntityCounterService::new(redis.clone(), config.rebuild.clone(), Some(producer.clone()));
    let user_counters = UserCounterService::new(redis.clone(), db_pool.clone());
    let relation_writer = RelationWriter::new(redis.clone(), db_pool.clone(), config.follow_rate_limit.clone());
    let relation_reader =
        RelationReader::new(db_pool.clone(), redis.clone(), user_counters.clone(), config.self_heal_window_seconds);
    let hot_keys = HotKeyDetector::new(config.hot_key.clone());
    let feed_cache = FeedCache::new(redis.clone(), config.cache.clone(), hot_keys.clone(), entity_counters.clone());

    let running = Arc::new(AtomicBool::new(true));

    let agg_consumer = bus::consumer(&config.kafka_brokers, bus::GROUP_COUNTER_AGG, false).expect("agg consumer");
    bus::subscribe(&agg_consumer, bus::TOPIC_COUNTER_EVENTS).expect("agg subscribe");
    tokio::spawn(engagefeed::counters::events::run_aggregation_consumer(agg_consumer, redis.clone(), running.clone()));
    tokio::spawn(engagefeed::counters::events::run_aggregation_flusher(redis.clone(), running.clone()));

    if config.rebuild.replay_enabled {
        let replay_consumer =
            bus::consumer(&config.kafka_brokers, bus::GROUP_COUNTER_REBUILD, true).expect("replay consumer");
        bus::subscribe(&replay_consumer, bus::TOPIC_COUNTER_EVENTS).expect("replay subscribe");
        tokio::spawn(engagefeed::counters::events::run_replay_consumer(replay_consumer, redis.clone(), running.clone()));
    }

    tokio::spawn(cdc::run(producer.as_ref().clone(), db_pool.clone(), config.cdc.clone(), running.clone()));

    let relation_consumer =
        bus::consumer(&config.kafka_brokers, bus::GROUP_RELATION_OUTBOX_CONSUMER, false).expect("relation consumer");
    bus::subscribe(&relation_consumer, bus::TOPIC_CANAL_OUTBOX).expect("relation subscribe");
    tokio::spawn(processor::run(relation_consumer, redis.clone(), user_counters.clone(), running.clone()));

    tokio::spawn(hot_keys.clone().run_rotator(running.clone()));
    tokio::spawn(invalidation::run(
        entity_counters.subscribe(),
        feed_cache.clone(),
        db_pool.clone(),
        user_counters.clone(),
    ));

    let state =
        AppState { entity_counters, user_counters, relation_writer, relation_reader, feed_cache, db_pool: db_pool.clone() };

    let raw_auth = warp::header::optional::<String>("authorization")
        .or(warp::query::<HashMap<String, String>>().map(|params: HashMap<String, String>| params.get("auth_token").cloned()))
        .unify();

    let auth = raw_auth.and_then(|auth: Option<String>| async move { extract_user_id(auth) });

    let optional_auth = raw_auth.map(|auth: Option<String>| {
        auth.and_then(|t| t.trim_start_matches("user_").parse::<i64>().ok())
    });

    let with_state = warp::any().map({
        let state = state.clone();
        move || state.clone()
    });

    let follow = warp::post()
        .and(warp::path!("v1" / "users" / "follow"))
        .and(auth)
        .and(warp::body::json())
        .and(with_state.clone())
        .and_then(follow_handler);

    let unfollow = warp::post()
        .and(warp::path!("v1" / "users" / "unfollow"))
        .and(auth)
        .and(warp::body::json())
        .and(with_state.clone())
        .and_then(unfollow_handler);

    let like = warp::post()
        .and(warp::path!("v1" / "posts" / "like"))
        .and(auth)
        .and(warp::body::json())
        .and(with_state.clone())
        .and_then(like_handler);

    let unlike = warp::post()
        .and(warp::path!("v1" / "posts" / "unlike"))
        .and(auth)
        .and(warp::body::json())
        .and(with_state.clone())
        .and_then(unlike_handler);

    let post_counts = warp::get()
        .and(warp::path!("v1" / "posts" / i64 / "counts"))
        .and(with_state.clone())
        .and_then(post_counts_handler);

    let get_feed = warp::get()
        .and(warp::path!("v1" / "me" / "feed"))
        .and(auth)
        .and(with_state.clone())
        .and_then(get_feed_handler);

    let user_counts = warp::get()
        .and(warp::path!("v1" / "users" / i64 / "counts"))
        .and(with_state.clone())
        .and_then(user_counts_handler);

    let get_public_feed = warp::get()
        .and(warp::path!("v1" / "feed" / "public"))
        .and(optional_auth)
        .and(with_state.clone())
        .and_then(get_public_feed_handler);

    let routes = follow
        .or(unfollow)
        .or(like)
        .or(unlike)
        .or(post_counts)
        .or(user_counts)
        .or(get_feed)
        .or(get_public_feed)
        .recover(handle_rejection);

    info!("engagefeed server listening on 127.0.0.1:3030");
    warp::serve(routes).run(([127, 0, 0, 1], 3030)).await;
}
