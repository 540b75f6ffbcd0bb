//! Crate-wide error taxonomy.
//!
//! Mirrors the abstract kinds from the engagement substrate design:
//! validation failures and policy denials are surfaced to callers,
//! everything else degrades in place (see `counters::entity` and
//! `feed::cache` for the degrade paths).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngageFeedError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("concurrency refused: {0}")]
    ConcurrencyRefused(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("message bus error: {0}")]
    Bus(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("data corruption: {0}")]
    DataCorruption(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, EngageFeedError>;
