//! Sharded user bitmap (spec.md §4.B).
//!
//! `CHUNK_SIZE = 32_768` bits per shard. For user `u`:
//! `chunk = u / CHUNK_SIZE`, `bit = u mod CHUNK_SIZE`. Shard
//! enumeration for rebuild goes through an explicit index set
//! (`bm:idx:{metric}:{etype}:{eid}`) rather than `KEYS`, per spec.md
//! §9 Open Question 4 — production must not scan the whole keyspace.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::{EngageFeedError, Result};

pub const CHUNK_SIZE: i64 = 32_768;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOp {
    Add,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    /// Bit flipped 0 -> 1; caller must emit a +1 delta event.
    Added,
    /// Bit flipped 1 -> 0; caller must emit a -1 delta event.
    Removed,
    /// Bit already in the target state; no event emitted.
    Unchanged,
}

pub fn chunk_and_bit(user_id: i64) -> (i64, i64) {
    (user_id / CHUNK_SIZE, user_id % CHUNK_SIZE)
}

fn shard_key(metric: &str, etype: &str, eid: &str, chunk: i64) -> String {
    format!("bm:{metric}:{etype}:{eid}:{chunk}")
}

fn index_key(metric: &str, etype: &str, eid: &str) -> String {
    format!("bm:idx:{metric}:{etype}:{eid}")
}

/// Read-check-write folded into one `EVAL` (same shape as Module A's
/// packed-counter script) so two concurrent togglers for the same bit
/// can't both observe the pre-flip state and both report a change.
const TOGGLE_SCRIPT: &str = r#"
local key = KEYS[1]
local idx_key = KEYS[2]
local bit = tonumber(ARGV[1])
local target = tonumber(ARGV[2])
local chunk = ARGV[3]

local current = redis.call('GETBIT', key, bit)
if current == target then
    return 0
end

redis.call('SETBIT', key, bit, target)
redis.call('SADD', idx_key, chunk)
if target == 1 then
    return 1
else
    return 2
end
"#;

/// Atomically flips the bit for `user_id` toward `op`'s target state.
/// Idempotent and commutative per `(user_id, metric, entity)`.
pub async fn toggle(
    redis: &mut ConnectionManager,
    metric: &str,
    etype: &str,
    eid: &str,
    user_id: i64,
    op: ToggleOp,
) -> Result<ToggleOutcome> {
    let (chunk, bit) = chunk_and_bit(user_id);
    let key = shard_key(metric, etype, eid, chunk);
    let idx_key = index_key(metric, etype, eid);
    let target: i64 = if op == ToggleOp::Add { 1 } else { 0 };

    let outcome: i64 = redis::cmd("EVAL")
        .arg(TOGGLE_SCRIPT)
        .arg(2)
        .arg(&key)
        .arg(&idx_key)
        .arg(bit)
        .arg(target)
        .arg(chunk)
        .query_async(redis)
        .await
        .map_err(EngageFeedError::Redis)?;

    Ok(match outcome {
        1 => ToggleOutcome::Added,
        2 => ToggleOutcome::Removed,
        _ => ToggleOutcome::Unchanged,
    })
}

pub async fn get_bit(
    redis: &mut ConnectionManager,
    metric: &str,
    etype: &str,
    eid: &str,
    user_id: i64,
) -> Result<bool> {
    let (chunk, bit) = chunk_and_bit(user_id);
    let key = shard_key(metric, etype, eid, chunk);
    redis.getbit(&key, bit as usize).await.map_err(EngageFeedError::Redis)
}

/// Sums `BITCOUNT` across every shard registered in the index set for
/// `(metric, etype, eid)`, pipelined in a single round trip.
pub async fn population_count(
    redis: &mut ConnectionManager,
    metric: &str,
    etype: &str,
    eid: &str,
) -> Result<u32> {
    let idx_key = index_key(metric, etype, eid);
    let chunks: Vec<i64> = redis.smembers(&idx_key).await.map_err(EngageFeedError::Redis)?;
    if chunks.is_empty() {
        return Ok(0);
    }

    let mut pipe = redis::pipe();
    for chunk in &chunks {
        pipe.bitcount(shard_key(metric, etype, eid, *chunk));
    }
    let counts: Vec<i64> = pipe.query_async(redis).await.map_err(EngageFeedError::Redis)?;
    Ok(counts.into_iter().sum::<i64>() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_edges() {
        assert_eq!(chunk_and_bit(32_767), (0, 32_767));
        assert_eq!(chunk_and_bit(32_768), (1, 0));
    }

    #[test]
    fn key_shapes() {
        assert_eq!(shard_key("like", "knowpost", "7", 1), "bm:like:knowpost:7:1");
        assert_eq!(index_key("like", "knowpost", "7"), "bm:idx:like:knowpost:7");
    }
}
