//! Packed-counter codec (spec.md §4.A).
//!
//! A fixed-layout byte blob: `SCHEMA_LEN` big-endian `u32` segments,
//! `FIELD_SIZE = 4` bytes each. Two schemas share the codec but use
//! disjoint index spaces; both are 1-based here (spec.md §9 Open
//! Question 5 — the source mixes 0-based and 1-based arithmetic
//! across its two codepaths, this implementation picks 1-based
//! everywhere and type-checks the index through `Schema`).

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::{EngageFeedError, Result};

pub const FIELD_SIZE: usize = 4;
pub const SCHEMA_LEN: usize = 5;
pub const BLOB_LEN: usize = SCHEMA_LEN * FIELD_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityMetric {
    Like = 1,
    Fav = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserMetric {
    Followings = 1,
    Followers = 2,
    Posts = 3,
    LikesReceived = 4,
    FavsReceived = 5,
}

/// A decoded packed counter: `SCHEMA_LEN` saturating `u32` segments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackedCounter {
    pub segments: [u32; SCHEMA_LEN],
}

impl PackedCounter {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn get(&self, idx_1based: usize) -> u32 {
        self.segments[idx_1based - 1]
    }

    pub fn set(&mut self, idx_1based: usize, value: u32) {
        self.segments[idx_1based - 1] = value;
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BLOB_LEN);
        for segment in &self.segments {
            buf.extend_from_slice(&segment.to_be_bytes());
        }
        buf
    }

    /// Decodes a blob, returning `None` (triggers rebuild in callers)
    /// when the length does not match exactly.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != BLOB_LEN {
            return None;
        }
        let mut segments = [0u32; SCHEMA_LEN];
        for (i, segment) in segments.iter_mut().enumerate() {
            let offset = i * FIELD_SIZE;
            let mut arr = [0u8; FIELD_SIZE];
            arr.copy_from_slice(&bytes[offset..offset + FIELD_SIZE]);
            *segment = u32::from_be_bytes(arr);
        }
        Some(Self { segments })
    }
}

/// Atomically adds `delta` (which may be negative) to the segment at
/// `idx_1based` within `key`, saturating at `[0, u32::MAX]`,
/// allocating a zero buffer first if the key is absent. Executed
/// server-side via `EVAL` so concurrent writers never race on a
/// client-side read-modify-write (grounded on the `EVAL`-based
/// distributed-lock/rate-limiter scripts in the retrieval pack).
const ADD_SEGMENT_SCRIPT: &str = r#"
local key = KEYS[1]
local schema_len = tonumber(ARGV[1])
local field_size = tonumber(ARGV[2])
local idx0 = tonumber(ARGV[3])
local delta = tonumber(ARGV[4])

local blob = redis.call('GET', key)
local len = schema_len * field_size
local bytes = {}
if blob and #blob == len then
    for i = 1, len do
        bytes[i] = string.byte(blob, i)
    end
else
    for i = 1, len do
        bytes[i] = 0
    end
end

local offset = idx0 * field_size
local current = 0
for i = 1, field_size do
    current = current * 256 + bytes[offset + i]
end

local updated = current + delta
if updated < 0 then
    updated = 0
end
if updated > 4294967295 then
    updated = 4294967295
end

local v = updated
for i = field_size, 1, -1 do
    bytes[offset + i] = v % 256
    v = math.floor(v / 256)
end

local out = {}
for i = 1, len do
    out[i] = string.char(bytes[i])
end
redis.call('SET', key, table.concat(out))
return updated
"#;

/// Same as `ADD_SEGMENT_SCRIPT` but also deletes `agg_field` from
/// `agg_key` in the same EVAL, closing the fold/delete race spec.md
/// §9 Open Question 1 calls out: a crash between folding a delta into
/// the snapshot and deleting the aggregation-bucket field would
/// otherwise double-count on restart.
const ADD_SEGMENT_AND_DRAIN_SCRIPT: &str = r#"
local key = KEYS[1]
local agg_key = KEYS[2]
local schema_len = tonumber(ARGV[1])
local field_size = tonumber(ARGV[2])
local idx0 = tonumber(ARGV[3])
local delta = tonumber(ARGV[4])
local agg_field = ARGV[5]

local blob = redis.call('GET', key)
local len = schema_len * field_size
local bytes = {}
if blob and #blob == len then
    for i = 1, len do
        bytes[i] = string.byte(blob, i)
    end
else
    for i = 1, len do
        bytes[i] = 0
    end
end

local offset = idx0 * field_size
local current = 0
for i = 1, field_size do
    current = current * 256 + bytes[offset + i]
end

local updated = current + delta
if updated < 0 then
    updated = 0
end
if updated > 4294967295 then
    updated = 4294967295
end

local v = updated
for i = field_size, 1, -1 do
    bytes[offset + i] = v % 256
    v = math.floor(v / 256)
end

local out = {}
for i = 1, len do
    out[i] = string.char(bytes[i])
end
redis.call('SET', key, table.concat(out))
redis.call('HDEL', agg_key, agg_field)
return updated
"#;

pub async fn add_segment(
    redis: &mut ConnectionManager,
    key: &str,
    idx_1based: usize,
    delta: i64,
) -> Result<u32> {
    let idx0 = idx_1based - 1;
    let result: i64 = redis::cmd("EVAL")
        .arg(ADD_SEGMENT_SCRIPT)
        .arg(1)
        .arg(key)
        .arg(SCHEMA_LEN)
        .arg(FIELD_SIZE)
        .arg(idx0)
        .arg(delta)
        .query_async(redis)
        .await
        .map_err(EngageFeedError::Redis)?;
    Ok(result as u32)
}

pub async fn add_segment_and_drain(
    redis: &mut ConnectionManager,
    key: &str,
    agg_key: &str,
    agg_field: &str,
    idx_1based: usize,
    delta: i64,
) -> Result<u32> {
    let idx0 = idx_1based - 1;
    let result: i64 = redis::cmd("EVAL")
        .arg(ADD_SEGMENT_AND_DRAIN_SCRIPT)
        .arg(2)
        .arg(key)
        .arg(agg_key)
        .arg(SCHEMA_LEN)
        .arg(FIELD_SIZE)
        .arg(idx0)
        .arg(delta)
        .arg(agg_field)
        .query_async(redis)
        .await
        .map_err(EngageFeedError::Redis)?;
    Ok(result as u32)
}

pub async fn read_blob(redis: &mut ConnectionManager, key: &str) -> Result<Option<Vec<u8>>> {
    let value: Option<Vec<u8>> = redis.get(key).await.map_err(EngageFeedError::Redis)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let mut counter = PackedCounter::zero();
        counter.set(EntityMetric::Like as usize, 7);
        counter.set(EntityMetric::Fav as usize, 3);
        let blob = counter.encode();
        assert_eq!(blob.len(), BLOB_LEN);
        let decoded = PackedCounter::decode(&blob).unwrap();
        assert_eq!(decoded, counter);
        assert_eq!(decoded.get(EntityMetric::Like as usize), 7);
        assert_eq!(decoded.get(EntityMetric::Fav as usize), 3);
    }

    #[test]
    fn short_blob_fails_to_decode() {
        assert!(PackedCounter::decode(&[0u8; 3]).is_none());
    }

    #[test]
    fn missing_blob_is_all_zero() {
        let counter = PackedCounter::zero();
        assert_eq!(counter.get(UserMetric::Followers as usize), 0);
    }
}
