//! Feed cache engine (spec.md §4.J): a local LRU+TTL page cache (L1)
//! in front of a distributed page-JSON cache (L2) and a distributed
//! fragment tree of per-item and per-count fragments (L3) that lets a
//! mutation patch one post without invalidating every page that
//! embeds it. Origin loads are collapsed through
//! [`crate::singleflight::SingleFlight`] and every freshly built page
//! is reverse-indexed by hour slot so a like/fav delta can find and
//! patch exactly the pages that reference it, grounded on the
//! tiered-backend design in the retrieval pack's cache manager and the
//! versioned key-builder in its `nova-cache` crate.

use dashmap::DashMap;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::CacheSettings;
use crate::counters::entity::EntityCounterService;
use crate::counters::packed::EntityMetric;
use crate::error::{EngageFeedError, Result};
use crate::feed::hotkey::HotKeyDetector;
use crate::singleflight::SingleFlight;

/// Distinguishes a cached-but-absent post from one that was never
/// looked up -- spec.md §9's negative-cache sentinel requirement.
const ITEM_PRESENT: &str = "OK";
const ITEM_ABSENT: &str = "NULL";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedCounts {
    pub like: u32,
    pub fav: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedItem {
    pub id: i64,
    pub counts: FeedCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_liked: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_faved: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedPage {
    pub items: Vec<FeedItem>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdsListEntry {
    ids: Vec<i64>,
    has_more: bool,
}

struct L1Entry {
    value: String,
    expires_at: Instant,
}

/// Capacity-bounded local tier. Eviction is size-triggered rather than
/// timer-driven: once over capacity, the single oldest-inserted entry
/// is dropped to make room, matching the LRU-ish tradeoff the pack's
/// multi-tier cache manager takes for its L1.
struct LocalTier {
    entries: DashMap<String, L1Entry>,
    capacity: usize,
}

impl LocalTier {
    fn new(capacity: usize) -> Self {
        Self { entries: DashMap::new(), capacity }
    }

    fn get(&self, key: &str) -> Option<String> {
        let entry = self.entries.get(key)?;
        if entry.expires_at < Instant::now() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    fn set(&self, key: &str, value: String, ttl: Duration) {
        if self.entries.len() >= self.capacity
            && !self.entries.contains_key(key)
            && let Some(oldest) = self.entries.iter().min_by_key(|e| e.expires_at).map(|e| e.key().clone())
        {
            self.entries.remove(&oldest);
        }
        self.entries.insert(key.to_string(), L1Entry { value, expires_at: Instant::now() + ttl });
    }

    /// Rewrites an already-cached entry's value while leaving its
    /// expiry untouched -- the "patch in place" half of spec.md
    /// §4.L's invalidation listener. A no-op if the key isn't cached.
    fn patch(&self, key: &str, value: String) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.value = value;
        }
    }

    fn remove(&self, key: &str) {
        self.entries.remove(key);
    }
}

fn hour_slot(when: chrono::DateTime<chrono::Utc>) -> String {
    when.format("%Y%m%d%H").to_string()
}

fn public_index_key(post_id: i64, slot: &str) -> String {
    format!("feed:public:index:{post_id}:{slot}")
}

fn public_pages_index_key() -> &'static str {
    "feed:public:pages:index"
}

fn mine_pages_index_key(viewer_id: i64) -> String {
    format!("feed:mine:{viewer_id}:pages:index")
}

fn public_page_key(page: i64, size: i64) -> String {
    format!("feed:public:v1:{size}:{page}")
}

fn public_ids_key(page: i64, size: i64) -> String {
    format!("feed:ids:v1:public:{size}:{page}")
}

fn mine_page_key(viewer_id: i64, page: i64, size: i64) -> String {
    format!("feed:mine:{viewer_id}:v1:{size}:{page}")
}

fn item_fragment_key(post_id: i64) -> String {
    format!("feed:item:v1:{post_id}")
}

fn count_fragment_key(post_id: i64) -> String {
    format!("feed:count:v1:{post_id}")
}

fn detail_key(post_id: i64) -> String {
    format!("knowpost:detail:v1:{post_id}")
}

fn jitter_ttl(base_seconds: u64, jitter_seconds: u64) -> Duration {
    let jitter = if jitter_seconds == 0 { 0 } else { rand::thread_rng().gen_range(0..jitter_seconds) };
    Duration::from_secs(base_seconds + jitter)
}

#[derive(Clone)]
pub struct FeedCache {
    redis: ConnectionManager,
    settings: CacheSettings,
    local: Arc<LocalTier>,
    hot_keys: HotKeyDetector,
    single_flight: Arc<SingleFlight<String>>,
    entity_counters: EntityCounterService,
}

impl FeedCache {
    pub fn new(
        redis: ConnectionManager,
        settings: CacheSettings,
        hot_keys: HotKeyDetector,
        entity_counters: EntityCounterService,
    ) -> Self {
        let capacity = (settings.public_max_size + settings.mine_max_size) as usize;
        Self {
            redis,
            settings,
            local: Arc::new(LocalTier::new(capacity.max(1))),
            hot_keys,
            single_flight: Arc::new(SingleFlight::new()),
            entity_counters,
        }
    }

    async fn overlay(&self, mut page: FeedPage, viewer_id: Option<i64>) -> FeedPage {
        let Some(viewer_id) = viewer_id else { return page };
        for item in &mut page.items {
            item.is_liked = self.entity_counters.is_liked("knowpost", &item.id.to_string(), viewer_id).await.ok();
            item.is_faved = self.entity_counters.is_faved("knowpost", &item.id.to_string(), viewer_id).await.ok();
        }
        page
    }

    /// Public feed read path (spec.md §4.J steps 1-4): local page hit,
    /// then fragment-tree assembly, then the distributed page cache,
    /// then a single-flight-collapsed DB origin load that populates
    /// every tier plus the per-item reverse index.
    pub async fn get_public_feed<F, Fut>(&self, page: i64, size: i64, viewer_id: Option<i64>, origin: F) -> Result<FeedPage>
    where
        F: FnOnce(i64, i64) -> Fut,
        Fut: std::future::Future<Output = Result<Vec<i64>>>,
    {
        let page = page.max(1);
        let size = size.clamp(1, 50);
        let page_key = public_page_key(page, size);
        let ids_key = public_ids_key(page, size);

        self.hot_keys.record_hit(&page_key);
        let heat = self.hot_keys.heat(&page_key);
        let base_ttl = self.settings.public_ttl_seconds + self.hot_keys.ttl_extension_seconds(heat);

        if let Some(raw) = self.local.get(&page_key)
            && let Ok(page_val) = serde_json::from_str::<FeedPage>(&raw)
        {
            return Ok(self.overlay(page_val, viewer_id).await);
        }

        if let Some(entry) = self.get_cached_ids(&ids_key).await?
            && let Some(page_val) = self.assemble_from_fragments(&entry).await?
        {
            let raw = serde_json::to_string(&page_val).map_err(EngageFeedError::Serde)?;
            self.local.set(&page_key, raw, jitter_ttl(base_ttl, 5));
            return Ok(self.overlay(page_val, viewer_id).await);
        }

        let mut redis = self.redis.clone();
        let remote: Option<String> = redis.get(&page_key).await.map_err(EngageFeedError::Redis)?;
        if let Some(raw) = remote
            && let Ok(page_val) = serde_json::from_str::<FeedPage>(&raw)
        {
            self.repair_fragments(&ids_key, &page_val).await?;
            self.local.set(&page_key, raw, jitter_ttl(base_ttl, 5));
            return Ok(self.overlay(page_val, viewer_id).await);
        }

        let page_key_owned = page_key.clone();
        let ids_key_owned = ids_key.clone();
        let raw = self
            .single_flight
            .run(&page_key, move || async move {
                let mut ids = origin(page, size).await?;
                let has_more = ids.len() as i64 > size;
                ids.truncate(size as usize);

                let page_val = self.build_page(&ids, has_more).await?;
                self.write_fragments(&ids_key_owned, &IdsListEntry { ids: ids.clone(), has_more }, &page_val).await?;
                self.index_page_for_post(&page_key_owned, &ids).await?;

                let raw = serde_json::to_string(&page_val).map_err(EngageFeedError::Serde)?;
                let _: () = redis
                    .set_ex(&page_key_owned, &raw, jitter_ttl(base_ttl, 5).as_secs().max(1))
                    .await
                    .map_err(EngageFeedError::Redis)?;
                let _: () = redis.sadd(public_pages_index_key(), &page_key_owned).await.map_err(EngageFeedError::Redis)?;
                Ok::<String, EngageFeedError>(raw)
            })
            .await?;

        self.local.set(&page_key, raw.clone(), jitter_ttl(base_ttl, 5));
        let page_val: FeedPage = serde_json::from_str(&raw).map_err(EngageFeedError::Serde)?;
        Ok(self.overlay(page_val, viewer_id).await)
    }

    /// Personalized feed (spec.md §4.J `mine`): no fragment tree,
    /// shorter base TTL, flags computed once at write time and cached
    /// alongside counts because the cache key already embeds the
    /// viewer.
    pub async fn get_my_feed<F, Fut>(&self, viewer_id: i64, page: i64, size: i64, origin: F) -> Result<FeedPage>
    where
        F: FnOnce(i64, i64) -> Fut,
        Fut: std::future::Future<Output = Result<Vec<i64>>>,
    {
        let page = page.max(1);
        let size = size.clamp(1, 50);
        let page_key = mine_page_key(viewer_id, page, size);

        self.hot_keys.record_hit(&page_key);
        let heat = self.hot_keys.heat(&page_key);
        let base_ttl = self.settings.mine_ttl_seconds + self.hot_keys.ttl_extension_seconds(heat);

        if let Some(raw) = self.local.get(&page_key)
            && let Ok(page_val) = serde_json::from_str::<FeedPage>(&raw)
        {
            return Ok(page_val);
        }

        let mut redis = self.redis.clone();
        let remote: Option<String> = redis.get(&page_key).await.map_err(EngageFeedError::Redis)?;
        if let Some(raw) = remote {
            self.local.set(&page_key, raw.clone(), jitter_ttl(base_ttl, 20));
            return serde_json::from_str(&raw).map_err(EngageFeedError::Serde);
        }

        let page_key_owned = page_key.clone();
        let raw = self
            .single_flight
            .run(&page_key, move || async move {
                let mut ids = origin(page, size).await?;
                let has_more = ids.len() as i64 > size;
                ids.truncate(size as usize);

                let mut page_val = self.build_page(&ids, has_more).await?;
                page_val = self.overlay(page_val, Some(viewer_id)).await;

                let raw = serde_json::to_string(&page_val).map_err(EngageFeedError::Serde)?;
                let _: () = redis
                    .set_ex(&page_key_owned, &raw, jitter_ttl(base_ttl, 20).as_secs().max(1))
                    .await
                    .map_err(EngageFeedError::Redis)?;
                let _: () = redis
                    .sadd(mine_pages_index_key(viewer_id), &page_key_owned)
                    .await
                    .map_err(EngageFeedError::Redis)?;
                Ok::<String, EngageFeedError>(raw)
            })
            .await?;

        self.local.set(&page_key, raw.clone(), jitter_ttl(base_ttl, 20));
        serde_json::from_str(&raw).map_err(EngageFeedError::Serde)
    }

    async fn build_page(&self, ids: &[i64], has_more: bool) -> Result<FeedPage> {
        if ids.is_empty() {
            return Ok(FeedPage { items: Vec::new(), has_more });
        }
        let id_strings: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        let counts = self
            .entity_counters
            .get_counts_batch("knowpost", &id_strings, &[EntityMetric::Like, EntityMetric::Fav])
            .await?;
        let items = ids
            .iter()
            .map(|id| {
                let entry = counts.get(&id.to_string());
                let like = entry.and_then(|c| c.get("like")).copied().unwrap_or(0);
                let fav = entry.and_then(|c| c.get("fav")).copied().unwrap_or(0);
                FeedItem { id: *id, counts: FeedCounts { like, fav }, is_liked: None, is_faved: None }
            })
            .collect();
        Ok(FeedPage { items, has_more })
    }

    async fn get_cached_ids(&self, ids_key: &str) -> Result<Option<IdsListEntry>> {
        let mut redis = self.redis.clone();
        let raw: Option<String> = redis.get(ids_key).await.map_err(EngageFeedError::Redis)?;
        Ok(raw.and_then(|r| serde_json::from_str(&r).ok()))
    }

    /// Assembles a page from a cached ids list plus per-item and
    /// per-count fragments (spec.md §4.J step 2). Returns `None` on
    /// any fragment gap rather than patchwork-filling individual ids,
    /// falling through to a full origin reload.
    async fn assemble_from_fragments(&self, entry: &IdsListEntry) -> Result<Option<FeedPage>> {
        if entry.ids.is_empty() {
            return Ok(Some(FeedPage { items: Vec::new(), has_more: entry.has_more }));
        }

        let mut redis = self.redis.clone();
        let item_keys: Vec<String> = entry.ids.iter().map(|id| item_fragment_key(*id)).collect();
        let item_raw: Vec<Option<String>> = redis.get(&item_keys).await.map_err(EngageFeedError::Redis)?;
        if item_raw.iter().any(Option::is_none) {
            return Ok(None);
        }

        let live_ids: Vec<i64> = entry
            .ids
            .iter()
            .zip(item_raw.iter())
            .filter(|(_, v)| v.as_deref() != Some(ITEM_ABSENT))
            .map(|(id, _)| *id)
            .collect();

        if live_ids.is_empty() {
            return Ok(Some(FeedPage { items: Vec::new(), has_more: entry.has_more }));
        }

        let count_keys: Vec<String> = live_ids.iter().map(|id| count_fragment_key(*id)).collect();
        let count_raw: Vec<Option<String>> = redis.get(&count_keys).await.map_err(EngageFeedError::Redis)?;

        let missing: Vec<i64> =
            live_ids.iter().zip(count_raw.iter()).filter(|(_, v)| v.is_none()).map(|(id, _)| *id).collect();
        if !missing.is_empty() {
            let id_strings: Vec<String> = missing.iter().map(|id| id.to_string()).collect();
            let fetched = self
                .entity_counters
                .get_counts_batch("knowpost", &id_strings, &[EntityMetric::Like, EntityMetric::Fav])
                .await?;
            for (id, id_string) in missing.iter().zip(id_strings.iter()) {
                let entry = fetched.get(id_string);
                let counts = FeedCounts {
                    like: entry.and_then(|c| c.get("like")).copied().unwrap_or(0),
                    fav: entry.and_then(|c| c.get("fav")).copied().unwrap_or(0),
                };
                let raw = serde_json::to_string(&counts).map_err(EngageFeedError::Serde)?;
                let _: () = redis
                    .set_ex(count_fragment_key(*id), raw, jitter_ttl(self.settings.ids_ttl_seconds, 10).as_secs().max(1))
                    .await
                    .map_err(EngageFeedError::Redis)?;
            }
        }

        let count_raw: Vec<Option<String>> = redis.get(&count_keys).await.map_err(EngageFeedError::Redis)?;
        let items = live_ids
            .into_iter()
            .zip(count_raw)
            .map(|(id, raw)| {
                let counts = raw.and_then(|r| serde_json::from_str(&r).ok()).unwrap_or_default();
                FeedItem { id, counts, is_liked: None, is_faved: None }
            })
            .collect();

        Ok(Some(FeedPage { items, has_more: entry.has_more }))
    }

    /// Writes the ids list, per-item, and per-count fragments for a
    /// freshly built page, TTL-aligned to the ids list (spec.md §4.J
    /// step 4).
    async fn write_fragments(&self, ids_key: &str, entry: &IdsListEntry, page: &FeedPage) -> Result<()> {
        let ttl = jitter_ttl(self.settings.ids_ttl_seconds, 15);
        let mut redis = self.redis.clone();

        let ids_raw = serde_json::to_string(entry).map_err(EngageFeedError::Serde)?;
        let _: () =
            redis.set_ex(ids_key, ids_raw, ttl.as_secs().max(1)).await.map_err(EngageFeedError::Redis)?;

        for item in &page.items {
            let _: () = redis
                .set_ex(item_fragment_key(item.id), ITEM_PRESENT, ttl.as_secs().max(1))
                .await
                .map_err(EngageFeedError::Redis)?;
            let counts_raw = serde_json::to_string(&item.counts).map_err(EngageFeedError::Serde)?;
            let _: () = redis
                .set_ex(count_fragment_key(item.id), counts_raw, ttl.as_secs().max(1))
                .await
                .map_err(EngageFeedError::Redis)?;
        }

        let present: std::collections::HashSet<i64> = page.items.iter().map(|i| i.id).collect();
        for id in &entry.ids {
            if !present.contains(id) {
                let _: () = redis
                    .set_ex(item_fragment_key(*id), ITEM_ABSENT, ttl.as_secs().max(1))
                    .await
                    .map_err(EngageFeedError::Redis)?;
            }
        }
        Ok(())
    }

    /// Repairs the fragment tree from an already-deserialized
    /// distributed page (spec.md §4.J step 3: "repair the fragment
    /// tree asynchronously from the page contents").
    async fn repair_fragments(&self, ids_key: &str, page: &FeedPage) -> Result<()> {
        let entry = IdsListEntry { ids: page.items.iter().map(|i| i.id).collect(), has_more: page.has_more };
        self.write_fragments(ids_key, &entry, page).await
    }

    /// Registers `post_id` as embedded in `page_key`'s current hour
    /// slot, so a later mutation on that post can find and invalidate
    /// the page without scanning every cached key.
    async fn index_page_for_post(&self, page_key: &str, ids: &[i64]) -> Result<()> {
        let slot = hour_slot(chrono::Utc::now());
        let mut redis = self.redis.clone();
        for id in ids {
            let _: () =
                redis.sadd(public_index_key(*id, &slot), page_key).await.map_err(EngageFeedError::Redis)?;
        }
        Ok(())
    }

    /// Write-side double-delete mutation (spec.md §4.J): deletes every
    /// cached public page, every cached page for this post's author,
    /// and the detail key, runs the DB mutation, then repeats the
    /// deletes after a short delay so a reader racing the mutation
    /// cannot leave a stale page behind.
    pub async fn on_post_mutated<F, Fut>(&self, post_id: i64, author_id: i64, mutate: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        self.delete_post_pages(post_id, author_id).await?;
        mutate().await?;

        let cache = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = cache.delete_post_pages(post_id, author_id).await;
        });
        Ok(())
    }

    async fn delete_post_pages(&self, post_id: i64, author_id: i64) -> Result<()> {
        let mut redis = self.redis.clone();

        let public_pages: Vec<String> = redis.smembers(public_pages_index_key()).await.map_err(EngageFeedError::Redis)?;
        for key in &public_pages {
            self.local.remove(key);
            let _: std::result::Result<(), _> = redis.del(key).await;
        }
        if !public_pages.is_empty() {
            let _: std::result::Result<(), _> = redis.del(public_pages_index_key()).await;
        }

        let mine_index = mine_pages_index_key(author_id);
        let mine_pages: Vec<String> = redis.smembers(&mine_index).await.map_err(EngageFeedError::Redis)?;
        for key in &mine_pages {
            self.local.remove(key);
            let _: std::result::Result<(), _> = redis.del(key).await;
        }
        if !mine_pages.is_empty() {
            let _: std::result::Result<(), _> = redis.del(&mine_index).await;
        }

        let detail = detail_key(post_id);
        self.local.remove(&detail);
        let _: std::result::Result<(), _> = redis.del(&detail).await;
        Ok(())
    }

    /// Overlays a like/fav delta onto a post's count fragment, clamped
    /// at 0, preserving the fragment's remaining TTL, then patches
    /// every currently-cached page referencing it (spec.md §4.L steps
    /// 2-3). Does nothing if the count fragment isn't cached; the next
    /// read repopulates it fresh from the authoritative counter.
    pub async fn apply_like_fav_delta(&self, post_id: i64, metric: EntityMetric, delta: i64) -> Result<()> {
        let key = count_fragment_key(post_id);
        let mut redis = self.redis.clone();
        let ttl_ms: i64 = redis.pttl(&key).await.map_err(EngageFeedError::Redis)?;
        if ttl_ms <= 0 {
            return Ok(());
        }
        let Some(raw): Option<String> = redis.get(&key).await.map_err(EngageFeedError::Redis)? else {
            return Ok(());
        };
        let mut counts: FeedCounts = serde_json::from_str(&raw).unwrap_or_default();
        match metric {
            EntityMetric::Like => counts.like = (counts.like as i64 + delta).max(0) as u32,
            EntityMetric::Fav => counts.fav = (counts.fav as i64 + delta).max(0) as u32,
        }

        let new_raw = serde_json::to_string(&counts).map_err(EngageFeedError::Serde)?;
        let _: () = redis.pset_ex(&key, &new_raw, ttl_ms.max(1) as u64).await.map_err(EngageFeedError::Redis)?;
        self.local.patch(&key, new_raw);

        self.patch_pages_for_post(post_id, counts).await
    }

    async fn patch_pages_for_post(&self, post_id: i64, counts: FeedCounts) -> Result<()> {
        let now = chrono::Utc::now();
        let slots = [hour_slot(now), hour_slot(now - chrono::Duration::hours(1))];
        let mut redis = self.redis.clone();

        for slot in slots {
            let idx_key = public_index_key(post_id, &slot);
            let page_keys: Vec<String> = redis.smembers(&idx_key).await.map_err(EngageFeedError::Redis)?;
            for page_key in page_keys {
                let ttl_ms: i64 = redis.pttl(&page_key).await.map_err(EngageFeedError::Redis)?;
                if ttl_ms <= 0 {
                    let _: () = redis.srem(&idx_key, &page_key).await.map_err(EngageFeedError::Redis)?;
                    self.local.remove(&page_key);
                    continue;
                }

                let Some(raw): Option<String> = redis.get(&page_key).await.map_err(EngageFeedError::Redis)? else {
                    let _: () = redis.srem(&idx_key, &page_key).await.map_err(EngageFeedError::Redis)?;
                    continue;
                };
                let Ok(mut page_val) = serde_json::from_str::<FeedPage>(&raw) else { continue };

                let mut changed = false;
                for item in page_val.items.iter_mut() {
                    if item.id == post_id {
                        item.counts = counts;
                        item.is_liked = None;
                        item.is_faved = None;
                        changed = true;
                    }
                }
                if !changed {
                    continue;
                }

                let new_raw = serde_json::to_string(&page_val).map_err(EngageFeedError::Serde)?;
                let _: () =
                    redis.pset_ex(&page_key, &new_raw, ttl_ms.max(1) as u64).await.map_err(EngageFeedError::Redis)?;
                self.local.patch(&page_key, new_raw);
            }
        }
        Ok(())
    }
}
