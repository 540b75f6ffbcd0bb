//! Hot-key detector (spec.md §4.K): a segmented ring buffer of hit
//! counters per tracked key, rotated by a single atomic index so the
//! read-hot path never takes a lock. Sized windows roll off older
//! segments automatically instead of decaying counts by timer,
//! grounded on the sharded atomic-counter pattern in the retrieval
//! pack's `sharded_metrics` module.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{interval, Duration};

use crate::config::HotKeySettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HeatLevel {
    Cold,
    Low,
    Medium,
    High,
}

struct Segments {
    counts: Vec<AtomicU64>,
    head: AtomicUsize,
}

impl Segments {
    fn new(n: usize) -> Self {
        Self { counts: (0..n).map(|_| AtomicU64::new(0)).collect(), head: AtomicUsize::new(0) }
    }

    fn hit(&self) {
        let head = self.head.load(Ordering::Relaxed);
        self.counts[head].fetch_add(1, Ordering::Relaxed);
    }

    fn total(&self) -> u64 {
        self.counts.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    fn rotate(&self) {
        let n = self.counts.len();
        let next = (self.head.load(Ordering::Relaxed) + 1) % n;
        self.counts[next].store(0, Ordering::Relaxed);
        self.head.store(next, Ordering::Relaxed);
    }
}

#[derive(Clone)]
pub struct HotKeyDetector {
    settings: HotKeySettings,
    segments: Arc<DashMap<String, Arc<Segments>>>,
}

impl HotKeyDetector {
    pub fn new(settings: HotKeySettings) -> Self {
        Self { settings, segments: Arc::new(DashMap::new()) }
    }

    fn segment_count(&self) -> usize {
        (self.settings.window_seconds / self.settings.segment_seconds.max(1)).max(1) as usize
    }

    pub fn record_hit(&self, key: &str) {
        let n = self.segment_count();
        let entry = self.segments.entry(key.to_string()).or_insert_with(|| Arc::new(Segments::new(n)));
        entry.hit();
    }

    pub fn heat(&self, key: &str) -> HeatLevel {
        let Some(entry) = self.segments.get(key) else { return HeatLevel::Cold };
        let total = entry.total();
        if total >= self.settings.level_high {
            HeatLevel::High
        } else if total >= self.settings.level_medium {
            HeatLevel::Medium
        } else if total >= self.settings.level_low {
            HeatLevel::Low
        } else {
            HeatLevel::Cold
        }
    }

    /// Extra local-cache TTL, in seconds, to apply on top of the base
    /// TTL for a key at this heat level (spec.md §4.K "extend TTL for
    /// hot keys").
    pub fn ttl_extension_seconds(&self, level: HeatLevel) -> u64 {
        match level {
            HeatLevel::Cold => 0,
            HeatLevel::Low => self.settings.extend_low_seconds,
            HeatLevel::Medium => self.settings.extend_medium_seconds,
            HeatLevel::High => self.settings.extend_high_seconds,
        }
    }

    /// Rotates every tracked key's ring buffer once per `segment_seconds`.
    pub async fn run_rotator(self, running: Arc<std::sync::atomic::AtomicBool>) {
        let mut ticker = interval(Duration::from_secs(self.settings.segment_seconds.max(1)));
        while running.load(Ordering::Relaxed) {
            ticker.tick().await;
            for entry in self.segments.iter() {
                entry.value().rotate();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> HotKeySettings {
        HotKeySettings {
            window_seconds: 60,
            segment_seconds: 10,
            level_low: 5,
            level_medium: 20,
            level_high: 50,
            extend_low_seconds: 20,
            extend_medium_seconds: 60,
            extend_high_seconds: 120,
        }
    }

    #[test]
    fn unseen_key_is_cold() {
        let detector = HotKeyDetector::new(settings());
        assert_eq!(detector.heat("post:1"), HeatLevel::Cold);
    }

    #[test]
    fn hits_escalate_heat_level() {
        let detector = HotKeyDetector::new(settings());
        for _ in 0..30 {
            detector.record_hit("post:1");
        }
        assert_eq!(detector.heat("post:1"), HeatLevel::Medium);
        assert_eq!(detector.ttl_extension_seconds(HeatLevel::Medium), 60);
    }

    #[test]
    fn rotation_drops_oldest_segment() {
        let detector = HotKeyDetector::new(settings());
        for _ in 0..10 {
            detector.record_hit("post:1");
        }
        let n = detector.segment_count();
        for _ in 0..n {
            if let Some(entry) = detector.segments.get("post:1") {
                entry.rotate();
            }
        }
        assert_eq!(detector.heat("post:1"), HeatLevel::Cold);
    }
}
