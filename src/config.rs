//! Layered configuration: built-in defaults, optional `config/*.toml`,
//! then environment overrides (prefix `ENGAGEFEED_`), the way
//! `estuary-flow`'s `control` crate layers `config::Config`.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct RebuildSettings {
    pub rate_permits: u32,
    pub rate_window_seconds: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub lock_ttl_ms: u64,
    pub replay_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FollowRateLimitSettings {
    pub capacity: u64,
    pub refill_per_second: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CdcSettings {
    pub enabled: bool,
    pub batch_size: i64,
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    pub public_ttl_seconds: u64,
    pub public_max_size: u64,
    pub mine_ttl_seconds: u64,
    pub mine_max_size: u64,
    pub ids_ttl_seconds: u64,
    pub detail_ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HotKeySettings {
    pub window_seconds: u64,
    pub segment_seconds: u64,
    pub level_low: u64,
    pub level_medium: u64,
    pub level_high: u64,
    pub extend_low_seconds: u64,
    pub extend_medium_seconds: u64,
    pub extend_high_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub redis_url: String,
    pub kafka_brokers: String,
    pub self_heal_window_seconds: u64,
    pub rebuild: RebuildSettings,
    pub follow_rate_limit: FollowRateLimitSettings,
    pub cdc: CdcSettings,
    pub cache: CacheSettings,
    pub hot_key: HotKeySettings,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .set_default("database_url", "postgres://localhost/engagefeed")?
            .set_default("redis_url", "redis://127.0.0.1:6379")?
            .set_default("kafka_brokers", "127.0.0.1:9092")?
            .set_default("self_heal_window_seconds", 300)?
            .set_default("rebuild.rate_permits", 3)?
            .set_default("rebuild.rate_window_seconds", 10)?
            .set_default("rebuild.backoff_base_ms", 500)?
            .set_default("rebuild.backoff_max_ms", 30_000)?
            .set_default("rebuild.lock_ttl_ms", 10_000)?
            .set_default("rebuild.replay_enabled", false)?
            .set_default("follow_rate_limit.capacity", 100)?
            .set_default("follow_rate_limit.refill_per_second", 1.0)?
            .set_default("cdc.enabled", true)?
            .set_default("cdc.batch_size", 100)?
            .set_default("cdc.interval_ms", 500)?
            .set_default("cache.public_ttl_seconds", 15)?
            .set_default("cache.public_max_size", 1000)?
            .set_default("cache.mine_ttl_seconds", 10)?
            .set_default("cache.mine_max_size", 1000)?
            .set_default("cache.ids_ttl_seconds", 75)?
            .set_default("cache.detail_ttl_seconds", 60)?
            .set_default("hot_key.window_seconds", 60)?
            .set_default("hot_key.segment_seconds", 10)?
            .set_default("hot_key.level_low", 50)?
            .set_default("hot_key.level_medium", 200)?
            .set_default("hot_key.level_high", 500)?
            .set_default("hot_key.extend_low_seconds", 20)?
            .set_default("hot_key.extend_medium_seconds", 60)?
            .set_default("hot_key.extend_high_seconds", 120)?
            .add_source(config::File::with_name("config/base").required(false))
            .add_source(config::Environment::with_prefix("ENGAGEFEED").separator("__"));

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_a_config_file() {
        let cfg = AppConfig::load().expect("defaults are sufficient on their own");
        assert_eq!(cfg.rebuild.rate_permits, 3);
        assert_eq!(cfg.follow_rate_limit.capacity, 100);
        assert_eq!(cfg.hot_key.level_high, 500);
    }
}
