use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Total entries across all shards. 0 disables the cache plugin.
    #[serde(default = "default_size")]
    pub size: usize,

    /// Redis backend URL. Accepted for config compatibility; the memory
    /// backend is the only one built in and a non-empty value fails startup.
    #[serde(default)]
    pub redis: String,

    /// Seconds an entry may be served past its DNS TTL. 0 disables lazy mode.
    #[serde(default)]
    pub lazy_cache_ttl: u64,

    /// TTL stamped into records served from the lazy window.
    #[serde(default = "default_lazy_reply_ttl")]
    pub lazy_cache_reply_ttl: u32,

    /// Seconds between background sweeps of expired entries. 0 disables.
    #[serde(default)]
    pub cleaner_interval: u64,

    /// Compress stored wire bytes (Snappy).
    #[serde(default)]
    pub compress_resp: bool,

    /// Tag of a subchain to run on cache hits.
    #[serde(default)]
    pub when_hit: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size: default_size(),
            redis: String::new(),
            lazy_cache_ttl: 0,
            lazy_cache_reply_ttl: default_lazy_reply_ttl(),
            cleaner_interval: 0,
            compress_resp: false,
            when_hit: String::new(),
        }
    }
}

fn default_size() -> usize {
    1024
}

fn default_lazy_reply_ttl() -> u32 {
    5
}
