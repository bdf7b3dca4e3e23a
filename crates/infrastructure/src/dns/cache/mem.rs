use std::hash::{BuildHasher, Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use rustc_hash::FxBuildHasher;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::dns::wire::TtlOffsets;

use super::backend::{unix_now, CacheBackend, CachedEntry};

/// Power of two, so the shard pick is a mask instead of a divmod.
const SHARD_COUNT: usize = 64;
const MIN_SHARD_CAPACITY: usize = 16;

struct Entry {
    wire: Arc<[u8]>,
    stored_secs: u64,
    fresh_expire_ns: u64,
    lazy_expire_ns: u64,
    offsets: TtlOffsets,
}

type Shard = Mutex<LruCache<Box<[u8]>, Entry>>;

/// Sharded, size-bounded in-memory store. Physical eviction is strictly
/// LRU-by-capacity; logical expiration happens in `get`, with an optional
/// periodic sweep removing entries whose lazy window has passed.
pub struct MemCache {
    shards: Box<[Shard]>,
    hasher: FxBuildHasher,
    closed: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MemCache {
    /// `size` is the total entry capacity across all shards. A positive
    /// `sweep_interval` starts the background sweeper (requires a runtime).
    pub fn new(size: usize, sweep_interval: Duration) -> Arc<Self> {
        const { assert!(SHARD_COUNT.is_power_of_two()) };

        let per_shard = (size / SHARD_COUNT).max(MIN_SHARD_CAPACITY);
        let capacity = NonZeroUsize::new(per_shard).expect("per-shard capacity is nonzero");

        let shards: Box<[Shard]> = (0..SHARD_COUNT)
            .map(|_| Mutex::new(LruCache::new(capacity)))
            .collect();

        let cache = Arc::new(Self {
            shards,
            hasher: FxBuildHasher,
            closed: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        });

        if !sweep_interval.is_zero() {
            let weak = Arc::downgrade(&cache);
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(sweep_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let Some(cache) = weak.upgrade() else { return };
                    cache.sweep();
                }
            });
            *cache.sweeper.lock().expect("sweeper slot poisoned") = Some(handle);
        }

        cache
    }

    fn shard(&self, key: &[u8]) -> &Shard {
        let mut hasher = self.hasher.build_hasher();
        key.hash(&mut hasher);
        let index = hasher.finish() as usize & (SHARD_COUNT - 1);
        &self.shards[index]
    }

    /// Removes every entry whose lazy window has passed.
    pub fn sweep(&self) {
        let (_, now_ns) = unix_now();
        let mut removed = 0usize;
        for shard in self.shards.iter() {
            let mut guard = shard.lock().expect("cache shard poisoned");
            let dead: Vec<Box<[u8]>> = guard
                .iter()
                .filter(|(_, e)| e.lazy_expire_ns <= now_ns)
                .map(|(k, _)| k.clone())
                .collect();
            removed += dead.len();
            for key in dead {
                guard.pop(&key);
            }
        }
        if removed > 0 {
            debug!(removed, "cache sweep removed expired entries");
        }
    }
}

impl CacheBackend for MemCache {
    fn get(&self, key: &[u8]) -> Option<CachedEntry> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }

        let (_, now_ns) = unix_now();
        let mut shard = self.shard(key).lock().expect("cache shard poisoned");
        let entry = shard.get(key)?;

        if now_ns > entry.lazy_expire_ns {
            return None;
        }

        Some(CachedEntry {
            wire: Arc::clone(&entry.wire),
            stored_secs: entry.stored_secs,
            offsets: entry.offsets,
            lazy_hit: now_ns > entry.fresh_expire_ns,
        })
    }

    fn store(
        &self,
        key: &[u8],
        wire: &[u8],
        fresh_expire_ns: u64,
        lazy_expire_ns: u64,
        offsets: TtlOffsets,
    ) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let (now_secs, _) = unix_now();
        let entry = Entry {
            wire: Arc::from(wire),
            stored_secs: now_secs,
            fresh_expire_ns,
            lazy_expire_ns,
            offsets,
        };

        let mut shard = self.shard(key).lock().expect("cache shard poisoned");
        shard.put(Box::from(key), entry);
    }

    fn remove(&self, key: &[u8]) {
        let mut shard = self.shard(key).lock().expect("cache shard poisoned");
        shard.pop(key);
    }

    fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().expect("cache shard poisoned").len())
            .sum()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.sweeper.lock().expect("sweeper slot poisoned").take() {
            handle.abort();
        }
    }
}

impl Drop for MemCache {
    fn drop(&mut self) {
        self.close();
    }
}
