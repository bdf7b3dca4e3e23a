use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::dns::wire::TtlOffsets;

/// A stored response handed back by [`CacheBackend::get`].
///
/// `wire` is the backend's immutable copy; callers patch an owned copy,
/// never these bytes.
#[derive(Clone)]
pub struct CachedEntry {
    pub wire: Arc<[u8]>,
    /// Wall-clock seconds at store time.
    pub stored_secs: u64,
    pub offsets: TtlOffsets,
    /// True when the entry is past its DNS TTL but inside the lazy window.
    pub lazy_hit: bool,
}

/// Wire-format response store keyed by the canonical query key.
pub trait CacheBackend: Send + Sync {
    /// Never mutates the entry. Returns `None` when the key is absent or the
    /// lazy window has passed.
    fn get(&self, key: &[u8]) -> Option<CachedEntry>;

    /// Copies `wire` in. `fresh_expire_ns` / `lazy_expire_ns` are unix
    /// nanoseconds; `stored ≤ fresh ≤ lazy` is the caller's contract.
    fn store(
        &self,
        key: &[u8],
        wire: &[u8],
        fresh_expire_ns: u64,
        lazy_expire_ns: u64,
        offsets: TtlOffsets,
    );

    fn remove(&self, key: &[u8]);

    fn len(&self) -> usize;

    /// Idempotent; stops any background sweeper.
    fn close(&self);
}

pub(crate) fn unix_now() -> (u64, u64) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (now.as_secs(), now.as_nanos() as u64)
}
