use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::ResponseCode;
use tracing::{debug, warn};

use conduit_dns_application::context::QueryContext;
use conduit_dns_application::executable::{exec_chain, ChainNode, Executable};
use conduit_dns_application::meta::TransportProtocol;
use conduit_dns_domain::DnsError;

use crate::dns::pool::BufferPool;
use crate::dns::singleflight::SingleFlight;
use crate::dns::wire;

use super::backend::{unix_now, CacheBackend};
use super::compress;

/// Empty-answer responses cache for this long.
const NEGATIVE_CACHE_TTL: u32 = 300;

/// Deadline of a background lazy refresh, deliberately detached from the
/// deadline of the query that triggered it.
const LAZY_REFRESH_TIMEOUT: Duration = Duration::from_secs(5);

pub struct CachePluginOpts {
    pub backend: Arc<dyn CacheBackend>,
    /// Seconds an entry stays servable past its DNS TTL. 0 disables lazy mode.
    pub lazy_window: u64,
    /// TTL stamped into lazy-served records.
    pub lazy_reply_ttl: u32,
    pub compress: bool,
    /// Subchain run after a hit has been attached to the context.
    pub when_hit: Option<Arc<ChainNode>>,
}

/// The cache node of the plugin graph.
///
/// Hits are served on the zero-unpack path: the cached wire bytes are copied
/// into a pooled buffer, the identifier and TTLs are patched in place and
/// the buffer rides the context back to the listener unparsed. Misses run
/// the rest of the chain and store what comes back.
pub struct CachePlugin {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn CacheBackend>,
    pool: Arc<BufferPool>,
    refresh_flight: SingleFlight,
    lazy_window: u64,
    lazy_reply_ttl: u32,
    compress: bool,
    when_hit: Option<Arc<ChainNode>>,
}

enum TtlPatch {
    /// Fresh hit: subtract seconds since store, floored at one.
    Subtract(u32),
    /// Lazy hit: stamp the configured reply TTL everywhere.
    Stamp(u32),
}

impl CachePlugin {
    pub fn new(opts: CachePluginOpts) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend: opts.backend,
                pool: BufferPool::new(),
                refresh_flight: SingleFlight::new(),
                lazy_window: opts.lazy_window,
                lazy_reply_ttl: if opts.lazy_reply_ttl == 0 {
                    5
                } else {
                    opts.lazy_reply_ttl
                },
                compress: opts.compress,
                when_hit: opts.when_hit,
            }),
        }
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.inner.backend
    }
}

#[async_trait]
impl Executable for CachePlugin {
    async fn exec(
        &self,
        qctx: &mut QueryContext,
        next: Option<&Arc<ChainNode>>,
    ) -> Result<(), DnsError> {
        let Some(key) = wire::build_key(qctx.query()) else {
            return exec_chain(qctx, next).await;
        };

        if let Some((bytes, stored_secs, offsets, lazy_hit)) = self.inner.lookup(&key) {
            let patch = if lazy_hit {
                self.inner
                    .spawn_lazy_refresh(key.clone(), qctx, next.cloned());
                TtlPatch::Stamp(self.inner.lazy_reply_ttl)
            } else {
                let (now_secs, _) = unix_now();
                TtlPatch::Subtract(now_secs.saturating_sub(stored_secs) as u32)
            };

            self.inner.fast_hit(qctx, &bytes, &offsets, patch);

            if self.inner.when_hit.is_some() {
                let when_hit = self.inner.when_hit.clone();
                return exec_chain(qctx, when_hit.as_ref()).await;
            }
            return Ok(());
        }

        exec_chain(qctx, next).await?;
        if qctx.response().is_some() {
            self.inner.try_store(&key, qctx);
        }
        Ok(())
    }
}

impl Inner {
    /// Backend lookup plus decompression and corruption checks. A corrupt
    /// entry is evicted and reported as a miss.
    fn lookup(&self, key: &[u8]) -> Option<(Vec<u8>, u64, wire::TtlOffsets, bool)> {
        let entry = self.backend.get(key)?;

        let bytes: Vec<u8> = if self.compress {
            match compress::decompress(&entry.wire) {
                Some(b) => b,
                None => {
                    warn!("corrupt compressed cache entry, evicting");
                    self.backend.remove(key);
                    return None;
                }
            }
        } else {
            entry.wire.to_vec()
        };

        if !offsets_fit(&bytes, &entry.offsets) {
            warn!("cache entry shorter than its TTL offset table, evicting");
            self.backend.remove(key);
            return None;
        }

        Some((bytes, entry.stored_secs, entry.offsets, entry.lazy_hit))
    }

    /// The zero-unpack path: copy, patch id and TTLs, truncate for UDP,
    /// attach the pooled buffer to the context.
    fn fast_hit(
        &self,
        qctx: &mut QueryContext,
        cached: &[u8],
        offsets: &wire::TtlOffsets,
        patch: TtlPatch,
    ) {
        let mut buf = self.pool.get(cached.len());
        buf.extend_from_slice(cached);

        wire::patch_id(&mut buf, qctx.query().id());
        match patch {
            TtlPatch::Subtract(delta) => {
                wire::subtract_ttls(&mut buf, offsets, delta);
            }
            TtlPatch::Stamp(ttl) => wire::set_ttls(&mut buf, offsets, ttl),
        }

        if qctx.meta().protocol() == TransportProtocol::Udp {
            let limit = wire::declared_udp_size(qctx.query());
            if buf.len() > limit {
                buf.truncate(limit);
                wire::set_tc(&mut buf);
            }
        }

        qctx.set_raw_response(self.pool.into_raw_response(buf));
    }

    /// Runs the remaining chain once per key in the background and stores
    /// the outcome. Concurrent triggers for the same key collapse into the
    /// flight already running.
    fn spawn_lazy_refresh(
        self: &Arc<Self>,
        key: Vec<u8>,
        qctx: &QueryContext,
        next: Option<Arc<ChainNode>>,
    ) {
        let Some(guard) = self.refresh_flight.begin(&key) else {
            return;
        };

        let inner = Arc::clone(self);
        let mut bg = qctx.clone_for_background();
        tokio::spawn(async move {
            let _flight = guard;
            match tokio::time::timeout(LAZY_REFRESH_TIMEOUT, exec_chain(&mut bg, next.as_ref()))
                .await
            {
                Ok(Ok(())) => {
                    if bg.response().is_some() {
                        inner.try_store(&key, &bg);
                    }
                }
                Ok(Err(e)) => {
                    debug!(query = %bg.summary(), error = %e, "lazy refresh failed")
                }
                Err(_) => debug!(query = %bg.summary(), "lazy refresh timed out"),
            }
        });
    }

    fn try_store(&self, key: &[u8], qctx: &QueryContext) {
        let Some(r) = qctx.response() else { return };

        if r.truncated() {
            return;
        }
        let rcode = r.response_code();
        if rcode != ResponseCode::NoError && rcode != ResponseCode::NXDomain {
            return;
        }

        let ttl = if r.answers().is_empty() {
            NEGATIVE_CACHE_TTL
        } else {
            match wire::min_ttl(r) {
                0 => return,
                t => t,
            }
        };

        let packed = match r.to_vec() {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed to pack response for caching");
                return;
            }
        };

        // Offsets always index the uncompressed bytes.
        let offsets = wire::extract_ttl_offsets(&packed);

        let (_, now_ns) = unix_now();
        let fresh_expire_ns = now_ns + ttl as u64 * 1_000_000_000;
        let lazy_expire_ns = fresh_expire_ns + self.lazy_window * 1_000_000_000;

        if self.compress {
            let stored = compress::compress(&packed);
            self.backend
                .store(key, &stored, fresh_expire_ns, lazy_expire_ns, offsets);
        } else {
            self.backend
                .store(key, &packed, fresh_expire_ns, lazy_expire_ns, offsets);
        }
    }
}

fn offsets_fit(bytes: &[u8], offsets: &wire::TtlOffsets) -> bool {
    if bytes.len() < wire::HEADER_LEN {
        return false;
    }
    let (table, count) = offsets.as_parts();
    table[..count as usize]
        .iter()
        .all(|&at| at as usize + 4 <= bytes.len())
}
