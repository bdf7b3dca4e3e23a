use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, TXT};
use hickory_proto::rr::{Name, RData, Record, RecordType};

use conduit_dns_application::context::QueryContext;
use conduit_dns_application::executable::{ChainNode, Executable};
use conduit_dns_application::meta::{RequestMeta, TransportProtocol};
use conduit_dns_domain::DnsError;
use conduit_dns_infrastructure::dns::cache::plugin::{CachePlugin, CachePluginOpts};
use conduit_dns_infrastructure::dns::cache::{CacheBackend, CachedEntry, MemCache};
use conduit_dns_infrastructure::dns::wire;

fn query(name: &str, id: u16) -> Message {
    let mut q = Message::new();
    q.set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    q.add_query(Query::query(Name::from_ascii(name).unwrap(), RecordType::A));
    q
}

fn udp_ctx(name: &str, id: u16) -> QueryContext {
    QueryContext::new(
        query(name, id),
        RequestMeta::new("192.0.2.9".parse().unwrap(), TransportProtocol::Udp),
    )
}

fn tcp_ctx(name: &str, id: u16) -> QueryContext {
    QueryContext::new(
        query(name, id),
        RequestMeta::new("192.0.2.9".parse().unwrap(), TransportProtocol::Tcp),
    )
}

fn answer_for(q: &Message, ttl: u32) -> Message {
    let mut r = Message::new();
    r.set_id(q.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .set_recursion_available(true)
        .set_response_code(ResponseCode::NoError);
    let name = q.queries()[0].name().clone();
    r.add_query(q.queries()[0].clone());
    r.add_answer(Record::from_rdata(
        name,
        ttl,
        RData::A(A::new(93, 184, 216, 34)),
    ));
    r
}

/// Chain terminator standing in for the upstream: counts calls, optionally
/// delays, answers with a fixed-TTL A record.
struct StubResolver {
    calls: Arc<AtomicUsize>,
    delay: Duration,
    rcode: ResponseCode,
    ttl: u32,
    truncated: bool,
}

impl StubResolver {
    fn plain(calls: Arc<AtomicUsize>) -> Self {
        Self {
            calls,
            delay: Duration::ZERO,
            rcode: ResponseCode::NoError,
            ttl: 300,
            truncated: false,
        }
    }
}

#[async_trait]
impl Executable for StubResolver {
    async fn exec(
        &self,
        qctx: &mut QueryContext,
        _next: Option<&Arc<ChainNode>>,
    ) -> Result<(), DnsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut r = if self.rcode == ResponseCode::NoError {
            answer_for(qctx.query(), self.ttl)
        } else {
            let mut r = answer_for(qctx.query(), self.ttl);
            r.take_answers();
            r.set_response_code(self.rcode);
            r
        };
        r.set_truncated(self.truncated);
        qctx.set_response(r);
        Ok(())
    }
}

fn chain_of(resolver: StubResolver) -> Arc<ChainNode> {
    ChainNode::link(&[Arc::new(resolver) as Arc<dyn Executable>], None).unwrap()
}

fn unix_now() -> (u64, u64) {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
    (now.as_secs(), now.as_nanos() as u64)
}

/// Backend with scripted entries, recording every store.
#[derive(Default)]
struct ScriptedBackend {
    entry: Mutex<Option<CachedEntry>>,
    stores: Mutex<Vec<(Vec<u8>, Vec<u8>, u64, u64)>>,
    removed: AtomicUsize,
}

impl ScriptedBackend {
    fn with_entry(entry: CachedEntry) -> Arc<Self> {
        let backend = Arc::new(Self::default());
        *backend.entry.lock().unwrap() = Some(entry);
        backend
    }

    fn stores(&self) -> Vec<(Vec<u8>, Vec<u8>, u64, u64)> {
        self.stores.lock().unwrap().clone()
    }
}

impl CacheBackend for ScriptedBackend {
    fn get(&self, _key: &[u8]) -> Option<CachedEntry> {
        self.entry.lock().unwrap().clone()
    }

    fn store(&self, key: &[u8], wire: &[u8], fresh: u64, lazy: u64, _offsets: wire::TtlOffsets) {
        self.stores
            .lock()
            .unwrap()
            .push((key.to_vec(), wire.to_vec(), fresh, lazy));
    }

    fn remove(&self, _key: &[u8]) {
        self.removed.fetch_add(1, Ordering::SeqCst);
        self.entry.lock().unwrap().take();
    }

    fn len(&self) -> usize {
        usize::from(self.entry.lock().unwrap().is_some())
    }

    fn close(&self) {}
}

fn entry_from_response(r: &Message, stored_ago_secs: u64, lazy_hit: bool) -> CachedEntry {
    let packed = r.to_vec().unwrap();
    let offsets = wire::extract_ttl_offsets(&packed);
    let (now_secs, _) = unix_now();
    CachedEntry {
        wire: Arc::from(packed.as_slice()),
        stored_secs: now_secs - stored_ago_secs,
        offsets,
        lazy_hit,
    }
}

fn plugin_with(backend: Arc<dyn CacheBackend>, lazy_window: u64) -> CachePlugin {
    CachePlugin::new(CachePluginOpts {
        backend,
        lazy_window,
        lazy_reply_ttl: 5,
        compress: false,
        when_hit: None,
    })
}

// S1: miss resolves upstream and stores one entry under the canonical key.
#[tokio::test]
async fn miss_resolves_and_stores() {
    let backend = MemCache::new(1024, Duration::ZERO);
    let calls = Arc::new(AtomicUsize::new(0));
    let plugin = plugin_with(backend.clone(), 300);
    let next = chain_of(StubResolver::plain(Arc::clone(&calls)));

    let mut qctx = udp_ctx("example.com.", 0x1234);
    plugin.exec(&mut qctx, Some(&next)).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let r = qctx.response().expect("parsed response on miss");
    assert_eq!(r.id(), 0x1234);
    assert_eq!(r.answers()[0].ttl(), 300);

    assert_eq!(backend.len(), 1);
    let mut key = b"example.com.".to_vec();
    key.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
    assert!(backend.get(&key).is_some(), "entry under the canonical key");
}

// S2: an immediate second query is served from the cache without parsing,
// with the new identifier patched in.
#[tokio::test]
async fn fresh_hit_serves_raw_with_patched_id() {
    let backend = MemCache::new(1024, Duration::ZERO);
    let calls = Arc::new(AtomicUsize::new(0));
    let plugin = plugin_with(backend.clone(), 300);
    let next = chain_of(StubResolver::plain(Arc::clone(&calls)));

    let mut first = udp_ctx("example.com.", 0x1111);
    plugin.exec(&mut first, Some(&next)).await.unwrap();

    let mut second = udp_ctx("example.com.", 0x2222);
    plugin.exec(&mut second, Some(&next)).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1, "hit must not reach upstream");
    let raw = second.raw_response().expect("zero-unpack response");
    assert_eq!(&raw.bytes()[0..2], &[0x22, 0x22]);

    let parsed = Message::from_vec(raw.bytes()).unwrap();
    assert!(parsed.answers()[0].ttl() >= 298);
}

// P3 via the scripted backend: a hit 60 seconds after store serves
// max(1, 300 - 60).
#[tokio::test]
async fn fresh_hit_subtracts_elapsed_seconds() {
    let response = answer_for(&query("example.com.", 0), 300);
    let backend = ScriptedBackend::with_entry(entry_from_response(&response, 60, false));
    let plugin = plugin_with(backend, 0);
    let calls = Arc::new(AtomicUsize::new(0));
    let next = chain_of(StubResolver::plain(Arc::clone(&calls)));

    let mut qctx = udp_ctx("example.com.", 0x1234);
    plugin.exec(&mut qctx, Some(&next)).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let raw = qctx.raw_response().expect("fast path");
    let parsed = Message::from_vec(raw.bytes()).unwrap();
    assert_eq!(parsed.id(), 0x1234);
    let ttl = parsed.answers()[0].ttl();
    assert!((239..=240).contains(&ttl), "expected ~240, got {}", ttl);
}

// S3 + P4: a lazy hit serves the configured reply TTL and triggers exactly
// one background refresh, which stores the new answer.
#[tokio::test]
async fn lazy_hit_serves_short_ttl_and_refreshes_once() {
    let response = answer_for(&query("example.com.", 0), 300);
    let backend = ScriptedBackend::with_entry(entry_from_response(&response, 500, true));
    let plugin = plugin_with(Arc::clone(&backend) as Arc<dyn CacheBackend>, 300);
    let calls = Arc::new(AtomicUsize::new(0));
    let next = chain_of(StubResolver::plain(Arc::clone(&calls)));

    let mut qctx = udp_ctx("example.com.", 0x0ABC);
    plugin.exec(&mut qctx, Some(&next)).await.unwrap();

    let raw = qctx.raw_response().expect("stale fast path");
    let parsed = Message::from_vec(raw.bytes()).unwrap();
    assert_eq!(parsed.answers()[0].ttl(), 5, "lazy reply TTL");

    // Let the background refresh land.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1, "one refresh");

    let stores = backend.stores();
    assert_eq!(stores.len(), 1, "refresh stored the new answer");
    let (_, _, fresh, lazy) = &stores[0];
    assert_eq!(lazy - fresh, 300 * 1_000_000_000, "lazy window appended");
}

// P7: concurrent lazy triggers for one key collapse into a single flight.
#[tokio::test]
async fn single_flight_deduplicates_refreshes() {
    let response = answer_for(&query("example.com.", 0), 300);
    let backend = ScriptedBackend::with_entry(entry_from_response(&response, 500, true));
    let plugin = Arc::new(plugin_with(Arc::clone(&backend) as Arc<dyn CacheBackend>, 300));
    let calls = Arc::new(AtomicUsize::new(0));
    let next = chain_of(StubResolver {
        calls: Arc::clone(&calls),
        delay: Duration::from_millis(200),
        rcode: ResponseCode::NoError,
        ttl: 300,
        truncated: false,
    });

    let tasks: Vec<_> = (0..100)
        .map(|i| {
            let plugin = Arc::clone(&plugin);
            let next = Arc::clone(&next);
            tokio::spawn(async move {
                let mut qctx = udp_ctx("example.com.", i as u16);
                plugin.exec(&mut qctx, Some(&next)).await.unwrap();
                assert!(qctx.raw_response().is_some());
            })
        })
        .collect();
    for t in tasks {
        t.await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        calls.load(Ordering::SeqCst),
        1,
        "exactly one upstream exchange for 100 lazy triggers"
    );
}

// S6: a UDP hit larger than the declared payload size is truncated with TC.
#[tokio::test]
async fn udp_hit_truncates_to_declared_size() {
    let q = query("big.example.com.", 0);
    let mut big = answer_for(&q, 300);
    for _ in 0..30 {
        big.add_answer(Record::from_rdata(
            Name::from_ascii("big.example.com.").unwrap(),
            300,
            RData::TXT(TXT::new(vec!["x".repeat(48)])),
        ));
    }
    assert!(big.to_vec().unwrap().len() > 512);

    let backend = ScriptedBackend::with_entry(entry_from_response(&big, 0, false));
    let plugin = plugin_with(backend, 0);
    let next = chain_of(StubResolver::plain(Arc::new(AtomicUsize::new(0))));

    let mut qctx = udp_ctx("big.example.com.", 0x7777);
    plugin.exec(&mut qctx, Some(&next)).await.unwrap();

    let raw = qctx.raw_response().expect("fast path");
    assert_eq!(raw.bytes().len(), 512);
    assert_eq!(raw.bytes()[2] & 0x02, 0x02, "TC bit set");
}

#[tokio::test]
async fn stream_hit_is_not_truncated() {
    let q = query("big.example.com.", 0);
    let mut big = answer_for(&q, 300);
    for _ in 0..30 {
        big.add_answer(Record::from_rdata(
            Name::from_ascii("big.example.com.").unwrap(),
            300,
            RData::TXT(TXT::new(vec!["x".repeat(48)])),
        ));
    }
    let full_len = big.to_vec().unwrap().len();

    let backend = ScriptedBackend::with_entry(entry_from_response(&big, 0, false));
    let plugin = plugin_with(backend, 0);
    let next = chain_of(StubResolver::plain(Arc::new(AtomicUsize::new(0))));

    let mut qctx = tcp_ctx("big.example.com.", 0x7777);
    plugin.exec(&mut qctx, Some(&next)).await.unwrap();
    assert_eq!(qctx.raw_response().unwrap().bytes().len(), full_len);
}

#[tokio::test]
async fn truncated_and_failed_responses_are_not_cached() {
    for resolver in [
        StubResolver {
            calls: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
            rcode: ResponseCode::NoError,
            ttl: 300,
            truncated: true,
        },
        StubResolver {
            calls: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
            rcode: ResponseCode::ServFail,
            ttl: 300,
            truncated: false,
        },
        StubResolver {
            calls: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
            rcode: ResponseCode::Refused,
            ttl: 300,
            truncated: false,
        },
    ] {
        let backend = Arc::new(ScriptedBackend::default());
        let plugin = plugin_with(Arc::clone(&backend) as Arc<dyn CacheBackend>, 300);
        let next = chain_of(resolver);

        let mut qctx = udp_ctx("example.com.", 1);
        plugin.exec(&mut qctx, Some(&next)).await.unwrap();
        assert!(backend.stores().is_empty());
    }
}

#[tokio::test]
async fn nxdomain_and_nodata_use_negative_floor() {
    let backend = Arc::new(ScriptedBackend::default());
    let plugin = plugin_with(Arc::clone(&backend) as Arc<dyn CacheBackend>, 0);
    let next = chain_of(StubResolver {
        calls: Arc::new(AtomicUsize::new(0)),
        delay: Duration::ZERO,
        rcode: ResponseCode::NXDomain,
        ttl: 300,
        truncated: false,
    });

    let mut qctx = udp_ctx("missing.example.", 1);
    plugin.exec(&mut qctx, Some(&next)).await.unwrap();

    let stores = backend.stores();
    assert_eq!(stores.len(), 1);
    let (_, _, fresh, lazy) = &stores[0];
    let (_, now_ns) = unix_now();
    let ttl_secs = fresh.saturating_sub(now_ns) / 1_000_000_000;
    assert!((295..=300).contains(&ttl_secs), "negative floor ~300s");
    assert_eq!(fresh, lazy, "lazy disabled");
}

#[tokio::test]
async fn zero_ttl_answers_are_not_cached() {
    let backend = Arc::new(ScriptedBackend::default());
    let plugin = plugin_with(Arc::clone(&backend) as Arc<dyn CacheBackend>, 300);
    let next = chain_of(StubResolver {
        calls: Arc::new(AtomicUsize::new(0)),
        delay: Duration::ZERO,
        rcode: ResponseCode::NoError,
        ttl: 0,
        truncated: false,
    });

    let mut qctx = udp_ctx("volatile.example.", 1);
    plugin.exec(&mut qctx, Some(&next)).await.unwrap();
    assert!(backend.stores().is_empty());
}

#[tokio::test]
async fn compressed_entries_round_trip() {
    let backend = MemCache::new(1024, Duration::ZERO);
    let calls = Arc::new(AtomicUsize::new(0));
    let plugin = CachePlugin::new(CachePluginOpts {
        backend: backend.clone(),
        lazy_window: 300,
        lazy_reply_ttl: 5,
        compress: true,
        when_hit: None,
    });
    let next = chain_of(StubResolver::plain(Arc::clone(&calls)));

    let mut first = udp_ctx("example.com.", 0x0001);
    plugin.exec(&mut first, Some(&next)).await.unwrap();

    let mut second = udp_ctx("example.com.", 0x0002);
    plugin.exec(&mut second, Some(&next)).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let raw = second.raw_response().expect("hit on compressed entry");
    let parsed = Message::from_vec(raw.bytes()).unwrap();
    assert_eq!(parsed.id(), 0x0002);
    assert_eq!(parsed.answers().len(), 1);
}

#[tokio::test]
async fn corrupt_entry_is_evicted_and_treated_as_miss() {
    // Entry claims offsets beyond its byte length.
    let bogus = CachedEntry {
        wire: Arc::from(&b"\x00\x00\x81\x80\x00\x00\x00\x00\x00\x00\x00\x00"[..]),
        stored_secs: unix_now().0,
        offsets: wire::TtlOffsets::from_parts([500, 0, 0, 0, 0, 0, 0, 0], 1),
        lazy_hit: false,
    };
    let backend = ScriptedBackend::with_entry(bogus);
    let calls = Arc::new(AtomicUsize::new(0));
    let plugin = plugin_with(Arc::clone(&backend) as Arc<dyn CacheBackend>, 300);
    let next = chain_of(StubResolver::plain(Arc::clone(&calls)));

    let mut qctx = udp_ctx("example.com.", 1);
    plugin.exec(&mut qctx, Some(&next)).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1, "fell through to upstream");
    assert_eq!(backend.removed.load(Ordering::SeqCst), 1, "entry evicted");
    assert!(qctx.response().is_some());
}

/// `when_hit` runs its subchain after the hit is attached.
#[tokio::test]
async fn when_hit_subchain_runs_on_hits() {
    struct MarkHit;

    #[async_trait]
    impl Executable for MarkHit {
        async fn exec(
            &self,
            qctx: &mut QueryContext,
            _next: Option<&Arc<ChainNode>>,
        ) -> Result<(), DnsError> {
            qctx.add_mark(42);
            Ok(())
        }
    }

    let response = answer_for(&query("example.com.", 0), 300);
    let backend = ScriptedBackend::with_entry(entry_from_response(&response, 10, false));
    let plugin = CachePlugin::new(CachePluginOpts {
        backend,
        lazy_window: 0,
        lazy_reply_ttl: 5,
        compress: false,
        when_hit: ChainNode::link(&[Arc::new(MarkHit) as Arc<dyn Executable>], None),
    });
    let next = chain_of(StubResolver::plain(Arc::new(AtomicUsize::new(0))));

    let mut qctx = udp_ctx("example.com.", 1);
    plugin.exec(&mut qctx, Some(&next)).await.unwrap();

    assert!(qctx.raw_response().is_some());
    assert!(qctx.has_mark(42));
}
