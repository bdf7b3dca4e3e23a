use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use hickory_proto::op::Message;
use tokio_util::sync::CancellationToken;

use conduit_dns_domain::DnsError;

use crate::meta::RequestMeta;

static CONTEXT_UID: AtomicU32 = AtomicU32::new(0);

/// Wire bytes owned by one request, with a hook that returns the underlying
/// buffer to its pool. The hook fires exactly once: on explicit `release`
/// or on drop, whichever comes first.
pub struct RawResponse {
    bytes: Vec<u8>,
    release: Option<Box<dyn FnOnce(Vec<u8>) + Send + Sync>>,
}

impl RawResponse {
    pub fn new(bytes: Vec<u8>, release: Box<dyn FnOnce(Vec<u8>) + Send + Sync>) -> Self {
        Self {
            bytes,
            release: Some(release),
        }
    }

    /// Bytes without a pool behind them; release is a no-op.
    pub fn unpooled(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            release: None,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(hook) = self.release.take() {
            hook(std::mem::take(&mut self.bytes));
        }
    }
}

impl Drop for RawResponse {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for RawResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawResponse")
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Per-request mutable state shared by every node of the plugin graph.
///
/// The response lives in exactly one of two slots: `response` (parsed) or
/// `raw_response` (wire bytes from the zero-unpack path). Setting one clears
/// the other; the server always checks raw first.
pub struct QueryContext {
    query: Message,
    original_query: Option<Box<Message>>,
    response: Option<Message>,
    raw_response: Option<RawResponse>,
    meta: RequestMeta,
    marks: HashSet<u32>,
    id: u32,
    start: Instant,
    cancel: CancellationToken,
}

impl QueryContext {
    pub fn new(query: Message, meta: RequestMeta) -> Self {
        Self {
            query,
            original_query: None,
            response: None,
            raw_response: None,
            meta,
            id: CONTEXT_UID.fetch_add(1, Ordering::Relaxed).wrapping_add(1),
            marks: HashSet::new(),
            start: Instant::now(),
            cancel: CancellationToken::new(),
        }
    }

    /// Cancellation signal of this request. The entry handler fires it when
    /// the per-query deadline passes; plugins doing fan-out I/O derive child
    /// tokens from it so their in-flight work dies with the request.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The current query. Earlier plugins may have rewritten it.
    pub fn query(&self) -> &Message {
        &self.query
    }

    pub fn query_mut(&mut self) -> &mut Message {
        &mut self.query
    }

    /// Snapshot of the query as it arrived. Copied on first access, so it
    /// must be touched before any plugin mutates the query to be exact.
    pub fn original_query(&mut self) -> &Message {
        if self.original_query.is_none() {
            self.original_query = Some(Box::new(self.query.clone()));
        }
        self.original_query.as_deref().unwrap()
    }

    pub fn response(&self) -> Option<&Message> {
        self.response.as_ref()
    }

    pub fn response_mut(&mut self) -> Option<&mut Message> {
        self.response.as_mut()
    }

    pub fn set_response(&mut self, r: Message) {
        self.raw_response = None;
        self.response = Some(r);
    }

    pub fn take_response(&mut self) -> Option<Message> {
        self.response.take()
    }

    pub fn raw_response(&self) -> Option<&RawResponse> {
        self.raw_response.as_ref()
    }

    pub fn set_raw_response(&mut self, raw: RawResponse) {
        self.response = None;
        self.raw_response = Some(raw);
    }

    pub fn take_raw_response(&mut self) -> Option<RawResponse> {
        self.raw_response.take()
    }

    /// Releases the raw buffer without transmitting it.
    pub fn release_raw_response(&mut self) {
        if let Some(raw) = self.raw_response.take() {
            raw.release();
        }
    }

    pub fn meta(&self) -> &RequestMeta {
        &self.meta
    }

    pub fn add_mark(&mut self, mark: u32) {
        self.marks.insert(mark);
    }

    pub fn has_mark(&self, mark: u32) -> bool {
        self.marks.contains(&mark)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn start_time(&self) -> Instant {
        self.start
    }

    /// One-line query summary for log fields.
    pub fn summary(&self) -> String {
        match self.query.queries().first() {
            Some(q) => format!(
                "{} {} {} {} {}",
                q.name(),
                q.query_class(),
                q.query_type(),
                self.query.id(),
                self.id
            ),
            None => format!("<no question> {} {}", self.query.id(), self.id),
        }
    }

    /// Copy used by the lazy-refresh path. Carries the query, metadata and
    /// marks but no response slots, so the background run cannot race the
    /// reply already handed to the client. The cancellation token is fresh:
    /// finishing the client's request must not kill the refresh.
    pub fn clone_for_background(&self) -> Self {
        Self {
            query: self.query.clone(),
            original_query: self.original_query.clone(),
            response: None,
            raw_response: None,
            meta: self.meta.clone(),
            marks: self.marks.clone(),
            id: self.id,
            start: self.start,
            cancel: CancellationToken::new(),
        }
    }
}

static ALLOCATED_MARK: Mutex<u32> = Mutex::new(0);

/// Hands out process-global mark ids, 1-based, monotonically increasing.
pub fn allocate_mark() -> Result<u32, DnsError> {
    let mut next = ALLOCATED_MARK.lock().expect("mark registry poisoned");
    let mark = next
        .checked_add(1)
        .ok_or_else(|| DnsError::Config("too many allocated marks".to_string()))?;
    *next = mark;
    Ok(mark)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::TransportProtocol;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn ctx() -> QueryContext {
        QueryContext::new(
            Message::new(),
            RequestMeta::unknown_client(TransportProtocol::Udp),
        )
    }

    #[test]
    fn parsed_and_raw_are_exclusive() {
        let mut c = ctx();
        c.set_response(Message::new());
        assert!(c.response().is_some());

        c.set_raw_response(RawResponse::unpooled(vec![0; 12]));
        assert!(c.response().is_none());
        assert!(c.raw_response().is_some());

        c.set_response(Message::new());
        assert!(c.raw_response().is_none());
    }

    #[test]
    fn release_hook_fires_exactly_once() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        let raw = RawResponse::new(
            vec![1, 2, 3],
            Box::new(move |_| {
                assert!(!fired2.swap(true, Ordering::SeqCst), "double release");
            }),
        );
        raw.release();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn release_hook_fires_on_drop() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        {
            let _raw = RawResponse::new(vec![1], Box::new(move |_| {
                fired2.store(true, Ordering::SeqCst);
            }));
        }
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn replacing_raw_releases_previous() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        let mut c = ctx();
        c.set_raw_response(RawResponse::new(
            vec![1],
            Box::new(move |_| fired2.store(true, Ordering::SeqCst)),
        ));
        c.set_response(Message::new());
        assert!(fired.load(Ordering::SeqCst), "old buffer must be returned");
    }

    #[test]
    fn background_copy_detaches_cancellation() {
        let c = ctx();
        let bg = c.clone_for_background();
        c.cancellation().cancel();
        assert!(c.cancellation().is_cancelled());
        assert!(!bg.cancellation().is_cancelled());
    }

    #[test]
    fn marks_allocate_one_based() {
        let a = allocate_mark().unwrap();
        let b = allocate_mark().unwrap();
        assert!(a >= 1);
        assert!(b > a);

        let mut c = ctx();
        assert!(!c.has_mark(a));
        c.add_mark(a);
        assert!(c.has_mark(a));
        assert!(!c.has_mark(b));
    }
}
