use std::sync::{Arc, Mutex};

use conduit_dns_application::context::RawResponse;

const MAX_POOLED: usize = 256;
const MAX_POOLED_CAPACITY: usize = 64 * 1024;

/// Freelist of wire buffers for the zero-unpack path.
///
/// A buffer leaves the pool inside a [`RawResponse`] whose release hook puts
/// it back; the hook fires exactly once, on every exit path, because the
/// response guards it behind drop.
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
        })
    }

    /// A zeroed-length buffer with at least `capacity` bytes reserved.
    pub fn get(self: &Arc<Self>, capacity: usize) -> Vec<u8> {
        let mut buf = self
            .free
            .lock()
            .expect("buffer pool poisoned")
            .pop()
            .unwrap_or_default();
        buf.clear();
        buf.reserve(capacity);
        buf
    }

    /// Wraps `buf` in a [`RawResponse`] that returns it here on release.
    pub fn into_raw_response(self: &Arc<Self>, buf: Vec<u8>) -> RawResponse {
        let pool = Arc::clone(self);
        RawResponse::new(
            buf,
            Box::new(move |returned| pool.put(returned)),
        )
    }

    fn put(&self, buf: Vec<u8>) {
        if buf.capacity() > MAX_POOLED_CAPACITY {
            return;
        }
        let mut free = self.free.lock().expect("buffer pool poisoned");
        if free.len() < MAX_POOLED {
            free.push(buf);
        }
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_returns_buffer() {
        let pool = BufferPool::new();
        let mut buf = pool.get(512);
        buf.extend_from_slice(&[1, 2, 3]);

        let raw = pool.into_raw_response(buf);
        assert_eq!(raw.bytes(), &[1, 2, 3]);
        assert_eq!(pool.idle(), 0);

        raw.release();
        assert_eq!(pool.idle(), 1);

        // The recycled buffer comes back empty.
        let again = pool.get(16);
        assert!(again.is_empty());
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn drop_also_returns_buffer() {
        let pool = BufferPool::new();
        {
            let _raw = pool.into_raw_response(pool.get(64));
        }
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn oversized_buffers_are_not_pooled() {
        let pool = BufferPool::new();
        let raw = pool.into_raw_response(vec![0u8; MAX_POOLED_CAPACITY + 1]);
        raw.release();
        assert_eq!(pool.idle(), 0);
    }
}
