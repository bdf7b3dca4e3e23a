use std::sync::Arc;

use dashmap::DashSet;
use rustc_hash::FxBuildHasher;

/// Deduplicates concurrent background work by key.
///
/// The first caller for a key wins and receives a guard; followers get
/// `None` and return immediately. Dropping the guard forgets the key, so
/// the next trigger after completion starts a fresh flight.
#[derive(Clone)]
pub struct SingleFlight {
    inflight: Arc<DashSet<Vec<u8>, FxBuildHasher>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(DashSet::with_hasher(FxBuildHasher)),
        }
    }

    pub fn begin(&self, key: &[u8]) -> Option<FlightGuard> {
        if !self.inflight.insert(key.to_vec()) {
            return None;
        }
        Some(FlightGuard {
            set: Arc::clone(&self.inflight),
            key: key.to_vec(),
        })
    }

    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self::new()
    }
}

pub struct FlightGuard {
    set: Arc<DashSet<Vec<u8>, FxBuildHasher>>,
    key: Vec<u8>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.set.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_first_caller_wins() {
        let sf = SingleFlight::new();
        let guard = sf.begin(b"key");
        assert!(guard.is_some());
        assert!(sf.begin(b"key").is_none());
        assert!(sf.begin(b"other").is_some());
    }

    #[test]
    fn drop_forgets_the_key() {
        let sf = SingleFlight::new();
        drop(sf.begin(b"key").unwrap());
        assert!(sf.begin(b"key").is_some(), "new flight after completion");
    }
}
