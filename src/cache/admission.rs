//! Traffic-gated admission.
//!
//! A page earns a cache slot by being requested `min_hits` times within
//! `window_seconds`. Counting only happens while there is no entry or the
//! entry has entered its trailing resample window, so hot pages do not pay
//! a counter round-trip on every hit.

use super::config::CacheConfig;
use super::entry::CacheEntry;
use super::genlock::RegenerationLock;
use super::keys::{CacheKey, UrlKey};
use super::store::EntryStore;

/// Outcome of admission for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Admission {
    /// The response generated for this request should be captured.
    pub should_cache: bool,
    /// Request count observed in the sampling window, if counting happened.
    pub requests: Option<i64>,
    /// This request holds the regeneration lock.
    pub genlock: bool,
}

#[derive(Clone)]
pub struct AdmissionController {
    store: EntryStore,
    lock: RegenerationLock,
    min_hits: u32,
    window_seconds: u64,
    sampling: bool,
}

impl AdmissionController {
    pub fn new(config: &CacheConfig, store: EntryStore) -> Self {
        let lock = RegenerationLock::new(store.clone(), config.genlock_ttl_seconds);
        Self {
            store,
            lock,
            min_hits: config.min_hits,
            window_seconds: config.window_seconds,
            sampling: config.sampling_enabled(),
        }
    }

    pub fn lock(&self) -> &RegenerationLock {
        &self.lock
    }

    pub async fn evaluate(
        &self,
        key: &CacheKey,
        url_key: &UrlKey,
        entry: Option<&CacheEntry>,
        url_version: i64,
        now: i64,
    ) -> Admission {
        let mut admission = Admission::default();

        if !self.sampling {
            admission.should_cache = true;
        } else if entry.is_none_or(|entry| entry.in_resample_window(now, self.window_seconds)) {
            let requests = self.store.count_request(key, self.window_seconds).await;
            admission.requests = requests;
            admission.should_cache = requests.unwrap_or(0) >= i64::from(self.min_hits);
        }

        let invalidated = entry.is_some_and(|entry| entry.content_version < url_version);
        if admission.should_cache && invalidated {
            admission.genlock = self.lock.acquire(url_key).await;
        }

        admission
    }
}
