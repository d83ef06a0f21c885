//! Single-flight regeneration lock.
//!
//! Taken with the store's add-if-absent when content changed under a
//! still-fresh entry. The holder regenerates; everyone else keeps serving the
//! old entry until the new one lands or the lock's TTL runs out.

use metrics::counter;
use tracing::debug;

use super::keys::UrlKey;
use super::store::EntryStore;

const METRIC_GENLOCK_TOTAL: &str = "pagefront_cache_genlock_total";

#[derive(Clone)]
pub struct RegenerationLock {
    store: EntryStore,
    ttl_seconds: u64,
}

impl RegenerationLock {
    pub fn new(store: EntryStore, ttl_seconds: u64) -> Self {
        Self { store, ttl_seconds }
    }

    /// Try to become the regenerator for `url_key`.
    pub async fn acquire(&self, url_key: &UrlKey) -> bool {
        let acquired = self
            .store
            .add_marker(&url_key.genlock_key(), self.ttl_seconds)
            .await;
        let result = if acquired { "acquired" } else { "contended" };
        debug!(url = %url_key, result, "regeneration lock");
        counter!(METRIC_GENLOCK_TOTAL, "result" => result).increment(1);
        acquired
    }

    /// Drop the lock. Missing locks are fine: the TTL may have beaten us.
    pub async fn release(&self, url_key: &UrlKey) {
        self.store.remove(&url_key.genlock_key()).await;
    }
}
