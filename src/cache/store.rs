//! Store collaborator contract and the typed entry accessor on top of it.
//!
//! The store is the only shared mutable resource of the page cache. Every
//! cross-request (and cross-process) coordination goes through its atomic
//! `add` and `increment` primitives.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use metrics::counter;
use thiserror::Error;
use tracing::{debug, warn};

use super::entry::CacheEntry;
use super::keys::{CacheKey, UrlKey};
use super::vary::VaryDimensionSet;

const METRIC_STORE_ERROR_TOTAL: &str = "pagefront_cache_store_error_total";

/// A key group inside the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub name: String,
    /// Values stay on the node that wrote them.
    pub local_only: bool,
}

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            local_only: false,
        }
    }

    /// Same group, replicated to every node.
    pub fn shared(&self) -> Self {
        Self {
            name: self.name.clone(),
            local_only: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }
}

/// Key-value store with TTLs and atomic `add`/`increment`.
///
/// A TTL of zero means the value never expires.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str, namespace: &Namespace) -> Result<Option<Bytes>, StoreError>;

    async fn set(
        &self,
        key: &str,
        value: Bytes,
        namespace: &Namespace,
        ttl_seconds: u64,
    ) -> Result<(), StoreError>;

    /// Store `value` only if `key` is absent. Returns false if it exists.
    async fn add(
        &self,
        key: &str,
        value: Bytes,
        namespace: &Namespace,
        ttl_seconds: u64,
    ) -> Result<bool, StoreError>;

    /// Atomically add `offset` to an integer value.
    ///
    /// Returns `None` if the key is missing or does not hold an integer.
    async fn increment(
        &self,
        key: &str,
        offset: i64,
        namespace: &Namespace,
    ) -> Result<Option<i64>, StoreError>;

    async fn delete(&self, key: &str, namespace: &Namespace) -> Result<bool, StoreError>;
}

/// Typed, fail-open access to page cache records.
///
/// Store failures are logged and counted, then reported as "absent" or
/// "not written" so the request carries on uncached.
#[derive(Clone)]
pub struct EntryStore {
    store: Arc<dyn Store>,
    namespace: Namespace,
}

impl EntryStore {
    pub fn new(store: Arc<dyn Store>, namespace: Namespace) -> Self {
        Self { store, namespace }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Read an entry. Malformed entries read as absent.
    pub async fn entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        let raw = self.get(key.as_str(), "get_entry").await?;
        let entry = CacheEntry::decode(&raw);
        if entry.is_none() {
            debug!(
                key = %key,
                "discarding malformed cache entry"
            );
        }
        entry
    }

    /// Replace the entry under `key`. Returns false if the write failed.
    pub async fn put_entry(&self, key: &CacheKey, entry: &CacheEntry, ttl_seconds: u64) -> bool {
        let encoded = match entry.encode() {
            Ok(encoded) => encoded,
            Err(err) => {
                record_failure("put_entry", &StoreError::from(err));
                return false;
            }
        };
        self.set(key.as_str(), encoded, ttl_seconds, "put_entry")
            .await
    }

    /// Current content version of a URL; zero until the URL is first invalidated.
    pub async fn url_version(&self, url_key: &UrlKey) -> i64 {
        self.get(&url_key.version_key(), "get_version")
            .await
            .and_then(|raw| parse_integer(&raw))
            .unwrap_or(0)
    }

    /// Increment the content version of a URL, creating it at zero first.
    pub async fn bump_version(&self, url_key: &UrlKey) -> Option<i64> {
        let key = url_key.version_key();
        self.add(&key, Bytes::from_static(b"0"), 0, "bump_version")
            .await;
        let version = self.increment(&key, 1, "bump_version").await?;

        // A local-only group would keep the bump on this node; push it out.
        if self.namespace.local_only {
            let shared = self.namespace.shared();
            if let Err(err) = self
                .store
                .set(&key, Bytes::from(version.to_string()), &shared, 0)
                .await
            {
                record_failure("bump_version", &err);
            }
        }

        Some(version)
    }

    /// Count one more request for `key` inside the sampling window.
    pub async fn count_request(&self, key: &CacheKey, ttl_seconds: u64) -> Option<i64> {
        let counter_key = key.counter_key();
        self.add(&counter_key, Bytes::from_static(b"0"), ttl_seconds, "count_request")
            .await;
        self.increment(&counter_key, 1, "count_request").await
    }

    /// Create `key` with a marker value if absent.
    pub async fn add_marker(&self, key: &str, ttl_seconds: u64) -> bool {
        self.add(key, Bytes::from_static(b"1"), ttl_seconds, "add_marker")
            .await
    }

    pub async fn remove(&self, key: &str) -> bool {
        match self.store.delete(key, &self.namespace).await {
            Ok(removed) => removed,
            Err(err) => {
                record_failure("delete", &err);
                false
            }
        }
    }

    /// Vary dimensions last persisted for a URL.
    pub async fn vary_dimensions(&self, url_key: &UrlKey) -> Option<VaryDimensionSet> {
        let raw = self.get(&url_key.vary_key(), "get_vary").await?;
        serde_json::from_slice(&raw).ok()
    }

    pub async fn put_vary_dimensions(
        &self,
        url_key: &UrlKey,
        set: &VaryDimensionSet,
        ttl_seconds: u64,
    ) -> bool {
        let encoded = match serde_json::to_vec(set) {
            Ok(encoded) => Bytes::from(encoded),
            Err(err) => {
                record_failure("put_vary", &StoreError::from(err));
                return false;
            }
        };
        self.set(&url_key.vary_key(), encoded, ttl_seconds, "put_vary")
            .await
    }

    async fn get(&self, key: &str, op: &'static str) -> Option<Bytes> {
        match self.store.get(key, &self.namespace).await {
            Ok(value) => value,
            Err(err) => {
                record_failure(op, &err);
                None
            }
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl_seconds: u64, op: &'static str) -> bool {
        match self
            .store
            .set(key, value, &self.namespace, ttl_seconds)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                record_failure(op, &err);
                false
            }
        }
    }

    async fn add(&self, key: &str, value: Bytes, ttl_seconds: u64, op: &'static str) -> bool {
        match self
            .store
            .add(key, value, &self.namespace, ttl_seconds)
            .await
        {
            Ok(added) => added,
            Err(err) => {
                record_failure(op, &err);
                false
            }
        }
    }

    async fn increment(&self, key: &str, offset: i64, op: &'static str) -> Option<i64> {
        match self.store.increment(key, offset, &self.namespace).await {
            Ok(value) => value,
            Err(err) => {
                record_failure(op, &err);
                None
            }
        }
    }
}

fn record_failure(op: &'static str, err: &StoreError) {
    warn!(
        op,
        error = %err,
        "page cache store operation failed; continuing uncached"
    );
    counter!(METRIC_STORE_ERROR_TOTAL, "op" => op).increment(1);
}

fn parse_integer(raw: &[u8]) -> Option<i64> {
    std::str::from_utf8(raw).ok()?.trim().parse().ok()
}
