//! In-process [`Store`] backed by a concurrent map.
//!
//! Good for a single node and for tests. `add` and `increment` are atomic
//! per key through the map's shard locks.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, mapref::entry::Entry};

use crate::cache::{Namespace, Store, StoreError};
use crate::util::clock::{Clock, SystemClock};

#[derive(Debug, Clone)]
struct Slot {
    value: Bytes,
    /// Unix seconds; `None` never expires.
    expires_at: Option<i64>,
}

impl Slot {
    fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

pub struct MemoryStore {
    slots: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: DashMap::new(),
            clock,
        }
    }

    /// Number of live values across all namespaces.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.slots
            .iter()
            .filter(|slot| !slot.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired values. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.is_expired(now));
        before.saturating_sub(self.slots.len())
    }

    fn slot(&self, value: Bytes, ttl_seconds: u64) -> Slot {
        let expires_at = (ttl_seconds > 0)
            .then(|| self.clock.now().saturating_add_unsigned(ttl_seconds));
        Slot { value, expires_at }
    }
}

fn slot_key(key: &str, namespace: &Namespace) -> String {
    format!("{}:{key}", namespace.name)
}

fn parse_integer(raw: &[u8]) -> Option<i64> {
    std::str::from_utf8(raw).ok()?.trim().parse().ok()
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str, namespace: &Namespace) -> Result<Option<Bytes>, StoreError> {
        let slot_key = slot_key(key, namespace);
        let now = self.clock.now();

        let value = self
            .slots
            .get(&slot_key)
            .filter(|slot| !slot.is_expired(now))
            .map(|slot| slot.value.clone());
        if value.is_none() {
            self.slots
                .remove_if(&slot_key, |_, slot| slot.is_expired(now));
        }
        Ok(value)
    }

    async fn set(
        &self,
        key: &str,
        value: Bytes,
        namespace: &Namespace,
        ttl_seconds: u64,
    ) -> Result<(), StoreError> {
        let slot = self.slot(value, ttl_seconds);
        self.slots.insert(slot_key(key, namespace), slot);
        Ok(())
    }

    async fn add(
        &self,
        key: &str,
        value: Bytes,
        namespace: &Namespace,
        ttl_seconds: u64,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let slot = self.slot(value, ttl_seconds);

        match self.slots.entry(slot_key(key, namespace)) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(slot);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
                Ok(true)
            }
        }
    }

    async fn increment(
        &self,
        key: &str,
        offset: i64,
        namespace: &Namespace,
    ) -> Result<Option<i64>, StoreError> {
        let now = self.clock.now();
        let Some(mut slot) = self.slots.get_mut(&slot_key(key, namespace)) else {
            return Ok(None);
        };
        if slot.is_expired(now) {
            return Ok(None);
        }
        let Some(current) = parse_integer(&slot.value) else {
            return Ok(None);
        };

        // Counters never go below zero.
        let next = current.saturating_add(offset).max(0);
        slot.value = Bytes::from(next.to_string());
        Ok(Some(next))
    }

    async fn delete(&self, key: &str, namespace: &Namespace) -> Result<bool, StoreError> {
        let now = self.clock.now();
        Ok(self
            .slots
            .remove(&slot_key(key, namespace))
            .is_some_and(|(_, slot)| !slot.is_expired(now)))
    }
}

#[cfg(test)]
mod tests {
    use crate::util::clock::ManualClock;

    use super::*;

    fn store_at(now: i64) -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now));
        (MemoryStore::new(clock.clone()), clock)
    }

    fn ns() -> Namespace {
        Namespace::new("test")
    }

    #[tokio::test]
    async fn values_expire_after_ttl() {
        let (store, clock) = store_at(1_000);
        store
            .set("page", Bytes::from_static(b"x"), &ns(), 10)
            .await
            .unwrap();

        clock.set(1_009);
        assert!(store.get("page", &ns()).await.unwrap().is_some());
        clock.set(1_010);
        assert!(store.get("page", &ns()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_ttl_never_expires() {
        let (store, clock) = store_at(0);
        store
            .set("version", Bytes::from_static(b"1"), &ns(), 0)
            .await
            .unwrap();
        clock.set(i64::from(u32::MAX));
        assert!(store.get("version", &ns()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn add_only_succeeds_once() {
        let (store, _) = store_at(0);
        assert!(store.add("lock", Bytes::from_static(b"1"), &ns(), 10).await.unwrap());
        assert!(!store.add("lock", Bytes::from_static(b"1"), &ns(), 10).await.unwrap());
    }

    #[tokio::test]
    async fn add_replaces_expired_value() {
        let (store, clock) = store_at(0);
        assert!(store.add("lock", Bytes::from_static(b"1"), &ns(), 10).await.unwrap());
        clock.set(10);
        assert!(store.add("lock", Bytes::from_static(b"1"), &ns(), 10).await.unwrap());
    }

    #[tokio::test]
    async fn increment_requires_an_integer() {
        let (store, _) = store_at(0);
        assert_eq!(store.increment("missing", 1, &ns()).await.unwrap(), None);

        store
            .set("text", Bytes::from_static(b"abc"), &ns(), 0)
            .await
            .unwrap();
        assert_eq!(store.increment("text", 1, &ns()).await.unwrap(), None);

        store
            .add("count", Bytes::from_static(b"0"), &ns(), 0)
            .await
            .unwrap();
        assert_eq!(store.increment("count", 1, &ns()).await.unwrap(), Some(1));
        assert_eq!(store.increment("count", 5, &ns()).await.unwrap(), Some(6));
        assert_eq!(store.increment("count", -10, &ns()).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let (store, _) = store_at(0);
        store
            .set("k", Bytes::from_static(b"a"), &Namespace::new("one"), 0)
            .await
            .unwrap();
        assert!(store.get("k", &Namespace::new("two")).await.unwrap().is_none());
        assert!(!store.delete("k", &Namespace::new("two")).await.unwrap());
        assert!(store.delete("k", &Namespace::new("one")).await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn purge_drops_only_expired_values() {
        let (store, clock) = store_at(0);
        store
            .set("short", Bytes::from_static(b"1"), &ns(), 5)
            .await
            .unwrap();
        store
            .set("long", Bytes::from_static(b"1"), &ns(), 50)
            .await
            .unwrap();
        clock.set(10);
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }
}
