//! In-process store implementation.
//!
//! A `MemoryStore` handle is a client of one logical store; `handle()`
//! produces additional independent clients of the same store, which is how
//! tests run several "nodes" against shared state. TTLs are enforced
//! lazily, on read, the way the backing cluster store evicts keys.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;

use super::backend::{NoticeStream, StateStore};
use super::error::{Result, StoreError};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Debug, Default)]
struct ListEntry {
    items: VecDeque<Vec<u8>>,
    expires_at: Option<Instant>,
}

impl ListEntry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Default)]
struct Shared {
    kv: DashMap<String, Entry>,
    lists: DashMap<String, ListEntry>,
    hashes: DashMap<String, ahash::AHashMap<String, Vec<u8>>>,
    channels: DashMap<String, broadcast::Sender<Bytes>>,
}

/// In-process implementation of [`StateStore`]
pub struct MemoryStore {
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// A new client handle onto the same logical store. Closing one handle
    /// does not affect the others.
    pub fn handle(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn expiry(ttl: Duration) -> Option<Instant> {
        if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Bytes> {
        self.shared
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.check_open()?;
        self.shared.kv.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Self::expiry(ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        if let Some(entry) = self.shared.kv.get(key) {
            if entry.expired() {
                drop(entry);
                self.shared.kv.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_open()?;
        self.shared.kv.remove(key);
        self.shared.lists.remove(key);
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_open()?;
        let mut keys = Vec::new();
        for entry in self.shared.kv.iter() {
            if entry.key().starts_with(prefix) && !entry.value().expired() {
                keys.push(entry.key().clone());
            }
        }
        keys.sort_unstable();
        Ok(keys)
    }

    async fn list_push_back(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.check_open()?;
        let mut list = self.shared.lists.entry(key.to_string()).or_default();
        if list.expired() {
            list.items.clear();
        }
        list.items.push_back(value);
        list.expires_at = Self::expiry(ttl);
        Ok(())
    }

    async fn list_pop_front(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        let popped = if let Some(mut list) = self.shared.lists.get_mut(key) {
            if list.expired() {
                list.items.clear();
            }
            list.items.pop_front()
        } else {
            None
        };
        if popped.is_none() {
            // a concurrent push may have landed after the guard dropped;
            // only a still-empty list may be evicted
            self.shared
                .lists
                .remove_if(key, |_, list| list.items.is_empty());
        }
        Ok(popped)
    }

    async fn hash_set(&self, key: &str, field: &str, value: Vec<u8>) -> Result<()> {
        self.check_open()?;
        self.shared
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        Ok(self
            .shared
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field).cloned()))
    }

    async fn hash_fields(&self, key: &str) -> Result<Vec<String>> {
        self.check_open()?;
        Ok(self
            .shared
            .hashes
            .get(key)
            .map(|hash| hash.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        self.check_open()?;
        // no subscribers is not an error; broadcast is best-effort
        let _ = self.sender(channel).send(Bytes::from(payload));
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<NoticeStream> {
        self.check_open()?;
        Ok(NoticeStream::new(self.sender(channel).subscribe()))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_kv_ttl_expires() {
        let store = MemoryStore::new();
        store
            .set("k", b"v".to_vec(), Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.scan("k").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_fifo_order() {
        let store = MemoryStore::new();
        for i in 0u8..3 {
            store
                .list_push_back("q", vec![i], Duration::ZERO)
                .await
                .unwrap();
        }
        assert_eq!(store.list_pop_front("q").await.unwrap(), Some(vec![0]));
        assert_eq!(store.list_pop_front("q").await.unwrap(), Some(vec![1]));
        assert_eq!(store.list_pop_front("q").await.unwrap(), Some(vec![2]));
        assert_eq!(store.list_pop_front("q").await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_push_and_drain_loses_nothing() {
        let store = Arc::new(MemoryStore::new());

        let pusher = {
            let store = store.clone();
            tokio::spawn(async move {
                for i in 0u8..100 {
                    store
                        .list_push_back("q", vec![i], Duration::ZERO)
                        .await
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        // drain concurrently; pops that race the pusher to an empty list
        // must not evict values pushed in between
        let mut seen = 0u32;
        let drain = async {
            while seen < 100 {
                if store.list_pop_front("q").await.unwrap().is_some() {
                    seen += 1;
                } else {
                    tokio::task::yield_now().await;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), drain)
            .await
            .expect("drain saw all pushed values");
        pusher.await.unwrap();
        assert_eq!(seen, 100);
    }

    #[tokio::test]
    async fn test_handles_share_state() {
        let store = MemoryStore::new();
        let other = store.handle();
        store
            .set("k", b"v".to_vec(), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(other.get("k").await.unwrap(), Some(b"v".to_vec()));

        other.close().await.unwrap();
        assert!(matches!(other.get("k").await, Err(StoreError::Closed)));
        // the first handle is unaffected
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let store = MemoryStore::new();
        let mut sub_a = store.subscribe("ch").await.unwrap();
        let mut sub_b = store.handle().subscribe("ch").await.unwrap();

        store.publish("ch", b"hello".to_vec()).await.unwrap();

        assert_eq!(sub_a.recv().await.unwrap().as_ref(), b"hello");
        assert_eq!(sub_b.recv().await.unwrap().as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_hash_fields() {
        let store = MemoryStore::new();
        store.hash_set("h", "a", vec![1]).await.unwrap();
        store.hash_set("h", "b", vec![2]).await.unwrap();

        let mut fields = store.hash_fields("h").await.unwrap();
        fields.sort_unstable();
        assert_eq!(fields, vec!["a", "b"]);
        assert_eq!(store.hash_get("h", "a").await.unwrap(), Some(vec![1]));
        assert_eq!(store.hash_get("h", "c").await.unwrap(), None);
    }
}
