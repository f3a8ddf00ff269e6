//! Storage backend trait.
//!
//! Models the clustered key-value store the broker nodes share. The trait
//! covers exactly the primitives the persistence layer needs: a TTL'd KV
//! space, FIFO lists for offline backlogs, a field-per-topic hash for the
//! retained index, and a named broadcast channel for sync notices.
//!
//! Implementations: `MemoryStore` (in-process, shared handles) and
//! `FjallStore` (durable, single node). A networked cluster store plugs in
//! through the same seam.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use super::error::Result;

/// Receiving side of a backend broadcast channel subscription
pub struct NoticeStream {
    rx: broadcast::Receiver<Bytes>,
}

impl NoticeStream {
    pub fn new(rx: broadcast::Receiver<Bytes>) -> Self {
        Self { rx }
    }

    /// Next broadcast payload, or `None` once the channel is closed.
    /// A lagged receiver skips dropped messages and keeps going; the sync
    /// protocol tolerates missed notices (the resync sweep repairs them).
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("notice stream lagged, skipped {} messages", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Storage backend for the shared broker state
#[async_trait]
pub trait StateStore: Send + Sync {
    // ========================================================================
    // TTL'd key-value space (subscription records)
    // ========================================================================

    /// Set a key with a time-to-live. A zero TTL means no expiry.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    /// Get a key; expired keys read as absent
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete a key
    async fn delete(&self, key: &str) -> Result<()>;

    /// All live keys starting with the prefix
    async fn scan(&self, prefix: &str) -> Result<Vec<String>>;

    // ========================================================================
    // FIFO lists (offline backlogs)
    // ========================================================================

    /// Append a value at the tail of the list; the TTL applies to the
    /// whole list and is refreshed on every push
    async fn list_push_back(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    /// Pop the oldest value from the head of the list
    async fn list_pop_front(&self, key: &str) -> Result<Option<Vec<u8>>>;

    // ========================================================================
    // Hash (retained index, field per topic, no expiry)
    // ========================================================================

    /// Upsert a field in a hash
    async fn hash_set(&self, key: &str, field: &str, value: Vec<u8>) -> Result<()>;

    /// Direct fetch of a single field
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>>;

    /// All field names in a hash
    async fn hash_fields(&self, key: &str) -> Result<Vec<String>>;

    // ========================================================================
    // Broadcast channel (sync notices)
    // ========================================================================

    /// Publish a payload on a named channel; best-effort fan-out to every
    /// current subscriber, including the publishing node
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()>;

    /// Subscribe to a named channel
    async fn subscribe(&self, channel: &str) -> Result<NoticeStream>;

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Release resources; subsequent operations may fail with `Closed`
    async fn close(&self) -> Result<()>;
}
