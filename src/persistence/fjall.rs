//! Fjall-based store implementation.
//!
//! Durable single-node backend on fjall (an LSM-tree embedded database).
//! Three partitions back the three key spaces: `kv` for subscription
//! records, `queues` for offline backlogs, `hashes` for the retained index.
//!
//! TTLs are enforced lazily: every stored value carries an 8-byte
//! big-endian expiry timestamp (unix seconds, 0 = no expiry) and expired
//! values read as absent and are deleted on the way out. Queue entries are
//! keyed by a per-queue monotonic sequence so prefix iteration yields FIFO
//! order; their TTL is applied per entry at enqueue time.
//!
//! Broadcast channels are in-process only with this backend; a networked
//! cluster store is needed for cross-host notice delivery.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use tokio::sync::broadcast;

use super::backend::{NoticeStream, StateStore};
use super::error::{Result, StoreError};

const CHANNEL_CAPACITY: usize = 1024;

/// Separator between a logical key and its field/sequence suffix.
/// Topics and client ids cannot contain NUL, so this never collides.
const SEP: u8 = 0;

/// Durable implementation of [`StateStore`]
pub struct FjallStore {
    keyspace: Keyspace,
    kv: PartitionHandle,
    queues: PartitionHandle,
    hashes: PartitionHandle,
    channels: DashMap<String, broadcast::Sender<Bytes>>,
    next_seq: DashMap<String, u64>,
    closed: AtomicBool,
}

impl FjallStore {
    /// Open (or create) a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let keyspace = Config::new(path).open()?;

        let kv = keyspace.open_partition("kv", PartitionCreateOptions::default())?;
        let queues = keyspace.open_partition("queues", PartitionCreateOptions::default())?;
        let hashes = keyspace.open_partition("hashes", PartitionCreateOptions::default())?;

        Ok(Self {
            keyspace,
            kv,
            queues,
            hashes,
            channels: DashMap::new(),
            next_seq: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn now_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    /// Prefix the value with its expiry timestamp (0 = no expiry)
    fn encode_value(value: &[u8], ttl: Duration) -> Vec<u8> {
        let expires_at = if ttl.is_zero() {
            0
        } else {
            Self::now_secs().saturating_add(ttl.as_secs().max(1))
        };
        let mut out = Vec::with_capacity(8 + value.len());
        out.extend_from_slice(&expires_at.to_be_bytes());
        out.extend_from_slice(value);
        out
    }

    /// Strip the expiry header; `None` if the value has expired or the
    /// header is malformed
    fn decode_value(bytes: &[u8]) -> Option<Vec<u8>> {
        if bytes.len() < 8 {
            return None;
        }
        let expires_at = u64::from_be_bytes(bytes[..8].try_into().ok()?);
        if expires_at != 0 && Self::now_secs() >= expires_at {
            return None;
        }
        Some(bytes[8..].to_vec())
    }

    fn composite_key(key: &str, suffix: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(key.len() + 1 + suffix.len());
        out.extend_from_slice(key.as_bytes());
        out.push(SEP);
        out.extend_from_slice(suffix);
        out
    }

    fn queue_prefix(key: &str) -> Vec<u8> {
        Self::composite_key(key, &[])
    }

    /// Next sequence number for a queue, resuming from disk on first use
    fn next_queue_seq(&self, key: &str) -> Result<u64> {
        let mut entry = self.next_seq.entry(key.to_string()).or_insert(0);
        if *entry == 0 {
            let prefix = Self::queue_prefix(key);
            for item in self.queues.prefix(prefix) {
                let (entry_key, _) = item?;
                if entry_key.len() >= 8 {
                    let seq_bytes: [u8; 8] =
                        entry_key[entry_key.len() - 8..].try_into().unwrap_or([0; 8]);
                    *entry = (*entry).max(u64::from_be_bytes(seq_bytes) + 1);
                }
            }
        }
        let seq = *entry;
        *entry += 1;
        Ok(seq)
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Bytes> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl StateStore for FjallStore {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.check_open()?;
        self.kv.insert(key, Self::encode_value(&value, ttl))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        match self.kv.get(key)? {
            Some(bytes) => match Self::decode_value(&bytes) {
                Some(value) => Ok(Some(value)),
                None => {
                    self.kv.remove(key)?;
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_open()?;
        self.kv.remove(key)?;

        let prefix = Self::queue_prefix(key);
        let entry_keys: Vec<_> = self
            .queues
            .prefix(prefix)
            .map(|item| item.map(|(k, _)| k))
            .collect::<std::result::Result<_, _>>()?;
        for entry_key in entry_keys {
            self.queues.remove(entry_key)?;
        }
        self.next_seq.remove(key);
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_open()?;
        let mut keys = Vec::new();
        for item in self.kv.prefix(prefix) {
            let (key, value) = item?;
            if Self::decode_value(&value).is_some() {
                keys.push(String::from_utf8_lossy(&key).to_string());
            }
        }
        Ok(keys)
    }

    async fn list_push_back(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.check_open()?;
        let seq = self.next_queue_seq(key)?;
        let entry_key = Self::composite_key(key, &seq.to_be_bytes());
        self.queues.insert(entry_key, Self::encode_value(&value, ttl))?;
        Ok(())
    }

    async fn list_pop_front(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        let prefix = Self::queue_prefix(key);
        for item in self.queues.prefix(prefix) {
            let (entry_key, bytes) = item?;
            let decoded = Self::decode_value(&bytes);
            self.queues.remove(entry_key)?;
            // expired entries are dropped and the scan continues
            if let Some(value) = decoded {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    async fn hash_set(&self, key: &str, field: &str, value: Vec<u8>) -> Result<()> {
        self.check_open()?;
        let entry_key = Self::composite_key(key, field.as_bytes());
        self.hashes.insert(entry_key, value)?;
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        let entry_key = Self::composite_key(key, field.as_bytes());
        Ok(self.hashes.get(entry_key)?.map(|bytes| bytes.to_vec()))
    }

    async fn hash_fields(&self, key: &str) -> Result<Vec<String>> {
        self.check_open()?;
        let prefix = Self::composite_key(key, &[]);
        let mut fields = Vec::new();
        for item in self.hashes.prefix(prefix.clone()) {
            let (entry_key, _) = item?;
            fields.push(String::from_utf8_lossy(&entry_key[prefix.len()..]).to_string());
        }
        Ok(fields)
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        self.check_open()?;
        let _ = self.sender(channel).send(Bytes::from(payload));
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<NoticeStream> {
        self.check_open()?;
        Ok(NoticeStream::new(self.sender(channel).subscribe()))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}
