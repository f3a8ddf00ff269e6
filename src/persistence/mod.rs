//! Persistence layer for RelayMQ.
//!
//! Owns the four kinds of shared broker state:
//! - per-client subscription records (TTL'd)
//! - retained messages (last value per topic, no expiry)
//! - per-client offline backlogs (FIFO, TTL'd at enqueue)
//! - the derived in-memory topic matcher
//!
//! The store is the system of record; the matcher is a cache repaired
//! toward it by the sync protocol in [`crate::sync`]. All public
//! operations complete definitively with `Ok` or `Err`; the only
//! fire-and-forget piece is the cross-node broadcast, whose loss peers
//! tolerate by design.

mod backend;
mod error;
mod fjall;
mod memory;
pub(crate) mod models;

pub use backend::{NoticeStream, StateStore};
pub use error::{Result, StoreError};
pub use fjall::FjallStore;
pub use memory::MemoryStore;
pub use models::{StoredPacket, StoredSubscription, SubscriptionRecord, SyncNotice};

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::try_join_all;
use tracing::debug;

use crate::config::{Config, TtlConfig};
use crate::message::Packet;
use crate::session::{ClientSession, Subscription};
use crate::topic::{contains_wildcard, validate_topic_name, TopicMatcher};

/// Key namespaces. The braces hash-tag the keys so a Redis-style cluster
/// co-locates each namespace within a single shard.
pub(crate) const SUBS_PREFIX: &str = "{persistence:subs}:";
pub(crate) const PACKETS_PREFIX: &str = "{persistence:packets}:";
pub(crate) const RETAINED_KEY: &str = "{persistence:retained}";

pub(crate) fn subscription_key(client_id: &str) -> String {
    format!("{SUBS_PREFIX}{client_id}")
}

pub(crate) fn packet_key(client_id: &str) -> String {
    format!("{PACKETS_PREFIX}{client_id}")
}

pub(crate) fn client_from_subscription_key(key: &str) -> Option<&str> {
    key.strip_prefix(SUBS_PREFIX)
}

/// The persistence collaborator handed to the broker core
pub struct Persistence {
    store: Arc<dyn StateStore>,
    matcher: Arc<TopicMatcher>,
    ttl: TtlConfig,
    channel: String,
    node_id: String,
}

impl Persistence {
    pub fn new(
        store: Arc<dyn StateStore>,
        matcher: Arc<TopicMatcher>,
        node_id: impl Into<String>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            matcher,
            ttl: config.ttl.clone(),
            channel: config.sync.channel.clone(),
            node_id: node_id.into(),
        }
    }

    /// Persist the session's QoS > 0 subscriptions, index them in the
    /// local matcher, and announce the change to peers.
    ///
    /// The record write and the broadcast are independent and issued
    /// concurrently; completion means both finished (or the first error).
    /// No-op for clean sessions and for sessions with no QoS > 0
    /// subscriptions, which would otherwise leave empty records for every
    /// resync to re-read.
    pub async fn store_subscriptions(&self, session: &ClientSession) -> Result<()> {
        if session.clean {
            return Ok(());
        }

        let record = SubscriptionRecord::from_session(session);
        if record.is_empty() {
            return Ok(());
        }
        for filter in record.filters() {
            self.matcher.add(filter, &session.client_id)?;
        }

        let key = subscription_key(&session.client_id);
        let value = models::encode(&record)?;
        let notice = serde_json::to_vec(&SyncNotice {
            key: key.clone(),
            process: self.node_id.clone(),
        })?;

        debug!(client = %session.client_id, filters = record.entries.len(), "storing subscriptions");
        tokio::try_join!(
            self.store.set(&key, value, self.ttl.subscriptions),
            self.store.publish(&self.channel, notice),
        )?;
        Ok(())
    }

    /// Hand the persisted subscriptions back to a reconnecting session.
    ///
    /// The returned patterns are removed from the matcher (ownership moves
    /// back to the live session) and the persisted record is deleted. A
    /// missing or malformed record yields an empty map, never an error.
    /// Clean sessions get cleanup instead.
    pub async fn lookup_subscriptions(
        &self,
        session: &ClientSession,
    ) -> Result<HashMap<String, Subscription>> {
        if session.clean {
            self.clean_client(session).await?;
            return Ok(HashMap::new());
        }

        let key = subscription_key(&session.client_id);
        let record = match self.store.get(&key).await? {
            Some(bytes) => models::decode::<SubscriptionRecord>(&bytes).unwrap_or_default(),
            None => SubscriptionRecord::default(),
        };

        for filter in record.filters() {
            self.matcher.remove(filter, &session.client_id);
        }
        self.store.delete(&key).await?;

        Ok(record.into_map())
    }

    /// Remove every trace of a clean session's previous incarnations:
    /// matcher entries, the subscription record, and the offline backlog.
    ///
    /// Returns whether cleanup applied (it only does for clean sessions).
    pub async fn clean_client(&self, session: &ClientSession) -> Result<bool> {
        if !session.clean {
            return Ok(false);
        }

        let key = subscription_key(&session.client_id);
        if let Some(bytes) = self.store.get(&key).await? {
            if let Ok(record) = models::decode::<SubscriptionRecord>(&bytes) {
                for filter in record.filters() {
                    self.matcher.remove(filter, &session.client_id);
                }
            }
        }

        debug!(client = %session.client_id, "cleaning client state");
        self.store.delete(&key).await?;
        self.store.delete(&packet_key(&session.client_id)).await?;
        Ok(true)
    }

    /// Upsert the retained message for the packet's exact topic
    pub async fn store_retained(&self, packet: &Packet) -> Result<()> {
        validate_topic_name(&packet.topic)?;
        let value = models::encode(&StoredPacket::from(packet))?;
        self.store.hash_set(RETAINED_KEY, &packet.topic, value).await
    }

    /// Retained messages for a topic or wildcard pattern.
    ///
    /// An exact topic is a direct single-field fetch and never scans the
    /// index. A wildcard pattern enumerates the stored topics in sorted
    /// order, filters them through a throwaway matcher seeded with just
    /// that pattern, and fetches the matches concurrently.
    pub async fn lookup_retained(&self, pattern: &str) -> Result<Vec<Packet>> {
        if !contains_wildcard(pattern) {
            return Ok(match self.store.hash_get(RETAINED_KEY, pattern).await? {
                Some(bytes) => match models::decode::<StoredPacket>(&bytes) {
                    Ok(stored) => vec![stored.into()],
                    Err(_) => Vec::new(),
                },
                None => Vec::new(),
            });
        }

        let mut topics = self.store.hash_fields(RETAINED_KEY).await?;
        topics.sort_unstable();

        let probe = TopicMatcher::new();
        probe.add(pattern, "probe")?;
        let matched: Vec<String> = topics
            .into_iter()
            .filter(|topic| !probe.matches(topic).is_empty())
            .collect();

        let fetches = matched
            .iter()
            .map(|topic| self.store.hash_get(RETAINED_KEY, topic));
        let results = try_join_all(fetches).await?;

        let mut packets = Vec::with_capacity(results.len());
        for bytes in results.into_iter().flatten() {
            if let Ok(stored) = models::decode::<StoredPacket>(&bytes) {
                packets.push(stored.into());
            }
        }
        Ok(packets)
    }

    /// Append the packet to the backlog of every currently-tracked
    /// offline subscriber matching its topic. Never invents subscribers:
    /// clients absent from the matcher receive nothing.
    pub async fn store_offline_packet(&self, packet: &Packet) -> Result<()> {
        validate_topic_name(&packet.topic)?;

        let matched = self.matcher.matches(&packet.topic);
        if matched.is_empty() {
            return Ok(());
        }

        let value = models::encode(&StoredPacket::from(packet))?;
        debug!(topic = %packet.topic, subscribers = matched.len(), "queueing offline packet");

        let pushes = matched.iter().map(|client| {
            let key = packet_key(client);
            let value = value.clone();
            let ttl = self.ttl.packets;
            async move { self.store.list_push_back(&key, value, ttl).await }
        });
        try_join_all(pushes).await?;
        Ok(())
    }

    /// Drain the session's backlog in FIFO order, invoking the callback
    /// for each packet until the backlog is empty. Malformed entries are
    /// skipped. Clean sessions trigger cleanup and stream nothing.
    pub async fn stream_offline_packets<F>(
        &self,
        session: &ClientSession,
        mut on_packet: F,
    ) -> Result<()>
    where
        F: FnMut(Packet),
    {
        if self.clean_client(session).await? {
            return Ok(());
        }

        let key = packet_key(&session.client_id);
        while let Some(bytes) = self.store.list_pop_front(&key).await? {
            if let Ok(stored) = models::decode::<StoredPacket>(&bytes) {
                on_packet(stored.into());
            }
        }
        Ok(())
    }

    /// Disconnect from the store; no further operations are issued
    pub async fn close(&self) -> Result<()> {
        self.store.close().await
    }
}
