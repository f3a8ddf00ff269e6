//! Cluster sync protocol.
//!
//! Keeps the per-node topic matchers convergent across a fleet of broker
//! processes sharing one store. On any node's subscription write, a
//! `SyncNotice` goes out on the broadcast channel; every other node
//! re-reads the named record and repairs its matcher from it. The store
//! record is always authoritative; the matcher only ever converges toward
//! it.
//!
//! This is best-effort gossip, not consensus: the store gives no
//! read-after-write visibility across nodes, so a notice can arrive before
//! the write it announces is readable. A read that misses is retried
//! exactly once after a fixed delay and then dropped silently. Notices can
//! also be lost outright; the full resync on startup and the periodic
//! reconciliation sweep bound how long a node can stay stale.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ahash::{AHashMap, AHashSet};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::persistence::{
    client_from_subscription_key, models, subscription_key, NoticeStream, Result, StateStore,
    SubscriptionRecord, SyncNotice, SUBS_PREFIX,
};
use crate::topic::TopicMatcher;

/// Protocol phase of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Not yet started
    Starting,
    /// Broadcast channel subscription in flight
    Subscribing,
    /// Receiving notices; matcher converging
    Active,
}

/// Generate the per-process identity token: hostname plus 64 bits derived
/// from the clock. Opaque, compared only for equality, stable for the
/// process lifetime.
fn generate_node_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "node".to_string());
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{}-{:016x}", host, nanos as u64)
}

/// Shared internals of the sync protocol, cloned into background tasks
struct SyncCore {
    node_id: String,
    store: Arc<dyn StateStore>,
    matcher: Arc<TopicMatcher>,
    retry_delay: Duration,
}

impl SyncCore {
    /// Read and decode a subscription record; misses, parse failures, and
    /// store errors all read as absent
    async fn read_record(&self, key: &str) -> Option<SubscriptionRecord> {
        match self.store.get(key).await {
            Ok(Some(bytes)) => models::decode(&bytes).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "sync read failed");
                None
            }
        }
    }

    /// The write we are chasing may not be visible yet: retry exactly once
    /// after the configured delay, then give up
    async fn read_record_with_retry(&self, key: &str) -> Option<SubscriptionRecord> {
        if let Some(record) = self.read_record(key).await {
            return Some(record);
        }
        tokio::time::sleep(self.retry_delay).await;
        self.read_record(key).await
    }

    /// Re-derive the matcher entries a subscription key should contain,
    /// replaying `add` for every filter in the fetched record
    async fn repair_key(&self, key: &str) {
        let Some(client_id) = client_from_subscription_key(key) else {
            debug!(key, "ignoring notice for unrecognized key");
            return;
        };

        match self.read_record_with_retry(key).await {
            Some(record) => {
                for filter in record.filters() {
                    if let Err(e) = self.matcher.add(filter, client_id) {
                        warn!(client = client_id, filter, error = e, "skipping invalid persisted filter");
                    }
                }
            }
            None => debug!(key, "record still missing after retry, dropping"),
        }
    }

    async fn notice_loop(self: Arc<Self>, mut notices: NoticeStream) {
        while let Some(payload) = notices.recv().await {
            let notice: SyncNotice = match serde_json::from_slice(&payload) {
                Ok(notice) => notice,
                Err(e) => {
                    debug!(error = %e, "ignoring malformed sync notice");
                    continue;
                }
            };

            // echo of our own write, already applied locally
            if notice.process == self.node_id {
                continue;
            }

            debug!(key = %notice.key, origin = %notice.process, "applying sync notice");
            self.repair_key(&notice.key).await;
        }
        debug!("notice stream closed");
    }

    /// Enumerate every subscription key in the store and repair the
    /// matcher from each; heals state missed during a restart or partition
    async fn full_resync(&self) -> Result<()> {
        let keys = self.store.scan(SUBS_PREFIX).await?;
        info!(records = keys.len(), "running full resync");
        for key in &keys {
            self.repair_key(key).await;
        }
        Ok(())
    }

    /// Prune matcher entries whose backing record expired or disappeared,
    /// and re-add filters the records hold but the matcher lost. Clients
    /// are gathered from both sides: the matcher snapshot and a store
    /// scan, so a record whose matcher entries vanished entirely is still
    /// repaired. Runs on the `ttl.check_frequency` interval; reads here
    /// are not retried, the next sweep covers any miss.
    async fn reconcile(&self) {
        let entries = self.matcher.entries();

        let mut clients: AHashSet<Arc<str>> = AHashSet::new();
        for (_, subscribers) in &entries {
            for client in subscribers {
                clients.insert(client.clone());
            }
        }
        match self.store.scan(SUBS_PREFIX).await {
            Ok(keys) => {
                for key in &keys {
                    if let Some(client) = client_from_subscription_key(key) {
                        clients.insert(Arc::from(client));
                    }
                }
            }
            Err(e) => warn!(error = %e, "reconciliation scan failed, sweeping matcher entries only"),
        }

        let mut records: AHashMap<Arc<str>, Option<AHashSet<String>>> = AHashMap::new();
        for client in clients {
            let filters = self
                .read_record(&subscription_key(&client))
                .await
                .map(|record| record.filters().map(str::to_string).collect());
            records.insert(client, filters);
        }

        let mut pruned = 0usize;
        for (filter, subscribers) in &entries {
            for client in subscribers {
                let backed = records
                    .get(client)
                    .and_then(|filters| filters.as_ref())
                    .is_some_and(|filters| filters.contains(filter));
                if !backed {
                    self.matcher.remove(filter, client);
                    pruned += 1;
                }
            }
        }

        for (client, filters) in &records {
            if let Some(filters) = filters {
                for filter in filters {
                    if let Err(e) = self.matcher.add(filter, client) {
                        warn!(client = %client, filter, error = e, "skipping invalid persisted filter");
                    }
                }
            }
        }

        if pruned > 0 {
            debug!(pruned, "reconciliation sweep pruned stale matcher entries");
        }
    }

    async fn sweep_loop(self: Arc<Self>, frequency: Duration) {
        let mut interval = tokio::time::interval(frequency);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await; // first tick fires immediately, skip it
        loop {
            interval.tick().await;
            self.reconcile().await;
        }
    }
}

/// Cluster sync coordinator for one node
pub struct ClusterSync {
    core: Arc<SyncCore>,
    channel: String,
    check_frequency: Duration,
    state: RwLock<SyncState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClusterSync {
    pub fn new(store: Arc<dyn StateStore>, matcher: Arc<TopicMatcher>, config: &Config) -> Self {
        Self::with_node_id(store, matcher, config, generate_node_id())
    }

    /// Construct with an explicit identity token (tests pin these)
    pub fn with_node_id(
        store: Arc<dyn StateStore>,
        matcher: Arc<TopicMatcher>,
        config: &Config,
        node_id: String,
    ) -> Self {
        Self {
            core: Arc::new(SyncCore {
                node_id,
                store,
                matcher,
                retry_delay: config.sync.retry_delay,
            }),
            channel: config.sync.channel.clone(),
            check_frequency: config.ttl.check_frequency,
            state: RwLock::new(SyncState::Starting),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// This node's identity token. `Persistence` stamps it into outgoing
    /// notices so the notice loop can recognize echoes.
    pub fn node_id(&self) -> &str {
        &self.core.node_id
    }

    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Subscribe to the broadcast channel, go active, and run the full
    /// resync. The notice loop and the reconciliation sweep keep running
    /// in the background until [`stop`](Self::stop).
    pub async fn start(&self) -> Result<()> {
        *self.state.write() = SyncState::Subscribing;
        let notices = self.core.store.subscribe(&self.channel).await?;
        *self.state.write() = SyncState::Active;
        info!(node = %self.core.node_id, channel = %self.channel, "cluster sync active");

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(self.core.clone().notice_loop(notices)));
        if !self.check_frequency.is_zero() {
            tasks.push(tokio::spawn(
                self.core.clone().sweep_loop(self.check_frequency),
            ));
        }
        drop(tasks);

        self.core.full_resync().await
    }

    /// Force a reconciliation sweep outside the regular interval
    pub async fn reconcile(&self) {
        self.core.reconcile().await;
    }

    /// Stop issuing sync operations. In-flight repair reads are abandoned
    /// rather than awaited.
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        *self.state.write() = SyncState::Starting;
    }
}

impl Drop for ClusterSync {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::QoS;
    use crate::persistence::{MemoryStore, Persistence};
    use crate::session::ClientSession;

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.sync.retry_delay = Duration::from_millis(50);
        config
    }

    async fn write_record(store: &MemoryStore, client: &str, filters: &[&str]) {
        let record = SubscriptionRecord {
            entries: filters
                .iter()
                .map(|f| crate::persistence::StoredSubscription {
                    filter: f.to_string(),
                    qos: 1,
                })
                .collect(),
        };
        store
            .set(
                &subscription_key(client),
                models::encode(&record).unwrap(),
                Duration::ZERO,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_transitions_to_active() {
        let store = Arc::new(MemoryStore::new());
        let matcher = Arc::new(TopicMatcher::new());
        let sync = ClusterSync::new(store, matcher, &fast_config());

        assert_eq!(sync.state(), SyncState::Starting);
        sync.start().await.unwrap();
        assert_eq!(sync.state(), SyncState::Active);
    }

    #[tokio::test]
    async fn test_full_resync_repairs_matcher() {
        let store = MemoryStore::new();
        write_record(&store, "c1", &["hello/#"]).await;
        write_record(&store, "c2", &["sensors/+/temp"]).await;

        let matcher = Arc::new(TopicMatcher::new());
        let sync = ClusterSync::new(Arc::new(store), matcher.clone(), &fast_config());
        sync.start().await.unwrap();

        assert!(matcher.matches("hello/42").contains("c1"));
        assert!(matcher.matches("sensors/a/temp").contains("c2"));
    }

    #[tokio::test]
    async fn test_self_notice_is_ignored() {
        let store = MemoryStore::new();
        let matcher = Arc::new(TopicMatcher::new());
        let config = fast_config();
        let sync = ClusterSync::with_node_id(
            Arc::new(store.handle()),
            matcher.clone(),
            &config,
            "node-self".to_string(),
        );
        sync.start().await.unwrap();

        write_record(&store, "c1", &["hello/#"]).await;
        let notice = serde_json::to_vec(&SyncNotice {
            key: subscription_key("c1"),
            process: "node-self".to_string(),
        })
        .unwrap();
        store.publish(&config.sync.channel, notice).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matcher.is_empty());
    }

    #[tokio::test]
    async fn test_peer_notice_repairs_matcher() {
        let store = MemoryStore::new();
        let matcher = Arc::new(TopicMatcher::new());
        let config = fast_config();
        let sync = ClusterSync::with_node_id(
            Arc::new(store.handle()),
            matcher.clone(),
            &config,
            "node-a".to_string(),
        );
        sync.start().await.unwrap();

        write_record(&store, "c1", &["hello/#"]).await;
        let notice = serde_json::to_vec(&SyncNotice {
            key: subscription_key("c1"),
            process: "node-b".to_string(),
        })
        .unwrap();
        store.publish(&config.sync.channel, notice).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matcher.matches("hello/42").contains("c1"));
    }

    #[tokio::test]
    async fn test_notice_before_write_lands_within_retry_window() {
        let store = MemoryStore::new();
        let matcher = Arc::new(TopicMatcher::new());
        let mut config = fast_config();
        config.sync.retry_delay = Duration::from_millis(100);
        let sync = ClusterSync::with_node_id(
            Arc::new(store.handle()),
            matcher.clone(),
            &config,
            "node-a".to_string(),
        );
        sync.start().await.unwrap();

        // notice first, record only becomes visible during the retry delay
        let notice = serde_json::to_vec(&SyncNotice {
            key: subscription_key("c1"),
            process: "node-b".to_string(),
        })
        .unwrap();
        store.publish(&config.sync.channel, notice).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        write_record(&store, "c1", &["hello/#"]).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(matcher.matches("hello/42").contains("c1"));
    }

    #[tokio::test]
    async fn test_reconcile_prunes_expired_entries() {
        let store = Arc::new(MemoryStore::new());
        let matcher = Arc::new(TopicMatcher::new());
        let sync = ClusterSync::new(store.clone(), matcher.clone(), &fast_config());

        // matcher claims a subscription the store no longer backs
        matcher.add("stale/#", "ghost").unwrap();
        write_record(&store, "live", &["fresh/#"]).await;
        matcher.add("fresh/#", "live").unwrap();

        sync.reconcile().await;

        assert!(matcher.matches("stale/42").is_empty());
        assert!(matcher.matches("fresh/42").contains("live"));
    }

    #[tokio::test]
    async fn test_reconcile_repairs_fully_lost_client() {
        let store = Arc::new(MemoryStore::new());
        let matcher = Arc::new(TopicMatcher::new());
        let sync = ClusterSync::new(store.clone(), matcher.clone(), &fast_config());

        // record exists but the matcher holds nothing at all for c1
        write_record(&store, "c1", &["a/#"]).await;
        assert!(matcher.is_empty());

        sync.reconcile().await;

        assert!(matcher.matches("a/x").contains("c1"));
    }

    #[tokio::test]
    async fn test_reconcile_readds_lost_filters() {
        let store = Arc::new(MemoryStore::new());
        let matcher = Arc::new(TopicMatcher::new());
        let sync = ClusterSync::new(store.clone(), matcher.clone(), &fast_config());

        // record holds two filters, matcher only knows one
        write_record(&store, "c1", &["a/#", "b/#"]).await;
        matcher.add("a/#", "c1").unwrap();

        sync.reconcile().await;

        assert!(matcher.matches("b/x").contains("c1"));
    }

    #[tokio::test]
    async fn test_write_path_and_sync_path_converge() {
        let store = MemoryStore::new();
        let config = fast_config();

        let matcher_a = Arc::new(TopicMatcher::new());
        let matcher_b = Arc::new(TopicMatcher::new());

        let sync_a = ClusterSync::new(Arc::new(store.handle()), matcher_a.clone(), &config);
        let sync_b = ClusterSync::new(Arc::new(store.handle()), matcher_b.clone(), &config);
        sync_a.start().await.unwrap();
        sync_b.start().await.unwrap();

        let persistence_a = Persistence::new(
            Arc::new(store.handle()),
            matcher_a.clone(),
            sync_a.node_id(),
            &config,
        );

        let mut session = ClientSession::new("c1", false);
        session.subscribe("hello/#", QoS::AtLeastOnce);
        persistence_a.store_subscriptions(&session).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matcher_a.matches("hello/42").contains("c1"));
        assert!(matcher_b.matches("hello/42").contains("c1"));
    }

    #[test]
    fn test_node_ids_are_unique_enough() {
        let a = generate_node_id();
        let b = generate_node_id();
        assert_ne!(a, b);
    }
}
