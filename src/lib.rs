//! RelayMQ - Clustered session-state persistence for MQTT-style brokers
//!
//! The state layer shared by a fleet of broker processes: per-client
//! subscription records, retained messages, offline packet backlogs, and
//! the wildcard topic matcher each node derives from them, kept
//! convergent across nodes by a broadcast-and-pull sync protocol.
//!
//! The wire protocol, listeners, and auth live in the broker core; this
//! crate is the collaborator it calls into.

pub mod config;
pub mod message;
pub mod persistence;
pub mod session;
pub mod sync;
pub mod topic;

pub use config::{BackendType, Config, ConfigError, StoreConfig, SyncConfig, TtlConfig};
pub use message::{Packet, QoS};
pub use persistence::{
    FjallStore, MemoryStore, Persistence, StateStore, StoreError, SubscriptionRecord, SyncNotice,
};
pub use session::{ClientSession, Subscription};
pub use sync::{ClusterSync, SyncState};
pub use topic::{TopicMatcher, TopicTrie};
