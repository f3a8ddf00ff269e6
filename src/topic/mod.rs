//! Topic matching engine.
//!
//! Maps wildcard topic filters to sets of subscriber identifiers. This is
//! the in-memory index that every node derives from the persisted
//! subscription records: never the system of record, always a cache that
//! the sync protocol repairs toward the store's contents.
//!
//! Mutation is serialized behind an internal RwLock because the
//! subscription path, the sync path, and the publish path all share one
//! matcher per node.

mod trie;
pub mod validation;

pub use trie::TopicTrie;
pub use validation::{contains_wildcard, validate_topic_filter, validate_topic_name};

use std::sync::Arc;

use ahash::AHashSet;
use parking_lot::RwLock;

/// Subscriber ids registered under a single filter
type SubscriberSet = AHashSet<Arc<str>>;

/// Thread-safe wildcard matcher
pub struct TopicMatcher {
    trie: RwLock<TopicTrie<SubscriberSet>>,
}

impl TopicMatcher {
    pub fn new() -> Self {
        Self {
            trie: RwLock::new(TopicTrie::new()),
        }
    }

    /// Register a subscriber under a filter. Idempotent; adding the same
    /// pair twice has no additional effect. Malformed filters are rejected.
    pub fn add(&self, filter: &str, subscriber: &str) -> Result<(), &'static str> {
        validation::validate_topic_filter(filter)?;

        let mut trie = self.trie.write();
        if let Some(set) = trie.get_mut(filter) {
            set.insert(Arc::from(subscriber));
        } else {
            let mut set = SubscriberSet::default();
            set.insert(Arc::from(subscriber));
            trie.insert(filter, set);
        }
        Ok(())
    }

    /// Remove a subscriber from a filter; no-op if either is absent.
    /// The filter entry is dropped from the trie once its set empties.
    pub fn remove(&self, filter: &str, subscriber: &str) {
        let mut trie = self.trie.write();
        if let Some(set) = trie.get_mut(filter) {
            set.remove(subscriber);
            if set.is_empty() {
                trie.remove(filter);
            }
        }
    }

    /// Every subscriber whose filter matches the topic, duplicate-free even
    /// when multiple filters match the same subscriber
    pub fn matches(&self, topic: &str) -> AHashSet<Arc<str>> {
        let trie = self.trie.read();
        let mut result = AHashSet::new();
        trie.matches(topic, |set| {
            for id in set {
                result.insert(id.clone());
            }
        });
        result
    }

    /// Snapshot of every (filter, subscribers) pair currently indexed.
    /// Used by the reconciliation sweep; not on the matching hot path.
    pub fn entries(&self) -> Vec<(String, Vec<Arc<str>>)> {
        let trie = self.trie.read();
        let mut out = Vec::new();
        trie.for_each_entry(|filter, set| {
            out.push((filter.to_string(), set.iter().cloned().collect()));
        });
        out
    }

    /// Total number of (filter, subscriber) associations
    pub fn len(&self) -> usize {
        let trie = self.trie.read();
        let mut count = 0;
        trie.for_each_entry(|_, set| count += set.len());
        count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TopicMatcher {
    fn default() -> Self {
        Self::new()
    }
}
