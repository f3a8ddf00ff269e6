//! Client session state.
//!
//! Sessions are owned by the broker core; the persistence layer borrows them
//! to decide what to persist and what to clean up. A session with `clean`
//! set leaves no server-side state behind: nothing is written for it, and
//! reads trigger removal of anything a previous incarnation left around.

use std::collections::HashMap;
use std::sync::Arc;

use crate::message::QoS;

/// A single subscription held by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    /// Granted QoS for this filter
    pub qos: QoS,
}

impl Subscription {
    pub fn new(qos: QoS) -> Self {
        Self { qos }
    }
}

/// Client session
#[derive(Debug, Clone)]
pub struct ClientSession {
    /// Client identifier
    pub client_id: Arc<str>,
    /// Clean flag: if true, no state survives disconnect
    pub clean: bool,
    /// Topic filter -> subscription
    pub subscriptions: HashMap<String, Subscription>,
}

impl ClientSession {
    pub fn new(client_id: impl AsRef<str>, clean: bool) -> Self {
        Self {
            client_id: Arc::from(client_id.as_ref()),
            clean,
            subscriptions: HashMap::new(),
        }
    }

    /// Add or replace a subscription
    pub fn subscribe(&mut self, filter: impl Into<String>, qos: QoS) {
        self.subscriptions.insert(filter.into(), Subscription::new(qos));
    }

    /// Remove a subscription, returning whether it existed
    pub fn unsubscribe(&mut self, filter: &str) -> bool {
        self.subscriptions.remove(filter).is_some()
    }

    /// Subscriptions that survive a disconnect (QoS > 0)
    pub fn persistent_subscriptions(&self) -> impl Iterator<Item = (&str, &Subscription)> {
        self.subscriptions
            .iter()
            .filter(|(_, sub)| sub.qos.is_persistent())
            .map(|(filter, sub)| (filter.as_str(), sub))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistent_subscriptions_filters_qos0() {
        let mut session = ClientSession::new("client-1", false);
        session.subscribe("a/b", QoS::AtMostOnce);
        session.subscribe("c/+", QoS::AtLeastOnce);
        session.subscribe("d/#", QoS::ExactlyOnce);

        let mut filters: Vec<&str> = session
            .persistent_subscriptions()
            .map(|(filter, _)| filter)
            .collect();
        filters.sort_unstable();
        assert_eq!(filters, vec!["c/+", "d/#"]);
    }

    #[test]
    fn test_unsubscribe() {
        let mut session = ClientSession::new("client-1", false);
        session.subscribe("a/b", QoS::AtLeastOnce);
        assert!(session.unsubscribe("a/b"));
        assert!(!session.unsubscribe("a/b"));
    }
}
