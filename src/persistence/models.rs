//! Serializable data models for persistence.
//!
//! Stored values use bincode (compact, versioned by us); the cross-node
//! sync notice is JSON-shaped because it travels over the shared broadcast
//! channel and peers written in other stacks must be able to read it.

use std::collections::HashMap;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::message::{Packet, QoS};
use crate::session::{ClientSession, Subscription};

/// Stored packet, the serialized form of one offline or retained message
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredPacket {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub message_id: Option<u16>,
    pub retain: bool,
}

impl From<&Packet> for StoredPacket {
    fn from(packet: &Packet) -> Self {
        Self {
            topic: packet.topic.clone(),
            payload: packet.payload.to_vec(),
            qos: packet.qos as u8,
            message_id: packet.message_id,
            retain: packet.retain,
        }
    }
}

impl From<StoredPacket> for Packet {
    fn from(stored: StoredPacket) -> Self {
        Self {
            topic: stored.topic,
            // restore the payload to its native byte-sequence form
            payload: bytes::Bytes::from(stored.payload),
            qos: QoS::from_u8(stored.qos).unwrap_or_default(),
            message_id: stored.message_id,
            retain: stored.retain,
        }
    }
}

/// One persisted subscription entry
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredSubscription {
    pub filter: String,
    pub qos: u8,
}

/// The record written under `{persistence:subs}:<clientId>`: every
/// non-trivial (QoS > 0) subscription the client holds
#[derive(Debug, Clone, Default, Encode, Decode)]
pub struct SubscriptionRecord {
    pub entries: Vec<StoredSubscription>,
}

impl SubscriptionRecord {
    /// Build the record from a session, keeping only QoS > 0 subscriptions
    pub fn from_session(session: &ClientSession) -> Self {
        Self {
            entries: session
                .persistent_subscriptions()
                .map(|(filter, sub)| StoredSubscription {
                    filter: filter.to_string(),
                    qos: sub.qos as u8,
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Filters contained in the record
    pub fn filters(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.filter.as_str())
    }

    /// Convert back to the runtime subscription map
    pub fn into_map(self) -> HashMap<String, Subscription> {
        self.entries
            .into_iter()
            .map(|e| {
                (
                    e.filter,
                    Subscription::new(QoS::from_u8(e.qos).unwrap_or_default()),
                )
            })
            .collect()
    }
}

/// Transient gossip message announcing that a persisted key changed.
/// Never stored, only transported over the broadcast channel as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncNotice {
    /// The persisted key that changed
    pub key: String,
    /// Identity token of the originating node, used only to filter echoes
    pub process: String,
}

pub(crate) fn encode<T: Encode>(value: &T) -> super::error::Result<Vec<u8>> {
    bincode::encode_to_vec(value, bincode::config::standard()).map_err(Into::into)
}

pub(crate) fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> super::error::Result<T> {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(Into::into)
}
