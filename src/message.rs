//! Message types shared by the persistence components.
//!
//! A `Packet` is the unit handed to us by the broker core on publish: a
//! concrete topic (no wildcards), an opaque byte payload, and delivery
//! metadata. The wire-level framing lives outside this crate.

use bytes::Bytes;

/// Quality of service level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    /// Subscriptions at this level are persisted and tracked for offline
    /// delivery; QoS 0 subscriptions stay local to the owning node.
    pub fn is_persistent(self) -> bool {
        self != QoS::AtMostOnce
    }
}

/// A published message as seen by the persistence layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Concrete topic name (never contains wildcards)
    pub topic: String,
    /// Message payload
    pub payload: Bytes,
    /// Delivery QoS
    pub qos: QoS,
    /// Message identifier, if the broker core assigned one
    pub message_id: Option<u16>,
    /// Retain flag
    pub retain: bool,
}

impl Packet {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            message_id: None,
            retain: false,
        }
    }

    pub fn retained(mut self) -> Self {
        self.retain = true;
        self
    }

    pub fn with_message_id(mut self, id: u16) -> Self {
        self.message_id = Some(id);
        self
    }
}
