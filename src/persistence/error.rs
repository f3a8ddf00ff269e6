//! Persistence error types.

use std::fmt;

/// Errors surfaced by the persistence layer.
///
/// Malformed stored records are deliberately NOT an error kind on the read
/// paths: subscription and packet reads treat them as absent, favoring
/// availability over surfacing transient corruption.
#[derive(Debug)]
pub enum StoreError {
    /// IO error
    Io(std::io::Error),
    /// The underlying store operation failed (network/timeout/protocol)
    Unavailable(String),
    /// Serialization error
    Serialize(String),
    /// Deserialization error (only for values we wrote ourselves, e.g. config)
    Deserialize(String),
    /// A topic filter or topic name failed validation
    InvalidTopic(&'static str),
    /// The store handle has been closed
    Closed,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::Unavailable(e) => write!(f, "store unavailable: {}", e),
            Self::Serialize(e) => write!(f, "serialization error: {}", e),
            Self::Deserialize(e) => write!(f, "deserialization error: {}", e),
            Self::InvalidTopic(e) => write!(f, "invalid topic: {}", e),
            Self::Closed => write!(f, "store is closed"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<fjall::Error> for StoreError {
    fn from(err: fjall::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for StoreError {
    fn from(err: bincode::error::EncodeError) -> Self {
        Self::Serialize(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for StoreError {
    fn from(err: bincode::error::DecodeError) -> Self {
        Self::Deserialize(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialize(err.to_string())
    }
}

impl From<&'static str> for StoreError {
    fn from(err: &'static str) -> Self {
        Self::InvalidTopic(err)
    }
}

/// Result type for persistence operations.
pub type Result<T> = std::result::Result<T, StoreError>;
