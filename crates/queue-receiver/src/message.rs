//! Message types for receiver operations including core domain identifiers.

use crate::error::ValidationError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated path of a queue or subscription, e.g. `orders` or
/// `orders/subscriptions/billing`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityPath(String);

impl EntityPath {
    /// Create new entity path with validation
    pub fn new(path: String) -> Result<Self, ValidationError> {
        if path.is_empty() || path.len() > 260 {
            return Err(ValidationError::OutOfRange {
                field: "entity_path".to_string(),
                message: "must be 1-260 characters".to_string(),
            });
        }

        if !path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
        {
            return Err(ValidationError::InvalidFormat {
                field: "entity_path".to_string(),
                message: "only ASCII alphanumeric, '-', '_', '.' and '/' allowed".to_string(),
            });
        }

        if path.split('/').any(|segment| segment.is_empty()) {
            return Err(ValidationError::InvalidFormat {
                field: "entity_path".to_string(),
                message: "no leading/trailing or consecutive '/'".to_string(),
            });
        }

        Ok(Self(path))
    }

    /// Path of a topic subscription
    pub fn subscription(topic: &str, subscription: &str) -> Result<Self, ValidationError> {
        Self::new(format!("{}/subscriptions/{}", topic, subscription))
    }

    /// Path of the dead-letter sub-queue of this entity
    pub fn dead_letter_path(&self) -> Self {
        Self(format!("{}/$deadletterqueue", self.0))
    }

    /// Get entity path as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityPath {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

/// Unique identifier for messages within the queue system
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Opaque 128-bit token correlating a locked message to one receiver.
///
/// A token is unique per lock grant. A message redelivered after its lock was
/// released or lost carries a fresh token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken(Uuid);

impl LockToken {
    /// Generate a new random lock token
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap a token issued by the broker
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LockToken {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = s.parse::<Uuid>().map_err(|e| ValidationError::InvalidFormat {
            field: "lock_token".to_string(),
            message: e.to_string(),
        })?;
        Ok(Self(id))
    }
}

/// Broker-assigned sequence number, monotonic and unique per entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceNumber(i64);

impl SequenceNumber {
    /// Sequence number before the first message of any entity
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> i64 {
        self.0
    }

    /// The sequence number immediately after this one
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl std::fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Timestamp `duration` after this one
    pub fn add_duration(&self, duration: Duration) -> Self {
        let delta = chrono::Duration::from_std(duration)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        Self(self.0 + delta)
    }

    /// Time from this timestamp until `later`, zero if `later` is not after it
    pub fn duration_until(&self, later: Timestamp) -> Duration {
        (later.0 - self.0).to_std().unwrap_or(Duration::ZERO)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dt = s.parse::<DateTime<Utc>>()?;
        Ok(Self::from_datetime(dt))
    }
}

// ============================================================================
// Receive Mode
// ============================================================================

/// How the broker hands messages to a receiver. Fixed for a receiver's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReceiveMode {
    /// Messages are locked on delivery and removed only on explicit settlement
    #[default]
    PeekLock,
    /// Messages are deleted by the broker as part of delivery
    ReceiveAndDelete,
}

impl ReceiveMode {
    /// Whether received messages carry lock tokens that must be settled
    pub fn tracks_locks(&self) -> bool {
        matches!(self, Self::PeekLock)
    }
}

impl std::fmt::Display for ReceiveMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PeekLock => write!(f, "PeekLock"),
            Self::ReceiveAndDelete => write!(f, "ReceiveAndDelete"),
        }
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// A message delivered by the broker.
///
/// Owned by the caller once returned. The receiver keeps only the lock token.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub message_id: MessageId,
    pub body: Bytes,
    pub properties: HashMap<String, String>,
    pub sequence_number: SequenceNumber,
    pub enqueued_at: Timestamp,
    pub delivery_count: u32,
    /// Present only for messages received in peek-lock mode
    pub lock_token: Option<LockToken>,
    pub locked_until: Option<Timestamp>,
}

impl ReceivedMessage {
    /// Get the lock token, if the message was received under a lock
    pub fn lock_token(&self) -> Option<LockToken> {
        self.lock_token
    }

    /// Check if the lock reported at delivery time has passed
    pub fn lock_expired(&self) -> bool {
        match self.locked_until {
            Some(locked_until) => Timestamp::now() >= locked_until,
            None => false,
        }
    }

    /// Body as UTF-8 text, if it is valid UTF-8
    pub fn body_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// Reason and optional description attached to a dead-lettered message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterReason {
    pub reason: String,
    pub description: Option<String>,
}

impl DeadLetterReason {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            description: None,
        }
    }

    /// Add a human readable description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
