//! Transport session contract consumed by the receiver.
//!
//! The transport owns the link to one queue or subscription and carries
//! request/response exchanges with the broker. Connection management, framing
//! and authentication live behind [`Transport`]; the receiver only sees typed
//! requests, typed responses and two failure kinds.

use crate::message::{
    DeadLetterReason, EntityPath, LockToken, ReceiveMode, ReceivedMessage, SequenceNumber,
    Timestamp,
};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Kind of request sent over the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Receive,
    ReceiveBySequence,
    Peek,
    Complete,
    Abandon,
    Defer,
    DeadLetter,
    RenewLock,
}

impl RequestType {
    /// Whether the request settles a lock
    pub fn is_settlement(&self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Abandon | Self::Defer | Self::DeadLetter
        )
    }
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Receive => "Receive",
            Self::ReceiveBySequence => "ReceiveBySequence",
            Self::Peek => "Peek",
            Self::Complete => "Complete",
            Self::Abandon => "Abandon",
            Self::Defer => "Defer",
            Self::DeadLetter => "DeadLetter",
            Self::RenewLock => "RenewLock",
        };
        write!(f, "{}", name)
    }
}

/// A request with its payload
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerRequest {
    Receive {
        max_count: u32,
        wait_time: Duration,
        mode: ReceiveMode,
    },
    ReceiveBySequence {
        sequence_numbers: Vec<SequenceNumber>,
        mode: ReceiveMode,
    },
    Peek {
        from_sequence_number: SequenceNumber,
        max_count: u32,
    },
    Complete {
        lock_token: LockToken,
    },
    Abandon {
        lock_token: LockToken,
    },
    Defer {
        lock_token: LockToken,
    },
    DeadLetter {
        lock_token: LockToken,
        reason: Option<DeadLetterReason>,
    },
    RenewLock {
        lock_token: LockToken,
    },
}

impl BrokerRequest {
    /// Get the request type
    pub fn request_type(&self) -> RequestType {
        match self {
            Self::Receive { .. } => RequestType::Receive,
            Self::ReceiveBySequence { .. } => RequestType::ReceiveBySequence,
            Self::Peek { .. } => RequestType::Peek,
            Self::Complete { .. } => RequestType::Complete,
            Self::Abandon { .. } => RequestType::Abandon,
            Self::Defer { .. } => RequestType::Defer,
            Self::DeadLetter { .. } => RequestType::DeadLetter,
            Self::RenewLock { .. } => RequestType::RenewLock,
        }
    }

    /// Lock token targeted by a settlement or renewal request
    pub fn lock_token(&self) -> Option<LockToken> {
        match self {
            Self::Complete { lock_token }
            | Self::Abandon { lock_token }
            | Self::Defer { lock_token }
            | Self::DeadLetter { lock_token, .. }
            | Self::RenewLock { lock_token } => Some(*lock_token),
            _ => None,
        }
    }
}

/// Broker answer to a request
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerResponse {
    /// Messages for receive, receive-by-sequence and peek requests
    Messages(Vec<ReceivedMessage>),
    /// Settlement committed
    Settled,
    /// Lock extended
    LockRenewed { locked_until: Timestamp },
    /// Lock token unknown, expired, or already settled on the broker
    LockLost,
    /// Request failed broker-side validation
    Rejected { reason: String },
}

/// Connection-level failures reported by the transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("No response within {duration:?}")]
    Timeout { duration: Duration },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },
}

/// Request/response session with the broker for one entity.
///
/// Implementations must accept concurrent outstanding requests or queue them
/// internally, and must honour `timeout` as the deadline for the response.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and await the broker response
    async fn send(
        &self,
        request: BrokerRequest,
        timeout: Duration,
    ) -> Result<BrokerResponse, TransportError>;

    /// Entity this session is linked to
    fn entity_path(&self) -> &EntityPath;
}
