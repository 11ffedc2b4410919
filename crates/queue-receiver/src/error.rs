//! Error types for receiver operations.

use crate::message::{LockToken, SequenceNumber};
use crate::transport::{RequestType, TransportError};
use std::time::Duration;
use thiserror::Error;

/// Comprehensive error type for all receiver operations
#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("{operation} timed out after {duration:?}")]
    Timeout {
        operation: RequestType,
        duration: Duration,
    },

    #[error("Transport failure during {operation}: {message}")]
    Transport {
        operation: RequestType,
        message: String,
    },

    #[error("Lock lost for token {lock_token}")]
    LockLost { lock_token: LockToken },

    #[error("Invalid operation: {message}")]
    InvalidOperation { message: String },

    #[error("No message available for sequence number {sequence_number}")]
    NotFound { sequence_number: SequenceNumber },

    #[error("Broker rejected the request: {reason}")]
    BrokerRejected { reason: String },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl ReceiverError {
    /// Map a transport failure into the receiver taxonomy for `operation`
    pub fn from_transport(operation: RequestType, error: TransportError) -> Self {
        match error {
            TransportError::Timeout { duration } => Self::Timeout {
                operation,
                duration,
            },
            TransportError::ConnectionFailed { message } => Self::Transport { operation, message },
        }
    }

    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Transport { .. } => true,
            Self::LockLost { .. } => false,
            Self::InvalidOperation { .. } => false,
            Self::NotFound { .. } => false,
            Self::BrokerRejected { .. } => false,
            Self::Configuration(_) => false,
            Self::Validation(_) => false,
        }
    }

    /// Check if error should be retried
    pub fn should_retry(&self) -> bool {
        self.is_transient()
    }

    /// Get suggested retry delay
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Timeout { .. } => Some(Duration::from_secs(1)),
            Self::Transport { .. } => Some(Duration::from_secs(5)),
            _ => None,
        }
    }

    /// Check if the error means the lock token can no longer be used
    pub fn is_lock_lost(&self) -> bool {
        matches!(self, Self::LockLost { .. })
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
