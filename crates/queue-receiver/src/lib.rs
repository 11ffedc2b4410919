//! # Queue Receiver
//!
//! Peek-lock message receiver for broker-backed queues and subscriptions.
//!
//! This library provides:
//! - Peek-lock and receive-and-delete consumption with optional prefetch
//! - Explicit settlement (complete, abandon, defer, dead-letter) with a single
//!   winner per lock token
//! - Lock renewal, on demand and in the background
//! - Non-destructive peek with a monotonic peek cursor
//! - An in-memory broker with fault injection for tests
//!
//! ## Module Organization
//!
//! - [`error`] - Error taxonomy for receiver operations
//! - [`message`] - Identifiers, receive modes and received messages
//! - [`transport`] - Request/response contract with the broker
//! - [`lock_registry`] - Lock entries and their settlement state machine
//! - [`receive`] - Receive, receive by sequence number and peek
//! - [`settlement`] - Settlement protocol
//! - [`renewal`] - Lock renewal
//! - [`receiver`] - Client-facing receiver traits and implementations
//! - [`config`] - Receiver and in-memory broker configuration
//! - [`providers`] - Transport implementations
//!
//! ## Example
//!
//! ```
//! use queue_receiver::{EntityPath, MessageReceiver, MessageReceiverFactory};
//! use std::time::Duration;
//!
//! tokio_test::block_on(async {
//!     let path = EntityPath::new("orders".to_string()).unwrap();
//!     let (broker, receiver) =
//!         MessageReceiverFactory::create_standalone_test_receiver(&path).unwrap();
//!     broker.enqueue(&path, "order-1");
//!
//!     let message = receiver
//!         .receive_with_wait(Duration::from_secs(1))
//!         .await
//!         .unwrap()
//!         .expect("message available");
//!     assert_eq!(message.body_as_str(), Some("order-1"));
//!
//!     receiver.complete(message.lock_token().unwrap()).await.unwrap();
//!     assert_eq!(broker.message_count(&path), 0);
//! });
//! ```

// Module declarations
pub mod config;
pub mod error;
pub mod lock_registry;
pub mod message;
pub mod providers;
pub mod receive;
pub mod receiver;
pub mod renewal;
pub mod settlement;
pub mod transport;

// Re-export commonly used types at crate root for convenience
pub use config::{InMemoryConfig, ReceiverConfig};
pub use error::{ConfigurationError, ReceiverError, ValidationError};
pub use lock_registry::{Disposition, LockEntry, LockOutcome, LockRegistry, LockState};
pub use message::{
    DeadLetterReason, EntityPath, LockToken, MessageId, ReceiveMode, ReceivedMessage,
    SequenceNumber, Timestamp,
};
pub use providers::{DeadLetteredMessage, InMemoryBroker, InMemoryLink, InjectedFault};
pub use receiver::{MessageReceiver, MessageReceiverFactory, StandardMessageReceiver};
pub use renewal::AutoRenewHandle;
pub use settlement::SettlementResult;
pub use transport::{BrokerRequest, BrokerResponse, RequestType, Transport, TransportError};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
