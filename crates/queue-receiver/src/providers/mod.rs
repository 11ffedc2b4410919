//! Broker implementations of the [`Transport`](crate::transport::Transport) contract.
//!
//! Only the in-process broker lives here; production transports are supplied
//! by the caller.

pub mod memory;

pub use memory::{DeadLetteredMessage, InMemoryBroker, InMemoryLink, InjectedFault};
