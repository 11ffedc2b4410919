//! Settlement of locked messages: complete, abandon, defer and dead-letter.
//!
//! Every settlement follows the same per-token protocol:
//!
//! 1. claim the token in the [`LockRegistry`] (`Locked` -> `Completing`);
//!    losing the claim fails fast with `LockLost` without contacting the broker
//! 2. send the settlement request
//! 3. record the outcome: `Settled` on success, `Expired` when the broker
//!    reports the lock lost, `Failed` on rejection, back to `Locked` on
//!    timeout or transport failure so the caller may retry
//!
//! A settlement future dropped while waiting for the broker leaves the entry
//! `Completing`. The broker may or may not have committed; later attempts on
//! that token report `LockLost` and the entry is evicted after its lock expiry.

use crate::error::ReceiverError;
use crate::lock_registry::{Disposition, LockOutcome, LockRegistry};
use crate::message::{DeadLetterReason, LockToken, ReceiveMode};
use crate::transport::{BrokerRequest, BrokerResponse, Transport, TransportError};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

#[cfg(test)]
#[path = "settlement_tests.rs"]
mod tests;

/// Result of settling one token of a batch
#[derive(Debug)]
pub struct SettlementResult {
    pub lock_token: LockToken,
    pub result: Result<(), ReceiverError>,
}

impl SettlementResult {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Executes settlements against the broker, one winner per lock token
pub struct SettlementCoordinator {
    registry: Arc<LockRegistry>,
    transport: Arc<dyn Transport>,
    mode: ReceiveMode,
    operation_timeout: Duration,
}

impl SettlementCoordinator {
    pub fn new(
        registry: Arc<LockRegistry>,
        transport: Arc<dyn Transport>,
        mode: ReceiveMode,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            transport,
            mode,
            operation_timeout,
        }
    }

    /// Remove the message from the entity
    pub async fn complete(&self, lock_token: LockToken) -> Result<(), ReceiverError> {
        self.settle(lock_token, Disposition::Completed, None).await
    }

    /// Complete several tokens independently.
    ///
    /// Results are returned in input order; a failing token does not stop
    /// the others.
    pub async fn complete_batch(&self, lock_tokens: &[LockToken]) -> Vec<SettlementResult> {
        join_all(lock_tokens.iter().map(|&lock_token| async move {
            SettlementResult {
                lock_token,
                result: self.complete(lock_token).await,
            }
        }))
        .await
    }

    /// Release the lock so the message becomes available again
    pub async fn abandon(&self, lock_token: LockToken) -> Result<(), ReceiverError> {
        self.settle(lock_token, Disposition::Abandoned, None).await
    }

    /// Set the message aside for retrieval by sequence number
    pub async fn defer(&self, lock_token: LockToken) -> Result<(), ReceiverError> {
        self.settle(lock_token, Disposition::Deferred, None).await
    }

    /// Move the message to the dead-letter sub-queue
    pub async fn dead_letter(
        &self,
        lock_token: LockToken,
        reason: Option<DeadLetterReason>,
    ) -> Result<(), ReceiverError> {
        self.settle(lock_token, Disposition::DeadLettered, reason)
            .await
    }

    #[instrument(skip(self, reason), fields(lock_token = %lock_token, disposition = ?disposition))]
    async fn settle(
        &self,
        lock_token: LockToken,
        disposition: Disposition,
        reason: Option<DeadLetterReason>,
    ) -> Result<(), ReceiverError> {
        if !self.mode.tracks_locks() {
            return Err(ReceiverError::InvalidOperation {
                message: format!(
                    "cannot settle messages received in {} mode",
                    self.mode
                ),
            });
        }

        if !self.registry.mark_settling(lock_token) {
            debug!("Settlement refused, lock not held");
            return Err(ReceiverError::LockLost { lock_token });
        }

        let request = settlement_request(lock_token, disposition, reason);
        let operation = request.request_type();
        let outcome = match tokio::time::timeout(
            self.operation_timeout,
            self.transport.send(request, self.operation_timeout),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::Timeout {
                duration: self.operation_timeout,
            }),
        };

        match outcome {
            Ok(BrokerResponse::Settled) => {
                self.registry
                    .finalize(lock_token, LockOutcome::Settled(disposition));
                debug!("Message settled");
                Ok(())
            }
            Ok(BrokerResponse::LockLost) => {
                self.registry.finalize(lock_token, LockOutcome::Expired);
                warn!("Broker reported lock lost during settlement");
                Err(ReceiverError::LockLost { lock_token })
            }
            Ok(BrokerResponse::Rejected { reason }) => {
                self.registry.mark_failed(lock_token);
                warn!(reason = %reason, "Broker rejected settlement");
                Err(ReceiverError::BrokerRejected { reason })
            }
            Ok(other) => {
                self.registry.restore(lock_token);
                warn!(response = ?other, "Unexpected response to settlement");
                Err(ReceiverError::Transport {
                    operation,
                    message: format!("unexpected response to {}", operation),
                })
            }
            Err(error) => {
                self.registry.restore(lock_token);
                warn!(error = %error, "Settlement failed, lock restored for retry");
                Err(ReceiverError::from_transport(operation, error))
            }
        }
    }
}

fn settlement_request(
    lock_token: LockToken,
    disposition: Disposition,
    reason: Option<DeadLetterReason>,
) -> BrokerRequest {
    match disposition {
        Disposition::Completed => BrokerRequest::Complete { lock_token },
        Disposition::Abandoned => BrokerRequest::Abandon { lock_token },
        Disposition::Deferred => BrokerRequest::Defer { lock_token },
        Disposition::DeadLettered => BrokerRequest::DeadLetter { lock_token, reason },
    }
}
