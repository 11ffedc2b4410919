//! Lock renewal, on demand and in the background.
//!
//! A renewal never changes the settlement state of an entry. If a settlement
//! claims the token while the renewal request is in flight, the renewal
//! reports `LockLost` instead of touching the entry.

use crate::error::ReceiverError;
use crate::lock_registry::LockRegistry;
use crate::message::{LockToken, ReceiveMode, Timestamp};
use crate::transport::{BrokerRequest, BrokerResponse, RequestType, Transport, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

#[cfg(test)]
#[path = "renewal_tests.rs"]
mod tests;

/// Pause before retrying a renewal that failed transiently
const AUTO_RENEW_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Extends locks of messages that are still being processed
pub struct LockRenewalManager {
    registry: Arc<LockRegistry>,
    transport: Arc<dyn Transport>,
    mode: ReceiveMode,
    operation_timeout: Duration,
    auto_renew_margin: Duration,
    max_auto_renew: Duration,
}

impl LockRenewalManager {
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
            auto_renew_margin: Duration::from_secs(10),
            max_auto_renew: Duration::from_secs(300),
        }
    }

    /// Configure background renewal timing
    pub fn with_auto_renew(mut self, margin: Duration, max_duration: Duration) -> Self {
        self.auto_renew_margin = margin;
        self.max_auto_renew = max_duration;
        self
    }

    /// Ask the broker to extend the lock and return the new expiry.
    ///
    /// # Errors
    ///
    /// - `InvalidOperation` in receive-and-delete mode
    /// - `LockLost` if the entry is unknown, expired, settling or settled, or
    ///   the broker no longer holds the lock
    /// - `Timeout` / `Transport` on transport failure; the entry is unchanged
    #[instrument(skip(self), fields(lock_token = %lock_token))]
    pub async fn renew_lock(&self, lock_token: LockToken) -> Result<Timestamp, ReceiverError> {
        if !self.mode.tracks_locks() {
            return Err(ReceiverError::InvalidOperation {
                message: format!("cannot renew locks in {} mode", self.mode),
            });
        }

        if !self.registry.is_active(lock_token) {
            return Err(ReceiverError::LockLost { lock_token });
        }

        let outcome = match tokio::time::timeout(
            self.operation_timeout,
            self.transport.send(
                BrokerRequest::RenewLock { lock_token },
                self.operation_timeout,
            ),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::Timeout {
                duration: self.operation_timeout,
            }),
        };

        match outcome {
            Ok(BrokerResponse::LockRenewed { locked_until }) => {
                match self.registry.extend(lock_token, locked_until) {
                    Some(locked_until) => {
                        debug!(locked_until = %locked_until, "Lock renewed");
                        Ok(locked_until)
                    }
                    None => {
                        debug!("Lock renewed by broker but entry no longer active");
                        Err(ReceiverError::LockLost { lock_token })
                    }
                }
            }
            Ok(BrokerResponse::LockLost) => {
                self.registry.expire(lock_token);
                warn!("Broker reported lock lost during renewal");
                Err(ReceiverError::LockLost { lock_token })
            }
            Ok(BrokerResponse::Rejected { reason }) => {
                Err(ReceiverError::BrokerRejected { reason })
            }
            Ok(other) => {
                warn!(response = ?other, "Unexpected response to lock renewal");
                Err(ReceiverError::Transport {
                    operation: RequestType::RenewLock,
                    message: "unexpected response to RenewLock".to_string(),
                })
            }
            Err(error) => Err(ReceiverError::from_transport(RequestType::RenewLock, error)),
        }
    }

    /// Keep renewing `lock_token` in the background.
    ///
    /// Each renewal fires the configured margin before the current expiry.
    /// Renewal stops when the entry leaves `Locked`/`Failed`, the lock is lost,
    /// or the maximum auto-renew duration has elapsed. Dropping the returned
    /// handle does not stop the task; call [`AutoRenewHandle::stop`].
    ///
    /// # Errors
    ///
    /// - `InvalidOperation` when called outside a Tokio runtime
    pub fn start_auto_renew(
        self: &Arc<Self>,
        lock_token: LockToken,
    ) -> Result<AutoRenewHandle, ReceiverError> {
        let runtime = Handle::try_current().map_err(|_| ReceiverError::InvalidOperation {
            message: "auto-renew requires a Tokio runtime".to_string(),
        })?;

        let manager = Arc::clone(self);
        let deadline = Instant::now() + self.max_auto_renew;
        let task = runtime.spawn(async move { manager.auto_renew_loop(lock_token, deadline).await });

        Ok(AutoRenewHandle { lock_token, task })
    }

    async fn auto_renew_loop(&self, lock_token: LockToken, deadline: Instant) {
        loop {
            let Some(entry) = self.registry.lookup(lock_token) else {
                break;
            };
            if !entry.state().is_active() {
                debug!(lock_token = %lock_token, state = ?entry.state(), "Auto-renew finished");
                break;
            }

            let until_expiry = Timestamp::now().duration_until(entry.locked_until());
            let wait = until_expiry.saturating_sub(self.auto_renew_margin);
            if Instant::now() + wait >= deadline {
                debug!(lock_token = %lock_token, "Auto-renew reached its maximum duration");
                break;
            }
            tokio::time::sleep(wait).await;

            match self.renew_lock(lock_token).await {
                Ok(_) => {}
                Err(error) if error.is_transient() => {
                    warn!(lock_token = %lock_token, error = %error, "Auto-renew attempt failed");
                    tokio::time::sleep(AUTO_RENEW_RETRY_DELAY).await;
                }
                Err(error) => {
                    debug!(lock_token = %lock_token, error = %error, "Auto-renew stopped");
                    break;
                }
            }
        }
    }
}

/// Handle to a background auto-renew task
#[derive(Debug)]
pub struct AutoRenewHandle {
    lock_token: LockToken,
    task: JoinHandle<()>,
}

impl AutoRenewHandle {
    pub fn lock_token(&self) -> LockToken {
        self.lock_token
    }

    /// Check if the task has stopped on its own or been stopped
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop renewing
    pub fn stop(&self) {
        self.task.abort();
    }
}
