//! Client-facing receiver traits and implementations.
//!
//! [`StandardMessageReceiver`] composes the lock registry, receive engine,
//! settlement coordinator and renewal manager over one [`Transport`] and owns
//! the background eviction task that publishes lock expirations.

use crate::config::{InMemoryConfig, ReceiverConfig};
use crate::error::{ConfigurationError, ReceiverError};
use crate::lock_registry::{LockEntry, LockRegistry};
use crate::message::{
    DeadLetterReason, EntityPath, LockToken, ReceiveMode, ReceivedMessage, SequenceNumber,
    Timestamp,
};
use crate::providers::InMemoryBroker;
use crate::receive::ReceiveEngine;
use crate::renewal::{AutoRenewHandle, LockRenewalManager};
use crate::settlement::{SettlementCoordinator, SettlementResult};
use crate::transport::Transport;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "receiver_tests.rs"]
mod tests;

/// Buffered expiry notifications per subscriber before the oldest are dropped
const EXPIRATION_CHANNEL_CAPACITY: usize = 256;

/// Main interface for consuming messages from a queue or subscription
#[async_trait]
pub trait MessageReceiver: Send + Sync {
    /// Entity this receiver is linked to
    fn path(&self) -> &EntityPath;

    /// Receive mode, fixed for the lifetime of the receiver
    fn receive_mode(&self) -> ReceiveMode;

    /// Messages fetched ahead of demand
    fn prefetch_count(&self) -> u32;

    /// Change the prefetch count for subsequent receives
    fn set_prefetch_count(&self, prefetch_count: u32);

    /// Highest sequence number returned by a peek so far
    fn last_peeked_sequence_number(&self) -> SequenceNumber;

    /// Receive a single message using the default wait time
    async fn receive(&self) -> Result<Option<ReceivedMessage>, ReceiverError>;

    /// Receive a single message, waiting at most `wait_time`
    async fn receive_with_wait(
        &self,
        wait_time: Duration,
    ) -> Result<Option<ReceivedMessage>, ReceiverError>;

    /// Receive up to `max_count` messages using the default wait time
    async fn receive_batch(&self, max_count: u32) -> Result<Vec<ReceivedMessage>, ReceiverError>;

    /// Receive up to `max_count` messages, waiting at most `wait_time`
    async fn receive_batch_with_wait(
        &self,
        max_count: u32,
        wait_time: Duration,
    ) -> Result<Vec<ReceivedMessage>, ReceiverError>;

    /// Receive one deferred message by sequence number
    async fn receive_by_sequence_number(
        &self,
        sequence_number: SequenceNumber,
    ) -> Result<ReceivedMessage, ReceiverError>;

    /// Receive several deferred messages; one result per sequence number
    async fn receive_by_sequence_numbers(
        &self,
        sequence_numbers: &[SequenceNumber],
    ) -> Result<Vec<Result<ReceivedMessage, ReceiverError>>, ReceiverError>;

    /// Mark message as successfully processed
    async fn complete(&self, lock_token: LockToken) -> Result<(), ReceiverError>;

    /// Complete several messages; one result per token
    async fn complete_batch(
        &self,
        lock_tokens: &[LockToken],
    ) -> Result<Vec<SettlementResult>, ReceiverError>;

    /// Return message to the entity for redelivery
    async fn abandon(&self, lock_token: LockToken) -> Result<(), ReceiverError>;

    /// Set message aside for retrieval by sequence number
    async fn defer(&self, lock_token: LockToken) -> Result<(), ReceiverError>;

    /// Send message to the dead-letter sub-queue
    async fn dead_letter(&self, lock_token: LockToken) -> Result<(), ReceiverError>;

    /// Send message to the dead-letter sub-queue with a reason
    async fn dead_letter_with_reason(
        &self,
        lock_token: LockToken,
        reason: DeadLetterReason,
    ) -> Result<(), ReceiverError>;

    /// Extend the lock and return the new expiry
    async fn renew_lock(&self, lock_token: LockToken) -> Result<Timestamp, ReceiverError>;

    /// Keep renewing the lock in the background until it is settled or lost
    fn auto_renew(&self, lock_token: LockToken) -> Result<AutoRenewHandle, ReceiverError>;

    /// Peek the next message after the peek cursor
    async fn peek(&self) -> Result<Option<ReceivedMessage>, ReceiverError>;

    /// Peek up to `max_count` messages after the peek cursor
    async fn peek_batch(&self, max_count: u32) -> Result<Vec<ReceivedMessage>, ReceiverError>;

    /// Peek the first message at or after `from`
    async fn peek_by_sequence_number(
        &self,
        from: SequenceNumber,
    ) -> Result<Option<ReceivedMessage>, ReceiverError>;

    /// Peek up to `max_count` messages at or after `from`
    async fn peek_batch_by_sequence_number(
        &self,
        from: SequenceNumber,
        max_count: u32,
    ) -> Result<Vec<ReceivedMessage>, ReceiverError>;

    /// Snapshot of the lock entry for `lock_token`
    fn lock_entry(&self, lock_token: LockToken) -> Option<LockEntry>;

    /// Subscribe to tokens whose locks expire without being settled
    fn subscribe_expirations(&self) -> broadcast::Receiver<LockToken>;

    /// Stop background work and refuse further operations
    async fn close(&self) -> Result<(), ReceiverError>;

    /// Check if the receiver has been closed
    fn is_closed(&self) -> bool;
}

/// Factory for creating receivers over a transport
pub struct MessageReceiverFactory;

impl MessageReceiverFactory {
    /// Create receiver from configuration
    pub fn create_receiver(
        config: ReceiverConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Box<dyn MessageReceiver>, ReceiverError> {
        Ok(Box::new(StandardMessageReceiver::new(config, transport)?))
    }

    /// Create receiver over a fresh in-memory broker link
    pub fn create_test_receiver(
        broker: &InMemoryBroker,
        path: &EntityPath,
    ) -> Result<Box<dyn MessageReceiver>, ReceiverError> {
        Self::create_receiver(ReceiverConfig::new(path), Arc::new(broker.link(path)))
    }

    /// Create receiver over a new in-memory broker with default settings
    pub fn create_standalone_test_receiver(
        path: &EntityPath,
    ) -> Result<(InMemoryBroker, Box<dyn MessageReceiver>), ReceiverError> {
        let broker = InMemoryBroker::new(InMemoryConfig::default());
        let receiver = Self::create_test_receiver(&broker, path)?;
        Ok((broker, receiver))
    }
}

/// Standard receiver implementation
pub struct StandardMessageReceiver {
    path: EntityPath,
    config: ReceiverConfig,
    registry: Arc<LockRegistry>,
    engine: ReceiveEngine,
    settlement: SettlementCoordinator,
    renewal: Arc<LockRenewalManager>,
    expirations: broadcast::Sender<LockToken>,
    eviction_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl StandardMessageReceiver {
    /// Create a receiver linked to `config.entity_path` over `transport`.
    ///
    /// When called inside a tokio runtime the periodic eviction task is
    /// started; otherwise entries are only expired lazily on access.
    pub fn new(
        config: ReceiverConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ReceiverError> {
        config.validate()?;
        let path = config.entity_path()?;
        if &path != transport.entity_path() {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "receiver configured for '{}' but transport is linked to '{}'",
                    path,
                    transport.entity_path()
                ),
            }
            .into());
        }

        let mode = config.receive_mode;
        let operation_timeout = config.operation_timeout();
        let registry = Arc::new(LockRegistry::new(config.terminal_entry_grace()));

        let engine = ReceiveEngine::new(
            Arc::clone(&registry),
            Arc::clone(&transport),
            mode,
            operation_timeout,
            config.max_receive_batch,
        );
        engine.set_prefetch_count(config.prefetch_count);

        let settlement = SettlementCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&transport),
            mode,
            operation_timeout,
        );
        let renewal = Arc::new(
            LockRenewalManager::new(Arc::clone(&registry), transport, mode, operation_timeout)
                .with_auto_renew(config.auto_renew_margin(), config.max_auto_renew()),
        );

        let (expirations, _) = broadcast::channel(EXPIRATION_CHANNEL_CAPACITY);
        let eviction_task = spawn_eviction_task(
            Arc::clone(&registry),
            expirations.clone(),
            config.eviction_interval(),
        );

        info!(path = %path, mode = %mode, prefetch_count = config.prefetch_count, "Receiver opened");

        Ok(Self {
            path,
            config,
            registry,
            engine,
            settlement,
            renewal,
            expirations,
            eviction_task: Mutex::new(eviction_task),
            closed: AtomicBool::new(false),
        })
    }

    /// Configuration the receiver was created with
    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<(), ReceiverError> {
        if self.is_closed() {
            return Err(ReceiverError::InvalidOperation {
                message: format!("receiver for '{}' is closed", self.path),
            });
        }
        Ok(())
    }

    fn stop_eviction_task(&self) {
        let task = self
            .eviction_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

fn spawn_eviction_task(
    registry: Arc<LockRegistry>,
    expirations: broadcast::Sender<LockToken>,
    period: Duration,
) -> Option<JoinHandle<()>> {
    let handle = match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle,
        Err(_) => {
            warn!("No tokio runtime available, lock eviction only runs on access");
            return None;
        }
    };

    Some(handle.spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;

            let expired = registry.evict_expired(Timestamp::now());
            if expired.is_empty() {
                continue;
            }
            debug!(count = expired.len(), "Lock entries expired");
            for lock_token in expired {
                // No subscribers is fine
                let _ = expirations.send(lock_token);
            }
        }
    }))
}

#[async_trait]
impl MessageReceiver for StandardMessageReceiver {
    fn path(&self) -> &EntityPath {
        &self.path
    }

    fn receive_mode(&self) -> ReceiveMode {
        self.engine.receive_mode()
    }

    fn prefetch_count(&self) -> u32 {
        self.engine.prefetch_count()
    }

    fn set_prefetch_count(&self, prefetch_count: u32) {
        self.engine.set_prefetch_count(prefetch_count);
    }

    fn last_peeked_sequence_number(&self) -> SequenceNumber {
        self.engine.last_peeked_sequence_number()
    }

    async fn receive(&self) -> Result<Option<ReceivedMessage>, ReceiverError> {
        self.receive_with_wait(self.config.default_wait_time()).await
    }

    async fn receive_with_wait(
        &self,
        wait_time: Duration,
    ) -> Result<Option<ReceivedMessage>, ReceiverError> {
        Ok(self
            .receive_batch_with_wait(1, wait_time)
            .await?
            .into_iter()
            .next())
    }

    async fn receive_batch(&self, max_count: u32) -> Result<Vec<ReceivedMessage>, ReceiverError> {
        self.receive_batch_with_wait(max_count, self.config.default_wait_time())
            .await
    }

    async fn receive_batch_with_wait(
        &self,
        max_count: u32,
        wait_time: Duration,
    ) -> Result<Vec<ReceivedMessage>, ReceiverError> {
        self.ensure_open()?;
        self.engine.receive(max_count, wait_time).await
    }

    async fn receive_by_sequence_number(
        &self,
        sequence_number: SequenceNumber,
    ) -> Result<ReceivedMessage, ReceiverError> {
        self.receive_by_sequence_numbers(&[sequence_number])
            .await?
            .into_iter()
            .next()
            .unwrap_or(Err(ReceiverError::NotFound { sequence_number }))
    }

    async fn receive_by_sequence_numbers(
        &self,
        sequence_numbers: &[SequenceNumber],
    ) -> Result<Vec<Result<ReceivedMessage, ReceiverError>>, ReceiverError> {
        self.ensure_open()?;
        self.engine
            .receive_by_sequence_numbers(sequence_numbers)
            .await
    }

    async fn complete(&self, lock_token: LockToken) -> Result<(), ReceiverError> {
        self.ensure_open()?;
        self.settlement.complete(lock_token).await
    }

    async fn complete_batch(
        &self,
        lock_tokens: &[LockToken],
    ) -> Result<Vec<SettlementResult>, ReceiverError> {
        self.ensure_open()?;
        Ok(self.settlement.complete_batch(lock_tokens).await)
    }

    async fn abandon(&self, lock_token: LockToken) -> Result<(), ReceiverError> {
        self.ensure_open()?;
        self.settlement.abandon(lock_token).await
    }

    async fn defer(&self, lock_token: LockToken) -> Result<(), ReceiverError> {
        self.ensure_open()?;
        self.settlement.defer(lock_token).await
    }

    async fn dead_letter(&self, lock_token: LockToken) -> Result<(), ReceiverError> {
        self.ensure_open()?;
        self.settlement.dead_letter(lock_token, None).await
    }

    async fn dead_letter_with_reason(
        &self,
        lock_token: LockToken,
        reason: DeadLetterReason,
    ) -> Result<(), ReceiverError> {
        self.ensure_open()?;
        self.settlement.dead_letter(lock_token, Some(reason)).await
    }

    async fn renew_lock(&self, lock_token: LockToken) -> Result<Timestamp, ReceiverError> {
        self.ensure_open()?;
        self.renewal.renew_lock(lock_token).await
    }

    fn auto_renew(&self, lock_token: LockToken) -> Result<AutoRenewHandle, ReceiverError> {
        self.ensure_open()?;
        if !self.receive_mode().tracks_locks() {
            return Err(ReceiverError::InvalidOperation {
                message: format!("cannot renew locks in {} mode", self.receive_mode()),
            });
        }
        if !self.registry.is_active(lock_token) {
            return Err(ReceiverError::LockLost { lock_token });
        }
        self.renewal.start_auto_renew(lock_token)
    }

    async fn peek(&self) -> Result<Option<ReceivedMessage>, ReceiverError> {
        Ok(self.peek_batch(1).await?.into_iter().next())
    }

    async fn peek_batch(&self, max_count: u32) -> Result<Vec<ReceivedMessage>, ReceiverError> {
        self.ensure_open()?;
        self.engine.peek(max_count, None).await
    }

    async fn peek_by_sequence_number(
        &self,
        from: SequenceNumber,
    ) -> Result<Option<ReceivedMessage>, ReceiverError> {
        Ok(self
            .peek_batch_by_sequence_number(from, 1)
            .await?
            .into_iter()
            .next())
    }

    async fn peek_batch_by_sequence_number(
        &self,
        from: SequenceNumber,
        max_count: u32,
    ) -> Result<Vec<ReceivedMessage>, ReceiverError> {
        self.ensure_open()?;
        self.engine.peek(max_count, Some(from)).await
    }

    fn lock_entry(&self, lock_token: LockToken) -> Option<LockEntry> {
        self.registry.lookup(lock_token)
    }

    fn subscribe_expirations(&self) -> broadcast::Receiver<LockToken> {
        self.expirations.subscribe()
    }

    async fn close(&self) -> Result<(), ReceiverError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.stop_eviction_task();
        let dropped = self.engine.clear_prefetched();
        info!(
            path = %self.path,
            dropped_prefetched = dropped,
            tracked_locks = self.registry.len(),
            "Receiver closed"
        );
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for StandardMessageReceiver {
    fn drop(&mut self) {
        self.stop_eviction_task();
    }
}
