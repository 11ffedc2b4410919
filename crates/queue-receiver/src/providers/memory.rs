//! In-memory broker for testing and development.
//!
//! This module provides an in-process broker that speaks the [`Transport`]
//! contract:
//! - Peek-lock and receive-and-delete delivery with per-link lock ownership
//! - Lock expiry, renewal and redelivery with fresh lock tokens
//! - Deferral, receive by sequence number and non-destructive peek
//! - A dead-letter sub-queue, including max-delivery-count dead-lettering
//! - Fault injection per request type
//!
//! This broker is intended for:
//! - Unit testing of receivers and their consumers
//! - Development without a live broker

use crate::config::InMemoryConfig;
use crate::message::{
    DeadLetterReason, EntityPath, LockToken, MessageId, ReceiveMode, ReceivedMessage,
    SequenceNumber, Timestamp,
};
use crate::transport::{BrokerRequest, BrokerResponse, RequestType, Transport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Longest a waiting receive sleeps before rechecking for expired locks
const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Reason recorded when a message runs out of deliveries
pub const MAX_DELIVERY_COUNT_EXCEEDED: &str = "MaxDeliveryCountExceeded";

// ============================================================================
// Fault Injection
// ============================================================================

/// Misbehaviour applied to the next request of a given type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectedFault {
    /// Fail without the broker acting on the request
    Fail(TransportError),
    /// Act on the request, then report the failure to the caller
    CommitThenFail(TransportError),
    /// Hold the request for this long before the broker acts on it
    Delay(Duration),
}

// ============================================================================
// Internal Storage Structures
// ============================================================================

struct BrokerState {
    entities: HashMap<EntityPath, EntityState>,
}

impl BrokerState {
    fn entity(&mut self, path: &EntityPath) -> &mut EntityState {
        self.entities.entry(path.clone()).or_default()
    }
}

#[derive(Default)]
struct EntityState {
    last_sequence_number: i64,
    messages: BTreeMap<SequenceNumber, StoredMessage>,
    dead_letter: Vec<DeadLetteredMessage>,
    tokens: HashMap<LockToken, SequenceNumber>,
}

/// A message stored in the broker with metadata
struct StoredMessage {
    message_id: MessageId,
    body: Bytes,
    properties: HashMap<String, String>,
    sequence_number: SequenceNumber,
    enqueued_at: Timestamp,
    delivery_count: u32,
    deferred: bool,
    lock: Option<BrokerLock>,
}

struct BrokerLock {
    token: LockToken,
    owner: Uuid,
    locked_until: Timestamp,
}

impl StoredMessage {
    /// Lock that has not yet expired at `now`
    fn live_lock(&self, now: Timestamp) -> Option<&BrokerLock> {
        self.lock.as_ref().filter(|lock| now < lock.locked_until)
    }

    fn to_received(&self, with_lock: bool) -> ReceivedMessage {
        let lock = self.lock.as_ref().filter(|_| with_lock);
        ReceivedMessage {
            message_id: self.message_id.clone(),
            body: self.body.clone(),
            properties: self.properties.clone(),
            sequence_number: self.sequence_number,
            enqueued_at: self.enqueued_at,
            delivery_count: self.delivery_count,
            lock_token: lock.map(|lock| lock.token),
            locked_until: lock.map(|lock| lock.locked_until),
        }
    }
}

/// A message moved to the dead-letter sub-queue
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetteredMessage {
    pub message: ReceivedMessage,
    pub reason: Option<DeadLetterReason>,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    faults: Mutex<HashMap<RequestType, VecDeque<InjectedFault>>>,
    requests: Mutex<HashMap<RequestType, usize>>,
    available: Notify,
    config: InMemoryConfig,
}

impl BrokerInner {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_fault(&self, request_type: RequestType) -> Option<InjectedFault> {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&request_type)
            .and_then(|queue| queue.pop_front())
    }

    fn record(&self, request_type: RequestType) {
        *self
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(request_type)
            .or_insert(0) += 1;
    }
}

// ============================================================================
// InMemoryBroker
// ============================================================================

/// In-memory broker shared by any number of links
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    /// Create new in-memory broker with configuration
    pub fn new(config: InMemoryConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState {
                    entities: HashMap::new(),
                }),
                faults: Mutex::new(HashMap::new()),
                requests: Mutex::new(HashMap::new()),
                available: Notify::new(),
                config,
            }),
        }
    }

    /// Open a link to `path`. Every link is a distinct lock owner.
    pub fn link(&self, path: &EntityPath) -> InMemoryLink {
        InMemoryLink {
            inner: Arc::clone(&self.inner),
            path: path.clone(),
            link_id: Uuid::new_v4(),
        }
    }

    /// Enqueue a message and return its sequence number
    pub fn enqueue(&self, path: &EntityPath, body: impl Into<Bytes>) -> SequenceNumber {
        self.enqueue_with_properties(path, body, HashMap::new())
    }

    /// Enqueue a message with application properties
    pub fn enqueue_with_properties(
        &self,
        path: &EntityPath,
        body: impl Into<Bytes>,
        properties: HashMap<String, String>,
    ) -> SequenceNumber {
        let sequence_number = {
            let mut state = self.inner.state();
            let entity = state.entity(path);
            entity.last_sequence_number += 1;
            let sequence_number = SequenceNumber::new(entity.last_sequence_number);
            entity.messages.insert(
                sequence_number,
                StoredMessage {
                    message_id: MessageId::new(),
                    body: body.into(),
                    properties,
                    sequence_number,
                    enqueued_at: Timestamp::now(),
                    delivery_count: 0,
                    deferred: false,
                    lock: None,
                },
            );
            sequence_number
        };

        self.inner.available.notify_waiters();
        sequence_number
    }

    /// Messages still held by the entity, locked, deferred or available
    pub fn message_count(&self, path: &EntityPath) -> usize {
        self.inner.state().entity(path).messages.len()
    }

    /// Messages of the entity currently marked deferred
    pub fn deferred_count(&self, path: &EntityPath) -> usize {
        self.inner
            .state()
            .entity(path)
            .messages
            .values()
            .filter(|message| message.deferred)
            .count()
    }

    /// Contents of the dead-letter sub-queue
    pub fn dead_letter_messages(&self, path: &EntityPath) -> Vec<DeadLetteredMessage> {
        self.inner.state().entity(path).dead_letter.clone()
    }

    /// Drop every lock on the entity, as if they had all expired
    pub fn expire_locks(&self, path: &EntityPath) {
        {
            let mut state = self.inner.state();
            let entity = state.entity(path);
            entity.tokens.clear();
            for message in entity.messages.values_mut() {
                message.lock = None;
            }
        }
        self.inner.available.notify_waiters();
    }

    /// Apply `fault` to the next request of `request_type`
    pub fn inject_fault(&self, request_type: RequestType, fault: InjectedFault) {
        self.inner
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(request_type)
            .or_default()
            .push_back(fault);
    }

    /// Number of requests of `request_type` received so far
    pub fn request_count(&self, request_type: RequestType) -> usize {
        self.inner
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&request_type)
            .copied()
            .unwrap_or(0)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(InMemoryConfig::default())
    }
}

// ============================================================================
// InMemoryLink
// ============================================================================

/// Transport session to one entity of an [`InMemoryBroker`]
pub struct InMemoryLink {
    inner: Arc<BrokerInner>,
    path: EntityPath,
    link_id: Uuid,
}

impl InMemoryLink {
    async fn dispatch(&self, request: BrokerRequest) -> BrokerResponse {
        match request {
            BrokerRequest::Receive {
                max_count,
                wait_time,
                mode,
            } => self.receive(max_count, wait_time, mode).await,
            BrokerRequest::ReceiveBySequence {
                sequence_numbers,
                mode,
            } => self.receive_by_sequence(&sequence_numbers, mode),
            BrokerRequest::Peek {
                from_sequence_number,
                max_count,
            } => self.peek(from_sequence_number, max_count),
            BrokerRequest::Complete { lock_token } => {
                self.settle(lock_token, None, |entity, sequence_number| {
                    entity.messages.remove(&sequence_number);
                })
            }
            BrokerRequest::Abandon { lock_token } => {
                let response = self.settle(lock_token, None, |entity, sequence_number| {
                    if let Some(message) = entity.messages.get_mut(&sequence_number) {
                        message.lock = None;
                    }
                });
                self.inner.available.notify_waiters();
                response
            }
            BrokerRequest::Defer { lock_token } => {
                self.settle(lock_token, None, |entity, sequence_number| {
                    if let Some(message) = entity.messages.get_mut(&sequence_number) {
                        message.lock = None;
                        message.deferred = true;
                    }
                })
            }
            BrokerRequest::DeadLetter { lock_token, reason } => {
                self.dead_letter(lock_token, reason)
            }
            BrokerRequest::RenewLock { lock_token } => self.renew_lock(lock_token),
        }
    }

    async fn receive(
        &self,
        max_count: u32,
        wait_time: Duration,
        mode: ReceiveMode,
    ) -> BrokerResponse {
        let deadline = Instant::now() + wait_time;
        loop {
            // Registered before checking so an enqueue in between is not missed.
            let available = self.inner.available.notified();

            let messages = self.take_available(max_count, mode);
            if !messages.is_empty() {
                return BrokerResponse::Messages(messages);
            }

            let now = Instant::now();
            if now >= deadline {
                return BrokerResponse::Messages(Vec::new());
            }
            let wait = (deadline - now).min(RECEIVE_POLL_INTERVAL);
            let _ = tokio::time::timeout(wait, available).await;
        }
    }

    fn take_available(&self, max_count: u32, mode: ReceiveMode) -> Vec<ReceivedMessage> {
        let now = Timestamp::now();
        let config = &self.inner.config;
        let mut state = self.inner.state();
        let entity = state.entity(&self.path);

        let candidates: Vec<SequenceNumber> = entity
            .messages
            .values()
            .filter(|message| !message.deferred && message.live_lock(now).is_none())
            .map(|message| message.sequence_number)
            .collect();

        let mut delivered = Vec::new();
        for sequence_number in candidates {
            if delivered.len() >= max_count as usize {
                break;
            }

            let exhausted = entity
                .messages
                .get(&sequence_number)
                .map(|message| message.delivery_count >= config.max_delivery_count)
                .unwrap_or(false);
            if exhausted {
                if let Some(message) = entity.remove(sequence_number) {
                    entity.dead_letter.push(DeadLetteredMessage {
                        message: message.to_received(false),
                        reason: Some(DeadLetterReason::new(MAX_DELIVERY_COUNT_EXCEEDED)),
                    });
                }
                continue;
            }

            if let Some(message) =
                entity.deliver(sequence_number, mode, self.link_id, now, config.lock_duration)
            {
                delivered.push(message);
            }
        }

        delivered
    }

    fn receive_by_sequence(
        &self,
        sequence_numbers: &[SequenceNumber],
        mode: ReceiveMode,
    ) -> BrokerResponse {
        let now = Timestamp::now();
        let lock_duration = self.inner.config.lock_duration;
        let mut state = self.inner.state();
        let entity = state.entity(&self.path);

        let mut delivered = Vec::new();
        for &sequence_number in sequence_numbers {
            // Only unlocked messages qualify, whichever link holds the lock.
            let locked = match entity.messages.get(&sequence_number) {
                Some(message) => message.live_lock(now).is_some(),
                None => continue,
            };
            if locked {
                continue;
            }
            if let Some(message) =
                entity.deliver(sequence_number, mode, self.link_id, now, lock_duration)
            {
                delivered.push(message);
            }
        }

        BrokerResponse::Messages(delivered)
    }

    fn peek(&self, from_sequence_number: SequenceNumber, max_count: u32) -> BrokerResponse {
        let mut state = self.inner.state();
        let entity = state.entity(&self.path);

        let messages = entity
            .messages
            .range(from_sequence_number..)
            .take(max_count as usize)
            .map(|(_, message)| message.to_received(false))
            .collect();

        BrokerResponse::Messages(messages)
    }

    /// Apply a settlement to the message locked by `lock_token` on this link.
    ///
    /// A lost lock wins over `rejection`; a rejected settlement changes nothing.
    fn settle<F>(
        &self,
        lock_token: LockToken,
        rejection: Option<String>,
        apply: F,
    ) -> BrokerResponse
    where
        F: FnOnce(&mut EntityState, SequenceNumber),
    {
        let now = Timestamp::now();
        let mut state = self.inner.state();
        let entity = state.entity(&self.path);

        let Some(sequence_number) = entity.locked_by(lock_token, self.link_id, now) else {
            return BrokerResponse::LockLost;
        };
        if let Some(reason) = rejection {
            return BrokerResponse::Rejected { reason };
        }

        entity.tokens.remove(&lock_token);
        apply(entity, sequence_number);
        BrokerResponse::Settled
    }

    fn dead_letter(
        &self,
        lock_token: LockToken,
        reason: Option<DeadLetterReason>,
    ) -> BrokerResponse {
        let max_length = self.inner.config.max_dead_letter_reason_length;
        let rejection = reason.as_ref().and_then(|reason| {
            let description_too_long = reason
                .description
                .as_ref()
                .map(|description| description.len() > max_length)
                .unwrap_or(false);
            if reason.reason.is_empty() || reason.reason.len() > max_length || description_too_long {
                Some(format!(
                    "dead-letter reason and description must be 1-{} characters",
                    max_length
                ))
            } else {
                None
            }
        });

        self.settle(lock_token, rejection, move |entity, sequence_number| {
            if let Some(mut message) = entity.messages.remove(&sequence_number) {
                message.lock = None;
                entity.dead_letter.push(DeadLetteredMessage {
                    message: message.to_received(false),
                    reason,
                });
            }
        })
    }

    fn renew_lock(&self, lock_token: LockToken) -> BrokerResponse {
        let now = Timestamp::now();
        let lock_duration = self.inner.config.lock_duration;
        let mut state = self.inner.state();
        let entity = state.entity(&self.path);

        let Some(sequence_number) = entity.locked_by(lock_token, self.link_id, now) else {
            return BrokerResponse::LockLost;
        };
        let Some(lock) = entity
            .messages
            .get_mut(&sequence_number)
            .and_then(|message| message.lock.as_mut())
        else {
            return BrokerResponse::LockLost;
        };

        let renewed = now.add_duration(lock_duration);
        lock.locked_until = if renewed > lock.locked_until {
            renewed
        } else {
            lock.locked_until.add_duration(Duration::from_millis(1))
        };

        BrokerResponse::LockRenewed {
            locked_until: lock.locked_until,
        }
    }
}

impl EntityState {
    /// Sequence number of the message live-locked by `lock_token` for `owner`
    fn locked_by(
        &self,
        lock_token: LockToken,
        owner: Uuid,
        now: Timestamp,
    ) -> Option<SequenceNumber> {
        let sequence_number = *self.tokens.get(&lock_token)?;
        let message = self.messages.get(&sequence_number)?;
        message
            .live_lock(now)
            .filter(|lock| lock.token == lock_token && lock.owner == owner)
            .map(|_| sequence_number)
    }

    fn remove(&mut self, sequence_number: SequenceNumber) -> Option<StoredMessage> {
        let message = self.messages.remove(&sequence_number)?;
        if let Some(lock) = &message.lock {
            self.tokens.remove(&lock.token);
        }
        Some(message)
    }

    /// Hand a message to `owner`: lock it in peek-lock mode, delete it otherwise
    fn deliver(
        &mut self,
        sequence_number: SequenceNumber,
        mode: ReceiveMode,
        owner: Uuid,
        now: Timestamp,
        lock_duration: Duration,
    ) -> Option<ReceivedMessage> {
        match mode {
            ReceiveMode::ReceiveAndDelete => {
                let mut message = self.remove(sequence_number)?;
                message.delivery_count += 1;
                message.lock = None;
                Some(message.to_received(false))
            }
            ReceiveMode::PeekLock => {
                let message = self.messages.get_mut(&sequence_number)?;
                if let Some(previous) = message.lock.take() {
                    self.tokens.remove(&previous.token);
                }

                let token = LockToken::new();
                message.delivery_count += 1;
                message.lock = Some(BrokerLock {
                    token,
                    owner,
                    locked_until: now.add_duration(lock_duration),
                });
                self.tokens.insert(token, sequence_number);
                Some(message.to_received(true))
            }
        }
    }
}

#[async_trait]
impl Transport for InMemoryLink {
    async fn send(
        &self,
        request: BrokerRequest,
        timeout: Duration,
    ) -> Result<BrokerResponse, TransportError> {
        let request_type = request.request_type();
        self.inner.record(request_type);

        let fault = self.inner.take_fault(request_type);
        match &fault {
            Some(InjectedFault::Fail(error)) => return Err(error.clone()),
            Some(InjectedFault::Delay(delay)) => {
                if *delay >= timeout {
                    tokio::time::sleep(timeout).await;
                    return Err(TransportError::Timeout { duration: timeout });
                }
                tokio::time::sleep(*delay).await;
            }
            _ => {}
        }

        let response = tokio::time::timeout(timeout, self.dispatch(request))
            .await
            .map_err(|_| TransportError::Timeout { duration: timeout })?;

        if let Some(InjectedFault::CommitThenFail(error)) = fault {
            return Err(error);
        }
        Ok(response)
    }

    fn entity_path(&self) -> &EntityPath {
        &self.path
    }
}
