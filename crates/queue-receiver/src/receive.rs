//! Receive engine: receive, receive by sequence number and peek.
//!
//! In peek-lock mode every delivered message is registered in the
//! [`LockRegistry`] before it is handed to the caller or buffered for
//! prefetch. A message is never observable without a tracked lock.
//!
//! Peek is served from a separate cursor and never touches the registry.

use crate::error::{ReceiverError, ValidationError};
use crate::lock_registry::{LockRegistry, LockState};
use crate::message::{ReceiveMode, ReceivedMessage, SequenceNumber};
use crate::transport::{BrokerRequest, BrokerResponse, RequestType, Transport, TransportError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, instrument, warn};

#[cfg(test)]
#[path = "receive_tests.rs"]
mod tests;

/// Fetches messages from the broker and tracks their locks
pub struct ReceiveEngine {
    registry: Arc<LockRegistry>,
    transport: Arc<dyn Transport>,
    mode: ReceiveMode,
    operation_timeout: Duration,
    max_batch: u32,
    prefetch_count: AtomicU32,
    prefetched: Mutex<VecDeque<ReceivedMessage>>,
    last_peeked: AtomicI64,
}

impl ReceiveEngine {
    pub fn new(
        registry: Arc<LockRegistry>,
        transport: Arc<dyn Transport>,
        mode: ReceiveMode,
        operation_timeout: Duration,
        max_batch: u32,
    ) -> Self {
        Self {
            registry,
            transport,
            mode,
            operation_timeout,
            max_batch,
            prefetch_count: AtomicU32::new(0),
            prefetched: Mutex::new(VecDeque::new()),
            last_peeked: AtomicI64::new(SequenceNumber::ZERO.value()),
        }
    }

    pub fn receive_mode(&self) -> ReceiveMode {
        self.mode
    }

    pub fn prefetch_count(&self) -> u32 {
        self.prefetch_count.load(Ordering::Acquire)
    }

    /// Change how many messages are fetched ahead of demand.
    ///
    /// Messages already buffered stay buffered.
    pub fn set_prefetch_count(&self, prefetch_count: u32) {
        self.prefetch_count.store(prefetch_count, Ordering::Release);
    }

    /// Highest sequence number returned by a peek so far
    pub fn last_peeked_sequence_number(&self) -> SequenceNumber {
        SequenceNumber::new(self.last_peeked.load(Ordering::Acquire))
    }

    /// Number of messages waiting in the prefetch buffer
    pub fn prefetched_len(&self) -> usize {
        self.buffer().len()
    }

    /// Drop every buffered message and return how many were dropped.
    ///
    /// Locks of dropped messages are left to expire on the broker.
    pub fn clear_prefetched(&self) -> usize {
        let mut buffer = self.buffer();
        let dropped = buffer.len();
        buffer.clear();
        dropped
    }

    /// Receive up to `max_count` messages, waiting at most `wait_time` for
    /// the first one to arrive.
    ///
    /// An empty result means nothing arrived in time; it is not an error.
    #[instrument(skip(self), fields(mode = %self.mode))]
    pub async fn receive(
        &self,
        max_count: u32,
        wait_time: Duration,
    ) -> Result<Vec<ReceivedMessage>, ReceiverError> {
        self.validate_count("max_count", max_count)?;

        let buffered = self.take_prefetched(max_count);
        if !buffered.is_empty() {
            debug!(count = buffered.len(), "Served receive from prefetch buffer");
            return Ok(buffered);
        }

        let request_count = max_count.max(self.prefetch_count());
        let response = self
            .send(
                BrokerRequest::Receive {
                    max_count: request_count,
                    wait_time,
                    mode: self.mode,
                },
                wait_time + self.operation_timeout,
            )
            .await?;

        let mut messages = self.track(expect_messages(RequestType::Receive, response)?);
        if messages.len() > max_count as usize {
            let extra = messages.split_off(max_count as usize);
            debug!(count = extra.len(), "Buffered prefetched messages");
            self.buffer().extend(extra);
        }

        debug!(count = messages.len(), "Received messages");
        Ok(messages)
    }

    /// Receive specific messages, typically deferred ones, by sequence number.
    ///
    /// The result has one entry per requested sequence number, in request
    /// order. Numbers with no matching message, or whose message is currently
    /// locked, yield `NotFound`. A number repeated in the request is fetched
    /// once and every occurrence carries the same result.
    #[instrument(skip(self, sequence_numbers), fields(count = sequence_numbers.len()))]
    pub async fn receive_by_sequence_numbers(
        &self,
        sequence_numbers: &[SequenceNumber],
    ) -> Result<Vec<Result<ReceivedMessage, ReceiverError>>, ReceiverError> {
        if sequence_numbers.is_empty() {
            return Ok(Vec::new());
        }
        self.validate_count(
            "sequence_numbers",
            u32::try_from(sequence_numbers.len()).unwrap_or(u32::MAX),
        )?;

        let mut seen = HashSet::new();
        let distinct: Vec<SequenceNumber> = sequence_numbers
            .iter()
            .copied()
            .filter(|sequence_number| seen.insert(*sequence_number))
            .collect();

        let response = self
            .send(
                BrokerRequest::ReceiveBySequence {
                    sequence_numbers: distinct,
                    mode: self.mode,
                },
                self.operation_timeout,
            )
            .await?;

        let found: HashMap<SequenceNumber, ReceivedMessage> = self
            .track(expect_messages(RequestType::ReceiveBySequence, response)?)
            .into_iter()
            .map(|message| (message.sequence_number, message))
            .collect();

        Ok(sequence_numbers
            .iter()
            .map(|&sequence_number| {
                found
                    .get(&sequence_number)
                    .cloned()
                    .ok_or(ReceiverError::NotFound { sequence_number })
            })
            .collect())
    }

    /// Look at up to `max_count` messages without locking or consuming them.
    ///
    /// Without `from_sequence_number` the peek continues after the highest
    /// sequence number previously peeked.
    #[instrument(skip(self))]
    pub async fn peek(
        &self,
        max_count: u32,
        from_sequence_number: Option<SequenceNumber>,
    ) -> Result<Vec<ReceivedMessage>, ReceiverError> {
        self.validate_count("max_count", max_count)?;

        let from_sequence_number =
            from_sequence_number.unwrap_or_else(|| self.last_peeked_sequence_number().next());
        let response = self
            .send(
                BrokerRequest::Peek {
                    from_sequence_number,
                    max_count,
                },
                self.operation_timeout,
            )
            .await?;

        let messages = expect_messages(RequestType::Peek, response)?;
        if let Some(highest) = messages.iter().map(|m| m.sequence_number).max() {
            self.last_peeked.fetch_max(highest.value(), Ordering::AcqRel);
        }

        debug!(
            from = %from_sequence_number,
            count = messages.len(),
            "Peeked messages"
        );
        Ok(messages)
    }

    fn validate_count(&self, field: &str, count: u32) -> Result<(), ReceiverError> {
        if count == 0 || count > self.max_batch {
            return Err(ValidationError::OutOfRange {
                field: field.to_string(),
                message: format!("must be between 1 and {}, got {}", self.max_batch, count),
            }
            .into());
        }
        Ok(())
    }

    async fn send(
        &self,
        request: BrokerRequest,
        timeout: Duration,
    ) -> Result<BrokerResponse, ReceiverError> {
        let operation = request.request_type();
        let outcome = match tokio::time::timeout(timeout, self.transport.send(request, timeout)).await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::Timeout { duration: timeout }),
        };

        outcome.map_err(|error| {
            warn!(operation = %operation, error = %error, "Broker request failed");
            ReceiverError::from_transport(operation, error)
        })
    }

    /// Register the locks of freshly delivered messages.
    ///
    /// Peek-lock messages arriving without a lock cannot be settled and are
    /// dropped.
    fn track(&self, messages: Vec<ReceivedMessage>) -> Vec<ReceivedMessage> {
        if !self.mode.tracks_locks() {
            return messages;
        }

        messages
            .into_iter()
            .filter(|message| match (message.lock_token, message.locked_until) {
                (Some(lock_token), Some(locked_until)) => {
                    self.registry
                        .register(lock_token, message.sequence_number, locked_until);
                    true
                }
                _ => {
                    warn!(
                        sequence_number = %message.sequence_number,
                        "Dropping peek-lock message delivered without a lock"
                    );
                    false
                }
            })
            .collect()
    }

    /// Pop up to `max_count` buffered messages whose locks are still held
    fn take_prefetched(&self, max_count: u32) -> Vec<ReceivedMessage> {
        let mut buffer = self.buffer();
        let mut taken = Vec::new();

        while taken.len() < max_count as usize {
            let Some(message) = buffer.pop_front() else {
                break;
            };

            let usable = match message.lock_token {
                Some(lock_token) if self.mode.tracks_locks() => self
                    .registry
                    .lookup(lock_token)
                    .map(|entry| entry.state() == LockState::Locked)
                    .unwrap_or(false),
                _ => true,
            };
            if usable {
                taken.push(message);
            } else {
                debug!(
                    sequence_number = %message.sequence_number,
                    "Discarded prefetched message with lapsed lock"
                );
            }
        }

        taken
    }

    fn buffer(&self) -> MutexGuard<'_, VecDeque<ReceivedMessage>> {
        self.prefetched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn expect_messages(
    operation: RequestType,
    response: BrokerResponse,
) -> Result<Vec<ReceivedMessage>, ReceiverError> {
    match response {
        BrokerResponse::Messages(messages) => Ok(messages),
        BrokerResponse::Rejected { reason } => Err(ReceiverError::BrokerRejected { reason }),
        other => {
            warn!(operation = %operation, response = ?other, "Unexpected broker response");
            Err(ReceiverError::Transport {
                operation,
                message: format!("unexpected response to {}", operation),
            })
        }
    }
}
