//! Lock registry for broker-issued message locks.
//!
//! The registry tracks every lock token handed out to this receiver together
//! with its sequence number, expiry and settlement state. It is the only
//! shared mutable state of a receiver: settlement, renewal and background
//! eviction all coordinate through it.
//!
//! # State machine
//!
//! ```text
//! Locked --settle attempt--> Completing --broker success--> Settled
//!                            Completing --lock lost-------> Expired
//!                            Completing --transport error-> Locked
//!                            Completing --rejected-------->  Failed
//! Locked | Failed --expiry elapsed--> Expired
//! ```
//!
//! `Settled` and `Expired` are terminal and evicted after a grace period.
//! `Failed` behaves like `Locked` (the broker still holds the lock) but
//! records that the last settlement attempt was rejected.
//!
//! # Concurrency
//!
//! Each entry sits behind its own mutex; the map lock is held only long
//! enough to look up or insert the entry, so unrelated tokens never contend
//! on a state transition.

use crate::message::{LockToken, SequenceNumber, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

#[cfg(test)]
#[path = "lock_registry_tests.rs"]
mod tests;

// ============================================================================
// Lock State
// ============================================================================

/// Settlement state of a lock entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockState {
    Locked,
    Completing,
    Settled,
    Expired,
    Failed,
}

impl LockState {
    /// Check if no further transition can happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Settled | Self::Expired)
    }

    /// Check if a settlement or renewal may start from this state
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Locked | Self::Failed)
    }
}

/// What the broker did with a settled message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Disposition {
    Completed,
    Abandoned,
    Deferred,
    DeadLettered,
}

/// Terminal outcome recorded by [`LockRegistry::finalize`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Settled(Disposition),
    Expired,
}

// ============================================================================
// Lock Entry
// ============================================================================

/// Snapshot of one tracked lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEntry {
    lock_token: LockToken,
    sequence_number: SequenceNumber,
    locked_until: Timestamp,
    state: LockState,
    disposition: Option<Disposition>,
    registered_at: Timestamp,
    state_changed_at: Timestamp,
}

impl LockEntry {
    fn new(lock_token: LockToken, sequence_number: SequenceNumber, locked_until: Timestamp) -> Self {
        let now = Timestamp::now();
        Self {
            lock_token,
            sequence_number,
            locked_until,
            state: LockState::Locked,
            disposition: None,
            registered_at: now,
            state_changed_at: now,
        }
    }

    pub fn lock_token(&self) -> LockToken {
        self.lock_token
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number
    }

    /// Current lock expiry as last reported by the broker
    pub fn locked_until(&self) -> Timestamp {
        self.locked_until
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    /// How the message was settled, once `Settled`
    pub fn disposition(&self) -> Option<Disposition> {
        self.disposition
    }

    pub fn registered_at(&self) -> Timestamp {
        self.registered_at
    }

    /// Time of the last state transition
    pub fn state_changed_at(&self) -> Timestamp {
        self.state_changed_at
    }

    /// Check if the lock has passed its expiry at `now`
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        now >= self.locked_until
    }

    fn transition(&mut self, state: LockState, now: Timestamp) {
        self.state = state;
        self.state_changed_at = now;
    }

    /// Move an active entry whose expiry has passed to `Expired`.
    ///
    /// Returns `true` if this call made the transition.
    fn expire_if_due(&mut self, now: Timestamp) -> bool {
        if self.state.is_active() && self.is_expired_at(now) {
            self.transition(LockState::Expired, now);
            return true;
        }
        false
    }

    fn is_evictable(&self, now: Timestamp, grace_period: Duration) -> bool {
        match self.state {
            LockState::Settled | LockState::Expired => {
                now >= self.state_changed_at.add_duration(grace_period)
            }
            // Left behind by a cancelled settlement; the broker lock is gone by now.
            LockState::Completing => now >= self.locked_until.add_duration(grace_period),
            LockState::Locked | LockState::Failed => false,
        }
    }
}

// ============================================================================
// Lock Registry
// ============================================================================

type EntrySlot = Arc<Mutex<LockEntry>>;

/// Thread-safe registry of lock entries keyed by lock token.
///
/// # Example
///
/// ```rust
/// use queue_receiver::lock_registry::{Disposition, LockOutcome, LockRegistry, LockState};
/// use queue_receiver::message::{LockToken, SequenceNumber, Timestamp};
/// use std::time::Duration;
///
/// let registry = LockRegistry::new(Duration::from_secs(30));
/// let token = LockToken::new();
/// let expiry = Timestamp::now().add_duration(Duration::from_secs(60));
/// registry.register(token, SequenceNumber::new(1), expiry);
///
/// assert!(registry.mark_settling(token));
/// assert!(!registry.mark_settling(token)); // one winner
/// assert!(registry.finalize(token, LockOutcome::Settled(Disposition::Completed)));
/// assert_eq!(registry.lookup(token).unwrap().state(), LockState::Settled);
/// ```
pub struct LockRegistry {
    entries: RwLock<HashMap<LockToken, EntrySlot>>,
    grace_period: Duration,
}

impl LockRegistry {
    /// Create a registry that keeps terminal entries for `grace_period`
    pub fn new(grace_period: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            grace_period,
        }
    }

    /// Start tracking a newly granted lock in state `Locked`
    pub fn register(
        &self,
        lock_token: LockToken,
        sequence_number: SequenceNumber,
        locked_until: Timestamp,
    ) -> LockEntry {
        let entry = LockEntry::new(lock_token, sequence_number, locked_until);
        let previous = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(lock_token, Arc::new(Mutex::new(entry.clone())));

        if previous.is_some() {
            debug!(lock_token = %lock_token, "Replaced existing lock entry");
        }

        entry
    }

    /// Get a snapshot of the entry for `lock_token`
    pub fn lookup(&self, lock_token: LockToken) -> Option<LockEntry> {
        let slot = self.slot(lock_token)?;
        let mut entry = lock_entry(&slot);
        entry.expire_if_due(Timestamp::now());
        Some(entry.clone())
    }

    /// Check if the entry exists and may be settled or renewed
    pub fn is_active(&self, lock_token: LockToken) -> bool {
        self.lookup(lock_token)
            .map(|entry| entry.state().is_active())
            .unwrap_or(false)
    }

    /// Claim the right to settle `lock_token` (`Locked`/`Failed` -> `Completing`).
    ///
    /// Exactly one of any number of concurrent callers gets `true`. Unknown,
    /// expired, settling and settled tokens all yield `false`.
    pub fn mark_settling(&self, lock_token: LockToken) -> bool {
        let Some(slot) = self.slot(lock_token) else {
            return false;
        };

        let now = Timestamp::now();
        let mut entry = lock_entry(&slot);
        if entry.expire_if_due(now) {
            debug!(lock_token = %lock_token, "Lock expired before settlement started");
            return false;
        }
        if !entry.state.is_active() {
            return false;
        }

        entry.transition(LockState::Completing, now);
        true
    }

    /// Record the terminal outcome of a settlement (`Completing` -> `Settled`/`Expired`).
    ///
    /// Returns `false` if the entry is not `Completing`, so an outcome is
    /// recorded at most once per settlement.
    pub fn finalize(&self, lock_token: LockToken, outcome: LockOutcome) -> bool {
        self.transition_from_completing(lock_token, |entry, now| match outcome {
            LockOutcome::Settled(disposition) => {
                entry.disposition = Some(disposition);
                entry.transition(LockState::Settled, now);
            }
            LockOutcome::Expired => entry.transition(LockState::Expired, now),
        })
    }

    /// Undo a settlement claim after a retryable failure (`Completing` -> `Locked`)
    pub fn restore(&self, lock_token: LockToken) -> bool {
        self.transition_from_completing(lock_token, |entry, now| {
            entry.transition(LockState::Locked, now)
        })
    }

    /// Record a broker rejection of the settlement (`Completing` -> `Failed`)
    pub fn mark_failed(&self, lock_token: LockToken) -> bool {
        self.transition_from_completing(lock_token, |entry, now| {
            entry.transition(LockState::Failed, now)
        })
    }

    /// Move an active entry to `Expired` after the broker reported the lock lost
    pub fn expire(&self, lock_token: LockToken) -> bool {
        let Some(slot) = self.slot(lock_token) else {
            return false;
        };

        let mut entry = lock_entry(&slot);
        if !entry.state.is_active() {
            return false;
        }
        entry.transition(LockState::Expired, Timestamp::now());
        true
    }

    /// Apply a renewed expiry to an active entry.
    ///
    /// Expiry only moves forward. Returns the resulting expiry, or `None` if
    /// the entry is gone or no longer active (for example because a
    /// settlement claimed it while the renewal was in flight).
    pub fn extend(&self, lock_token: LockToken, locked_until: Timestamp) -> Option<Timestamp> {
        let slot = self.slot(lock_token)?;
        let mut entry = lock_entry(&slot);
        if entry.expire_if_due(Timestamp::now()) || !entry.state.is_active() {
            return None;
        }

        if locked_until > entry.locked_until {
            entry.locked_until = locked_until;
        }
        Some(entry.locked_until)
    }

    /// Expire overdue entries and drop entries past their grace period.
    ///
    /// Returns the tokens that this sweep moved to `Expired`. Each entry's
    /// mutex is held only while that entry is checked.
    pub fn evict_expired(&self, now: Timestamp) -> Vec<LockToken> {
        let slots: Vec<(LockToken, EntrySlot)> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(token, slot)| (*token, Arc::clone(slot)))
            .collect();

        let mut newly_expired = Vec::new();
        let mut evictable = Vec::new();
        for (token, slot) in slots {
            let mut entry = lock_entry(&slot);
            if entry.expire_if_due(now) {
                newly_expired.push(token);
            } else if entry.is_evictable(now, self.grace_period) {
                evictable.push(token);
            }
        }

        if !evictable.is_empty() {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            for token in evictable {
                let still_evictable = entries
                    .get(&token)
                    .map(|slot| lock_entry(slot).is_evictable(now, self.grace_period))
                    .unwrap_or(false);
                if still_evictable {
                    entries.remove(&token);
                }
            }
        }

        newly_expired
    }

    /// Number of tracked entries, terminal ones included
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries currently in `state`
    pub fn count_in_state(&self, state: LockState) -> usize {
        self.snapshot()
            .iter()
            .filter(|entry| entry.state() == state)
            .count()
    }

    /// Snapshot of every tracked entry
    pub fn snapshot(&self) -> Vec<LockEntry> {
        let slots: Vec<EntrySlot> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let now = Timestamp::now();
        slots
            .iter()
            .map(|slot| {
                let mut entry = lock_entry(slot);
                entry.expire_if_due(now);
                entry.clone()
            })
            .collect()
    }

    fn slot(&self, lock_token: LockToken) -> Option<EntrySlot> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&lock_token)
            .cloned()
    }

    fn transition_from_completing<F>(&self, lock_token: LockToken, apply: F) -> bool
    where
        F: FnOnce(&mut LockEntry, Timestamp),
    {
        let Some(slot) = self.slot(lock_token) else {
            return false;
        };

        let mut entry = lock_entry(&slot);
        if entry.state != LockState::Completing {
            return false;
        }
        apply(&mut entry, Timestamp::now());
        true
    }
}

fn lock_entry(slot: &Mutex<LockEntry>) -> MutexGuard<'_, LockEntry> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}
