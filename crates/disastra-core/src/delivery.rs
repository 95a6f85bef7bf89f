//! Delivery state machine for locally originated messages
//!
//! Each outbox entry carries a [`DeliveryRecord`] that moves through
//! [`DeliveryState`] as send attempts are made and their outcomes arrive.
//! Every transition is checked; an illegal move yields a
//! [`StateTransitionError`] and leaves the record untouched.

use core::fmt;
use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{MessageId, Timestamp};

// ----------------------------------------------------------------------------
// Delivery State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryState {
    /// Constructed, not yet admitted to the outbox
    Created,
    /// Waiting for its next send attempt
    Queued,
    /// Handed to the transport, outcome pending
    Sending,
    /// Transport confirmed the hand-off
    Sent,
    /// A responder acknowledged the message
    Acknowledged,
    /// Last attempt failed, retry scheduled
    Failed,
    /// Given up; no further attempts
    Expired,
}

impl DeliveryState {
    /// No transition leaves a terminal state
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryState::Acknowledged | DeliveryState::Expired)
    }

    /// States from which a send attempt may begin
    pub fn is_pending(self) -> bool {
        matches!(self, DeliveryState::Queued | DeliveryState::Failed)
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeliveryState::Created => "created",
            DeliveryState::Queued => "queued",
            DeliveryState::Sending => "sending",
            DeliveryState::Sent => "sent",
            DeliveryState::Acknowledged => "acknowledged",
            DeliveryState::Failed => "failed",
            DeliveryState::Expired => "expired",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Invalid delivery transition from {from} to {to}")]
pub struct StateTransitionError {
    pub from: DeliveryState,
    pub to: DeliveryState,
}

// ----------------------------------------------------------------------------
// Delivery Event
// ----------------------------------------------------------------------------

/// Emitted for every state a message enters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryEvent {
    pub id: MessageId,
    pub state: DeliveryState,
    pub attempts: u32,
    pub reason: Option<String>,
}

// ----------------------------------------------------------------------------
// Delivery Configuration
// ----------------------------------------------------------------------------

/// Retry and retention behaviour of the outbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Attempts allowed before a failing message expires
    pub max_attempts: u32,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// How long settled entries stay in the outbox before pruning
    pub retention_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_retry_delay_ms: 1_000,
            max_retry_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            retention_secs: 24 * 60 * 60,
        }
    }
}

impl DeliveryConfig {
    /// Fast timers for tests and simulation
    pub fn testing() -> Self {
        Self {
            max_attempts: 5,
            initial_retry_delay_ms: 10,
            max_retry_delay_ms: 100,
            backoff_multiplier: 2.0,
            retention_secs: 60,
        }
    }

    /// Delay before the retry that follows attempt number `attempts`
    ///
    /// `initial * multiplier^(attempts - 1)`, capped at the maximum delay.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_ms = self.initial_retry_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = if delay_ms.is_finite() {
            delay_ms.min(self.max_retry_delay_ms as f64)
        } else {
            self.max_retry_delay_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

// ----------------------------------------------------------------------------
// Delivery Record
// ----------------------------------------------------------------------------

/// Delivery progress of one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub state: DeliveryState,
    pub attempts: u32,
    pub last_attempt_at: Option<Timestamp>,
    /// Earliest time the next attempt may start
    pub next_retry_at: Timestamp,
    pub last_error: Option<String>,
    /// When the record settled (Sent, Acknowledged or Expired)
    pub terminal_at: Option<Timestamp>,
}

impl DeliveryRecord {
    pub fn new(now: Timestamp) -> Self {
        Self {
            state: DeliveryState::Created,
            attempts: 0,
            last_attempt_at: None,
            next_retry_at: now,
            last_error: None,
            terminal_at: None,
        }
    }

    fn check(&self, allowed: bool, to: DeliveryState) -> Result<(), StateTransitionError> {
        if allowed {
            Ok(())
        } else {
            Err(StateTransitionError {
                from: self.state,
                to,
            })
        }
    }

    /// Created -> Queued
    pub fn queue(&mut self, now: Timestamp) -> Result<(), StateTransitionError> {
        self.check(self.state == DeliveryState::Created, DeliveryState::Queued)?;
        self.state = DeliveryState::Queued;
        self.next_retry_at = now;
        Ok(())
    }

    /// Queued | Failed -> Sending, counting the attempt
    pub fn begin_send(&mut self, now: Timestamp) -> Result<(), StateTransitionError> {
        self.check(self.state.is_pending(), DeliveryState::Sending)?;
        self.state = DeliveryState::Sending;
        self.attempts += 1;
        self.last_attempt_at = Some(now);
        Ok(())
    }

    /// Sending -> Sent
    pub fn mark_sent(&mut self, now: Timestamp) -> Result<(), StateTransitionError> {
        self.check(self.state == DeliveryState::Sending, DeliveryState::Sent)?;
        self.state = DeliveryState::Sent;
        self.last_error = None;
        self.terminal_at = Some(now);
        Ok(())
    }

    /// Sending -> Failed, scheduling the retry after `backoff`
    pub fn mark_failed(
        &mut self,
        reason: String,
        backoff: Duration,
        now: Timestamp,
    ) -> Result<(), StateTransitionError> {
        self.check(self.state == DeliveryState::Sending, DeliveryState::Failed)?;
        self.state = DeliveryState::Failed;
        self.last_error = Some(reason);
        self.next_retry_at = now + backoff;
        Ok(())
    }

    /// Sending -> Queued when the node shuts down mid-send
    pub fn suspend(&mut self) -> Result<(), StateTransitionError> {
        self.check(self.state == DeliveryState::Sending, DeliveryState::Queued)?;
        self.state = DeliveryState::Queued;
        Ok(())
    }

    /// Sent -> Acknowledged
    ///
    /// An acknowledgement can overtake the local send confirmation, so any
    /// non-terminal state that has made at least one attempt also accepts it.
    pub fn acknowledge(&mut self, now: Timestamp) -> Result<(), StateTransitionError> {
        let allowed = match self.state {
            DeliveryState::Sent => true,
            DeliveryState::Sending | DeliveryState::Failed | DeliveryState::Queued => {
                self.attempts > 0
            }
            _ => false,
        };
        self.check(allowed, DeliveryState::Acknowledged)?;
        self.state = DeliveryState::Acknowledged;
        self.terminal_at = Some(now);
        Ok(())
    }

    /// Queued | Failed -> Expired
    pub fn expire(&mut self, reason: String, now: Timestamp) -> Result<(), StateTransitionError> {
        self.check(self.state.is_pending(), DeliveryState::Expired)?;
        self.state = DeliveryState::Expired;
        self.last_error = Some(reason);
        self.terminal_at = Some(now);
        Ok(())
    }

    pub fn is_due(&self, now: Timestamp) -> bool {
        self.state.is_pending() && self.next_retry_at <= now
    }

    pub fn is_exhausted(&self, max_attempts: u32) -> bool {
        self.attempts >= max_attempts
    }

    pub fn event(&self, id: MessageId) -> DeliveryEvent {
        let reason = match self.state {
            DeliveryState::Failed | DeliveryState::Expired => self.last_error.clone(),
            _ => None,
        };
        DeliveryEvent {
            id,
            state: self.state,
            attempts: self.attempts,
            reason,
        }
    }
}
