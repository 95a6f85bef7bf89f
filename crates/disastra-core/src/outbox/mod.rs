//! Durable outbox of locally originated messages
//!
//! The outbox owns one [`OutboxEntry`] per message this node submitted and
//! drives it through the delivery state machine. Every mutation is written
//! through to the configured [`OutboxPersistence`] before the call returns,
//! so an acknowledged submission survives a crash.

pub mod persistence;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::delivery::{DeliveryConfig, DeliveryEvent, DeliveryRecord, DeliveryState};
use crate::errors::{RelayError, Result, TransportError};
use crate::protocol::envelope::MessageEnvelope;
use crate::types::{MessageId, Timestamp};

pub use persistence::{FileOutboxPersistence, MemoryOutboxPersistence, OutboxPersistence};

// ----------------------------------------------------------------------------
// Outbox Entry
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub envelope: MessageEnvelope,
    pub delivery: DeliveryRecord,
}

impl OutboxEntry {
    pub fn id(&self) -> MessageId {
        self.envelope.id
    }

    pub fn state(&self) -> DeliveryState {
        self.delivery.state
    }

    pub fn attempts(&self) -> u32 {
        self.delivery.attempts
    }

    fn event(&self) -> DeliveryEvent {
        self.delivery.event(self.envelope.id)
    }

    /// Settled entries whose retention window has passed
    fn is_prunable(&self, now: Timestamp, config: &DeliveryConfig) -> bool {
        let settled = matches!(
            self.delivery.state,
            DeliveryState::Sent | DeliveryState::Acknowledged | DeliveryState::Expired
        );
        match (settled, self.delivery.terminal_at) {
            (true, Some(at)) => now.duration_since(at) > config.retention(),
            _ => false,
        }
    }
}

// ----------------------------------------------------------------------------
// Outbox Store
// ----------------------------------------------------------------------------

pub struct OutboxStore {
    entries: HashMap<MessageId, OutboxEntry>,
    config: DeliveryConfig,
    persistence: Box<dyn OutboxPersistence>,
}

impl core::fmt::Debug for OutboxStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OutboxStore")
            .field("entries", &self.entries.len())
            .field("config", &self.config)
            .finish()
    }
}

impl OutboxStore {
    /// Open the outbox, loading whatever the backend holds
    ///
    /// Entries that were mid-send when the node stopped are returned to
    /// `Queued`; their outcome was never observed.
    pub fn open<P>(persistence: P, config: DeliveryConfig) -> Result<Self>
    where
        P: OutboxPersistence + 'static,
    {
        let loaded = persistence.load()?;
        let mut store = Self {
            entries: HashMap::with_capacity(loaded.len()),
            config,
            persistence: Box::new(persistence),
        };

        let mut recovered = 0usize;
        for mut entry in loaded {
            if entry.delivery.state == DeliveryState::Sending {
                entry.delivery.suspend()?;
                recovered += 1;
            }
            store.entries.insert(entry.id(), entry);
        }

        if recovered > 0 {
            info!(recovered, "Returned in-flight outbox entries to the queue");
            store.persist()?;
        }
        debug!(entries = store.entries.len(), "Outbox opened");
        Ok(store)
    }

    /// Outbox backed by a private in-memory store
    pub fn in_memory(config: DeliveryConfig) -> Self {
        Self {
            entries: HashMap::new(),
            config,
            persistence: Box::new(MemoryOutboxPersistence::new()),
        }
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    fn persist(&self) -> Result<()> {
        let snapshot: Vec<OutboxEntry> = self.entries.values().cloned().collect();
        self.persistence.save(&snapshot)
    }

    /// Admit an envelope, idempotent on its id
    ///
    /// A repeated id returns the stored entry unchanged and no events.
    pub fn enqueue(
        &mut self,
        envelope: MessageEnvelope,
        now: Timestamp,
    ) -> Result<(OutboxEntry, Vec<DeliveryEvent>)> {
        if let Some(existing) = self.entries.get(&envelope.id) {
            debug!(message_id = %envelope.id, state = %existing.state(), "Duplicate enqueue ignored");
            return Ok((existing.clone(), Vec::new()));
        }
        envelope.validate()?;

        let mut entry = OutboxEntry {
            envelope,
            delivery: DeliveryRecord::new(now),
        };
        let mut events = vec![entry.event()];
        entry.delivery.queue(now)?;
        events.push(entry.event());

        let id = entry.id();
        self.entries.insert(id, entry.clone());
        if let Err(e) = self.persist() {
            // Not durable means not admitted
            self.entries.remove(&id);
            return Err(e);
        }

        debug!(message_id = %id, kind = %entry.envelope.kind(), "Enqueued message");
        Ok((entry, events))
    }

    /// Entries ready for an attempt, oldest first
    pub fn next_due(&self, now: Timestamp) -> Vec<OutboxEntry> {
        let mut due: Vec<OutboxEntry> = self
            .entries
            .values()
            .filter(|entry| entry.delivery.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.envelope
                .created_at
                .cmp(&b.envelope.created_at)
                .then_with(|| a.id().cmp(&b.id()))
        });
        due
    }

    /// Apply `transition` to a copy of one entry and write it through
    ///
    /// A failed save restores the previous record.
    fn commit<T>(
        &mut self,
        id: &MessageId,
        transition: impl FnOnce(&mut OutboxEntry) -> Result<T>,
    ) -> Result<T> {
        let previous = self
            .entries
            .get(id)
            .cloned()
            .ok_or_else(|| RelayError::unknown_message(id))?;
        let mut updated = previous.clone();
        let outcome = transition(&mut updated)?;

        self.entries.insert(*id, updated);
        if let Err(e) = self.persist() {
            self.entries.insert(*id, previous);
            return Err(e);
        }
        Ok(outcome)
    }

    /// Apply `transition` to every entry it accepts, as one write
    ///
    /// `transition` returns `None` to leave an entry untouched. A failed save
    /// restores every changed record.
    fn commit_each(
        &mut self,
        mut transition: impl FnMut(&mut OutboxEntry) -> Result<Option<DeliveryEvent>>,
    ) -> Result<Vec<DeliveryEvent>> {
        let mut updates = Vec::new();
        let mut events = Vec::new();
        for entry in self.entries.values() {
            let mut updated = entry.clone();
            if let Some(event) = transition(&mut updated)? {
                updates.push(updated);
                events.push(event);
            }
        }
        if updates.is_empty() {
            return Ok(events);
        }

        let previous: Vec<OutboxEntry> = updates
            .into_iter()
            .filter_map(|updated| self.entries.insert(updated.id(), updated))
            .collect();
        if let Err(e) = self.persist() {
            for entry in previous {
                self.entries.insert(entry.id(), entry);
            }
            return Err(e);
        }
        Ok(events)
    }

    pub fn begin_send(&mut self, id: &MessageId, now: Timestamp) -> Result<DeliveryEvent> {
        self.commit(id, |entry| {
            entry.delivery.begin_send(now)?;
            Ok(entry.event())
        })
    }

    pub fn mark_sent(&mut self, id: &MessageId, now: Timestamp) -> Result<DeliveryEvent> {
        self.commit(id, |entry| {
            entry.delivery.mark_sent(now)?;
            Ok(entry.event())
        })
    }

    /// Record a failed attempt
    ///
    /// Emits `Failed`, followed by `Expired` when the error is permanent, the
    /// attempt budget is spent, or the envelope's lifetime has elapsed.
    pub fn mark_failed(
        &mut self,
        id: &MessageId,
        error: &TransportError,
        now: Timestamp,
    ) -> Result<Vec<DeliveryEvent>> {
        let max_attempts = self.config.max_attempts;
        let config = self.config.clone();

        self.commit(id, |entry| {
            let backoff = config.backoff(entry.attempts());
            entry.delivery.mark_failed(error.to_string(), backoff, now)?;
            let mut events = vec![entry.event()];

            let give_up = if !error.is_transient() {
                Some(format!("permanent transport error: {error}"))
            } else if entry.delivery.is_exhausted(max_attempts) {
                Some(format!("gave up after {} attempts", entry.attempts()))
            } else if entry.envelope.is_expired(now) {
                Some("lifetime elapsed".to_string())
            } else {
                None
            };

            match give_up {
                Some(reason) => {
                    warn!(message_id = %id, attempts = entry.attempts(), %reason, "Message expired");
                    entry.delivery.expire(reason, now)?;
                    events.push(entry.event());
                }
                None => {
                    debug!(
                        message_id = %id,
                        attempts = entry.attempts(),
                        retry_in_ms = backoff.as_millis() as u64,
                        error = %error,
                        "Send failed, retry scheduled"
                    );
                }
            }
            Ok(events)
        })
    }

    /// Record a responder acknowledgement
    ///
    /// Returns `None` when the entry was already acknowledged.
    pub fn acknowledge(&mut self, id: &MessageId, now: Timestamp) -> Result<Option<DeliveryEvent>> {
        let state = self
            .entries
            .get(id)
            .map(|entry| entry.state())
            .ok_or_else(|| RelayError::unknown_message(id))?;
        if state == DeliveryState::Acknowledged {
            return Ok(None);
        }
        self.commit(id, |entry| {
            entry.delivery.acknowledge(now)?;
            Ok(Some(entry.event()))
        })
    }

    pub fn expire(&mut self, id: &MessageId, reason: &str, now: Timestamp) -> Result<DeliveryEvent> {
        self.commit(id, |entry| {
            entry.delivery.expire(reason.to_string(), now)?;
            Ok(entry.event())
        })
    }

    /// Expire pending entries whose lifetime elapsed or attempts ran out
    pub fn expire_due(&mut self, now: Timestamp) -> Result<Vec<DeliveryEvent>> {
        let max_attempts = self.config.max_attempts;
        self.commit_each(|entry| {
            if !entry.state().is_pending() {
                return Ok(None);
            }
            let reason = if entry.envelope.is_expired(now) {
                "lifetime elapsed".to_string()
            } else if entry.delivery.is_exhausted(max_attempts) {
                format!("gave up after {} attempts", entry.attempts())
            } else {
                return Ok(None);
            };
            warn!(message_id = %entry.id(), %reason, "Message expired");
            entry.delivery.expire(reason, now)?;
            Ok(Some(entry.event()))
        })
    }

    /// Return every in-flight entry to the queue
    pub fn suspend_in_flight(&mut self) -> Result<Vec<DeliveryEvent>> {
        self.commit_each(|entry| {
            if entry.state() != DeliveryState::Sending {
                return Ok(None);
            }
            entry.delivery.suspend()?;
            Ok(Some(entry.event()))
        })
    }

    /// Remove settled entries older than the retention window
    pub fn prune(&mut self, now: Timestamp) -> Result<usize> {
        let config = self.config.clone();
        let prunable: Vec<MessageId> = self
            .entries
            .values()
            .filter(|entry| entry.is_prunable(now, &config))
            .map(|entry| entry.id())
            .collect();
        let removed: Vec<OutboxEntry> = prunable
            .iter()
            .filter_map(|id| self.entries.remove(id))
            .collect();
        if removed.is_empty() {
            return Ok(0);
        }

        if let Err(e) = self.persist() {
            for entry in removed {
                self.entries.insert(entry.id(), entry);
            }
            return Err(e);
        }
        debug!(pruned = removed.len(), remaining = self.entries.len(), "Pruned outbox");
        Ok(removed.len())
    }

    pub fn get(&self, id: &MessageId) -> Option<&OutboxEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries.contains_key(id)
    }

    /// All entries, oldest first
    pub fn entries(&self) -> Vec<&OutboxEntry> {
        let mut all: Vec<&OutboxEntry> = self.entries.values().collect();
        all.sort_by(|a, b| {
            a.envelope
                .created_at
                .cmp(&b.envelope.created_at)
                .then_with(|| a.id().cmp(&b.id()))
        });
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
