//! Holding area for follow-ups that arrive before their SOS
//!
//! Mesh paths reorder traffic, so an `Update` or `SafeNotice` can reach a
//! node before the SOS it refers to. Such envelopes are parked here, keyed by
//! the SOS id, and handed back once that SOS is delivered.

use hashbrown::HashMap;
use smallvec::SmallVec;
use tracing::debug;

use crate::protocol::envelope::MessageEnvelope;
use crate::types::{MessageId, Timestamp};

#[derive(Debug, Clone)]
struct HeldOrphan {
    envelope: MessageEnvelope,
    held_at: Timestamp,
}

/// Orphaned follow-ups grouped by the SOS they wait for
#[derive(Debug, Default)]
pub struct OrphanBuffer {
    // Most threads carry one or two follow-ups
    waiting: HashMap<MessageId, SmallVec<[HeldOrphan; 2]>>,
    len: usize,
}

impl OrphanBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park an envelope until its correlated SOS arrives
    ///
    /// Returns false for envelopes without a correlation id and for ids that
    /// are already held.
    pub fn hold(&mut self, envelope: MessageEnvelope, now: Timestamp) -> bool {
        let Some(sos_id) = envelope.correlation_id else {
            return false;
        };
        let slot = self.waiting.entry(sos_id).or_default();
        if slot.iter().any(|held| held.envelope.id == envelope.id) {
            return false;
        }
        debug!(message_id = %envelope.id, %sos_id, "Holding orphaned follow-up");
        slot.push(HeldOrphan {
            envelope,
            held_at: now,
        });
        self.len += 1;
        true
    }

    /// Take every envelope waiting on `sos_id`, oldest `created_at` first
    pub fn release(&mut self, sos_id: &MessageId) -> Vec<MessageEnvelope> {
        let Some(held) = self.waiting.remove(sos_id) else {
            return Vec::new();
        };
        self.len -= held.len();

        let mut released: Vec<MessageEnvelope> =
            held.into_iter().map(|orphan| orphan.envelope).collect();
        released.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        debug!(%sos_id, released = released.len(), "Released orphaned follow-ups");
        released
    }

    /// Drop envelopes held since before `cutoff`, returning them
    pub fn purge_older_than(&mut self, cutoff: Timestamp) -> Vec<MessageEnvelope> {
        let mut purged = Vec::new();
        self.waiting.retain(|_, held| {
            let mut index = 0;
            while index < held.len() {
                if held[index].held_at < cutoff {
                    purged.push(held.remove(index).envelope);
                } else {
                    index += 1;
                }
            }
            !held.is_empty()
        });
        self.len -= purged.len();
        purged
    }

    pub fn is_waiting_on(&self, sos_id: &MessageId) -> bool {
        self.waiting.contains_key(sos_id)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::envelope::{SafePayload, UpdatePayload};
    use crate::types::Ttl;

    fn update(sos_id: MessageId, created_ms: u64) -> MessageEnvelope {
        MessageEnvelope::update(
            sos_id,
            UpdatePayload::default(),
            Timestamp::new(created_ms),
            Ttl::DEFAULT,
        )
    }

    #[test]
    fn test_hold_and_release_in_creation_order() {
        let mut buffer = OrphanBuffer::new();
        let sos_id = MessageId::new();
        let second = update(sos_id, 200);
        let first = update(sos_id, 100);
        let safe = MessageEnvelope::safe_notice(
            sos_id,
            SafePayload {
                marked_safe_at: Timestamp::new(300),
                note: "ok".into(),
            },
            Timestamp::new(300),
            Ttl::DEFAULT,
        );

        assert!(buffer.hold(second.clone(), Timestamp::new(1)));
        assert!(buffer.hold(safe.clone(), Timestamp::new(2)));
        assert!(buffer.hold(first.clone(), Timestamp::new(3)));
        assert_eq!(buffer.len(), 3);

        let released = buffer.release(&sos_id);
        let ids: Vec<MessageId> = released.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![first.id, second.id, safe.id]);
        assert!(buffer.is_empty());
        assert!(buffer.release(&sos_id).is_empty());
    }

    #[test]
    fn test_duplicate_hold_ignored() {
        let mut buffer = OrphanBuffer::new();
        let env = update(MessageId::new(), 1);
        assert!(buffer.hold(env.clone(), Timestamp::new(0)));
        assert!(!buffer.hold(env, Timestamp::new(1)));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_purge_older_than() {
        let mut buffer = OrphanBuffer::new();
        let sos_a = MessageId::new();
        let sos_b = MessageId::new();
        let stale = update(sos_a, 0);
        buffer.hold(stale.clone(), Timestamp::new(10));
        buffer.hold(update(sos_a, 1), Timestamp::new(500));
        buffer.hold(update(sos_b, 2), Timestamp::new(20));

        let purged = buffer.purge_older_than(Timestamp::new(100));
        assert_eq!(purged.len(), 2);
        assert!(purged.iter().any(|e| e.id == stale.id));
        assert_eq!(buffer.len(), 1);
        assert!(buffer.is_waiting_on(&sos_a));
        assert!(!buffer.is_waiting_on(&sos_b));
    }
}
