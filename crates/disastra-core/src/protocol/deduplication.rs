//! Seen-message cache for mesh deduplication
//!
//! Every envelope id that passes through the node, whether submitted locally
//! or received from a peer, is recorded here. The cache is the single
//! admission gate for relay: an id that is already present is neither
//! delivered again nor re-broadcast, which breaks forwarding loops.
//!
//! Records are bounded by time only. A count-based eviction would let a burst
//! of traffic push out ids that are still circulating.

use core::time::Duration;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{MessageId, Timestamp};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Default retention of seen records (24 hours)
pub const DEFAULT_SEEN_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

// ----------------------------------------------------------------------------
// Seen Record
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenRecord {
    pub first_seen_at: Timestamp,
    /// How many further copies of the id arrived after the first
    pub relay_count: u32,
}

/// Outcome of observing an id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// The id was not known; it has now been recorded
    FirstTime,
    /// The id was already known
    AlreadySeen { relay_count: u32 },
}

impl Observation {
    pub fn is_first(&self) -> bool {
        matches!(self, Observation::FirstTime)
    }
}

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeduplicationStats {
    pub observations: u64,
    pub duplicates: u64,
    pub purged: u64,
}

impl DeduplicationStats {
    /// Fraction of observations that were duplicates
    pub fn duplicate_ratio(&self) -> f64 {
        if self.observations == 0 {
            0.0
        } else {
            self.duplicates as f64 / self.observations as f64
        }
    }
}

// ----------------------------------------------------------------------------
// Seen Cache
// ----------------------------------------------------------------------------

/// Time-bounded record of every message id observed by this node
#[derive(Debug, Default)]
pub struct SeenCache {
    records: HashMap<MessageId, SeenRecord>,
    stats: DeduplicationStats,
}

impl SeenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit an id, reporting whether it is new
    ///
    /// Callers must hold exclusive access; the runtime guarantees this by
    /// routing every observation through its single event loop.
    pub fn observe(&mut self, id: MessageId, now: Timestamp) -> Observation {
        self.stats.observations += 1;
        match self.records.get_mut(&id) {
            Some(record) => {
                record.relay_count = record.relay_count.saturating_add(1);
                self.stats.duplicates += 1;
                Observation::AlreadySeen {
                    relay_count: record.relay_count,
                }
            }
            None => {
                self.records.insert(
                    id,
                    SeenRecord {
                        first_seen_at: now,
                        relay_count: 0,
                    },
                );
                Observation::FirstTime
            }
        }
    }

    /// Register an id without counting it as an observation
    ///
    /// Used to re-seed the cache from the outbox at startup. An existing
    /// record keeps its earlier `first_seen_at`.
    pub fn record(&mut self, id: MessageId, first_seen_at: Timestamp) {
        self.records.entry(id).or_insert(SeenRecord {
            first_seen_at,
            relay_count: 0,
        });
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.records.contains_key(id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&SeenRecord> {
        self.records.get(id)
    }

    /// Drop every record first seen before `cutoff`
    pub fn purge_older_than(&mut self, cutoff: Timestamp) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, record| record.first_seen_at >= cutoff);
        let purged = before - self.records.len();
        if purged > 0 {
            self.stats.purged += purged as u64;
            debug!(purged, remaining = self.records.len(), "Purged seen records");
        }
        purged
    }

    pub fn stats(&self) -> DeduplicationStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
