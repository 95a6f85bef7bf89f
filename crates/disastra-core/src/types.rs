//! Core types for the Disastra relay
//!
//! This module defines the fundamental types used throughout the relay,
//! using newtype patterns for semantic validation and type safety.

use core::fmt;
use core::ops::{Add, Deref, Sub};
use core::str::FromStr;
use core::time::Duration;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::RelayError;

// ----------------------------------------------------------------------------
// Message Identifier
// ----------------------------------------------------------------------------

/// Globally unique identifier of an emergency message
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Rebuild an identifier from its 16 wire bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| RelayError::config_error(format!("invalid message id {s:?}: {e}")))
    }
}

impl Deref for MessageId {
    type Target = Uuid;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ----------------------------------------------------------------------------
// Node Identifier
// ----------------------------------------------------------------------------

/// Identity a transport assigns to the local node once its session starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell nodes apart in logs
        let simple = self.0.simple().to_string();
        write!(f, "{}", &simple[..8])
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, other: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(other.as_millis() as u64))
    }
}

impl Sub for Timestamp {
    type Output = Duration;

    fn sub(self, other: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

impl Timestamp {
    /// Create a new timestamp
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Get the raw milliseconds
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Subtract a duration, saturating at the epoch
    pub fn saturating_sub(&self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration.as_millis() as u64))
    }

    /// Get duration since another timestamp
    pub fn duration_since(&self, other: Self) -> Duration {
        *self - other
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

// ----------------------------------------------------------------------------
// Time-to-Live (TTL)
// ----------------------------------------------------------------------------

/// Propagation bound of an envelope: remaining relay hops and total lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ttl {
    /// Remaining relay hops
    pub hops: u8,
    /// Lifetime measured from the envelope's creation time
    pub lifetime_ms: u32,
}

impl Ttl {
    /// Default TTL for new envelopes: 7 hops, 24 hours
    pub const DEFAULT: Self = Self {
        hops: 7,
        lifetime_ms: 24 * 60 * 60 * 1000,
    };

    pub fn new(hops: u8, lifetime: Duration) -> Self {
        Self {
            hops,
            lifetime_ms: lifetime.as_millis().min(u32::MAX as u128) as u32,
        }
    }

    pub fn lifetime(&self) -> Duration {
        Duration::from_millis(self.lifetime_ms as u64)
    }

    /// Decrement hops, returning None once no hops remain
    pub fn decrement(self) -> Option<Self> {
        if self.hops > 0 {
            Some(Self {
                hops: self.hops - 1,
                ..self
            })
        } else {
            None
        }
    }

    /// Whether `now` lies beyond `created_at + lifetime`
    pub fn is_elapsed(&self, created_at: Timestamp, now: Timestamp) -> bool {
        now.duration_since(created_at) > self.lifetime()
    }
}

impl Default for Ttl {
    fn default() -> Self {
        Self::DEFAULT
    }
}

// ----------------------------------------------------------------------------
// Time Source Trait
// ----------------------------------------------------------------------------

/// Source of "now" for everything that schedules or expires
pub trait TimeSource: Send + Sync {
    /// Get the current timestamp
    fn now(&self) -> Timestamp;
}

/// Wall-clock time source
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl SystemTimeSource {
    pub fn new() -> Self {
        Self
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Manually advanced clock, shared between clones
#[derive(Debug, Clone, Default)]
pub struct ManualTimeSource {
    millis: Arc<AtomicU64>,
}

impl ManualTimeSource {
    pub fn new(start: Timestamp) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(start.as_millis())),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, to: Timestamp) {
        self.millis.store(to.as_millis(), Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp(self.millis.load(Ordering::SeqCst))
    }
}

impl<T: TimeSource + ?Sized> TimeSource for Arc<T> {
    fn now(&self) -> Timestamp {
        (**self).now()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_bytes() {
        let id = MessageId::new();
        let rebuilt = MessageId::from_bytes(*id.as_bytes());
        assert_eq!(id, rebuilt);

        let parsed: MessageId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<MessageId>().is_err());
    }

    #[test]
    fn test_ttl() {
        let mut ttl = Ttl::new(2, Duration::from_secs(60));
        assert_eq!(ttl.hops, 2);

        ttl = ttl.decrement().unwrap();
        assert_eq!(ttl.hops, 1);

        ttl = ttl.decrement().unwrap();
        assert_eq!(ttl.hops, 0);

        assert!(ttl.decrement().is_none());
    }

    #[test]
    fn test_ttl_lifetime() {
        let ttl = Ttl::new(3, Duration::from_secs(10));
        let created = Timestamp::new(1_000);
        assert!(!ttl.is_elapsed(created, Timestamp::new(11_000)));
        assert!(ttl.is_elapsed(created, Timestamp::new(11_001)));
    }

    #[test]
    fn test_manual_time_source() {
        let clock = ManualTimeSource::new(Timestamp::new(500));
        let shared = clock.clone();
        clock.advance(Duration::from_millis(250));
        assert_eq!(shared.now(), Timestamp::new(750));

        shared.set(Timestamp::new(10));
        assert_eq!(clock.now().as_millis(), 10);
    }
}
