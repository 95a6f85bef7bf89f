//! Emergency message envelopes
//!
//! An envelope is the unit the relay stores, deduplicates and forwards. The
//! kind-specific payload is opaque to the relay; only the id, correlation id,
//! creation time and TTL drive relay decisions.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{RelayError, Result};
use crate::types::{MessageId, Timestamp, Ttl};

// ----------------------------------------------------------------------------
// Envelope Kind
// ----------------------------------------------------------------------------

/// Kind of an emergency message, carried as a one-byte tag on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EnvelopeKind {
    /// Distress broadcast originating a thread
    Sos = 1,
    /// Follow-up details for an earlier SOS
    Update = 2,
    /// The sender of an earlier SOS is now safe
    SafeNotice = 3,
    /// A responder acknowledges an earlier message
    Ack = 4,
}

impl EnvelopeKind {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(EnvelopeKind::Sos),
            2 => Some(EnvelopeKind::Update),
            3 => Some(EnvelopeKind::SafeNotice),
            4 => Some(EnvelopeKind::Ack),
            _ => None,
        }
    }

    /// Whether envelopes of this kind must reference an earlier message
    pub fn requires_correlation(self) -> bool {
        !matches!(self, EnvelopeKind::Sos)
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EnvelopeKind::Sos => "sos",
            EnvelopeKind::Update => "update",
            EnvelopeKind::SafeNotice => "safe",
            EnvelopeKind::Ack => "ack",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Payloads
// ----------------------------------------------------------------------------

/// Category of emergency reported in an SOS
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmergencyType {
    Trapped,
    Medical,
    Fire,
    Unsafe,
    Other(String),
}

impl EmergencyType {
    /// Parse a user supplied category; anything unrecognised becomes `Other`
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "trapped" => EmergencyType::Trapped,
            "medical" => EmergencyType::Medical,
            "fire" => EmergencyType::Fire,
            "unsafe" => EmergencyType::Unsafe,
            _ => EmergencyType::Other(value.trim().to_string()),
        }
    }
}

impl fmt::Display for EmergencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmergencyType::Trapped => f.write_str("trapped"),
            EmergencyType::Medical => f.write_str("medical"),
            EmergencyType::Fire => f.write_str("fire"),
            EmergencyType::Unsafe => f.write_str("unsafe"),
            EmergencyType::Other(other) => write!(f, "other({other})"),
        }
    }
}

/// Position reported by the device that raised the SOS
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64, altitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SosPayload {
    pub emergency_type: EmergencyType,
    pub location: Option<GeoPoint>,
    pub battery_percent: Option<u8>,
    pub note: String,
}

impl SosPayload {
    pub fn new(emergency_type: EmergencyType) -> Self {
        Self {
            emergency_type,
            location: None,
            battery_percent: None,
            note: String::new(),
        }
    }

    pub fn with_location(mut self, location: GeoPoint) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_battery(mut self, percent: u8) -> Self {
        self.battery_percent = Some(percent.min(100));
        self
    }

    pub fn with_note<T: Into<String>>(mut self, note: T) -> Self {
        self.note = note.into();
        self
    }
}

/// Follow-up details for an SOS
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UpdatePayload {
    pub people: String,
    pub medical_supplies: String,
    pub additional_info: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafePayload {
    pub marked_safe_at: Timestamp,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    /// Free-form responder identification (team, unit, name)
    pub responder: String,
    pub note: String,
}

/// Kind-specific body of an envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessagePayload {
    Sos(SosPayload),
    Update(UpdatePayload),
    SafeNotice(SafePayload),
    Ack(AckPayload),
}

impl MessagePayload {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            MessagePayload::Sos(_) => EnvelopeKind::Sos,
            MessagePayload::Update(_) => EnvelopeKind::Update,
            MessagePayload::SafeNotice(_) => EnvelopeKind::SafeNotice,
            MessagePayload::Ack(_) => EnvelopeKind::Ack,
        }
    }
}

// ----------------------------------------------------------------------------
// Message Envelope
// ----------------------------------------------------------------------------

/// Emergency message as stored in the outbox and carried on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Assigned once at creation, never changes while relayed
    pub id: MessageId,
    /// Message this one refers to; absent only for `Sos`
    pub correlation_id: Option<MessageId>,
    pub payload: MessagePayload,
    /// Origination time on the sender's clock
    pub created_at: Timestamp,
    pub ttl: Ttl,
}

impl MessageEnvelope {
    /// Create a new SOS envelope
    pub fn sos(payload: SosPayload, created_at: Timestamp, ttl: Ttl) -> Self {
        Self {
            id: MessageId::new(),
            correlation_id: None,
            payload: MessagePayload::Sos(payload),
            created_at,
            ttl,
        }
    }

    /// Create an update for the SOS `sos_id`
    pub fn update(
        sos_id: MessageId,
        payload: UpdatePayload,
        created_at: Timestamp,
        ttl: Ttl,
    ) -> Self {
        Self::correlated(sos_id, MessagePayload::Update(payload), created_at, ttl)
    }

    /// Create a safe notice for the SOS `sos_id`
    pub fn safe_notice(
        sos_id: MessageId,
        payload: SafePayload,
        created_at: Timestamp,
        ttl: Ttl,
    ) -> Self {
        Self::correlated(sos_id, MessagePayload::SafeNotice(payload), created_at, ttl)
    }

    /// Create a responder acknowledgement of `target`
    pub fn ack(target: MessageId, payload: AckPayload, created_at: Timestamp, ttl: Ttl) -> Self {
        Self::correlated(target, MessagePayload::Ack(payload), created_at, ttl)
    }

    fn correlated(
        correlation_id: MessageId,
        payload: MessagePayload,
        created_at: Timestamp,
        ttl: Ttl,
    ) -> Self {
        Self {
            id: MessageId::new(),
            correlation_id: Some(correlation_id),
            payload,
            created_at,
            ttl,
        }
    }

    /// Replace the generated id, used when an id was assigned elsewhere
    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = id;
        self
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.payload.kind()
    }

    /// Check the correlation rules for this envelope's kind
    pub fn validate(&self) -> Result<()> {
        match (self.kind().requires_correlation(), self.correlation_id) {
            (true, None) => Err(RelayError::invalid_envelope(format!(
                "{} envelope requires a correlation id",
                self.kind()
            ))),
            (false, Some(_)) => Err(RelayError::invalid_envelope(
                "sos envelope must not carry a correlation id",
            )),
            (true, Some(corr)) if corr == self.id => Err(RelayError::invalid_envelope(
                "envelope cannot correlate to itself",
            )),
            _ => Ok(()),
        }
    }

    /// Whether the envelope outlived its TTL lifetime on the local clock
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.ttl.is_elapsed(self.created_at, now)
    }

    /// Copy of this envelope for the next relay hop, if any hops remain
    pub fn next_hop(&self) -> Option<Self> {
        self.ttl.decrement().map(|ttl| Self {
            ttl,
            ..self.clone()
        })
    }
}
