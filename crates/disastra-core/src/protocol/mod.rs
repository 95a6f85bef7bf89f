//! Disastra Protocol Module
//!
//! - `envelope`: emergency message envelopes and their payloads
//! - `wire`: binary frame codec
//! - `deduplication`: seen-message cache

pub mod deduplication;
pub mod envelope;
pub mod wire;

pub use deduplication::{DeduplicationStats, Observation, SeenCache, SeenRecord};
pub use envelope::{
    AckPayload, EmergencyType, EnvelopeKind, GeoPoint, MessageEnvelope, MessagePayload,
    SafePayload, SosPayload, UpdatePayload,
};
pub use wire::EnvelopeCodec;
