//! Error types for the Disastra relay
//!
//! This module contains all error types used throughout the relay core,
//! including decode errors, transport errors, storage errors, and the main
//! RelayError type that unifies them all.

use crate::delivery::StateTransitionError;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Failure to decode an inbound frame
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Malformed envelope: {reason}")]
    Malformed { reason: String },
    #[error("Unknown message kind tag: {tag}")]
    UnknownKind { tag: u8 },
}

impl DecodeError {
    pub fn malformed<T: Into<String>>(reason: T) -> Self {
        DecodeError::Malformed {
            reason: reason.into(),
        }
    }
}

/// Failure reported by a transport adapter
///
/// These are always returned as values; a transport never panics or unwinds
/// across the adapter boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Transport is not ready")]
    NotReady,
    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("Transport failure: {reason}")]
    Unknown { reason: String },
}

impl TransportError {
    /// Transient errors are retried with backoff, permanent ones are not
    pub fn is_transient(&self) -> bool {
        !matches!(self, TransportError::PayloadTooLarge { .. })
    }
}

/// Failure reading or writing the durable outbox
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Outbox snapshot could not be encoded: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("Outbox snapshot is corrupt: {reason}")]
    Corrupt { reason: String },
}

// ----------------------------------------------------------------------------
// Relay Error
// ----------------------------------------------------------------------------

/// Core error type for the relay
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("State transition error: {0}")]
    StateTransition(#[from] StateTransitionError),

    /// Envelope exceeds what the codec or transport can carry
    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Envelope violates a structural invariant
    #[error("Invalid envelope: {reason}")]
    InvalidEnvelope { reason: String },

    /// Unknown outbox entry
    #[error("No outbox entry for message {message_id}")]
    UnknownMessage { message_id: String },

    /// Channel communication error between tasks
    #[error("Channel error: {message}")]
    Channel { message: String },

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl RelayError {
    /// Create an invalid envelope error with a reason
    pub fn invalid_envelope<T: Into<String>>(reason: T) -> Self {
        RelayError::InvalidEnvelope {
            reason: reason.into(),
        }
    }

    /// Create a channel error with a message
    pub fn channel_error<T: Into<String>>(message: T) -> Self {
        RelayError::Channel {
            message: message.into(),
        }
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        RelayError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create an unknown message error
    pub fn unknown_message<T: ToString>(message_id: T) -> Self {
        RelayError::UnknownMessage {
            message_id: message_id.to_string(),
        }
    }

    /// Create a corrupt storage error
    pub fn corrupt_storage<T: Into<String>>(reason: T) -> Self {
        RelayError::Storage(StorageError::Corrupt {
            reason: reason.into(),
        })
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, RelayError>;
pub type RelayResult<T> = Result<T>;
