//! Transport abstraction for the Disastra relay
//!
//! The relay never talks to a radio directly. A [`TransportAdapter`] hands
//! frames to the mesh without blocking and reports everything that happens
//! afterwards (session start, send outcomes, inbound frames) as
//! [`TransportEvent`]s on the channel it was attached to.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, TransportError};
use crate::types::NodeId;

// ----------------------------------------------------------------------------
// Transport Trait
// ----------------------------------------------------------------------------

/// Mesh transport as seen by the relay
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Register the channel that receives this transport's events
    ///
    /// Called once, before `start`.
    fn attach(&self, events: TransportEventSender);

    /// Begin the mesh session; the outcome arrives as `Started` or
    /// `FailedToStart`
    async fn start(&self) -> Result<()>;

    /// End the mesh session
    async fn stop(&self) -> Result<()>;

    /// Queue a frame for broadcast without waiting for the radio
    ///
    /// The outcome of an accepted frame is reported later as a `SendResult`
    /// carrying the returned ticket.
    fn send(&self, bytes: &[u8]) -> core::result::Result<SendTicket, TransportError>;

    fn capabilities(&self) -> TransportCapabilities;
}

// ----------------------------------------------------------------------------
// Transport Capabilities
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportCapabilities {
    pub transport_type: TransportType,
    /// Largest frame `send` accepts
    pub max_payload_size: usize,
    pub supports_broadcast: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportType {
    /// Bluetooth / Wi-Fi Direct mesh radio
    Mesh,
    /// In-process mesh (simulation and tests)
    Loopback,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportType::Mesh => write!(f, "mesh"),
            TransportType::Loopback => write!(f, "loopback"),
        }
    }
}

// ----------------------------------------------------------------------------
// Send Tickets
// ----------------------------------------------------------------------------

/// Handle correlating a `send` call with its later `SendResult`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SendTicket(pub u64);

impl fmt::Display for SendTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic ticket source for transport implementations
#[derive(Debug, Default)]
pub struct TicketCounter(AtomicU64);

impl TicketCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> SendTicket {
        SendTicket(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

// ----------------------------------------------------------------------------
// Transport Events
// ----------------------------------------------------------------------------

/// Final outcome of an accepted send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The frame left this node
    Delivered,
    Failed(TransportError),
}

/// Events emitted by a transport, in the order they happen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Session established; the mesh assigned this node an identity
    Started { node_id: NodeId },
    Stopped,
    FailedToStart { reason: String },
    SendResult {
        ticket: SendTicket,
        outcome: SendOutcome,
    },
    /// A frame arrived from a peer
    Received { bytes: Vec<u8> },
}

/// Transports run on their own I/O threads and must never block on the
/// relay, so the event channel is unbounded.
pub type TransportEventSender = tokio::sync::mpsc::UnboundedSender<TransportEvent>;
pub type TransportEventReceiver = tokio::sync::mpsc::UnboundedReceiver<TransportEvent>;

pub fn create_transport_event_channel() -> (TransportEventSender, TransportEventReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}
