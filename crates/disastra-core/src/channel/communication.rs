//! CSP Channel Communication Protocol Types
//!
//! All traffic between the application and the relay event loop flows
//! through these message types. Transport traffic uses
//! [`crate::transport::TransportEvent`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::delivery::DeliveryEvent;
use crate::protocol::envelope::MessageEnvelope;
use crate::types::{MessageId, NodeId};

// ----------------------------------------------------------------------------
// Command: Application → Relay
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Originate a message from this node
    Submit { envelope: MessageEnvelope },
    /// Purge caches and prune the outbox now instead of waiting for the scan
    Maintain,
    /// Stop the relay, keeping in-flight messages queued
    Shutdown,
}

// ----------------------------------------------------------------------------
// AppEvent: Relay → Application
// ----------------------------------------------------------------------------

/// A message delivered to the local application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub envelope: MessageEnvelope,
    /// Hops consumed between origin and this node, as far as the TTL tells
    pub relay_hops: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AppEvent {
    /// A locally originated message entered a new delivery state
    Delivery(DeliveryEvent),
    /// A message from the mesh, delivered once per id
    Inbound(InboundMessage),
    /// A submission was refused before reaching the outbox
    SubmissionRejected { id: MessageId, reason: String },
    TransportStatus { status: TransportStatus },
}

// ----------------------------------------------------------------------------
// Supporting Types
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportStatus {
    /// Session running under the given node identity
    Active { node_id: NodeId },
    Stopped,
    Failed { reason: String },
}

impl fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportStatus::Active { node_id } => write!(f, "Active ({node_id})"),
            TransportStatus::Stopped => write!(f, "Stopped"),
            TransportStatus::Failed { reason } => write!(f, "Failed: {reason}"),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Submit { envelope } => {
                write!(f, "Submit({} {})", envelope.kind(), envelope.id)
            }
            Command::Maintain => write!(f, "Maintain"),
            Command::Shutdown => write!(f, "Shutdown"),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
