//! Disastra Core
//!
//! Foundational types for store-and-forward relay of emergency messages over
//! an intermittently connected peer mesh: envelopes and their wire codec,
//! the seen-message cache, the orphan buffer, the delivery state machine, the
//! durable outbox and the transport adapter trait. The event loop that ties
//! them together lives in `disastra-runtime`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod channel;
pub mod config;
pub mod delivery;
pub mod errors;
pub mod orphans;
pub mod outbox;
pub mod protocol;
pub mod transport;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use channel::{
    create_app_event_channel, create_command_channel, AppEvent, AppEventReceiver,
    AppEventSender, ChannelError, Command, CommandReceiver, CommandSender, InboundMessage,
    NonBlockingSend, TransportStatus,
};
pub use config::{ChannelConfig, DedupConfig, OrphanConfig, RelayConfig};
pub use delivery::{
    DeliveryConfig, DeliveryEvent, DeliveryRecord, DeliveryState, StateTransitionError,
};
pub use errors::{DecodeError, RelayError, RelayResult, Result, StorageError, TransportError};
pub use orphans::OrphanBuffer;
pub use outbox::{
    FileOutboxPersistence, MemoryOutboxPersistence, OutboxEntry, OutboxPersistence, OutboxStore,
};
pub use protocol::{
    AckPayload, DeduplicationStats, EmergencyType, EnvelopeCodec, EnvelopeKind, GeoPoint,
    MessageEnvelope, MessagePayload, Observation, SafePayload, SeenCache, SosPayload,
    UpdatePayload,
};
pub use transport::{
    create_transport_event_channel, SendOutcome, SendTicket, TicketCounter,
    TransportAdapter, TransportCapabilities, TransportEvent, TransportEventReceiver,
    TransportEventSender, TransportType,
};
pub use types::{
    ManualTimeSource, MessageId, NodeId, SystemTimeSource, TimeSource, Timestamp, Ttl,
};
