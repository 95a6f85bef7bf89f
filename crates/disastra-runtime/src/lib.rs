//! Disastra Runtime
//!
//! The relay engine for the Disastra emergency relay:
//! - `RelayCore`: the single-writer state machine tying the outbox, the
//!   seen cache and the orphan buffer to a transport
//! - `RelayTask`: the event loop that owns the core, plus the retry scan
//! - `RelayRuntime` and `RuntimeBuilder`: lifecycle and wiring
//! - `LoopbackMesh`: an in-process transport for simulation and tests
//!
//! `disastra-core` provides the stable types; this crate runs them.

pub mod builder;
pub mod logic;
pub mod loopback;
pub mod relay;
mod runtime;

pub use builder::{create_testing_runtime, RuntimeBuilder};
pub use logic::{RelayTask, MAINTENANCE_INTERVAL};
pub use loopback::{LoopbackMesh, LoopbackTransport, DEFAULT_MAX_PAYLOAD};
pub use relay::{delivery_events, RelayCore, RelayStats};
pub use runtime::RelayRuntime;

// Re-export core types for convenience
pub use disastra_core::{
    AppEvent, AppEventReceiver, Command, CommandSender, DeliveryEvent, DeliveryState,
    InboundMessage, MessageEnvelope, RelayConfig, RelayError, RelayResult, TransportAdapter,
    TransportStatus,
};
