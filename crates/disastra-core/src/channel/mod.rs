//! Channel Module
//!
//! CSP channel infrastructure between the application and the relay:
//! - `communication`: commands, application events and their payloads
//! - `utils`: channel aliases, constructors and non-blocking send

pub mod communication;
pub mod utils;

pub use communication::{AppEvent, Command, InboundMessage, TransportStatus};

pub use crate::config::ChannelConfig;

pub use utils::{
    create_app_event_channel, create_command_channel, AppEventReceiver, AppEventSender,
    ChannelError, CommandReceiver, CommandSender, NonBlockingSend,
};
