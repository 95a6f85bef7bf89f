//! Channel utilities for CSP communication

use std::fmt;

use crate::channel::communication::{AppEvent, Command};
use crate::config::ChannelConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    ChannelFull,
    ChannelClosed,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::ChannelFull => write!(f, "Channel buffer is full"),
            ChannelError::ChannelClosed => write!(f, "Channel is closed"),
        }
    }
}

impl std::error::Error for ChannelError {}

pub type CommandSender = tokio::sync::mpsc::Sender<Command>;
pub type CommandReceiver = tokio::sync::mpsc::Receiver<Command>;
pub type AppEventSender = tokio::sync::mpsc::Sender<AppEvent>;
pub type AppEventReceiver = tokio::sync::mpsc::Receiver<AppEvent>;

// ----------------------------------------------------------------------------
// Channel Creation Utilities
// ----------------------------------------------------------------------------

/// Create bounded command channel (Application → Relay)
pub fn create_command_channel(config: &ChannelConfig) -> (CommandSender, CommandReceiver) {
    tokio::sync::mpsc::channel(config.command_buffer_size)
}

/// Create bounded app event channel (Relay → Application)
pub fn create_app_event_channel(config: &ChannelConfig) -> (AppEventSender, AppEventReceiver) {
    tokio::sync::mpsc::channel(config.app_event_buffer_size)
}

// ----------------------------------------------------------------------------
// Non-blocking Send Utilities
// ----------------------------------------------------------------------------

/// Send without waiting for buffer space
pub trait NonBlockingSend<T> {
    fn try_send_non_blocking(&self, message: T) -> Result<(), ChannelError>;
}

impl<T> NonBlockingSend<T> for tokio::sync::mpsc::Sender<T> {
    fn try_send_non_blocking(&self, message: T) -> Result<(), ChannelError> {
        self.try_send(message).map_err(|e| match e {
            tokio::sync::mpsc::error::TrySendError::Full(_) => ChannelError::ChannelFull,
            tokio::sync::mpsc::error::TrySendError::Closed(_) => ChannelError::ChannelClosed,
        })
    }
}
