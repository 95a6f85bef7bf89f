//! Disastra CLI library
//!
//! Argument parsing, configuration and command handlers behind the
//! `disastra` binary.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod simulation;

pub use cli::{Cli, Commands, SubmitMessage};
pub use commands::CommandDispatcher;
pub use config::{AppConfig, SimulationConfig};
pub use error::{CliError, Result};
pub use simulation::{run_simulation, SimulationReport};
