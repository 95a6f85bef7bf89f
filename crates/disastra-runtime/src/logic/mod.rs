//! Relay Logic Module
//!
//! The event-loop task that owns the relay core, and the retry scan that
//! drives it.

pub mod task;

pub use task::{run_retry_scan, RelayTask, ScanTick, MAINTENANCE_INTERVAL};
