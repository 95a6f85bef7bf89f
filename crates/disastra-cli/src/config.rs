//! Disastra CLI Configuration
//!
//! Configuration is read from a TOML file when `--config` is given and falls
//! back to defaults otherwise. Every section is optional in the file.

use std::path::{Path, PathBuf};

use disastra_core::RelayConfig;
use serde::{Deserialize, Serialize};

use crate::error::{CliError, Result};

/// Directory name used under the platform data directory
const APP_DIR_NAME: &str = "disastra";

// ----------------------------------------------------------------------------
// CLI Application Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Relay engine settings
    pub relay: RelayConfig,
    pub simulation: SimulationConfig,
    /// Outbox location; the platform data directory when unset
    pub data_dir: Option<PathBuf>,
}

/// Loopback mesh used by `disastra simulate`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub nodes: usize,
    /// Sends failed with `NotReady` on the local node before the radio cooperates
    pub not_ready_attempts: usize,
    pub duration_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            nodes: 3,
            not_ready_attempts: 0,
            duration_ms: 2000,
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Loading Logic
// ----------------------------------------------------------------------------

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: AppConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path.as_ref(), toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.relay.validate()?;
        if self.simulation.nodes < 2 {
            return Err(CliError::Config(
                "Simulation needs at least two nodes".to_string(),
            ));
        }
        if self.simulation.duration_ms == 0 {
            return Err(CliError::Config(
                "Simulation duration must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory holding the durable outbox
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Self::default_data_dir(),
        }
    }

    fn default_data_dir() -> Result<PathBuf> {
        dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .map(|dir| dir.join(APP_DIR_NAME))
            .ok_or_else(|| CliError::Config("No data directory available".to_string()))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
