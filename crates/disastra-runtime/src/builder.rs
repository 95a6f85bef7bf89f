//! Runtime Builder API
//!
//! Provides a builder-style API for consumers (CLI, simulator, tests) to
//! pick a transport, an outbox backend and a clock, and get back a running
//! [`RelayRuntime`].

use std::path::PathBuf;
use std::sync::Arc;

use disastra_core::{
    FileOutboxPersistence, OutboxStore, RelayConfig, RelayError, RelayResult, SystemTimeSource,
    TimeSource, TransportAdapter,
};
use tracing::info;

use crate::runtime::RelayRuntime;

enum OutboxSource {
    Memory,
    Directory(PathBuf),
    Store(OutboxStore),
}

// ----------------------------------------------------------------------------
// Runtime Builder
// ----------------------------------------------------------------------------

pub struct RuntimeBuilder {
    config: RelayConfig,
    transport: Option<Arc<dyn TransportAdapter>>,
    outbox: OutboxSource,
    time_source: Arc<dyn TimeSource>,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config: RelayConfig::default(),
            transport: None,
            outbox: OutboxSource::Memory,
            time_source: Arc::new(SystemTimeSource),
        }
    }

    pub fn with_config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn TransportAdapter>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Keep the outbox in `dir`, surviving restarts
    pub fn with_data_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.outbox = OutboxSource::Directory(dir.into());
        self
    }

    /// Use an outbox opened by the caller
    pub fn with_outbox(mut self, outbox: OutboxStore) -> Self {
        self.outbox = OutboxSource::Store(outbox);
        self
    }

    pub fn with_time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.time_source = time_source;
        self
    }

    /// Build and start the runtime
    pub async fn build_and_start(self) -> RelayResult<RelayRuntime> {
        self.config.validate()?;
        let transport = self
            .transport
            .ok_or_else(|| RelayError::config_error("No transport configured"))?;

        let outbox = match self.outbox {
            OutboxSource::Memory => OutboxStore::in_memory(self.config.delivery.clone()),
            OutboxSource::Directory(dir) => {
                let persistence = FileOutboxPersistence::in_dir(&dir);
                info!(path = %persistence.path().display(), "Opening durable outbox");
                OutboxStore::open(persistence, self.config.delivery.clone())?
            }
            OutboxSource::Store(store) => store,
        };

        RelayRuntime::start(self.config, outbox, transport, self.time_source).await
    }
}

// ----------------------------------------------------------------------------
// Convenience Functions
// ----------------------------------------------------------------------------

/// Runtime with fast timers and an in-memory outbox
pub async fn create_testing_runtime(
    transport: Arc<dyn TransportAdapter>,
) -> RelayResult<RelayRuntime> {
    RuntimeBuilder::new()
        .with_config(RelayConfig::testing())
        .with_transport(transport)
        .build_and_start()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackMesh;

    #[tokio::test]
    async fn test_missing_transport_is_config_error() {
        let result = RuntimeBuilder::new().build_and_start().await;
        assert!(matches!(result, Err(RelayError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mesh = LoopbackMesh::new();
        let mut config = RelayConfig::testing();
        config.scan_interval_ms = 0;
        let result = RuntimeBuilder::new()
            .with_config(config)
            .with_transport(Arc::new(mesh.transport()))
            .build_and_start()
            .await;
        assert!(result.is_err());
        assert_eq!(mesh.online(), 0);
    }

    #[tokio::test]
    async fn test_build_start_and_shutdown() {
        let mesh = LoopbackMesh::new();
        let runtime = create_testing_runtime(Arc::new(mesh.transport()))
            .await
            .unwrap();
        assert!(runtime.is_running());
        assert_eq!(mesh.online(), 1);

        let stats = runtime.shutdown().await.unwrap();
        assert_eq!(stats.submitted, 0);
        assert_eq!(mesh.online(), 0);
    }
}
