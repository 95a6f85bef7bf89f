//! Disastra Runtime
//!
//! Wires the relay core to its channels and tasks and manages their
//! lifecycle.
//!
//! Startup order:
//! 1. the outbox is opened (by the caller or the builder) and its ids are
//!    registered as seen;
//! 2. the transport is attached to the transport event channel;
//! 3. the relay loop and the retry scan are spawned;
//! 4. the transport is started.
//!
//! Shutdown runs the other way: the transport is stopped, the shutdown
//! signal cancels the scan, then the relay loop returns in-flight sends to
//! the queue and exits. Once the signal is raised the loop no longer waits
//! on a full app event buffer, so an application that stopped reading
//! cannot hold shutdown up.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use disastra_core::{
    create_app_event_channel, create_command_channel, create_transport_event_channel, AppEvent,
    AppEventReceiver, Command, CommandSender, MessageEnvelope, NonBlockingSend, OutboxStore,
    RelayConfig, RelayError, RelayResult, TimeSource, TransportAdapter,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::logic::{run_retry_scan, RelayTask};
use crate::relay::{RelayCore, RelayStats};

// ----------------------------------------------------------------------------
// Relay Runtime
// ----------------------------------------------------------------------------

/// Handle to a running relay
pub struct RelayRuntime {
    command_sender: CommandSender,
    app_event_receiver: Option<AppEventReceiver>,
    transport: Arc<dyn TransportAdapter>,
    relay_handle: Option<JoinHandle<RelayResult<RelayStats>>>,
    scan_handle: Option<JoinHandle<()>>,
    shutdown_signal: watch::Sender<bool>,
}

impl RelayRuntime {
    /// Start a relay over an opened outbox
    pub async fn start(
        config: RelayConfig,
        outbox: OutboxStore,
        transport: Arc<dyn TransportAdapter>,
        time_source: Arc<dyn TimeSource>,
    ) -> RelayResult<Self> {
        config.validate()?;

        let core = RelayCore::new(outbox, transport.clone(), config.clone(), time_source.now());

        let (command_sender, command_receiver) = create_command_channel(&config.channels);
        let (app_event_sender, app_event_receiver) = create_app_event_channel(&config.channels);
        let (transport_sender, transport_receiver) = create_transport_event_channel();
        transport.attach(transport_sender);

        let (scan_sender, scan_receiver) = mpsc::channel(1);
        let scan_in_progress = Arc::new(AtomicBool::new(false));
        let (shutdown_signal, shutdown_receiver) = watch::channel(false);

        let task = RelayTask::new(
            core,
            command_receiver,
            transport_receiver,
            scan_receiver,
            scan_in_progress.clone(),
            app_event_sender,
            shutdown_receiver.clone(),
            time_source,
        );
        let relay_handle = tokio::spawn(task.run());
        let scan_handle = tokio::spawn(run_retry_scan(
            config.scan_interval(),
            scan_sender,
            scan_in_progress,
            shutdown_receiver,
        ));

        let mut runtime = Self {
            command_sender,
            app_event_receiver: Some(app_event_receiver),
            transport,
            relay_handle: Some(relay_handle),
            scan_handle: Some(scan_handle),
            shutdown_signal,
        };

        if let Err(e) = runtime.transport.start().await {
            warn!(error = %e, "Transport start failed, stopping relay");
            let _ = runtime.stop_tasks().await;
            return Err(e);
        }

        info!(
            transport = %runtime.transport.capabilities().transport_type,
            "Relay runtime started"
        );
        Ok(runtime)
    }

    /// Sender for application commands
    pub fn command_sender(&self) -> CommandSender {
        self.command_sender.clone()
    }

    /// Take the application event receiver; only the first call gets it
    pub fn take_app_event_receiver(&mut self) -> Option<AppEventReceiver> {
        self.app_event_receiver.take()
    }

    /// Wait for the next application event
    ///
    /// Returns `None` once the receiver was taken or the relay has stopped.
    pub async fn next_app_event(&mut self) -> Option<AppEvent> {
        match self.app_event_receiver.as_mut() {
            Some(receiver) => receiver.recv().await,
            None => None,
        }
    }

    pub async fn submit(&self, envelope: MessageEnvelope) -> RelayResult<()> {
        self.send_command(Command::Submit { envelope }).await
    }

    /// Submit without waiting for room in the command buffer
    pub fn try_submit(&self, envelope: MessageEnvelope) -> RelayResult<()> {
        self.command_sender
            .try_send_non_blocking(Command::Submit { envelope })
            .map_err(|e| RelayError::channel_error(e.to_string()))
    }

    pub async fn maintain(&self) -> RelayResult<()> {
        self.send_command(Command::Maintain).await
    }

    async fn send_command(&self, command: Command) -> RelayResult<()> {
        self.command_sender
            .send(command)
            .await
            .map_err(|_| RelayError::channel_error("relay task is not running"))
    }

    pub fn is_running(&self) -> bool {
        self.relay_handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Stop the transport, then the retry scan and the relay loop
    pub async fn shutdown(mut self) -> RelayResult<RelayStats> {
        info!("Shutting down relay runtime");
        if let Err(e) = self.transport.stop().await {
            warn!(error = %e, "Transport stop failed");
        }

        let stats = self.stop_tasks().await?;
        info!("Relay runtime stopped");
        Ok(stats)
    }

    async fn stop_tasks(&mut self) -> RelayResult<RelayStats> {
        let _ = self.shutdown_signal.send(true);
        if let Some(handle) = self.scan_handle.take() {
            let _ = handle.await;
        }

        // A closed channel means the loop already exited on its own
        let _ = self.command_sender.send(Command::Shutdown).await;
        match self.relay_handle.take() {
            Some(handle) => handle
                .await
                .map_err(|e| RelayError::channel_error(format!("relay task failed: {e}")))?,
            None => Ok(RelayStats::default()),
        }
    }
}

impl Drop for RelayRuntime {
    fn drop(&mut self) {
        let _ = self.shutdown_signal.send(true);
    }
}
