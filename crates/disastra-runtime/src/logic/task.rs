//! Relay Task Implementation
//!
//! The single event loop that owns the [`RelayCore`]. Commands from the
//! application, events from the transport and ticks from the retry scan are
//! all funnelled into this task and handled one at a time.

use core::time::Duration;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use disastra_core::{
    AppEvent, AppEventSender, ChannelError, Command, CommandReceiver, NonBlockingSend,
    RelayResult, TimeSource, Timestamp, TransportEventReceiver,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::relay::{RelayCore, RelayStats};

/// How often housekeeping runs, measured on the relay clock
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

/// Tick sent by the retry scan
#[derive(Debug, Clone, Copy)]
pub struct ScanTick;

// ----------------------------------------------------------------------------
// Relay Task
// ----------------------------------------------------------------------------

pub struct RelayTask {
    core: RelayCore,
    command_receiver: CommandReceiver,
    transport_events: TransportEventReceiver,
    scan_ticks: mpsc::Receiver<ScanTick>,
    /// Set by the scan task when a tick is queued, cleared once handled
    scan_in_progress: Arc<AtomicBool>,
    app_event_sender: AppEventSender,
    /// Once raised, publishing no longer waits for buffer space
    shutdown: watch::Receiver<bool>,
    shutting_down: bool,
    time_source: Arc<dyn TimeSource>,
    last_maintenance: Timestamp,
    app_receiver_gone: bool,
}

impl RelayTask {
    pub fn new(
        core: RelayCore,
        command_receiver: CommandReceiver,
        transport_events: TransportEventReceiver,
        scan_ticks: mpsc::Receiver<ScanTick>,
        scan_in_progress: Arc<AtomicBool>,
        app_event_sender: AppEventSender,
        shutdown: watch::Receiver<bool>,
        time_source: Arc<dyn TimeSource>,
    ) -> Self {
        let last_maintenance = time_source.now();
        Self {
            core,
            command_receiver,
            transport_events,
            scan_ticks,
            scan_in_progress,
            app_event_sender,
            shutdown,
            shutting_down: false,
            time_source,
            last_maintenance,
            app_receiver_gone: false,
        }
    }

    /// Run until `Shutdown` arrives or every command sender is dropped
    ///
    /// On the way out, in-flight sends are returned to the queue and the
    /// final relay statistics are returned.
    pub async fn run(mut self) -> RelayResult<RelayStats> {
        info!("Relay task starting");

        loop {
            tokio::select! {
                command = self.command_receiver.recv() => {
                    match command {
                        Some(Command::Shutdown) => {
                            info!("Shutdown requested");
                            break;
                        }
                        Some(cmd) => self.process_command(cmd).await,
                        None => {
                            info!("Command channel closed, shutting down");
                            break;
                        }
                    }
                }

                Some(event) = self.transport_events.recv() => {
                    let now = self.time_source.now();
                    let events = self.core.handle_transport_event(event, now);
                    self.publish(events).await;
                }

                Some(ScanTick) = self.scan_ticks.recv() => {
                    self.process_scan().await;
                    self.scan_in_progress.store(false, Ordering::SeqCst);
                }
            }
        }

        let events = self.core.suspend();
        self.publish(events).await;

        let stats = self.core.stats();
        info!(
            submitted = stats.submitted,
            delivered = stats.delivered,
            forwarded = stats.forwarded,
            duplicates = stats.duplicates,
            "Relay task stopped"
        );
        Ok(stats)
    }

    async fn process_command(&mut self, command: Command) {
        debug!(%command, "Processing command");
        let now = self.time_source.now();
        let events = match command {
            Command::Submit { envelope } => self.core.submit(envelope, now),
            Command::Maintain => {
                self.last_maintenance = now;
                self.core.maintain(now)
            }
            Command::Shutdown => Vec::new(),
        };
        self.publish(events).await;
    }

    async fn process_scan(&mut self) {
        let now = self.time_source.now();
        trace!(%now, "Retry scan");
        let mut events = self.core.dispatch_due(now);

        if now.duration_since(self.last_maintenance) >= MAINTENANCE_INTERVAL {
            self.last_maintenance = now;
            events.extend(self.core.maintain(now));
        }
        self.publish(events).await;
    }

    /// Hand events to the application, waiting for buffer space
    ///
    /// After the shutdown signal is raised, events that do not fit are
    /// dropped instead.
    async fn publish(&mut self, events: Vec<AppEvent>) {
        for event in events {
            if self.app_receiver_gone {
                return;
            }
            if !self.shutting_down && *self.shutdown.borrow() {
                self.shutting_down = true;
            }

            if !self.shutting_down {
                tokio::select! {
                    permit = self.app_event_sender.reserve() => {
                        let delivered = match permit {
                            Ok(permit) => {
                                permit.send(event);
                                true
                            }
                            Err(_) => false,
                        };
                        if !delivered {
                            // Inlined `receiver_dropped`: the pending select
                            // output still borrows `app_event_sender`.
                            warn!("App event receiver dropped, events will no longer be published");
                            self.app_receiver_gone = true;
                        }
                        continue;
                    }
                    _ = self.shutdown.changed() => {
                        debug!("Shutdown signalled while app event buffer was full");
                        self.shutting_down = true;
                    }
                }
            }

            match self.app_event_sender.try_send_non_blocking(event) {
                Ok(()) => {}
                Err(ChannelError::ChannelFull) => {
                    debug!("App event buffer full during shutdown, event dropped")
                }
                Err(ChannelError::ChannelClosed) => self.receiver_dropped(),
            }
        }
    }

    fn receiver_dropped(&mut self) {
        warn!("App event receiver dropped, events will no longer be published");
        self.app_receiver_gone = true;
    }
}

// ----------------------------------------------------------------------------
// Retry Scan
// ----------------------------------------------------------------------------

/// Tick the relay every `interval` until shutdown is signalled
///
/// A tick is skipped while the previous one is still being handled, so a
/// slow loop never accumulates a backlog of scans.
pub async fn run_retry_scan(
    interval: Duration,
    ticks: mpsc::Sender<ScanTick>,
    in_progress: Arc<AtomicBool>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = timer.tick() => {
                if in_progress.swap(true, Ordering::SeqCst) {
                    trace!("Previous scan still running, skipping tick");
                    continue;
                }
                if ticks.send(ScanTick).await.is_err() {
                    debug!("Relay task gone, retry scan exiting");
                    break;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("Retry scan cancelled");
                    break;
                }
            }
        }
    }
}
