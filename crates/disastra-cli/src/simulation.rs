//! Loopback mesh simulation
//!
//! Node 0 is this device: it runs on the durable outbox, so anything queued
//! with `disastra submit` is drained through the mesh. Node 1 plays a
//! responder and acknowledges every SOS it hears. The remaining nodes only
//! relay.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use disastra_core::{
    AckPayload, AppEvent, AppEventReceiver, ChannelError, Command, CommandSender, EmergencyType,
    EnvelopeKind, FileOutboxPersistence, MessageEnvelope, NodeId, NonBlockingSend, OutboxStore,
    SosPayload, Timestamp, TransportError, Ttl, UpdatePayload,
};
use disastra_runtime::{LoopbackMesh, RelayRuntime, RelayStats, RuntimeBuilder};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::{CliError, Result};

const RESPONDER: usize = 1;

#[derive(Debug, Clone)]
pub struct NodeReport {
    pub index: usize,
    pub node_id: NodeId,
    pub stats: RelayStats,
}

#[derive(Debug, Clone, Default)]
pub struct SimulationReport {
    pub nodes: Vec<NodeReport>,
}

struct SimNode {
    index: usize,
    node_id: NodeId,
    runtime: RelayRuntime,
    watcher: JoinHandle<()>,
}

/// Run the mesh for the configured duration and return per-node statistics
///
/// With `echo` set, every application event is printed as it happens.
pub async fn run_simulation(config: &AppConfig, data_dir: &Path, echo: bool) -> Result<SimulationReport> {
    config.validate()?;
    let sim = &config.simulation;
    let mesh = LoopbackMesh::new();

    let outbox = OutboxStore::open(
        FileOutboxPersistence::in_dir(data_dir),
        config.relay.delivery.clone(),
    )?;
    let has_pending = outbox.entries().iter().any(|entry| entry.state().is_pending());

    let mut nodes = Vec::with_capacity(sim.nodes);
    let mut local_outbox = Some(outbox);
    for index in 0..sim.nodes {
        let transport = Arc::new(mesh.transport());
        let node_id = transport.node_id();
        let mut builder = RuntimeBuilder::new()
            .with_config(config.relay.clone())
            .with_transport(transport.clone());
        if let Some(outbox) = local_outbox.take() {
            transport.fail_next(sim.not_ready_attempts, TransportError::NotReady);
            builder = builder.with_outbox(outbox);
        }

        let mut runtime = builder.build_and_start().await?;
        let events = runtime
            .take_app_event_receiver()
            .ok_or_else(|| CliError::Config("event receiver already taken".to_string()))?;
        let watcher = tokio::spawn(watch_node(
            index,
            events,
            runtime.command_sender(),
            index == RESPONDER,
            config.relay.default_ttl,
            echo,
        ));
        debug!(index, %node_id, "Simulation node started");
        nodes.push(SimNode {
            index,
            node_id,
            runtime,
            watcher,
        });
    }
    info!(nodes = nodes.len(), online = mesh.online(), "Loopback mesh running");

    if !has_pending {
        if let Some(local) = nodes.first() {
            seed_demo(&local.runtime, config.relay.default_ttl).await?;
        }
    }

    tokio::time::sleep(Duration::from_millis(sim.duration_ms)).await;

    let mut report = SimulationReport::default();
    for node in nodes {
        let stats = node.runtime.shutdown().await?;
        if let Err(e) = node.watcher.await {
            warn!(index = node.index, error = %e, "Event watcher failed");
        }
        report.nodes.push(NodeReport {
            index: node.index,
            node_id: node.node_id,
            stats,
        });
    }
    Ok(report)
}

/// Raise an SOS and a follow-up when the outbox has nothing to deliver
async fn seed_demo(runtime: &RelayRuntime, ttl: Ttl) -> Result<()> {
    let now = Timestamp::now();
    let sos = MessageEnvelope::sos(
        SosPayload::new(EmergencyType::Trapped)
            .with_battery(35)
            .with_note("simulated SOS"),
        now,
        ttl,
    );
    let update = MessageEnvelope::update(
        sos.id,
        UpdatePayload {
            people: "2".to_string(),
            medical_supplies: "first aid kit".to_string(),
            additional_info: "simulated update".to_string(),
        },
        now + Duration::from_millis(1),
        ttl,
    );
    info!(message_id = %sos.id, "Seeding simulated SOS");
    runtime.submit(sos).await?;
    runtime.submit(update).await?;
    Ok(())
}

async fn watch_node(
    index: usize,
    mut events: AppEventReceiver,
    commands: CommandSender,
    responder: bool,
    ttl: Ttl,
    echo: bool,
) {
    while let Some(event) = events.recv().await {
        if echo {
            println!("[node {index}] {}", describe(&event));
        }
        if !responder {
            continue;
        }
        let AppEvent::Inbound(message) = &event else {
            continue;
        };
        if message.envelope.kind() != EnvelopeKind::Sos {
            continue;
        }
        let ack = MessageEnvelope::ack(
            message.envelope.id,
            AckPayload {
                responder: format!("node {index}"),
                note: "help is on the way".to_string(),
            },
            Timestamp::now(),
            ttl,
        );
        // The relay may be publishing into a full buffer; never wait on it here
        match commands.try_send_non_blocking(Command::Submit { envelope: ack }) {
            Ok(()) => {}
            Err(ChannelError::ChannelFull) => {
                warn!(index, sos_id = %message.envelope.id, "Command buffer full, ack dropped")
            }
            Err(ChannelError::ChannelClosed) => break,
        }
    }
}

fn describe(event: &AppEvent) -> String {
    match event {
        AppEvent::Delivery(delivery) => match &delivery.reason {
            Some(reason) => format!(
                "{} {} (attempts {}): {}",
                delivery.id, delivery.state, delivery.attempts, reason
            ),
            None => format!("{} {} (attempts {})", delivery.id, delivery.state, delivery.attempts),
        },
        AppEvent::Inbound(message) => format!(
            "received {} {} after {} hops",
            message.envelope.kind(),
            message.envelope.id,
            message.relay_hops
        ),
        AppEvent::SubmissionRejected { id, reason } => format!("rejected {id}: {reason}"),
        AppEvent::TransportStatus { status } => format!("transport {status}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::outbox_rows;
    use disastra_core::RelayConfig;
    use tempfile::TempDir;

    fn sim_config(not_ready_attempts: usize) -> AppConfig {
        let mut config = AppConfig {
            relay: RelayConfig::testing(),
            ..AppConfig::default()
        };
        config.simulation.nodes = 3;
        config.simulation.duration_ms = 500;
        config.simulation.not_ready_attempts = not_ready_attempts;
        config
    }

    #[tokio::test]
    async fn test_demo_sos_is_acknowledged() {
        let dir = TempDir::new().unwrap();
        let config = sim_config(2);

        let report = run_simulation(&config, dir.path(), false).await.unwrap();
        assert_eq!(report.nodes.len(), 3);
        assert_eq!(report.nodes[0].stats.submitted, 2);
        assert_eq!(report.nodes[RESPONDER].stats.submitted, 1);
        assert!(report.nodes[2].stats.delivered >= 3);

        let rows = outbox_rows(dir.path(), &config).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].kind, "sos");
        assert_eq!(rows[0].state, "acknowledged");
        assert_eq!(rows[1].state, "sent");
    }

    #[tokio::test]
    async fn test_invalid_simulation_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = sim_config(0);
        config.simulation.nodes = 1;
        assert!(run_simulation(&config, dir.path(), false).await.is_err());
    }

    #[test]
    fn test_describe_inbound() {
        let envelope = MessageEnvelope::sos(
            SosPayload::new(EmergencyType::Medical),
            Timestamp::new(0),
            Ttl::DEFAULT,
        );
        let line = describe(&AppEvent::Inbound(disastra_core::InboundMessage {
            envelope,
            relay_hops: 2,
        }));
        assert!(line.starts_with("received sos"));
        assert!(line.ends_with("after 2 hops"));
    }
}
