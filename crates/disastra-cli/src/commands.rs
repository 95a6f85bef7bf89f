//! Command handlers for the Disastra CLI

use std::path::Path;

use disastra_core::{
    AckPayload, EmergencyType, EnvelopeCodec, FileOutboxPersistence, GeoPoint, MessageEnvelope,
    MessageId, OutboxStore, RelayError, SafePayload, SosPayload, Timestamp, Ttl, UpdatePayload,
};
use disastra_runtime::DEFAULT_MAX_PAYLOAD;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::cli::{Cli, Commands, SosArgs, SubmitMessage};
use crate::config::AppConfig;
use crate::error::Result;
use crate::simulation::run_simulation;

/// One line of `disastra outbox`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxRow {
    pub id: MessageId,
    pub kind: String,
    pub correlation_id: Option<MessageId>,
    pub state: String,
    pub attempts: u32,
    pub created_at: u64,
    pub last_error: Option<String>,
}

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    pub async fn execute(cli: Cli, config: AppConfig) -> Result<()> {
        let data_dir = config.data_dir()?;
        match cli.command {
            Commands::Submit { message } => {
                let envelope = build_envelope(&message, config.relay.default_ttl, Timestamp::now())?;
                let id = submit_to_outbox(&data_dir, &config, envelope)?;
                println!("Queued {} (ID: {})", message_label(&message), id);
                Ok(())
            }
            Commands::Outbox { json } => {
                let rows = outbox_rows(&data_dir, &config)?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                } else {
                    print_rows(&rows);
                }
                Ok(())
            }
            Commands::Simulate {
                nodes,
                duration_ms,
                not_ready,
            } => {
                let mut config = config;
                if let Some(nodes) = nodes {
                    config.simulation.nodes = nodes;
                }
                if let Some(duration_ms) = duration_ms {
                    config.simulation.duration_ms = duration_ms;
                }
                if let Some(not_ready) = not_ready {
                    config.simulation.not_ready_attempts = not_ready;
                }
                config.validate()?;

                let report = run_simulation(&config, &data_dir, true).await?;
                for node in &report.nodes {
                    println!(
                        "node {}: submitted {} delivered {} forwarded {} duplicates {} orphans {}",
                        node.index,
                        node.stats.submitted,
                        node.stats.delivered,
                        node.stats.forwarded,
                        node.stats.duplicates,
                        node.stats.orphans_held
                    );
                }
                print_rows(&outbox_rows(&data_dir, &config)?);
                Ok(())
            }
        }
    }
}

fn message_label(message: &SubmitMessage) -> &'static str {
    match message {
        SubmitMessage::Sos(_) => "SOS",
        SubmitMessage::Update { .. } => "update",
        SubmitMessage::Safe { .. } => "safe notice",
        SubmitMessage::Ack { .. } => "acknowledgement",
    }
}

pub fn parse_message_id(value: &str) -> Result<MessageId> {
    Ok(MessageId::from_uuid(Uuid::parse_str(value)?))
}

fn sos_payload(args: &SosArgs) -> SosPayload {
    let mut payload =
        SosPayload::new(EmergencyType::parse(&args.emergency_type)).with_note(args.note.clone());
    if let (Some(latitude), Some(longitude)) = (args.latitude, args.longitude) {
        payload = payload.with_location(GeoPoint::new(latitude, longitude, args.altitude));
    }
    if let Some(battery) = args.battery {
        payload = payload.with_battery(battery);
    }
    payload
}

/// Turn parsed arguments into an envelope
pub fn build_envelope(message: &SubmitMessage, ttl: Ttl, now: Timestamp) -> Result<MessageEnvelope> {
    let envelope = match message {
        SubmitMessage::Sos(args) => MessageEnvelope::sos(sos_payload(args), now, ttl),
        SubmitMessage::Update {
            sos,
            people,
            supplies,
            info,
        } => MessageEnvelope::update(
            parse_message_id(sos)?,
            UpdatePayload {
                people: people.clone(),
                medical_supplies: supplies.clone(),
                additional_info: info.clone(),
            },
            now,
            ttl,
        ),
        SubmitMessage::Safe { sos, note } => MessageEnvelope::safe_notice(
            parse_message_id(sos)?,
            SafePayload {
                marked_safe_at: now,
                note: note.clone(),
            },
            now,
            ttl,
        ),
        SubmitMessage::Ack {
            target,
            responder,
            note,
        } => MessageEnvelope::ack(
            parse_message_id(target)?,
            AckPayload {
                responder: responder.clone(),
                note: note.clone(),
            },
            now,
            ttl,
        ),
    };
    envelope.validate()?;
    Ok(envelope)
}

/// Store an envelope in the durable outbox under `data_dir`
pub fn submit_to_outbox(
    data_dir: &Path,
    config: &AppConfig,
    envelope: MessageEnvelope,
) -> Result<MessageId> {
    let size = EnvelopeCodec::encoded_len(&envelope)?;
    if size > DEFAULT_MAX_PAYLOAD {
        return Err(RelayError::PayloadTooLarge {
            size,
            max: DEFAULT_MAX_PAYLOAD,
        }
        .into());
    }

    let mut outbox = open_outbox(data_dir, config)?;
    let id = envelope.id;
    outbox.enqueue(envelope, Timestamp::now())?;
    info!(message_id = %id, dir = %data_dir.display(), "Message stored in outbox");
    Ok(id)
}

pub fn outbox_rows(data_dir: &Path, config: &AppConfig) -> Result<Vec<OutboxRow>> {
    let outbox = open_outbox(data_dir, config)?;
    Ok(outbox
        .entries()
        .into_iter()
        .map(|entry| OutboxRow {
            id: entry.id(),
            kind: entry.envelope.kind().to_string(),
            correlation_id: entry.envelope.correlation_id,
            state: entry.state().to_string(),
            attempts: entry.attempts(),
            created_at: entry.envelope.created_at.as_millis(),
            last_error: entry.delivery.last_error.clone(),
        })
        .collect())
}

fn open_outbox(data_dir: &Path, config: &AppConfig) -> Result<OutboxStore> {
    Ok(OutboxStore::open(
        FileOutboxPersistence::in_dir(data_dir),
        config.relay.delivery.clone(),
    )?)
}

fn print_rows(rows: &[OutboxRow]) {
    if rows.is_empty() {
        println!("Outbox is empty");
        return;
    }
    for row in rows {
        let error = row.last_error.as_deref().unwrap_or("-");
        println!(
            "{}  {:<6} {:<12} attempts={} error={}",
            row.id, row.kind, row.state, row.attempts, error
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CliError;
    use disastra_core::{EnvelopeKind, MessagePayload};
    use std::time::Duration;
    use tempfile::TempDir;

    fn sos_args() -> SosArgs {
        SosArgs {
            emergency_type: "fire".into(),
            latitude: Some(38.72),
            longitude: Some(-9.14),
            altitude: 12.0,
            battery: Some(150),
            note: "third floor".into(),
        }
    }

    #[test]
    fn test_build_sos_from_args() {
        let envelope =
            build_envelope(&SubmitMessage::Sos(sos_args()), Ttl::DEFAULT, Timestamp::new(1)).unwrap();
        assert_eq!(envelope.kind(), EnvelopeKind::Sos);
        assert!(envelope.correlation_id.is_none());
        match envelope.payload {
            MessagePayload::Sos(payload) => {
                assert_eq!(payload.emergency_type, EmergencyType::Fire);
                assert_eq!(payload.battery_percent, Some(100));
                assert_eq!(payload.location, Some(GeoPoint::new(38.72, -9.14, 12.0)));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_bad_correlation_id_rejected() {
        let message = SubmitMessage::Safe {
            sos: "not-a-uuid".into(),
            note: String::new(),
        };
        assert!(matches!(
            build_envelope(&message, Ttl::DEFAULT, Timestamp::new(1)),
            Err(CliError::InvalidMessageId(_))
        ));
    }

    #[test]
    fn test_submit_then_list() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::default();
        let now = Timestamp::now();

        let sos = build_envelope(&SubmitMessage::Sos(sos_args()), Ttl::DEFAULT, now).unwrap();
        let sos_id = submit_to_outbox(dir.path(), &config, sos).unwrap();
        let update = build_envelope(
            &SubmitMessage::Update {
                sos: sos_id.to_string(),
                people: "4".into(),
                supplies: String::new(),
                info: String::new(),
            },
            Ttl::DEFAULT,
            now + Duration::from_millis(1),
        )
        .unwrap();
        submit_to_outbox(dir.path(), &config, update).unwrap();

        let rows = outbox_rows(dir.path(), &config).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, sos_id);
        assert_eq!(rows[0].state, "queued");
        assert_eq!(rows[1].correlation_id, Some(sos_id));

        let json = serde_json::to_string(&rows).unwrap();
        assert!(json.contains(&sos_id.to_string()));
    }

    #[test]
    fn test_oversized_note_not_stored() {
        let dir = TempDir::new().unwrap();
        let mut args = sos_args();
        args.note = "x".repeat(DEFAULT_MAX_PAYLOAD);
        let envelope =
            build_envelope(&SubmitMessage::Sos(args), Ttl::DEFAULT, Timestamp::now()).unwrap();

        let result = submit_to_outbox(dir.path(), &AppConfig::default(), envelope);
        assert!(matches!(
            result,
            Err(CliError::Relay(RelayError::PayloadTooLarge { .. }))
        ));
        assert!(outbox_rows(dir.path(), &AppConfig::default()).unwrap().is_empty());
    }
}
