//! Relay core
//!
//! [`RelayCore`] is the single owner of every piece of mutable relay state:
//! the outbox, the seen cache, the orphan buffer and the table of in-flight
//! send tickets. Each operation takes the current time and returns the
//! application events it produced, so the core can be driven directly in
//! tests without an async runtime. In production it is owned by exactly one
//! event-loop task, which makes every seen-cache observation atomic.

use std::sync::Arc;

use disastra_core::{
    AppEvent, DecodeError, DeliveryEvent, EnvelopeCodec, EnvelopeKind, InboundMessage,
    MessageEnvelope, MessageId, NodeId, Observation, OrphanBuffer, OutboxStore, RelayConfig,
    RelayError, SeenCache, SendOutcome, SendTicket, Timestamp, TransportAdapter, TransportError,
    TransportEvent, TransportStatus,
};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

/// Bytes of a rejected frame included in logs
const LOGGED_FRAME_PREFIX: usize = 16;

// ----------------------------------------------------------------------------
// Supporting Types
// ----------------------------------------------------------------------------

/// What an outstanding send ticket refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingSend {
    /// Attempt for a locally originated outbox entry
    Outbox(MessageId),
    /// Best-effort re-broadcast of a peer's message
    Relay(MessageId),
}

/// Counters describing relay activity since start
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStats {
    pub submitted: u64,
    pub rejected: u64,
    pub received: u64,
    pub delivered: u64,
    pub duplicates: u64,
    pub forwarded: u64,
    pub malformed: u64,
    pub unknown_kind: u64,
    pub orphans_held: u64,
}

// ----------------------------------------------------------------------------
// Relay Core
// ----------------------------------------------------------------------------

pub struct RelayCore {
    outbox: OutboxStore,
    seen: SeenCache,
    orphans: OrphanBuffer,
    transport: Arc<dyn TransportAdapter>,
    config: RelayConfig,
    tickets: HashMap<SendTicket, PendingSend>,
    transport_active: bool,
    stats: RelayStats,
}

impl RelayCore {
    /// Build the core around an already opened outbox
    ///
    /// Every outbox id is registered as seen so this node never re-delivers
    /// or re-broadcasts its own messages when peers echo them back.
    pub fn new(
        outbox: OutboxStore,
        transport: Arc<dyn TransportAdapter>,
        config: RelayConfig,
        now: Timestamp,
    ) -> Self {
        let mut seen = SeenCache::new();
        for entry in outbox.entries() {
            seen.record(entry.id(), now);
        }
        debug!(seen = seen.len(), outbox = outbox.len(), "Relay core initialized");

        Self {
            outbox,
            seen,
            orphans: OrphanBuffer::new(),
            transport,
            config,
            tickets: HashMap::new(),
            transport_active: false,
            stats: RelayStats::default(),
        }
    }

    pub fn outbox(&self) -> &OutboxStore {
        &self.outbox
    }

    pub fn seen(&self) -> &SeenCache {
        &self.seen
    }

    pub fn orphans(&self) -> &OrphanBuffer {
        &self.orphans
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    pub fn is_transport_active(&self) -> bool {
        self.transport_active
    }

    // ------------------------------------------------------------------------
    // Local submission
    // ------------------------------------------------------------------------

    /// Originate a message from this node
    pub fn submit(&mut self, envelope: MessageEnvelope, now: Timestamp) -> Vec<AppEvent> {
        let id = envelope.id;
        if let Err(e) = self.check_submission(&envelope) {
            self.stats.rejected += 1;
            warn!(message_id = %id, error = %e, "Submission rejected");
            return vec![AppEvent::SubmissionRejected {
                id,
                reason: e.to_string(),
            }];
        }

        self.seen.observe(id, now);
        let (_, delivery_events) = match self.outbox.enqueue(envelope.clone(), now) {
            Ok(result) => result,
            Err(e) => {
                self.stats.rejected += 1;
                warn!(message_id = %id, error = %e, "Outbox refused submission");
                return vec![AppEvent::SubmissionRejected {
                    id,
                    reason: e.to_string(),
                }];
            }
        };

        let mut events = Vec::new();
        if !delivery_events.is_empty() {
            self.stats.submitted += 1;
            info!(message_id = %id, kind = %envelope.kind(), "Message submitted");
        }
        events.extend(delivery_events.into_iter().map(AppEvent::Delivery));

        if envelope.kind() == EnvelopeKind::Sos {
            self.release_orphans(&id, &mut events);
        }

        events.extend(self.dispatch_due(now));
        events
    }

    /// Construction-time checks: valid shape and a frame the transport can carry
    fn check_submission(&self, envelope: &MessageEnvelope) -> Result<(), RelayError> {
        let size = EnvelopeCodec::encode(envelope)?.len();
        let max = self.transport.capabilities().max_payload_size;
        if size > max {
            return Err(RelayError::PayloadTooLarge { size, max });
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Outbound delivery
    // ------------------------------------------------------------------------

    /// Expire what is due, then attempt every due entry, oldest first
    ///
    /// Attempts are held back while the transport session is down so that
    /// waiting for the mesh does not spend the attempt budget.
    pub fn dispatch_due(&mut self, now: Timestamp) -> Vec<AppEvent> {
        let mut events = Vec::new();
        match self.outbox.expire_due(now) {
            Ok(expired) => events.extend(expired.into_iter().map(AppEvent::Delivery)),
            Err(e) => warn!(error = %e, "Failed to expire outbox entries"),
        }

        if !self.transport_active {
            return events;
        }

        for entry in self.outbox.next_due(now) {
            self.attempt(&entry.envelope, now, &mut events);
        }
        events
    }

    fn attempt(&mut self, envelope: &MessageEnvelope, now: Timestamp, events: &mut Vec<AppEvent>) {
        let id = envelope.id;
        match self.outbox.begin_send(&id, now) {
            Ok(event) => events.push(AppEvent::Delivery(event)),
            Err(e) => {
                warn!(message_id = %id, error = %e, "Could not begin send");
                return;
            }
        }

        let sent = match EnvelopeCodec::encode(envelope) {
            Ok(bytes) => self.transport.send(&bytes),
            Err(e) => Err(TransportError::Unknown {
                reason: format!("encoding failed: {e}"),
            }),
        };

        match sent {
            Ok(ticket) => {
                trace!(message_id = %id, %ticket, "Frame handed to transport");
                self.tickets.insert(ticket, PendingSend::Outbox(id));
            }
            Err(error) => self.record_failure(&id, &error, now, events),
        }
    }

    fn record_failure(
        &mut self,
        id: &MessageId,
        error: &TransportError,
        now: Timestamp,
        events: &mut Vec<AppEvent>,
    ) {
        match self.outbox.mark_failed(id, error, now) {
            Ok(delivery) => events.extend(delivery.into_iter().map(AppEvent::Delivery)),
            Err(e) => debug!(message_id = %id, error = %e, "Failure not recorded"),
        }
    }

    /// Apply the asynchronous outcome of an accepted send
    pub fn on_send_result(
        &mut self,
        ticket: SendTicket,
        outcome: SendOutcome,
        now: Timestamp,
    ) -> Vec<AppEvent> {
        let mut events = Vec::new();
        match self.tickets.remove(&ticket) {
            None => debug!(%ticket, "Send result for unknown ticket"),
            Some(PendingSend::Relay(id)) => match outcome {
                SendOutcome::Delivered => trace!(message_id = %id, %ticket, "Relay hop sent"),
                SendOutcome::Failed(error) => {
                    debug!(message_id = %id, %ticket, %error, "Relay hop failed")
                }
            },
            Some(PendingSend::Outbox(id)) => match outcome {
                SendOutcome::Delivered => match self.outbox.mark_sent(&id, now) {
                    Ok(event) => {
                        info!(message_id = %id, attempts = event.attempts, "Message sent");
                        events.push(AppEvent::Delivery(event));
                    }
                    // Acknowledged or pruned while the send was in flight
                    Err(e) => debug!(message_id = %id, error = %e, "Send confirmation ignored"),
                },
                SendOutcome::Failed(error) => self.record_failure(&id, &error, now, &mut events),
            },
        }
        events
    }

    // ------------------------------------------------------------------------
    // Inbound relay
    // ------------------------------------------------------------------------

    /// Handle a frame received from the mesh
    pub fn on_receive(&mut self, bytes: &[u8], now: Timestamp) -> Vec<AppEvent> {
        self.stats.received += 1;

        let envelope = match EnvelopeCodec::decode(bytes) {
            Ok(envelope) => envelope,
            Err(DecodeError::UnknownKind { tag }) => {
                self.stats.unknown_kind += 1;
                debug!(tag, size = bytes.len(), "Dropped frame of unknown kind");
                return Vec::new();
            }
            Err(e) => {
                self.stats.malformed += 1;
                let prefix = &bytes[..bytes.len().min(LOGGED_FRAME_PREFIX)];
                debug!(
                    error = %e,
                    size = bytes.len(),
                    prefix = %hex::encode(prefix),
                    "Dropped malformed frame"
                );
                return Vec::new();
            }
        };

        let id = envelope.id;
        if let Observation::AlreadySeen { relay_count } = self.seen.observe(id, now) {
            self.stats.duplicates += 1;
            trace!(message_id = %id, relay_count, "Duplicate dropped");
            return Vec::new();
        }

        self.forward(&envelope, now);

        let mut events = Vec::new();
        match envelope.kind() {
            EnvelopeKind::Ack => {
                if let Some(target) = envelope.correlation_id {
                    self.apply_ack(&target, now, &mut events);
                }
                self.deliver(envelope, &mut events);
            }
            EnvelopeKind::Update | EnvelopeKind::SafeNotice => {
                let parent_known = envelope
                    .correlation_id
                    .map(|corr| self.seen.contains(&corr))
                    .unwrap_or(false);
                if parent_known {
                    self.deliver(envelope, &mut events);
                } else if self.orphans.hold(envelope, now) {
                    self.stats.orphans_held += 1;
                }
            }
            EnvelopeKind::Sos => {
                self.deliver(envelope, &mut events);
                self.release_orphans(&id, &mut events);
            }
        }
        events
    }

    /// Re-broadcast with one hop fewer, while TTL allows
    fn forward(&mut self, envelope: &MessageEnvelope, now: Timestamp) {
        if envelope.is_expired(now) {
            trace!(message_id = %envelope.id, "Lifetime elapsed, not forwarding");
            return;
        }
        let Some(next) = envelope.next_hop() else {
            trace!(message_id = %envelope.id, "No hops left, not forwarding");
            return;
        };

        let result = EnvelopeCodec::encode(&next)
            .map_err(|e| TransportError::Unknown {
                reason: e.to_string(),
            })
            .and_then(|bytes| self.transport.send(&bytes));
        match result {
            Ok(ticket) => {
                self.stats.forwarded += 1;
                self.tickets.insert(ticket, PendingSend::Relay(envelope.id));
                trace!(message_id = %envelope.id, hops = next.ttl.hops, "Forwarded");
            }
            Err(error) => debug!(message_id = %envelope.id, %error, "Forward not sent"),
        }
    }

    fn apply_ack(&mut self, target: &MessageId, now: Timestamp, events: &mut Vec<AppEvent>) {
        if !self.outbox.contains(target) {
            return;
        }
        match self.outbox.acknowledge(target, now) {
            Ok(Some(event)) => {
                info!(message_id = %target, "Message acknowledged");
                events.push(AppEvent::Delivery(event));
            }
            Ok(None) => {}
            Err(e) => debug!(message_id = %target, error = %e, "Acknowledgement ignored"),
        }
    }

    fn deliver(&mut self, envelope: MessageEnvelope, events: &mut Vec<AppEvent>) {
        self.stats.delivered += 1;
        let relay_hops = self.config.default_ttl.hops.saturating_sub(envelope.ttl.hops);
        debug!(message_id = %envelope.id, kind = %envelope.kind(), relay_hops, "Delivered");
        events.push(AppEvent::Inbound(InboundMessage {
            envelope,
            relay_hops,
        }));
    }

    fn release_orphans(&mut self, sos_id: &MessageId, events: &mut Vec<AppEvent>) {
        for orphan in self.orphans.release(sos_id) {
            self.deliver(orphan, events);
        }
    }

    // ------------------------------------------------------------------------
    // Housekeeping and lifecycle
    // ------------------------------------------------------------------------

    /// Purge seen records, flush stale orphans and prune the outbox
    ///
    /// Orphans whose SOS never arrived are delivered on their own rather than
    /// dropped.
    pub fn maintain(&mut self, now: Timestamp) -> Vec<AppEvent> {
        let mut events = Vec::new();

        let purged = self
            .seen
            .purge_older_than(now.saturating_sub(self.config.dedup.retention()));

        let stale = self
            .orphans
            .purge_older_than(now.saturating_sub(self.config.orphans.retention()));
        for orphan in stale {
            warn!(
                message_id = %orphan.id,
                sos_id = ?orphan.correlation_id,
                "SOS never arrived, delivering follow-up on its own"
            );
            self.deliver(orphan, &mut events);
        }

        if let Err(e) = self.outbox.prune(now) {
            warn!(error = %e, "Failed to prune outbox");
        }
        // Own messages stay admitted for as long as the outbox holds them
        let own: Vec<MessageId> = self.outbox.entries().iter().map(|e| e.id()).collect();
        for id in own {
            self.seen.record(id, now);
        }

        let dedup = self.seen.stats();
        debug!(
            seen = self.seen.len(),
            purged,
            duplicate_ratio = dedup.duplicate_ratio(),
            outbox = self.outbox.len(),
            "Maintenance complete"
        );
        events
    }

    /// Return in-flight sends to the queue before shutdown
    pub fn suspend(&mut self) -> Vec<AppEvent> {
        self.requeue_in_flight()
    }

    /// Forget outstanding outbox tickets and queue their entries again
    ///
    /// Results for those tickets will never arrive once the session is gone.
    /// The attempt already counted stays counted.
    fn requeue_in_flight(&mut self) -> Vec<AppEvent> {
        self.tickets
            .retain(|_, pending| matches!(pending, PendingSend::Relay(_)));
        match self.outbox.suspend_in_flight() {
            Ok(suspended) => {
                if !suspended.is_empty() {
                    debug!(count = suspended.len(), "Returned in-flight sends to the queue");
                }
                suspended.into_iter().map(AppEvent::Delivery).collect()
            }
            Err(e) => {
                warn!(error = %e, "Failed to suspend in-flight sends");
                Vec::new()
            }
        }
    }

    pub fn on_transport_started(&mut self, node_id: NodeId, now: Timestamp) -> Vec<AppEvent> {
        info!(%node_id, "Transport session started");
        self.transport_active = true;
        let mut events = vec![AppEvent::TransportStatus {
            status: TransportStatus::Active { node_id },
        }];
        events.extend(self.dispatch_due(now));
        events
    }

    pub fn on_transport_stopped(&mut self) -> Vec<AppEvent> {
        info!("Transport session stopped");
        self.transport_active = false;
        let mut events = vec![AppEvent::TransportStatus {
            status: TransportStatus::Stopped,
        }];
        events.extend(self.requeue_in_flight());
        events
    }

    pub fn on_transport_failed_to_start(&mut self, reason: String) -> Vec<AppEvent> {
        warn!(%reason, "Transport failed to start");
        self.transport_active = false;
        let mut events = vec![AppEvent::TransportStatus {
            status: TransportStatus::Failed { reason },
        }];
        events.extend(self.requeue_in_flight());
        events
    }

    /// Route one transport event to its handler
    pub fn handle_transport_event(&mut self, event: TransportEvent, now: Timestamp) -> Vec<AppEvent> {
        match event {
            TransportEvent::Started { node_id } => self.on_transport_started(node_id, now),
            TransportEvent::Stopped => self.on_transport_stopped(),
            TransportEvent::FailedToStart { reason } => self.on_transport_failed_to_start(reason),
            TransportEvent::SendResult { ticket, outcome } => {
                self.on_send_result(ticket, outcome, now)
            }
            TransportEvent::Received { bytes } => self.on_receive(&bytes, now),
        }
    }
}

/// Delivery events contained in a batch of application events
pub fn delivery_events(events: &[AppEvent]) -> impl Iterator<Item = &DeliveryEvent> {
    events.iter().filter_map(|event| match event {
        AppEvent::Delivery(delivery) => Some(delivery),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackMesh, LoopbackTransport};
    use core::time::Duration;
    use disastra_core::{
        create_transport_event_channel, AckPayload, DeliveryConfig, DeliveryState,
        EmergencyType, MemoryOutboxPersistence, OutboxEntry, OutboxPersistence, SafePayload,
        SosPayload, TransportEventReceiver, Ttl, UpdatePayload,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        core: RelayCore,
        transport: Arc<LoopbackTransport>,
        events: TransportEventReceiver,
    }

    async fn fixture() -> Fixture {
        let mesh = LoopbackMesh::new();
        let transport = Arc::new(mesh.transport());
        let (tx, events) = create_transport_event_channel();
        transport.attach(tx);
        let config = RelayConfig::testing();
        let outbox = OutboxStore::in_memory(config.delivery.clone());
        let core = RelayCore::new(outbox, transport.clone(), config, Timestamp::new(0));
        Fixture {
            core,
            transport,
            events,
        }
    }

    async fn started_fixture() -> Fixture {
        let mut fx = fixture().await;
        fx.transport.start().await.unwrap();
        let started = fx.events.recv().await.unwrap();
        fx.core.handle_transport_event(started, Timestamp::new(0));
        fx
    }

    fn sos(now: u64) -> MessageEnvelope {
        MessageEnvelope::sos(
            SosPayload::new(EmergencyType::Trapped),
            Timestamp::new(now),
            Ttl::new(3, Duration::from_secs(60)),
        )
    }

    fn states(events: &[AppEvent]) -> Vec<DeliveryState> {
        delivery_events(events).map(|e| e.state).collect()
    }

    fn inbound_ids(events: &[AppEvent]) -> Vec<MessageId> {
        events
            .iter()
            .filter_map(|event| match event {
                AppEvent::Inbound(msg) => Some(msg.envelope.id),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_submit_before_start_waits_for_transport() {
        let mut fx = fixture().await;
        let env = sos(0);

        let events = fx.core.submit(env.clone(), Timestamp::new(0));
        assert_eq!(states(&events), vec![DeliveryState::Created, DeliveryState::Queued]);
        assert_eq!(fx.core.outbox().get(&env.id).unwrap().attempts(), 0);

        fx.transport.start().await.unwrap();
        let started = fx.events.recv().await.unwrap();
        let events = fx.core.handle_transport_event(started, Timestamp::new(1));
        assert!(matches!(
            events[0],
            AppEvent::TransportStatus {
                status: TransportStatus::Active { .. }
            }
        ));
        assert_eq!(states(&events), vec![DeliveryState::Sending]);
    }

    #[tokio::test]
    async fn test_submit_then_send_result() {
        let mut fx = started_fixture().await;
        let env = sos(0);

        let events = fx.core.submit(env.clone(), Timestamp::new(0));
        assert_eq!(
            states(&events),
            vec![
                DeliveryState::Created,
                DeliveryState::Queued,
                DeliveryState::Sending
            ]
        );

        let result = fx.events.recv().await.unwrap();
        let events = fx.core.handle_transport_event(result, Timestamp::new(1));
        assert_eq!(states(&events), vec![DeliveryState::Sent]);

        // Duplicate submission creates nothing
        let events = fx.core.submit(env, Timestamp::new(2));
        assert!(events.is_empty());
        assert_eq!(fx.core.outbox().len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_submission_rejected() {
        let mut fx = started_fixture().await;
        let max = fx.transport.capabilities().max_payload_size;
        let env = MessageEnvelope::sos(
            SosPayload::new(EmergencyType::Fire).with_note("x".repeat(max)),
            Timestamp::new(0),
            Ttl::DEFAULT,
        );

        let events = fx.core.submit(env.clone(), Timestamp::new(0));
        assert!(matches!(
            &events[..],
            [AppEvent::SubmissionRejected { id, .. }] if *id == env.id
        ));
        assert!(fx.core.outbox().is_empty());
        assert_eq!(fx.core.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_sync_not_ready_counts_as_attempt() {
        let mut fx = started_fixture().await;
        fx.transport.fail_next(1, TransportError::NotReady);
        let env = sos(0);

        let events = fx.core.submit(env.clone(), Timestamp::new(0));
        assert_eq!(
            states(&events),
            vec![
                DeliveryState::Created,
                DeliveryState::Queued,
                DeliveryState::Sending,
                DeliveryState::Failed
            ]
        );

        // Backoff of the testing preset is 10ms for the first retry
        assert!(states(&fx.core.dispatch_due(Timestamp::new(9))).is_empty());
        assert_eq!(
            states(&fx.core.dispatch_due(Timestamp::new(10))),
            vec![DeliveryState::Sending]
        );
        assert_eq!(fx.core.outbox().get(&env.id).unwrap().attempts(), 2);
    }

    #[tokio::test]
    async fn test_receive_delivers_once_and_forwards() {
        let mut fx = started_fixture().await;
        let env = sos(0);
        let bytes = EnvelopeCodec::encode(&env).unwrap();

        let events = fx.core.on_receive(&bytes, Timestamp::new(1));
        assert_eq!(inbound_ids(&events), vec![env.id]);
        assert!(fx.core.on_receive(&bytes, Timestamp::new(2)).is_empty());
        assert_eq!(fx.core.seen().get(&env.id).unwrap().relay_count, 1);

        let forwarded = fx.transport.sent_frames();
        assert_eq!(forwarded.len(), 1);
        let hop = EnvelopeCodec::decode(&forwarded[0]).unwrap();
        assert_eq!(hop.id, env.id);
        assert_eq!(hop.ttl.hops, env.ttl.hops - 1);
    }

    #[tokio::test]
    async fn test_no_forward_without_hops_or_lifetime() {
        let mut fx = started_fixture().await;
        let mut last_hop = sos(0);
        last_hop.ttl.hops = 0;
        fx.core
            .on_receive(&EnvelopeCodec::encode(&last_hop).unwrap(), Timestamp::new(1));

        let stale = sos(0);
        let events = fx
            .core
            .on_receive(&EnvelopeCodec::encode(&stale).unwrap(), Timestamp::new(120_000));
        assert_eq!(inbound_ids(&events), vec![stale.id]);

        assert!(fx.transport.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_dropped() {
        let mut fx = started_fixture().await;
        assert!(fx.core.on_receive(b"garbage", Timestamp::new(0)).is_empty());

        let mut bytes = EnvelopeCodec::encode(&sos(0)).unwrap();
        bytes[3] = 99;
        let len = bytes.len();
        let crc = crc32fast::hash(&bytes[..len - 4]);
        bytes[len - 4..].copy_from_slice(&crc.to_be_bytes());
        assert!(fx.core.on_receive(&bytes, Timestamp::new(0)).is_empty());

        let stats = fx.core.stats();
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.unknown_kind, 1);
    }

    #[tokio::test]
    async fn test_orphan_held_until_sos() {
        let mut fx = started_fixture().await;
        let parent = sos(100);
        let update = MessageEnvelope::update(
            parent.id,
            UpdatePayload {
                people: "3 adults".into(),
                ..UpdatePayload::default()
            },
            Timestamp::new(200),
            Ttl::DEFAULT,
        );

        let events = fx
            .core
            .on_receive(&EnvelopeCodec::encode(&update).unwrap(), Timestamp::new(1));
        assert!(events.is_empty());
        assert_eq!(fx.core.orphans().len(), 1);

        let events = fx
            .core
            .on_receive(&EnvelopeCodec::encode(&parent).unwrap(), Timestamp::new(2));
        assert_eq!(inbound_ids(&events), vec![parent.id, update.id]);
        assert!(fx.core.orphans().is_empty());
    }

    #[tokio::test]
    async fn test_stale_orphan_delivered_on_maintain() {
        let mut fx = started_fixture().await;
        let safe = MessageEnvelope::safe_notice(
            MessageId::new(),
            SafePayload {
                marked_safe_at: Timestamp::new(0),
                note: String::new(),
            },
            Timestamp::new(0),
            Ttl::DEFAULT,
        );
        fx.core
            .on_receive(&EnvelopeCodec::encode(&safe).unwrap(), Timestamp::new(0));

        assert!(inbound_ids(&fx.core.maintain(Timestamp::new(60_000))).is_empty());
        let events = fx.core.maintain(Timestamp::new(60_001));
        assert_eq!(inbound_ids(&events), vec![safe.id]);
    }

    #[tokio::test]
    async fn test_ack_acknowledges_outbox_entry() {
        let mut fx = started_fixture().await;
        let env = sos(0);
        fx.core.submit(env.clone(), Timestamp::new(0));
        let result = fx.events.recv().await.unwrap();
        fx.core.handle_transport_event(result, Timestamp::new(1));

        let ack = MessageEnvelope::ack(
            env.id,
            AckPayload {
                responder: "medic 7".into(),
                note: String::new(),
            },
            Timestamp::new(5),
            Ttl::DEFAULT,
        );
        let events = fx
            .core
            .on_receive(&EnvelopeCodec::encode(&ack).unwrap(), Timestamp::new(6));
        assert_eq!(states(&events), vec![DeliveryState::Acknowledged]);
        assert_eq!(inbound_ids(&events), vec![ack.id]);
    }

    #[tokio::test]
    async fn test_own_message_echo_is_duplicate() {
        let mut fx = started_fixture().await;
        let env = sos(0);
        fx.core.submit(env.clone(), Timestamp::new(0));

        let echo = EnvelopeCodec::encode(&env.next_hop().unwrap()).unwrap();
        assert!(fx.core.on_receive(&echo, Timestamp::new(1)).is_empty());
    }

    #[tokio::test]
    async fn test_suspend_requeues_in_flight() {
        let mut fx = started_fixture().await;
        let env = sos(0);
        fx.core.submit(env.clone(), Timestamp::new(0));

        let events = fx.core.suspend();
        assert_eq!(states(&events), vec![DeliveryState::Queued]);

        // The late confirmation no longer refers to a pending ticket
        let result = fx.events.recv().await.unwrap();
        assert!(fx.core.handle_transport_event(result, Timestamp::new(1)).is_empty());
        assert_eq!(
            fx.core.outbox().get(&env.id).unwrap().state(),
            DeliveryState::Queued
        );
    }

    #[tokio::test]
    async fn test_session_loss_requeues_in_flight() {
        let mut fx = started_fixture().await;
        let env = sos(0);
        fx.core.submit(env.clone(), Timestamp::new(0));
        let late_result = fx.events.recv().await.unwrap();

        let events = fx
            .core
            .handle_transport_event(TransportEvent::Stopped, Timestamp::new(1));
        assert!(matches!(
            events[0],
            AppEvent::TransportStatus {
                status: TransportStatus::Stopped
            }
        ));
        assert_eq!(states(&events), vec![DeliveryState::Queued]);
        assert!(fx
            .core
            .handle_transport_event(late_result, Timestamp::new(2))
            .is_empty());

        let events = fx.core.on_transport_started(NodeId::new(), Timestamp::new(3));
        assert_eq!(states(&events), vec![DeliveryState::Sending]);
        assert_eq!(fx.core.outbox().get(&env.id).unwrap().attempts(), 2);

        let result = fx.events.recv().await.unwrap();
        let events = fx.core.handle_transport_event(result, Timestamp::new(4));
        assert_eq!(states(&events), vec![DeliveryState::Sent]);
    }

    #[tokio::test]
    async fn test_failed_restart_lets_lifetime_expire() {
        let mut fx = started_fixture().await;
        let env = sos(0);
        fx.core.submit(env.clone(), Timestamp::new(0));

        let events = fx.core.handle_transport_event(
            TransportEvent::FailedToStart {
                reason: "radio off".into(),
            },
            Timestamp::new(1),
        );
        assert_eq!(states(&events), vec![DeliveryState::Queued]);

        // Lifetime of the fixture SOS is 60s
        let events = fx.core.dispatch_due(Timestamp::new(60_001));
        assert_eq!(states(&events), vec![DeliveryState::Expired]);
    }

    /// Memory backend that fails one numbered save
    #[derive(Clone)]
    struct FlakyDisk {
        inner: MemoryOutboxPersistence,
        saves: Arc<AtomicUsize>,
        failing_save: usize,
    }

    impl FlakyDisk {
        fn failing_save(failing_save: usize) -> Self {
            Self {
                inner: MemoryOutboxPersistence::new(),
                saves: Arc::new(AtomicUsize::new(0)),
                failing_save,
            }
        }
    }

    impl OutboxPersistence for FlakyDisk {
        fn load(&self) -> disastra_core::Result<Vec<OutboxEntry>> {
            self.inner.load()
        }

        fn save(&self, entries: &[OutboxEntry]) -> disastra_core::Result<()> {
            let save = self.saves.fetch_add(1, Ordering::SeqCst) + 1;
            if save == self.failing_save {
                return Err(RelayError::corrupt_storage("write failed"));
            }
            self.inner.save(entries)
        }
    }

    #[tokio::test]
    async fn test_failed_outbox_write_keeps_entry_retryable() {
        let mesh = LoopbackMesh::new();
        let transport = Arc::new(mesh.transport());
        let (tx, mut rx) = create_transport_event_channel();
        transport.attach(tx);
        let config = RelayConfig::testing();
        // Save 1 admits the message, save 2 records the first attempt
        let outbox = OutboxStore::open(FlakyDisk::failing_save(2), config.delivery.clone()).unwrap();
        let mut core = RelayCore::new(outbox, transport.clone(), config, Timestamp::new(0));
        transport.start().await.unwrap();
        let started = rx.recv().await.unwrap();
        core.handle_transport_event(started, Timestamp::new(0));

        let env = sos(0);
        let events = core.submit(env.clone(), Timestamp::new(0));
        assert_eq!(
            states(&events),
            vec![DeliveryState::Created, DeliveryState::Queued]
        );
        assert!(transport.sent_frames().is_empty());
        let entry = core.outbox().get(&env.id).unwrap();
        assert_eq!(entry.state(), DeliveryState::Queued);
        assert_eq!(entry.attempts(), 0);

        let events = core.dispatch_due(Timestamp::new(1));
        assert_eq!(states(&events), vec![DeliveryState::Sending]);
        assert_eq!(transport.sent_frames().len(), 1);

        let result = rx.recv().await.unwrap();
        let events = core.handle_transport_event(result, Timestamp::new(2));
        assert_eq!(states(&events), vec![DeliveryState::Sent]);
    }

    #[test]
    fn test_exhausted_attempts_expire() {
        let mesh = LoopbackMesh::new();
        let transport = Arc::new(mesh.transport());
        let mut config = RelayConfig::testing();
        config.delivery = DeliveryConfig {
            max_attempts: 2,
            ..DeliveryConfig::testing()
        };
        let outbox = OutboxStore::in_memory(config.delivery.clone());
        let mut core = RelayCore::new(outbox, transport.clone(), config, Timestamp::new(0));
        core.on_transport_started(NodeId::new(), Timestamp::new(0));
        transport.fail_next(2, TransportError::NotReady);

        let env = sos(0);
        core.submit(env.clone(), Timestamp::new(0));
        let events = core.dispatch_due(Timestamp::new(10));
        assert_eq!(
            states(&events),
            vec![
                DeliveryState::Sending,
                DeliveryState::Failed,
                DeliveryState::Expired
            ]
        );
    }
}
