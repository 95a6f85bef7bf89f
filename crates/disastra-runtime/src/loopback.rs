//! In-process loopback mesh
//!
//! Every [`LoopbackTransport`] created from the same [`LoopbackMesh`] sees
//! every other one as a direct neighbour: a frame sent by one node is handed
//! to all other running nodes as a `Received` event. Used by the simulator
//! and by tests, with hooks to inject send failures, start failures and raw
//! inbound frames.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use dashmap::DashMap;
use disastra_core::{
    NodeId, RelayResult, SendOutcome, SendTicket, TicketCounter, TransportAdapter,
    TransportCapabilities, TransportError, TransportEvent, TransportEventSender, TransportType,
};
use tracing::{debug, trace};

/// Default frame limit, comparable to a Wi-Fi Direct datagram
pub const DEFAULT_MAX_PAYLOAD: usize = 4096;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ----------------------------------------------------------------------------
// Loopback Mesh
// ----------------------------------------------------------------------------

/// Shared medium connecting loopback transports
#[derive(Debug, Clone, Default)]
pub struct LoopbackMesh {
    peers: Arc<DashMap<NodeId, TransportEventSender>>,
}

impl LoopbackMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport attached to this mesh
    pub fn transport(&self) -> LoopbackTransport {
        LoopbackTransport::new(self.clone(), DEFAULT_MAX_PAYLOAD)
    }

    pub fn transport_with_max_payload(&self, max_payload_size: usize) -> LoopbackTransport {
        LoopbackTransport::new(self.clone(), max_payload_size)
    }

    /// Number of nodes currently reachable
    pub fn online(&self) -> usize {
        self.peers.len()
    }

    fn join(&self, node_id: NodeId, events: TransportEventSender) {
        self.peers.insert(node_id, events);
    }

    fn leave(&self, node_id: &NodeId) {
        self.peers.remove(node_id);
    }

    /// Hand a frame to every node except `from`
    fn broadcast(&self, from: &NodeId, bytes: &[u8]) -> usize {
        let mut reached = 0;
        for peer in self.peers.iter() {
            if peer.key() == from {
                continue;
            }
            let event = TransportEvent::Received {
                bytes: bytes.to_vec(),
            };
            if peer.value().send(event).is_ok() {
                reached += 1;
            }
        }
        reached
    }
}

// ----------------------------------------------------------------------------
// Loopback Transport
// ----------------------------------------------------------------------------

pub struct LoopbackTransport {
    mesh: LoopbackMesh,
    node_id: NodeId,
    max_payload_size: usize,
    events: Mutex<Option<TransportEventSender>>,
    running: AtomicBool,
    reachable: AtomicBool,
    tickets: TicketCounter,
    injected_failures: Mutex<VecDeque<TransportError>>,
    start_failure: Mutex<Option<String>>,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl LoopbackTransport {
    fn new(mesh: LoopbackMesh, max_payload_size: usize) -> Self {
        Self {
            mesh,
            node_id: NodeId::new(),
            max_payload_size,
            events: Mutex::new(None),
            running: AtomicBool::new(false),
            reachable: AtomicBool::new(true),
            tickets: TicketCounter::new(),
            injected_failures: Mutex::new(VecDeque::new()),
            start_failure: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Make the next `count` sends fail synchronously with `error`
    pub fn fail_next(&self, count: usize, error: TransportError) {
        let mut failures = lock(&self.injected_failures);
        failures.extend(std::iter::repeat(error).take(count));
    }

    /// Make the next `start` report `FailedToStart`
    pub fn fail_start<T: Into<String>>(&self, reason: T) {
        *lock(&self.start_failure) = Some(reason.into());
    }

    /// Take the node in or out of radio range without stopping it
    ///
    /// Out of range, sends still succeed locally but reach nobody and
    /// nothing is received.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
        if !self.is_running() {
            return;
        }
        if reachable {
            if let Some(events) = lock(&self.events).clone() {
                self.mesh.join(self.node_id, events);
            }
        } else {
            self.mesh.leave(&self.node_id);
        }
    }

    /// Deliver a raw frame to this node as if a neighbour had sent it
    pub fn inject_received(&self, bytes: Vec<u8>) {
        self.emit(TransportEvent::Received { bytes });
    }

    /// Every frame accepted by `send`, in order
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        lock(&self.sent).clone()
    }

    fn emit(&self, event: TransportEvent) {
        match lock(&self.events).as_ref() {
            Some(events) => {
                if events.send(event).is_err() {
                    trace!(node_id = %self.node_id, "Event receiver dropped");
                }
            }
            None => debug!(node_id = %self.node_id, "Transport event before attach"),
        }
    }
}

#[async_trait]
impl TransportAdapter for LoopbackTransport {
    fn attach(&self, events: TransportEventSender) {
        *lock(&self.events) = Some(events);
    }

    async fn start(&self) -> RelayResult<()> {
        if let Some(reason) = lock(&self.start_failure).take() {
            self.emit(TransportEvent::FailedToStart { reason });
            return Ok(());
        }

        self.running.store(true, Ordering::SeqCst);
        if self.reachable.load(Ordering::SeqCst) {
            if let Some(events) = lock(&self.events).clone() {
                self.mesh.join(self.node_id, events);
            }
        }
        debug!(node_id = %self.node_id, online = self.mesh.online(), "Loopback transport started");
        self.emit(TransportEvent::Started {
            node_id: self.node_id,
        });
        Ok(())
    }

    async fn stop(&self) -> RelayResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.mesh.leave(&self.node_id);
        debug!(node_id = %self.node_id, "Loopback transport stopped");
        self.emit(TransportEvent::Stopped);
        Ok(())
    }

    fn send(&self, bytes: &[u8]) -> Result<SendTicket, TransportError> {
        if !self.is_running() {
            return Err(TransportError::NotReady);
        }
        if let Some(error) = lock(&self.injected_failures).pop_front() {
            return Err(error);
        }
        if bytes.len() > self.max_payload_size {
            return Err(TransportError::PayloadTooLarge {
                size: bytes.len(),
                max: self.max_payload_size,
            });
        }

        let ticket = self.tickets.next();
        lock(&self.sent).push(bytes.to_vec());
        let reached = if self.reachable.load(Ordering::SeqCst) {
            self.mesh.broadcast(&self.node_id, bytes)
        } else {
            0
        };
        trace!(node_id = %self.node_id, %ticket, reached, "Loopback frame sent");

        self.emit(TransportEvent::SendResult {
            ticket,
            outcome: SendOutcome::Delivered,
        });
        Ok(ticket)
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            transport_type: TransportType::Loopback,
            max_payload_size: self.max_payload_size,
            supports_broadcast: true,
        }
    }
}
