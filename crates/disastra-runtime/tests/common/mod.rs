//! Shared helpers for runtime integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use disastra_core::{
    AppEvent, DeliveryEvent, DeliveryState, EmergencyType, MessageEnvelope, MessageId,
    SosPayload, Timestamp, Ttl,
};
use disastra_runtime::{create_testing_runtime, LoopbackMesh, LoopbackTransport, RelayRuntime};

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// A running relay together with its loopback transport
pub struct TestNode {
    pub runtime: RelayRuntime,
    pub transport: Arc<LoopbackTransport>,
}

impl TestNode {
    pub async fn start(mesh: &LoopbackMesh) -> Self {
        Self::start_with(Arc::new(mesh.transport())).await
    }

    pub async fn start_with(transport: Arc<LoopbackTransport>) -> Self {
        let runtime = create_testing_runtime(transport.clone())
            .await
            .expect("runtime should start");
        Self { runtime, transport }
    }

    /// Wait for the first event matching `predicate`, discarding the rest
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> AppEvent
    where
        F: FnMut(&AppEvent) -> bool,
    {
        let runtime = &mut self.runtime;
        tokio::time::timeout(EVENT_TIMEOUT, async {
            loop {
                let event = runtime.next_app_event().await.expect("relay stopped");
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Delivery events for `id` up to and including `state`
    pub async fn delivery_until(&mut self, id: MessageId, state: DeliveryState) -> Vec<DeliveryEvent> {
        let mut seen = Vec::new();
        loop {
            let event = self
                .wait_for(|event| matches!(event, AppEvent::Delivery(d) if d.id == id))
                .await;
            if let AppEvent::Delivery(delivery) = event {
                let done = delivery.state == state;
                seen.push(delivery);
                if done {
                    return seen;
                }
            }
        }
    }

    /// Wait for the inbound delivery of `id`
    pub async fn inbound(&mut self, id: MessageId) -> MessageEnvelope {
        match self
            .wait_for(|event| matches!(event, AppEvent::Inbound(m) if m.envelope.id == id))
            .await
        {
            AppEvent::Inbound(message) => message.envelope,
            other => panic!("unexpected event {other:?}"),
        }
    }
}

pub fn sos(note: &str) -> MessageEnvelope {
    MessageEnvelope::sos(
        SosPayload::new(EmergencyType::Trapped)
            .with_battery(40)
            .with_note(note),
        Timestamp::now(),
        Ttl::new(7, Duration::from_secs(60)),
    )
}

pub fn states(events: &[DeliveryEvent]) -> Vec<DeliveryState> {
    events.iter().map(|event| event.state).collect()
}
