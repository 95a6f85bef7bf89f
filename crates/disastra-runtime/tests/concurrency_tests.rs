//! Concurrent input into a single relay

mod common;

use std::sync::Arc;

use common::{sos, TestNode};
use disastra_core::{AppEvent, DeliveryState, EnvelopeCodec};
use disastra_runtime::LoopbackMesh;
use futures::future::join_all;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_copies_delivered_once() {
    let mesh = LoopbackMesh::new();
    let mut node = TestNode::start(&mesh).await;

    let alert = sos("same frame from every neighbour");
    let frame = EnvelopeCodec::encode(&alert).unwrap();

    let injections = (0..16).map(|_| {
        let transport = Arc::clone(&node.transport);
        let frame = frame.clone();
        tokio::spawn(async move { transport.inject_received(frame) })
    });
    for result in join_all(injections).await {
        result.unwrap();
    }

    // Transport events are handled in order, so the marker arrives last
    let marker = sos("marker");
    node.transport
        .inject_received(EnvelopeCodec::encode(&marker).unwrap());

    let mut copies = 0;
    loop {
        let event = node
            .wait_for(|event| matches!(event, AppEvent::Inbound(_)))
            .await;
        let AppEvent::Inbound(message) = event else {
            unreachable!()
        };
        if message.envelope.id == marker.id {
            break;
        }
        assert_eq!(message.envelope.id, alert.id);
        copies += 1;
    }
    assert_eq!(copies, 1);

    let stats = node.runtime.shutdown().await.unwrap();
    assert_eq!(stats.received, 17);
    assert_eq!(stats.duplicates, 15);
    assert_eq!(stats.delivered, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_all_sent() {
    let mesh = LoopbackMesh::new();
    let mut node = TestNode::start(&mesh).await;

    let envelopes: Vec<_> = (0..20).map(|i| sos(&format!("caller {i}"))).collect();
    let submissions = envelopes.iter().cloned().map(|envelope| {
        let commands = node.runtime.command_sender();
        tokio::spawn(async move {
            commands
                .send(disastra_core::Command::Submit { envelope })
                .await
        })
    });
    for result in join_all(submissions).await {
        result.unwrap().unwrap();
    }

    let mut pending: std::collections::HashSet<_> = envelopes.iter().map(|e| e.id).collect();
    while !pending.is_empty() {
        let event = node
            .wait_for(|event| {
                matches!(event, AppEvent::Delivery(d) if d.state == DeliveryState::Sent)
            })
            .await;
        if let AppEvent::Delivery(delivery) = event {
            assert!(pending.remove(&delivery.id), "sent twice: {}", delivery.id);
        }
    }

    let stats = node.runtime.shutdown().await.unwrap();
    assert_eq!(stats.submitted, 20);
    assert_eq!(node.transport.sent_frames().len(), 20);
}
