// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! End-to-end scenarios driving a [`Core`] against an in-memory fake transport and a
//! temp-directory journal, covering the six literal scenarios this crate is specified
//! against: happy activation via all three subscribe/peer-message orderings, peer-silence
//! demotion, publish-then-ack removing a journaled event, and ack-timeout demotion leaving
//! the event journaled for republish on reactivation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use link_core::{
    Core, CoreConfigBuilder, LinkConfigBuilder, PublishTicket, State, TransportClient,
    TransportError, TransportEvent, TransportEventLoop,
};
use tokio::sync::mpsc;

struct FakeClient {
    publishes: mpsc::UnboundedSender<(String, Bytes, PublishTicket)>,
    next_ticket: Arc<AtomicU64>,
}

#[async_trait]
impl TransportClient for FakeClient {
    async fn subscribe(&self, _topic: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<PublishTicket, TransportError> {
        let ticket = PublishTicket(self.next_ticket.fetch_add(1, Ordering::SeqCst));
        let _ = self.publishes.send((topic.to_string(), payload, ticket));
        Ok(ticket)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct FakeEventLoop {
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
impl TransportEventLoop for FakeEventLoop {
    async fn poll(&mut self) -> Result<TransportEvent, TransportError> {
        match self.events.recv().await {
            Some(e) => Ok(e),
            None => std::future::pending().await,
        }
    }
}

/// Starts a single-link `Core` named `peer-a`, backed by a fake transport whose events are
/// driven by the returned sender and whose outbound publishes are observed on the returned
/// receiver.
async fn start_single_link_core(
    journal_dir: std::path::PathBuf,
) -> (
    Core,
    mpsc::UnboundedSender<TransportEvent>,
    mpsc::UnboundedReceiver<(String, Bytes, PublishTicket)>,
) {
    let config = CoreConfigBuilder::default()
        .links(vec![LinkConfigBuilder::default()
            .name("peer-a")
            .ingress_topics(vec!["inbound/a".to_string(), "inbound/b".to_string()])
            .egress_topic("outbound/a")
            .ack_timeout(Duration::from_secs(5))
            .peer_silence_timeout(Duration::from_secs(60))
            .build()
            .unwrap()])
        .journal_dir(journal_dir)
        .build()
        .unwrap();

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (publish_tx, publish_rx) = mpsc::unbounded_channel();
    let next_ticket = Arc::new(AtomicU64::new(0));
    let event_rx = std::sync::Mutex::new(Some(event_rx));

    let transport_factory: link_core::TransportFactory = Arc::new(move |_link_config| {
        let client = Arc::new(FakeClient {
            publishes: publish_tx.clone(),
            next_ticket: next_ticket.clone(),
        });
        let event_loop = Box::new(FakeEventLoop {
            events: event_rx.lock().unwrap().take().expect("one link only"),
        });
        (
            client as Arc<dyn TransportClient>,
            event_loop as Box<dyn TransportEventLoop>,
        )
    });
    let validator: link_core::MessageValidator = Arc::new(|_topic, _payload| true);

    let core = Core::start(config, transport_factory, validator).await.unwrap();
    (core, event_tx, publish_rx)
}

/// Drives `core` to `State::Active` by waiting on its state-change stream, failing the test
/// if activation doesn't happen within a bounded number of transitions.
///
/// `NotStarted -> Connecting` is never observed here: `Core::start` broadcasts it
/// synchronously before returning the handle a caller could subscribe through, so every
/// transition sequence asserted below starts from `AwaitingSetupAndPeer` onward.
async fn wait_for_active(core: &Core) -> Vec<State> {
    let mut changes = core.subscribe_state_changes();
    let mut seen = Vec::new();
    for _ in 0..10 {
        let change = changes.recv().await.unwrap();
        seen.push(change.to);
        if change.to == State::Active {
            break;
        }
    }
    seen
}

#[tokio::test(start_paused = true)]
async fn scenario_1_happy_activate_subs_then_peer_then_remaining_sub() {
    let dir = tempfile::tempdir().unwrap();
    let (core, event_tx, _publish_rx) = start_single_link_core(dir.path().to_path_buf()).await;

    event_tx.send(TransportEvent::Connected).unwrap();
    event_tx
        .send(TransportEvent::SubAck {
            topic: "inbound/a".to_string(),
        })
        .unwrap();
    event_tx
        .send(TransportEvent::Message {
            topic: "inbound/a".to_string(),
            payload: Bytes::from_static(b"hello"),
        })
        .unwrap();
    event_tx
        .send(TransportEvent::SubAck {
            topic: "inbound/b".to_string(),
        })
        .unwrap();

    let transitions = wait_for_active(&core).await;
    assert_eq!(
        transitions,
        vec![
            State::AwaitingSetupAndPeer,
            State::AwaitingSetup,
            State::Active,
        ]
    );
    assert_eq!(core.link_state("peer-a").await.unwrap(), State::Active);

    core.stop().await;
}

#[tokio::test(start_paused = true)]
async fn scenario_2_peer_first_then_subs() {
    let dir = tempfile::tempdir().unwrap();
    let (core, event_tx, _publish_rx) = start_single_link_core(dir.path().to_path_buf()).await;

    event_tx.send(TransportEvent::Connected).unwrap();
    event_tx
        .send(TransportEvent::Message {
            topic: "inbound/a".to_string(),
            payload: Bytes::from_static(b"hello"),
        })
        .unwrap();
    event_tx
        .send(TransportEvent::SubAck {
            topic: "inbound/a".to_string(),
        })
        .unwrap();
    event_tx
        .send(TransportEvent::SubAck {
            topic: "inbound/b".to_string(),
        })
        .unwrap();

    let transitions = wait_for_active(&core).await;
    assert_eq!(
        transitions,
        vec![
            State::AwaitingSetupAndPeer,
            State::AwaitingSetup,
            State::Active,
        ]
    );

    core.stop().await;
}

#[tokio::test(start_paused = true)]
async fn scenario_3_subs_first_then_peer() {
    let dir = tempfile::tempdir().unwrap();
    let (core, event_tx, _publish_rx) = start_single_link_core(dir.path().to_path_buf()).await;

    event_tx.send(TransportEvent::Connected).unwrap();
    event_tx
        .send(TransportEvent::SubAck {
            topic: "inbound/a".to_string(),
        })
        .unwrap();
    event_tx
        .send(TransportEvent::SubAck {
            topic: "inbound/b".to_string(),
        })
        .unwrap();
    event_tx
        .send(TransportEvent::Message {
            topic: "inbound/a".to_string(),
            payload: Bytes::from_static(b"hello"),
        })
        .unwrap();

    let transitions = wait_for_active(&core).await;
    assert_eq!(
        transitions,
        vec![
            State::AwaitingSetupAndPeer,
            State::AwaitingPeer,
            State::Active,
        ]
    );

    core.stop().await;
}

#[tokio::test(start_paused = true)]
async fn scenario_4_peer_silence_demotes_active_link() {
    let dir = tempfile::tempdir().unwrap();
    let (core, event_tx, _publish_rx) = start_single_link_core(dir.path().to_path_buf()).await;

    event_tx.send(TransportEvent::Connected).unwrap();
    event_tx
        .send(TransportEvent::SubAck {
            topic: "inbound/a".to_string(),
        })
        .unwrap();
    event_tx
        .send(TransportEvent::Message {
            topic: "inbound/a".to_string(),
            payload: Bytes::from_static(b"hello"),
        })
        .unwrap();
    event_tx
        .send(TransportEvent::SubAck {
            topic: "inbound/b".to_string(),
        })
        .unwrap();
    wait_for_active(&core).await;

    let mut changes = core.subscribe_state_changes();
    tokio::time::advance(Duration::from_secs(61)).await;

    let change = changes.recv().await.unwrap();
    assert_eq!(change.to, State::AwaitingPeer);
    assert_eq!(change.reason, link_core::Reason::PeerSilence);

    core.stop().await;
}

#[tokio::test(start_paused = true)]
async fn scenario_5_publish_then_ack_removes_journaled_event() {
    let dir = tempfile::tempdir().unwrap();
    let (core, event_tx, mut publish_rx) = start_single_link_core(dir.path().to_path_buf()).await;

    event_tx.send(TransportEvent::Connected).unwrap();
    event_tx
        .send(TransportEvent::SubAck {
            topic: "inbound/a".to_string(),
        })
        .unwrap();
    event_tx
        .send(TransportEvent::Message {
            topic: "inbound/a".to_string(),
            payload: Bytes::from_static(b"hello"),
        })
        .unwrap();
    event_tx
        .send(TransportEvent::SubAck {
            topic: "inbound/b".to_string(),
        })
        .unwrap();
    wait_for_active(&core).await;

    core.send_event("peer-a", Bytes::from_static(b"e1"))
        .await
        .unwrap();

    let (topic, payload, ticket) = publish_rx.recv().await.unwrap();
    assert_eq!(topic, "outbound/a");
    assert_eq!(payload, Bytes::from_static(b"e1"));

    let stats_before = core.link_stats("peer-a").await.unwrap();
    assert_eq!(stats_before.unacked_backlog, 1);
    assert_eq!(stats_before.in_flight, 1);

    event_tx.send(TransportEvent::PubAck { ticket }).unwrap();
    // Give the dispatcher a chance to process the PubAck before asserting on its effect.
    tokio::task::yield_now().await;
    tokio::time::advance(Duration::from_millis(1)).await;

    let stats_after = core.link_stats("peer-a").await.unwrap();
    assert_eq!(stats_after.unacked_backlog, 0);
    assert_eq!(stats_after.in_flight, 0);
    assert_eq!(core.link_state("peer-a").await.unwrap(), State::Active);

    core.stop().await;
}

#[tokio::test(start_paused = true)]
async fn scenario_6_ack_timeout_demotes_event_remains_journaled_and_is_republished() {
    let dir = tempfile::tempdir().unwrap();
    let (core, event_tx, mut publish_rx) = start_single_link_core(dir.path().to_path_buf()).await;

    event_tx.send(TransportEvent::Connected).unwrap();
    event_tx
        .send(TransportEvent::SubAck {
            topic: "inbound/a".to_string(),
        })
        .unwrap();
    event_tx
        .send(TransportEvent::Message {
            topic: "inbound/a".to_string(),
            payload: Bytes::from_static(b"hello"),
        })
        .unwrap();
    event_tx
        .send(TransportEvent::SubAck {
            topic: "inbound/b".to_string(),
        })
        .unwrap();
    wait_for_active(&core).await;

    let mut changes = core.subscribe_state_changes();

    core.send_event("peer-a", Bytes::from_static(b"e2"))
        .await
        .unwrap();
    let (_topic, payload, _ticket) = publish_rx.recv().await.unwrap();
    assert_eq!(payload, Bytes::from_static(b"e2"));

    // No PubAck is ever sent: advance past the 5s ack timeout.
    tokio::time::advance(Duration::from_secs(6)).await;

    let change = changes.recv().await.unwrap();
    assert_eq!(change.to, State::AwaitingPeer);
    assert_eq!(change.reason, link_core::Reason::AckTimeout);

    let stats = core.link_stats("peer-a").await.unwrap();
    assert_eq!(stats.unacked_backlog, 1, "e2 must remain journaled after ack timeout");
    assert_eq!(stats.in_flight, 0);

    // Reactivate: the link was deactivated but subscriptions stay acked (no disconnect was
    // reported), so only a fresh peer message is needed to return to Active.
    event_tx
        .send(TransportEvent::Message {
            topic: "inbound/a".to_string(),
            payload: Bytes::from_static(b"hello-again"),
        })
        .unwrap();

    let mut reactivated = false;
    for _ in 0..5 {
        let change = changes.recv().await.unwrap();
        if change.to == State::Active {
            reactivated = true;
            break;
        }
    }
    assert!(reactivated, "link did not return to Active after reactivation");

    let (topic, republished_payload, _ticket) = publish_rx.recv().await.unwrap();
    assert_eq!(topic, "outbound/a");
    assert_eq!(
        republished_payload,
        Bytes::from_static(b"e2"),
        "e2 must be republished from the journal on reactivation"
    );

    core.stop().await;
}
