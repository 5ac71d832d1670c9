// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Public entry point for embedding the link core in an application.

use bytes::Bytes;
use tokio::sync::broadcast;

use crate::config::CoreConfig;
use crate::dispatcher::{Dispatcher, DispatcherHandle, LinkStats, MessageValidator, TransportFactory};
use crate::error::CoreError;
use crate::link::{State, StateChange};

/// A running link core. Cheaply cloneable; every clone drives the same dispatcher task.
///
/// Obtained from [`Core::start`]. Dropping every clone does not stop the dispatcher; call
/// [`Core::stop`] explicitly for a graceful shutdown.
#[derive(Clone)]
pub struct Core {
    handle: DispatcherHandle,
}

impl Core {
    /// Start the link core: opens the event journal, constructs a transport client/event
    /// loop pair for each configured link via `transport_factory`, and spawns the
    /// dispatcher's cooperative event loop.
    ///
    /// `validator` decides whether an inbound message counts as evidence a peer is alive;
    /// only messages it accepts drive a link toward `Active`.
    ///
    /// # Errors
    /// Returns [`CoreError`] if the event journal cannot be opened.
    pub async fn start(
        config: CoreConfig,
        transport_factory: TransportFactory,
        validator: MessageValidator,
    ) -> Result<Self, CoreError> {
        let (handle, _join) = Dispatcher::start(config, transport_factory, validator).await?;
        Ok(Self { handle })
    }

    /// Append `payload` to the event journal for `target_link` and publish it as soon as
    /// the link's in-flight budget allows, returning the assigned event id.
    ///
    /// # Errors
    /// Returns [`CoreError::UnknownLink`](crate::error::CoreErrorKind::UnknownLink) if
    /// `target_link` is not configured, or a journal error if the write fails.
    pub async fn send_event(&self, target_link: &str, payload: Bytes) -> Result<u64, CoreError> {
        self.handle.send_event(target_link, payload).await
    }

    /// Return the current communication state of `link`.
    ///
    /// # Errors
    /// Returns [`CoreError::UnknownLink`](crate::error::CoreErrorKind::UnknownLink) if
    /// `link` is not configured.
    pub async fn link_state(&self, link: &str) -> Result<State, CoreError> {
        self.handle.link_state(link).await
    }

    /// Return point-in-time statistics for `link`.
    ///
    /// # Errors
    /// Returns [`CoreError::UnknownLink`](crate::error::CoreErrorKind::UnknownLink) if
    /// `link` is not configured.
    pub async fn link_stats(&self, link: &str) -> Result<LinkStats, CoreError> {
        self.handle.link_stats(link).await
    }

    /// Subscribe to [`StateChange`] notifications for every managed link.
    #[must_use]
    pub fn subscribe_state_changes(&self) -> broadcast::Receiver<StateChange> {
        self.handle.subscribe_state_changes()
    }

    /// Gracefully stop every link: transitions each to `Stopped`, cancels outstanding
    /// timers, and requests a transport disconnect, waiting up to the configured stop
    /// deadline.
    pub async fn stop(&self) {
        self.handle.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoreConfigBuilder, LinkConfigBuilder};
    use crate::transport::{PublishTicket, TransportClient, TransportError, TransportEvent, TransportEventLoop};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct FakeClient {
        publishes: mpsc::UnboundedSender<(String, Bytes)>,
        next_ticket: Arc<AtomicU64>,
    }

    #[async_trait]
    impl TransportClient for FakeClient {
        async fn subscribe(&self, _topic: &str) -> Result<(), TransportError> {
            Ok(())
        }
        async fn publish(&self, topic: &str, payload: Bytes) -> Result<PublishTicket, TransportError> {
            let _ = self.publishes.send((topic.to_string(), payload));
            let id = self.next_ticket.fetch_add(1, Ordering::SeqCst);
            Ok(PublishTicket(id))
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

    #[tokio::test]
    async fn activates_and_delivers_an_event_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let config = CoreConfigBuilder::default()
            .links(vec![LinkConfigBuilder::default()
                .name("peer-a")
                .ingress_topics(vec!["inbound/a".to_string()])
                .egress_topic("outbound/a")
                .build()
                .unwrap()])
            .journal_dir(dir.path().to_path_buf())
            .build()
            .unwrap();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (publish_tx, mut publish_rx) = mpsc::unbounded_channel();
        let next_ticket = Arc::new(AtomicU64::new(0));
        let event_rx = std::sync::Mutex::new(Some(event_rx));

        let transport_factory: TransportFactory = Arc::new(move |_link_config| {
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
        let validator: crate::dispatcher::MessageValidator = Arc::new(|_topic, _payload| true);

        let core = Core::start(config, transport_factory, validator).await.unwrap();

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

        let mut changes = core.subscribe_state_changes();
        let mut state = State::NotStarted;
        for _ in 0..10 {
            let change = changes.recv().await.unwrap();
            state = change.to;
            if state == State::Active {
                break;
            }
        }
        assert_eq!(state, State::Active);

        core.send_event("peer-a", Bytes::from_static(b"payload"))
            .await
            .unwrap();

        let (topic, payload) = publish_rx.recv().await.unwrap();
        assert_eq!(topic, "outbound/a");
        assert_eq!(payload, Bytes::from_static(b"payload"));

        core.stop().await;
    }

    fn trivial_config(journal_dir: std::path::PathBuf) -> CoreConfig {
        CoreConfigBuilder::default()
            .links(vec![LinkConfigBuilder::default()
                .name("peer-a")
                .ingress_topics(vec!["inbound/a".to_string()])
                .egress_topic("outbound/a")
                .build()
                .unwrap()])
            .journal_dir(journal_dir)
            .build()
            .unwrap()
    }

    fn trivial_transport_factory() -> TransportFactory {
        Arc::new(|_link_config| {
            let (_event_tx, event_rx) = mpsc::unbounded_channel();
            let client = Arc::new(FakeClient {
                publishes: mpsc::unbounded_channel().0,
                next_ticket: Arc::new(AtomicU64::new(0)),
            });
            let event_loop = Box::new(FakeEventLoop { events: event_rx });
            (
                client as Arc<dyn TransportClient>,
                event_loop as Box<dyn TransportEventLoop>,
            )
        })
    }

    #[tokio::test]
    async fn starting_a_second_core_against_the_same_journal_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let validator: crate::dispatcher::MessageValidator = Arc::new(|_topic, _payload| true);

        let first = Core::start(
            trivial_config(dir.path().to_path_buf()),
            trivial_transport_factory(),
            validator.clone(),
        )
        .await
        .unwrap();

        let second = Core::start(
            trivial_config(dir.path().to_path_buf()),
            trivial_transport_factory(),
            validator,
        )
        .await;

        let Err(err) = second else {
            panic!("expected the second Core::start to fail");
        };
        assert!(matches!(
            err.kind(),
            crate::error::CoreErrorKind::AlreadyStarted
        ));

        first.stop().await;
    }
}
