// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The cooperative, single-threaded event loop that owns all core state.
//!
//! One [`Dispatcher`] instance serializes every transport event, timer firing, and
//! application command through a single ingress queue, in the spirit of the MQTT session
//! run loop this crate's runtime model is descended from: a `tokio::select!` over a force
//! exit signal and the next unit of work, with no internal locking of link state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::ack_engine::AckEngine;
use crate::clock::{schedule_once, Clock, TimerHandle};
use crate::config::{CoreConfig, LinkConfig};
use crate::error::{CoreError, CoreErrorKind};
use crate::journal::Journal;
use crate::link::{Link, LinkEffect, LinkInput, State, StateChange};
use crate::reconnect::ReconnectPolicy;
use crate::transport::{PublishTicket, TransportClient, TransportEvent, TransportEventLoop};

/// Validates an inbound message and decides whether it counts as evidence the peer is
/// alive. Only messages this returns `true` for drive a link toward `Active`.
pub type MessageValidator = Arc<dyn Fn(&str, &[u8]) -> bool + Send + Sync>;

/// Produces the transport client/event-loop pair used to carry one link's traffic.
pub type TransportFactory = Arc<
    dyn Fn(&LinkConfig) -> (Arc<dyn TransportClient>, Box<dyn TransportEventLoop>) + Send + Sync,
>;

/// Point-in-time statistics for one link, returned by [`super::facade::CoreHandle::link_stats`].
#[derive(Debug, Clone)]
pub struct LinkStats {
    /// Number of outbound events currently in flight (published, awaiting ack).
    pub in_flight: usize,
    /// Number of outbound events journaled for this link that have not yet been acked.
    pub unacked_backlog: usize,
    /// How long ago the link last heard from its peer, if ever.
    pub last_peer_seen: Option<Duration>,
    /// Current communication state of the link.
    pub state: State,
}

enum Command {
    SendEvent {
        target_link: String,
        payload: Bytes,
        reply: oneshot::Sender<Result<u64, CoreError>>,
    },
    LinkState {
        name: String,
        reply: oneshot::Sender<Result<State, CoreError>>,
    },
    LinkStats {
        name: String,
        reply: oneshot::Sender<Result<LinkStats, CoreError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

enum DispatchItem {
    Transport {
        link: String,
        event: TransportEvent,
    },
    TransportFailed {
        link: String,
    },
    AckTimeout {
        link: String,
        ticket: PublishTicket,
    },
    SilenceTimeout {
        link: String,
    },
    Published {
        link: String,
        event_id: u64,
        ticket: PublishTicket,
    },
    Command(Command),
}

/// Cheaply cloneable handle used by the application to drive a running [`Dispatcher`]
/// from any task. See [`crate::facade`] for the public-facing wrapper.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<DispatchItem>,
    state_changes: broadcast::Sender<StateChange>,
}

impl DispatcherHandle {
    /// Append `payload` to the journal for `target_link` and publish it as soon as the
    /// link's in-flight budget allows.
    ///
    /// # Errors
    /// Returns [`CoreError`] if the dispatcher has shut down or the journal write fails.
    pub async fn send_event(&self, target_link: &str, payload: Bytes) -> Result<u64, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DispatchItem::Command(Command::SendEvent {
                target_link: target_link.to_string(),
                payload,
                reply,
            }))
            .await
            .map_err(|_| CoreError::new(CoreErrorKind::NotStarted))?;
        rx.await.map_err(|_| CoreError::new(CoreErrorKind::NotStarted))?
    }

    /// Return the current communication state of `link`.
    ///
    /// # Errors
    /// Returns [`CoreError`] if the dispatcher has shut down or `link` is unknown.
    pub async fn link_state(&self, link: &str) -> Result<State, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DispatchItem::Command(Command::LinkState {
                name: link.to_string(),
                reply,
            }))
            .await
            .map_err(|_| CoreError::new(CoreErrorKind::NotStarted))?;
        rx.await.map_err(|_| CoreError::new(CoreErrorKind::NotStarted))?
    }

    /// Return point-in-time statistics for `link`.
    ///
    /// # Errors
    /// Returns [`CoreError`] if the dispatcher has shut down or `link` is unknown.
    pub async fn link_stats(&self, link: &str) -> Result<LinkStats, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DispatchItem::Command(Command::LinkStats {
                name: link.to_string(),
                reply,
            }))
            .await
            .map_err(|_| CoreError::new(CoreErrorKind::NotStarted))?;
        rx.await.map_err(|_| CoreError::new(CoreErrorKind::NotStarted))?
    }

    /// Subscribe to [`StateChange`] notifications, delivered at-least-once and in order
    /// per-link.
    #[must_use]
    pub fn subscribe_state_changes(&self) -> broadcast::Receiver<StateChange> {
        self.state_changes.subscribe()
    }

    /// Request a graceful stop. Waits for the dispatcher to finish draining.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(DispatchItem::Command(Command::Stop { reply }))
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

struct LinkRuntime {
    link: Link,
    ack_engine: AckEngine,
    client: Arc<dyn TransportClient>,
    egress_topic: String,
    ack_timeout: Duration,
    silence_timer: Option<TimerHandle>,
    ack_timers: HashMap<PublishTicket, TimerHandle>,
    reconnect_attempts: u32,
    last_peer_seen_at: Option<Instant>,
}

/// Owns all link state and runs the cooperative event loop described in this crate's
/// documentation. Construct via [`Dispatcher::start`].
pub struct Dispatcher {
    links: HashMap<String, LinkRuntime>,
    journal: Arc<Journal>,
    reconnect_policy: Box<dyn ReconnectPolicy>,
    tx: mpsc::Sender<DispatchItem>,
    rx: mpsc::Receiver<DispatchItem>,
    state_changes: broadcast::Sender<StateChange>,
    validator: MessageValidator,
    stop_deadline: Duration,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    /// Build and start the dispatcher, spawning one forwarding task per link's event loop
    /// plus the dispatcher's own cooperative loop task.
    ///
    /// # Errors
    /// Returns [`CoreError::AlreadyStarted`](CoreErrorKind::AlreadyStarted) if another live
    /// core already holds `config.journal_dir`, or [`CoreError`] if the journal cannot be
    /// opened.
    pub async fn start(
        config: CoreConfig,
        transport_factory: TransportFactory,
        validator: MessageValidator,
    ) -> Result<(DispatcherHandle, tokio::task::JoinHandle<()>), CoreError> {
        let journal_dir = config.journal_dir.clone();
        let acquired = tokio::task::spawn_blocking(move || Journal::try_lock(&journal_dir))
            .await
            .expect("journal lock task panicked")?;
        if !acquired {
            return Err(CoreError::new(CoreErrorKind::AlreadyStarted));
        }
        let journal = Arc::new(Journal::open(config.journal_dir.clone()).await?);
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let (state_changes, _) = broadcast::channel(config.channel_capacity);

        let mut links = HashMap::new();
        for link_config in &config.links {
            let (client, mut event_loop) = transport_factory(link_config);
            let name = link_config.name.clone();
            let forward_tx = tx.clone();
            let forward_name = name.clone();
            tokio::spawn(async move {
                loop {
                    match event_loop.poll().await {
                        Ok(event) => {
                            if forward_tx
                                .send(DispatchItem::Transport {
                                    link: forward_name.clone(),
                                    event,
                                })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => {
                            log::error!("transport error on link {forward_name}: {e}");
                            if forward_tx
                                .send(DispatchItem::TransportFailed {
                                    link: forward_name.clone(),
                                })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                }
            });

            links.insert(
                name,
                LinkRuntime {
                    link: Link::new(link_config),
                    ack_engine: AckEngine::new(link_config.max_in_flight),
                    client,
                    egress_topic: link_config.egress_topic.clone(),
                    ack_timeout: link_config.ack_timeout,
                    silence_timer: None,
                    ack_timers: HashMap::new(),
                    reconnect_attempts: 0,
                    last_peer_seen_at: None,
                },
            );
        }

        let mut dispatcher = Dispatcher {
            links,
            journal,
            reconnect_policy: config.reconnect_policy,
            tx: tx.clone(),
            rx,
            state_changes: state_changes.clone(),
            validator,
            stop_deadline: config.stop_deadline,
            clock: config.clock,
        };

        for name in dispatcher.links.keys().cloned().collect::<Vec<_>>() {
            let now = dispatcher.clock.now();
            dispatcher.apply_input(&name, LinkInput::Start, now);
        }

        let handle = DispatcherHandle {
            tx,
            state_changes,
        };
        let join = tokio::spawn(async move { dispatcher.run().await });
        Ok((handle, join))
    }

    async fn run(mut self) {
        while let Some(item) = self.rx.recv().await {
            match item {
                DispatchItem::Transport { link, event } => self.on_transport_event(&link, event).await,
                DispatchItem::TransportFailed { link } => self.on_transport_failed(&link),
                DispatchItem::AckTimeout { link, ticket } => self.on_ack_timeout(&link, ticket),
                DispatchItem::SilenceTimeout { link } => {
                    self.apply_input(&link, LinkInput::PeerSilenceTimeout, self.clock.now());
                }
                DispatchItem::Published {
                    link,
                    event_id,
                    ticket,
                } => self.on_published(&link, event_id, ticket),
                DispatchItem::Command(Command::SendEvent {
                    target_link,
                    payload,
                    reply,
                }) => {
                    let result = self.on_send_event(&target_link, payload).await;
                    let _ = reply.send(result);
                }
                DispatchItem::Command(Command::LinkState { name, reply }) => {
                    let result = self
                        .links
                        .get(&name)
                        .map(|r| r.link.state())
                        .ok_or_else(|| CoreError::new(CoreErrorKind::UnknownLink(name.clone())));
                    let _ = reply.send(result);
                }
                DispatchItem::Command(Command::LinkStats { name, reply }) => {
                    let result = self.link_stats(&name).await;
                    let _ = reply.send(result);
                }
                DispatchItem::Command(Command::Stop { reply }) => {
                    self.on_stop().await;
                    let _ = reply.send(());
                    break;
                }
            }
        }
    }

    async fn on_transport_event(&mut self, link_name: &str, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                self.apply_input(link_name, LinkInput::TransportConnected, self.clock.now());
                if let Some(runtime) = self.links.get_mut(link_name) {
                    runtime.reconnect_attempts = 0;
                }
            }
            TransportEvent::ConnectFailed { reason } => {
                log::warn!("link {link_name} connect failed: {reason}");
                self.apply_input(link_name, LinkInput::TransportConnectFailed, self.clock.now());
                self.schedule_reconnect(link_name);
            }
            TransportEvent::Disconnected { reason } => {
                log::warn!("link {link_name} disconnected: {reason}");
                self.apply_input(link_name, LinkInput::TransportDisconnected, self.clock.now());
                self.schedule_reconnect(link_name);
            }
            TransportEvent::SubAck { topic } => {
                self.apply_input(link_name, LinkInput::SubAckReceived { topic }, self.clock.now());
            }
            TransportEvent::Message { topic, payload } => {
                if (self.validator)(&topic, &payload) {
                    self.apply_input(
                        link_name,
                        LinkInput::PeerMessageReceived { topic },
                        self.clock.now(),
                    );
                } else {
                    log::debug!("dropping invalid message on link {link_name}, topic {topic}");
                }
            }
            TransportEvent::PubAck { ticket } => self.on_puback(link_name, ticket).await,
        }
    }

    fn on_transport_failed(&mut self, link_name: &str) {
        self.apply_input(link_name, LinkInput::TransportConnectFailed, self.clock.now());
        self.schedule_reconnect(link_name);
    }

    fn schedule_reconnect(&mut self, link_name: &str) {
        let Some(runtime) = self.links.get_mut(link_name) else {
            return;
        };
        if let Some(delay) = self
            .reconnect_policy
            .next_reconnect_delay(runtime.reconnect_attempts)
        {
            runtime.reconnect_attempts += 1;
            log::info!("link {link_name} reconnecting in {delay:?}");
        } else {
            log::error!("link {link_name} halted by reconnect policy");
        }
    }

    /// Apply a single FSM input to `link_name`, emitting the resulting [`StateChange`] and
    /// carrying out every returned [`LinkEffect`].
    fn apply_input(&mut self, link_name: &str, input: LinkInput, now: Instant) {
        let Some(runtime) = self.links.get_mut(link_name) else {
            return;
        };
        let (change, effects) = runtime.link.handle(input, now);

        if let Some(change) = change {
            log::info!(
                "link {link_name}: {:?} -> {:?} ({:?})",
                change.from,
                change.to,
                change.reason
            );
            let _ = self.state_changes.send(change);
        }

        for effect in effects {
            match effect {
                LinkEffect::Subscribe(topic) => {
                    let client = runtime.client.clone();
                    tokio::spawn(async move {
                        if let Err(e) = client.subscribe(&topic).await {
                            log::error!("subscribe to {topic} failed: {e}");
                        }
                    });
                }
                LinkEffect::LinkActivated => {
                    runtime.last_peer_seen_at = Some(now);
                    let name = link_name.to_string();
                    let journal = self.journal.clone();
                    let client = runtime.client.clone();
                    let egress_topic = runtime.egress_topic.clone();
                    let tx = self.tx.clone();
                    let slots = runtime.ack_engine.available_slots();
                    tokio::spawn(async move {
                        refill_backlog(name, journal, client, egress_topic, tx, slots).await;
                    });
                }
                LinkEffect::LinkDeactivated => {
                    for (_, timer) in runtime.ack_timers.drain() {
                        timer.cancel();
                    }
                    runtime.ack_engine.discard_all();
                }
                LinkEffect::ScheduleSilenceTimer => {
                    if let Some(timer) = runtime.silence_timer.take() {
                        timer.cancel();
                    }
                    if let Some(deadline) = runtime.link.silence_deadline() {
                        let delay = deadline.saturating_duration_since(self.clock.now());
                        let event = DispatchItem::SilenceTimeout {
                            link: link_name.to_string(),
                        };
                        runtime.silence_timer = Some(schedule_once(delay, event, self.tx.clone()));
                    }
                }
                LinkEffect::CancelSilenceTimer => {
                    if let Some(timer) = runtime.silence_timer.take() {
                        timer.cancel();
                    }
                }
                LinkEffect::Disconnect => {
                    let client = runtime.client.clone();
                    tokio::spawn(async move {
                        let _ = client.disconnect().await;
                    });
                }
            }
        }
    }

    async fn on_send_event(&mut self, target_link: &str, payload: Bytes) -> Result<u64, CoreError> {
        let runtime = self
            .links
            .get(target_link)
            .ok_or_else(|| CoreError::new(CoreErrorKind::UnknownLink(target_link.to_string())))?;
        let active = runtime.link.state().is_active();
        let id = self.journal.append(target_link.to_string(), payload).await?;

        if active {
            if let Some(runtime) = self.links.get_mut(target_link) {
                if runtime.ack_engine.available_slots() > 0 {
                    self.publish_event(target_link, id).await;
                }
            }
        }
        Ok(id)
    }

    async fn publish_event(&mut self, link_name: &str, event_id: u64) {
        let Some(runtime) = self.links.get(link_name) else {
            return;
        };
        let Ok(event) = self.journal.iter_unacked().await else {
            return;
        };
        let Some(event) = event.into_iter().find(|e| e.id == event_id) else {
            return;
        };
        let client = runtime.client.clone();
        let egress_topic = runtime.egress_topic.clone();
        match client.publish(&egress_topic, event.payload).await {
            Ok(ticket) => {
                if let Some(runtime) = self.links.get_mut(link_name) {
                    runtime.ack_engine.register_in_flight(ticket, event_id);
                    let timer = schedule_once(
                        runtime.ack_timeout,
                        DispatchItem::AckTimeout {
                            link: link_name.to_string(),
                            ticket,
                        },
                        self.tx.clone(),
                    );
                    runtime.ack_timers.insert(ticket, timer);
                }
            }
            Err(e) => log::error!("publish failed on link {link_name}: {e}"),
        }
    }

    async fn on_puback(&mut self, link_name: &str, ticket: PublishTicket) {
        let Some(runtime) = self.links.get_mut(link_name) else {
            return;
        };
        let Some(event_id) = runtime.ack_engine.ack(ticket) else {
            return;
        };
        if let Some(timer) = runtime.ack_timers.remove(&ticket) {
            timer.cancel();
        }
        if let Err(e) = self.journal.remove(event_id).await {
            log::error!("failed to remove acked event {event_id} from journal: {e}");
        }

        // Refill the backlog now that a slot freed up.
        if let Some(runtime) = self.links.get(link_name) {
            if runtime.link.state().is_active() && runtime.ack_engine.available_slots() > 0 {
                let journal = self.journal.clone();
                let client = runtime.client.clone();
                let egress_topic = runtime.egress_topic.clone();
                let tx = self.tx.clone();
                let slots = runtime.ack_engine.available_slots();
                let name = link_name.to_string();
                tokio::spawn(async move {
                    refill_backlog(name, journal, client, egress_topic, tx, slots).await;
                });
            }
        }
    }

    fn on_published(&mut self, link_name: &str, event_id: u64, ticket: PublishTicket) {
        let Some(runtime) = self.links.get_mut(link_name) else {
            return;
        };
        if !runtime.link.state().is_active() {
            return;
        }
        runtime.ack_engine.register_in_flight(ticket, event_id);
        let timer = schedule_once(
            runtime.ack_timeout,
            DispatchItem::AckTimeout {
                link: link_name.to_string(),
                ticket,
            },
            self.tx.clone(),
        );
        runtime.ack_timers.insert(ticket, timer);
    }

    fn on_ack_timeout(&mut self, link_name: &str, ticket: PublishTicket) {
        let Some(runtime) = self.links.get_mut(link_name) else {
            return;
        };
        runtime.ack_timers.remove(&ticket);
        if runtime.ack_engine.ack(ticket).is_some() {
            // Was still outstanding: demote the link. The event remains journaled.
            self.apply_input(link_name, LinkInput::AckTimeout, self.clock.now());
        }
    }

    async fn link_stats(&self, name: &str) -> Result<LinkStats, CoreError> {
        let runtime = self
            .links
            .get(name)
            .ok_or_else(|| CoreError::new(CoreErrorKind::UnknownLink(name.to_string())))?;
        let unacked = self.journal.iter_unacked().await?;
        let backlog = unacked.iter().filter(|e| e.target_link == name).count();
        Ok(LinkStats {
            in_flight: runtime.ack_engine.in_flight_count(),
            unacked_backlog: backlog,
            last_peer_seen: runtime.last_peer_seen_at.map(|t| self.clock.now() - t),
            state: runtime.link.state(),
        })
    }

    async fn on_stop(&mut self) {
        let names: Vec<String> = self.links.keys().cloned().collect();
        for name in names {
            self.apply_input(&name, LinkInput::Stop, self.clock.now());
        }
        tokio::time::sleep(Duration::from_millis(10).min(self.stop_deadline)).await;
    }
}

async fn refill_backlog(
    link_name: String,
    journal: Arc<Journal>,
    client: Arc<dyn TransportClient>,
    egress_topic: String,
    tx: mpsc::Sender<DispatchItem>,
    slots: usize,
) {
    let Ok(unacked) = journal.iter_unacked().await else {
        return;
    };
    let mut published = 0;
    for event in unacked.into_iter().filter(|e| e.target_link == link_name) {
        if published >= slots {
            break;
        }
        match client.publish(&egress_topic, event.payload).await {
            Ok(ticket) => {
                published += 1;
                // All mutation of link/ack-engine state happens back on the dispatcher
                // task; this spawned task only performs the I/O.
                if tx
                    .send(DispatchItem::Published {
                        link: link_name.clone(),
                        event_id: event.id,
                        ticket,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(e) => {
                log::error!("publish failed on link {link_name}: {e}");
                break;
            }
        }
    }
}
