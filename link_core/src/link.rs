// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-link communication-state machine.
//!
//! Consumes transport events, peer-message arrivals, and timer firings; decides whether
//! the link is currently "active" in the application-level sense; and reports every
//! transition as a [`StateChange`] plus a list of [`LinkEffect`]s the dispatcher must act on.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::config::LinkConfig;

/// Communication state of a single link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// The link has not been started.
    NotStarted,
    /// Waiting for the transport to connect.
    Connecting,
    /// Connected; waiting for both all ingress subscriptions to be acked and a peer message.
    AwaitingSetupAndPeer,
    /// Connected and a peer message has been seen; waiting for subscriptions to be acked.
    AwaitingSetup,
    /// Connected and all subscriptions are acked; waiting for a peer message.
    AwaitingPeer,
    /// Fully active: subscriptions acked and the peer has been heard from recently.
    Active,
    /// Terminally stopped.
    Stopped,
}

impl State {
    /// Returns true if this state is the application-level "active" state.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, State::Active)
    }
}

/// The reason a [`StateChange`] occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// The link was started.
    Started,
    /// A transport connect attempt failed.
    TransportConnectFailed,
    /// The transport connected.
    TransportConnected,
    /// All configured ingress subscriptions have been acked.
    AllSubsAcked,
    /// A valid peer message was received.
    PeerMessage,
    /// An outbound event's acknowledgement was not observed within the ack timeout.
    AckTimeout,
    /// No peer message was observed within the peer silence timeout.
    PeerSilence,
    /// The transport disconnected.
    TransportDisconnected,
    /// The link was stopped.
    Stopped,
}

/// A notification that a link transitioned between states.
#[derive(Debug, Clone)]
pub struct StateChange {
    /// Name of the link that transitioned.
    pub link: String,
    /// State before the transition.
    pub from: State,
    /// State after the transition.
    pub to: State,
    /// Why the transition occurred.
    pub reason: Reason,
}

/// Input events consumed by the link state machine.
#[derive(Debug, Clone)]
pub enum LinkInput {
    /// Start the link.
    Start,
    /// Stop the link permanently.
    Stop,
    /// The transport connected.
    TransportConnected,
    /// The transport disconnected. Carries a human-readable reason, unused by the FSM itself.
    TransportDisconnected,
    /// A transport connect attempt failed.
    TransportConnectFailed,
    /// The broker acknowledged a subscribe request for `topic`.
    SubAckReceived {
        /// The topic pattern that was acked.
        topic: String,
    },
    /// A validated application message arrived from the peer on `topic`.
    PeerMessageReceived {
        /// The topic the message arrived on.
        topic: String,
    },
    /// No `PubAck` was observed in time for an in-flight publish while Active.
    AckTimeout,
    /// No peer message has been observed within `peer_silence_timeout` while Active.
    PeerSilenceTimeout,
}

/// An action the dispatcher must take in response to a link's state transition.
#[derive(Debug, Clone)]
pub enum LinkEffect {
    /// Issue a subscribe request for `topic`.
    Subscribe(String),
    /// Tell the ack/retransmit engine this link is now active and may drain its backlog.
    LinkActivated,
    /// Tell the ack/retransmit engine this link is no longer active.
    LinkDeactivated,
    /// (Re)arm the peer-silence timer, based on the link's current `last_peer_seen`.
    ScheduleSilenceTimer,
    /// Disarm the peer-silence timer.
    CancelSilenceTimer,
    /// Request a transport disconnect.
    Disconnect,
}

/// One managed link's communication state.
pub struct Link {
    name: String,
    ingress_topics: HashSet<String>,
    pending_subs: HashSet<String>,
    acked_subs: HashSet<String>,
    last_peer_seen: Option<Instant>,
    peer_silence_timeout: Duration,
    state: State,
}

impl Link {
    /// Create a new link in the `NotStarted` state from its configuration.
    #[must_use]
    pub fn new(config: &LinkConfig) -> Self {
        Self {
            name: config.name.clone(),
            ingress_topics: config.ingress_topics.iter().cloned().collect(),
            pending_subs: HashSet::new(),
            acked_subs: HashSet::new(),
            last_peer_seen: None,
            peer_silence_timeout: config.peer_silence_timeout,
            state: State::NotStarted,
        }
    }

    /// The link's configured name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The link's current state.
    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    /// The instant the peer silence timer should fire at, if the link is Active.
    #[must_use]
    pub fn silence_deadline(&self) -> Option<Instant> {
        if self.state.is_active() {
            self.last_peer_seen.map(|t| t + self.peer_silence_timeout)
        } else {
            None
        }
    }

    /// Apply `input`, returning the resulting state change (if any) and the effects the
    /// dispatcher must carry out.
    pub fn handle(&mut self, input: LinkInput, now: Instant) -> (Option<StateChange>, Vec<LinkEffect>) {
        let from = self.state;
        let mut effects = Vec::new();

        if from == State::Stopped {
            return (None, effects);
        }

        let (to, reason) = match (from, input) {
            (State::NotStarted, LinkInput::Start) => (State::Connecting, Some(Reason::Started)),

            (State::Connecting, LinkInput::TransportConnectFailed) => {
                (State::Connecting, Some(Reason::TransportConnectFailed))
            }
            (State::Connecting, LinkInput::TransportConnected) => {
                self.pending_subs = self.ingress_topics.clone();
                self.acked_subs.clear();
                for topic in &self.ingress_topics {
                    effects.push(LinkEffect::Subscribe(topic.clone()));
                }
                (State::AwaitingSetupAndPeer, Some(Reason::TransportConnected))
            }

            (State::AwaitingSetupAndPeer, LinkInput::SubAckReceived { topic }) => {
                self.ack_sub(&topic);
                if self.pending_subs.is_empty() {
                    (State::AwaitingPeer, Some(Reason::AllSubsAcked))
                } else {
                    (State::AwaitingSetupAndPeer, None)
                }
            }
            (State::AwaitingSetupAndPeer, LinkInput::PeerMessageReceived { .. }) => {
                self.last_peer_seen = Some(now);
                (State::AwaitingSetup, Some(Reason::PeerMessage))
            }
            (State::AwaitingSetupAndPeer, LinkInput::TransportDisconnected) => {
                self.reset_subs();
                (State::Connecting, Some(Reason::TransportDisconnected))
            }

            (State::AwaitingSetup, LinkInput::SubAckReceived { topic }) => {
                self.ack_sub(&topic);
                if self.pending_subs.is_empty() {
                    effects.push(LinkEffect::LinkActivated);
                    effects.push(LinkEffect::ScheduleSilenceTimer);
                    (State::Active, Some(Reason::AllSubsAcked))
                } else {
                    (State::AwaitingSetup, None)
                }
            }
            (State::AwaitingSetup, LinkInput::TransportDisconnected) => {
                self.reset_subs();
                (State::Connecting, Some(Reason::TransportDisconnected))
            }

            (State::AwaitingPeer, LinkInput::PeerMessageReceived { .. }) => {
                self.last_peer_seen = Some(now);
                effects.push(LinkEffect::LinkActivated);
                effects.push(LinkEffect::ScheduleSilenceTimer);
                (State::Active, Some(Reason::PeerMessage))
            }
            (State::AwaitingPeer, LinkInput::TransportDisconnected) => {
                self.reset_subs();
                (State::Connecting, Some(Reason::TransportDisconnected))
            }

            (State::Active, LinkInput::PeerMessageReceived { .. }) => {
                self.last_peer_seen = Some(now);
                effects.push(LinkEffect::ScheduleSilenceTimer);
                (State::Active, None)
            }
            (State::Active, LinkInput::AckTimeout) => {
                effects.push(LinkEffect::LinkDeactivated);
                effects.push(LinkEffect::CancelSilenceTimer);
                (State::AwaitingPeer, Some(Reason::AckTimeout))
            }
            (State::Active, LinkInput::PeerSilenceTimeout) => {
                effects.push(LinkEffect::LinkDeactivated);
                effects.push(LinkEffect::CancelSilenceTimer);
                (State::AwaitingPeer, Some(Reason::PeerSilence))
            }
            (State::Active, LinkInput::TransportDisconnected) => {
                effects.push(LinkEffect::LinkDeactivated);
                effects.push(LinkEffect::CancelSilenceTimer);
                self.reset_subs();
                (State::Connecting, Some(Reason::TransportDisconnected))
            }

            (_, LinkInput::Stop) => {
                if from.is_active() {
                    effects.push(LinkEffect::LinkDeactivated);
                    effects.push(LinkEffect::CancelSilenceTimer);
                }
                effects.push(LinkEffect::Disconnect);
                (State::Stopped, Some(Reason::Stopped))
            }

            // Any input not meaningful in the current state is ignored.
            (state, _) => (state, None),
        };

        self.state = to;

        let change = reason.map(|reason| StateChange {
            link: self.name.clone(),
            from,
            to,
            reason,
        });
        (change, effects)
    }

    fn ack_sub(&mut self, topic: &str) {
        if self.pending_subs.remove(topic) {
            self.acked_subs.insert(topic.to_string());
        }
    }

    fn reset_subs(&mut self) {
        self.pending_subs.clear();
        self.acked_subs.clear();
        self.last_peer_seen = None;
    }
}
