// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The seam between the link core and a concrete pub/sub transport.
//!
//! A transport is split into two capability sets, mirroring the split between a
//! connection's client handle and its event loop: [`TransportClient`] is cheaply
//! cloned and used to issue outbound requests from any task, while [`TransportEventLoop`]
//! is exclusively owned by the dispatcher and polled in its cooperative loop.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Quality of service used for outbound publishes. The core always requests at-least-once
/// delivery so the transport generates an acknowledgement.
pub const PUBLISH_QOS_AT_LEAST_ONCE: u8 = 1;

/// A normalized event surfaced by the transport, in the order it occurred.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The transport established a connection to the broker.
    Connected,
    /// The transport lost its connection to the broker.
    Disconnected {
        /// Human-readable reason for the disconnect.
        reason: String,
    },
    /// A connect attempt failed without ever establishing a connection.
    ConnectFailed {
        /// Human-readable reason for the failure.
        reason: String,
    },
    /// The broker acknowledged a subscribe request for `topic`.
    SubAck {
        /// The topic pattern that was subscribed to.
        topic: String,
    },
    /// An inbound message arrived on a subscribed topic.
    Message {
        /// The topic the message arrived on.
        topic: String,
        /// The message payload.
        payload: Bytes,
    },
    /// The broker acknowledged a previously published message.
    PubAck {
        /// The ticket returned by [`TransportClient::publish`] for the acknowledged publish.
        ticket: PublishTicket,
    },
}

/// Correlates a [`TransportEvent::PubAck`] with the [`TransportClient::publish`] call that
/// produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublishTicket(pub u64);

/// Error produced by a [`TransportClient`] operation.
#[derive(Debug, Error, Clone)]
#[error("{kind}")]
pub struct TransportError {
    kind: TransportErrorKind,
}

impl TransportError {
    /// Create a new [`TransportError`]
    #[must_use]
    pub fn new(kind: TransportErrorKind) -> Self {
        Self { kind }
    }

    /// Return the corresponding [`TransportErrorKind`] for this error
    #[must_use]
    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }
}

/// An enumeration of categories of [`TransportError`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The client is detached from its connection/event loop and cannot send requests.
    DetachedClient,
    /// An invalid topic was supplied.
    InvalidTopic(String),
    /// An error surfaced by the concrete transport implementation that does not fit a
    /// more specific kind above (e.g. a protocol library error).
    Io(String),
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportErrorKind::DetachedClient => {
                write!(f, "client is detached from connection/event loop")
            }
            TransportErrorKind::InvalidTopic(t) => write!(f, "invalid topic: {t}"),
            TransportErrorKind::Io(detail) => write!(f, "transport error: {detail}"),
        }
    }
}

/// Cheaply cloneable handle used to issue outbound requests to a transport connection.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Subscribe to a topic pattern. Completion is observed asynchronously as a
    /// [`TransportEvent::SubAck`] from the paired [`TransportEventLoop`].
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Publish `payload` to `topic` at at-least-once quality of service, returning a
    /// ticket that will correlate with a later [`TransportEvent::PubAck`].
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<PublishTicket, TransportError>;

    /// Request a graceful disconnect from the broker.
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Exclusively owned by the dispatcher: polls the transport for the next event.
#[async_trait]
pub trait TransportEventLoop: Send {
    /// Poll for the next transport event. Never returns `Err` for events the link FSM is
    /// expected to recover from on its own (those are folded into `ConnectFailed`/`Disconnected`);
    /// returns `Err` only for conditions the caller cannot recover from by reconnecting.
    async fn poll(&mut self) -> Result<TransportEvent, TransportError>;
}
