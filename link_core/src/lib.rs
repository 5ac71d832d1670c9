// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![warn(missing_docs)]

//! Per-link communication-state tracking and a reliable local event journal for a
//! message-oriented runtime.
//!
//! This crate is transport-agnostic: it is driven by any pair of types implementing
//! [`transport::TransportClient`] and [`transport::TransportEventLoop`]. See the
//! `mqtt_transport` crate for an MQTT v5 adapter built on `rumqttc`.
//!
//! The entry point is [`facade::Core`], started with [`facade::Core::start`].

#[macro_use]
extern crate derive_builder;

pub mod ack_engine;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod facade;
pub mod journal;
pub mod link;
pub mod reconnect;
pub mod transport;

pub use config::{CoreConfig, CoreConfigBuilder, LinkConfig, LinkConfigBuilder};
pub use dispatcher::{LinkStats, MessageValidator, TransportFactory};
pub use error::{CoreError, CoreErrorKind, JournalError, JournalErrorKind};
pub use facade::Core;
pub use journal::Event;
pub use link::{Reason, State, StateChange};
pub use reconnect::{ExponentialBackoffWithJitter, ReconnectPolicy};
pub use transport::{PublishTicket, TransportClient, TransportError, TransportErrorKind, TransportEvent, TransportEventLoop};
