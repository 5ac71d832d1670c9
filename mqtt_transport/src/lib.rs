// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![warn(missing_docs)]

//! MQTT v5 transport adapter for `link_core`, built on `rumqttc`.

#[macro_use]
extern crate derive_builder;

pub mod adapter;
pub mod connection_settings;
pub mod control_packet;
pub mod error;
pub mod topic;

pub use adapter::{connect, RumqttcTransportClient, RumqttcTransportEventLoop};
pub use connection_settings::{MqttConnectionSettings, MqttConnectionSettingsBuilder};
pub use error::{AdapterError, AdapterErrorKind};
pub use topic::{TopicFilter, TopicName, TopicParseError};
