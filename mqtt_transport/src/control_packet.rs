// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Thin aliases onto the underlying MQTT v5 wire types.

/// Quality of Service.
pub type QoS = rumqttc::v5::mqttbytes::QoS;
/// PUBLISH packet.
pub type Publish = rumqttc::v5::mqttbytes::v5::Publish;
/// Any incoming or outgoing MQTT v5 control packet.
pub type Packet = rumqttc::v5::mqttbytes::v5::Packet;
/// A client/event-loop notification: either an outcome of an outgoing request, or an
/// incoming packet.
pub type Event = rumqttc::v5::Event;
