// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Adapts `rumqttc`'s MQTT v5 client/event loop pair onto the link core's transport seam.
//!
//! `rumqttc` does not hand back a packet identifier from `publish`/`subscribe` calls, so
//! correlating a later `SubAck`/`PubAck` with the request that caused it relies on FIFO
//! ordering: the broker acknowledges subscribes and QoS-1 publishes in the order the
//! client sent them, and TCP preserves that order end to end. A pending-request queue
//! per client tracks this.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use link_core::transport::{
    PublishTicket, TransportClient, TransportError, TransportErrorKind, TransportEvent,
    TransportEventLoop,
};
use rumqttc::v5::EventLoop;

use crate::connection_settings::MqttConnectionSettings;
use crate::control_packet::{Event, Packet, QoS};
use crate::error::{AdapterError, AdapterErrorKind};
use crate::topic::{TopicFilter, TopicName};

/// Builds the `rumqttc` client/event loop pair for `settings` and wraps them in the
/// link core's [`TransportClient`]/[`TransportEventLoop`] seam.
///
/// # Errors
/// Returns [`AdapterError`] if `settings` cannot be converted to `rumqttc`'s connection
/// options.
pub fn connect(
    settings: MqttConnectionSettings,
    channel_capacity: usize,
) -> Result<(RumqttcTransportClient, RumqttcTransportEventLoop), AdapterError> {
    let mqtt_options: rumqttc::v5::MqttOptions = settings.try_into()?;
    let (client, event_loop) = rumqttc::v5::AsyncClient::new(mqtt_options, channel_capacity);

    let pending_subs = std::sync::Arc::new(Mutex::new(VecDeque::new()));
    let pending_pubs = std::sync::Arc::new(Mutex::new(VecDeque::new()));
    let next_ticket = std::sync::Arc::new(AtomicU64::new(0));

    let transport_client = RumqttcTransportClient {
        client,
        pending_subs: pending_subs.clone(),
        pending_pubs: pending_pubs.clone(),
        next_ticket,
    };
    let transport_event_loop = RumqttcTransportEventLoop {
        event_loop,
        pending_subs,
        pending_pubs,
        connected: false,
    };
    Ok((transport_client, transport_event_loop))
}

impl TryFrom<MqttConnectionSettings> for rumqttc::v5::MqttOptions {
    type Error = AdapterError;

    fn try_from(settings: MqttConnectionSettings) -> Result<Self, Self::Error> {
        let mut options = rumqttc::v5::MqttOptions::new(
            settings.client_id.clone(),
            settings.host_name,
            settings.tcp_port,
        );
        options.set_keep_alive(settings.keep_alive);
        let session_expiry_secs: u32 = settings
            .session_expiry
            .as_secs()
            .try_into()
            .map_err(|_| AdapterError::new(AdapterErrorKind::SessionExpiryOutOfRange))?;
        options.set_session_expiry_interval(Some(session_expiry_secs));
        options.set_connection_timeout(settings.connection_timeout.as_secs());
        options.set_clean_start(settings.clean_start);
        if let Some(username) = settings.username {
            options.set_credentials(username, settings.password.unwrap_or_default());
        }
        if settings.use_tls {
            options.set_transport(rumqttc::Transport::tls_with_default_config());
        }
        Ok(options)
    }
}

/// Cheaply cloneable handle used to publish and subscribe on an MQTT v5 connection.
#[derive(Clone)]
pub struct RumqttcTransportClient {
    client: rumqttc::v5::AsyncClient,
    pending_subs: std::sync::Arc<Mutex<VecDeque<String>>>,
    pending_pubs: std::sync::Arc<Mutex<VecDeque<PublishTicket>>>,
    next_ticket: std::sync::Arc<AtomicU64>,
}

#[async_trait]
impl TransportClient for RumqttcTransportClient {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        if !TopicFilter::is_valid_topic_filter(topic) {
            return Err(TransportError::new(TransportErrorKind::InvalidTopic(
                topic.to_string(),
            )));
        }
        self.pending_subs.lock().unwrap().push_back(topic.to_string());
        self.client
            .subscribe(topic.to_string(), QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::new(TransportErrorKind::Io(e.to_string())))
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<PublishTicket, TransportError> {
        if !TopicName::is_valid_topic_name(topic) {
            return Err(TransportError::new(TransportErrorKind::InvalidTopic(
                topic.to_string(),
            )));
        }
        let ticket = PublishTicket(self.next_ticket.fetch_add(1, Ordering::SeqCst));
        self.pending_pubs.lock().unwrap().push_back(ticket);
        self.client
            .publish(topic.to_string(), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::new(TransportErrorKind::Io(e.to_string())))?;
        Ok(ticket)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| TransportError::new(TransportErrorKind::Io(e.to_string())))
    }
}

/// Exclusively owned by the dispatcher: drives the underlying `rumqttc` event loop and
/// normalizes its notifications into [`TransportEvent`]s.
pub struct RumqttcTransportEventLoop {
    event_loop: EventLoop,
    pending_subs: std::sync::Arc<Mutex<VecDeque<String>>>,
    pending_pubs: std::sync::Arc<Mutex<VecDeque<PublishTicket>>>,
    connected: bool,
}

#[async_trait]
impl TransportEventLoop for RumqttcTransportEventLoop {
    async fn poll(&mut self) -> Result<TransportEvent, TransportError> {
        loop {
            match self.event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    self.connected = true;
                    return Ok(TransportEvent::Connected);
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    if let Some(topic) = self.pending_subs.lock().unwrap().pop_front() {
                        return Ok(TransportEvent::SubAck { topic });
                    }
                }
                Ok(Event::Incoming(Packet::PubAck(_))) => {
                    if let Some(ticket) = self.pending_pubs.lock().unwrap().pop_front() {
                        return Ok(TransportEvent::PubAck { ticket });
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let topic = String::from_utf8_lossy(&publish.topic).into_owned();
                    return Ok(TransportEvent::Message {
                        topic,
                        payload: publish.payload,
                    });
                }
                Ok(Event::Incoming(Packet::Disconnect(_))) => {
                    self.connected = false;
                    return Ok(TransportEvent::Disconnected {
                        reason: "server sent DISCONNECT".to_string(),
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    let reason = e.to_string();
                    let was_connected = self.connected;
                    self.connected = false;
                    return Ok(if was_connected {
                        TransportEvent::Disconnected { reason }
                    } else {
                        TransportEvent::ConnectFailed { reason }
                    });
                }
            }
        }
    }
}
