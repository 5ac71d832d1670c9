// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Connection settings for the MQTT v5 transport adapter.

use std::env::{self, VarError};
use std::time::Duration;

/// All the settings required to establish an MQTT connection.
#[derive(Builder, Clone)]
#[builder(pattern = "owned", setter(into), build_fn(validate = "Self::validate"))]
pub struct MqttConnectionSettings {
    /// Client identifier presented in the CONNECT packet.
    pub(crate) client_id: String,
    /// FQDN or IP address of the broker to connect to.
    pub(crate) host_name: String,
    /// TCP port to connect to the broker on.
    #[builder(default = "8883")]
    pub(crate) tcp_port: u16,
    /// Max time between communications.
    #[builder(default = "Duration::from_secs(60)")]
    pub(crate) keep_alive: Duration,
    /// Session expiry interval, advertised in the CONNECT packet. Must be at least 5 seconds.
    #[builder(default = "Duration::from_secs(3600)")]
    pub(crate) session_expiry: Duration,
    /// Connection timeout.
    #[builder(default = "Duration::from_secs(30)")]
    pub(crate) connection_timeout: Duration,
    /// Clean start.
    #[builder(default = "true")]
    pub(crate) clean_start: bool,
    /// Username for MQTT authentication.
    #[builder(default = "None")]
    pub(crate) username: Option<String>,
    /// Password for MQTT authentication.
    #[builder(default = "None")]
    pub(crate) password: Option<String>,
    /// Whether to negotiate TLS. Certificate material is supplied out of band by the
    /// platform's TLS stack rather than by per-field cert/key paths.
    #[builder(default = "true")]
    pub(crate) use_tls: bool,
}

impl MqttConnectionSettingsBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(session_expiry) = self.session_expiry {
            if session_expiry.as_secs() < 5 {
                return Err("session_expiry must be at least 5 seconds".to_string());
            }
        }
        Ok(())
    }

    /// Initialize the builder from environment variables, mirroring the variables the
    /// broker-side runtime conventionally uses.
    ///
    /// # Errors
    /// Returns a `String` describing the error if a set environment variable cannot be parsed.
    pub fn from_environment() -> Result<Self, String> {
        let client_id = string_from_environment("MQTT_CLIENT_ID")?;
        let host_name = string_from_environment("MQTT_BROKER_HOSTNAME")?;
        let tcp_port = string_from_environment("MQTT_BROKER_TCP_PORT")?
            .map(|v| v.parse::<u16>())
            .transpose()
            .map_err(|e| format!("MQTT_BROKER_TCP_PORT: {e}"))?;
        let use_tls = string_from_environment("MQTT_USE_TLS")?
            .map(|v| v.parse::<bool>())
            .transpose()
            .map_err(|e| format!("MQTT_USE_TLS: {e}"))?;
        let username = string_from_environment("MQTT_USERNAME")?;

        if client_id.is_none() {
            log::warn!("MQTT_CLIENT_ID is not set in environment");
        }
        if host_name.is_none() {
            log::warn!("MQTT_BROKER_HOSTNAME is not set in environment");
        }

        let mut builder = Self::default();
        if let Some(client_id) = client_id {
            builder = builder.client_id(client_id);
        }
        if let Some(host_name) = host_name {
            builder = builder.host_name(host_name);
        }
        if let Some(tcp_port) = tcp_port {
            builder = builder.tcp_port(tcp_port);
        }
        if let Some(use_tls) = use_tls {
            builder = builder.use_tls(use_tls);
        }
        if let Some(username) = username {
            builder = builder.username(Some(username));
        }
        Ok(builder)
    }
}

fn string_from_environment(key: &str) -> Result<Option<String>, String> {
    match env::var(key) {
        Ok(v) => Ok(Some(v)),
        Err(VarError::NotPresent) => Ok(None),
        Err(e) => Err(format!("{key}: {e}")),
    }
}
