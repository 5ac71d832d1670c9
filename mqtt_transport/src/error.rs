// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Errors produced while constructing an MQTT transport connection.

use std::fmt;

use thiserror::Error;

/// Error type for adapting [`crate::connection_settings::MqttConnectionSettings`] into
/// `rumqttc`'s connection options.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct AdapterError {
    kind: AdapterErrorKind,
}

impl AdapterError {
    /// Create a new [`AdapterError`]
    #[must_use]
    pub fn new(kind: AdapterErrorKind) -> Self {
        Self { kind }
    }

    /// Return the corresponding [`AdapterErrorKind`] for this error
    #[must_use]
    pub fn kind(&self) -> &AdapterErrorKind {
        &self.kind
    }
}

/// An enumeration of categories of [`AdapterError`]
#[derive(Debug)]
pub enum AdapterErrorKind {
    /// `session_expiry` could not be represented as the wire type rumqttc expects.
    SessionExpiryOutOfRange,
}

impl fmt::Display for AdapterErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterErrorKind::SessionExpiryOutOfRange => {
                write!(f, "session_expiry out of range for the wire protocol")
            }
        }
    }
}
