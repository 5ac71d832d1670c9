// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Common error types for the link core.

use std::fmt;
use std::io;

use thiserror::Error;

/// Error type for the event journal.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct JournalError {
    kind: JournalErrorKind,
}

impl JournalError {
    /// Create a new [`JournalError`]
    #[must_use]
    pub fn new(kind: JournalErrorKind) -> Self {
        Self { kind }
    }

    /// Return the corresponding [`JournalErrorKind`] for this error
    #[must_use]
    pub fn kind(&self) -> &JournalErrorKind {
        &self.kind
    }
}

/// An enumeration of categories of [`JournalError`]
#[derive(Debug)]
pub enum JournalErrorKind {
    /// The journal directory is full or otherwise cannot accept new events.
    StorageFull,
    /// An I/O error occurred while reading or writing the journal.
    StorageIo(io::Error),
    /// The journal directory contains data that cannot be parsed as a valid event.
    StorageCorruption(String),
}

impl fmt::Display for JournalErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JournalErrorKind::StorageFull => write!(f, "event journal storage is full"),
            JournalErrorKind::StorageIo(e) => write!(f, "event journal I/O error: {e}"),
            JournalErrorKind::StorageCorruption(detail) => {
                write!(f, "event journal storage is corrupt: {detail}")
            }
        }
    }
}

impl From<io::Error> for JournalError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::StorageFull {
            JournalError::new(JournalErrorKind::StorageFull)
        } else {
            JournalError::new(JournalErrorKind::StorageIo(e))
        }
    }
}

/// Error type for the link core. The type of error is specified by the value of [`CoreErrorKind`].
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct CoreError {
    kind: CoreErrorKind,
}

impl CoreError {
    /// Create a new [`CoreError`]
    #[must_use]
    pub fn new(kind: CoreErrorKind) -> Self {
        Self { kind }
    }

    /// Return the corresponding [`CoreErrorKind`] for this error
    #[must_use]
    pub fn kind(&self) -> &CoreErrorKind {
        &self.kind
    }
}

/// An enumeration of categories of [`CoreError`]
#[derive(Debug)]
pub enum CoreErrorKind {
    /// An event could not be appended to, or recovered from, the journal.
    Journal(JournalError),
    /// Invalid configuration was provided when starting the core.
    ConfigurationError(String),
    /// The core was already started.
    AlreadyStarted,
    /// An operation was attempted before the core was started.
    NotStarted,
    /// The given link name is not one of the configured links.
    UnknownLink(String),
}

impl fmt::Display for CoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreErrorKind::Journal(e) => write!(f, "event journal error: {e}"),
            CoreErrorKind::ConfigurationError(detail) => {
                write!(f, "invalid configuration: {detail}")
            }
            CoreErrorKind::AlreadyStarted => write!(f, "core is already started"),
            CoreErrorKind::NotStarted => write!(f, "core has not been started"),
            CoreErrorKind::UnknownLink(name) => write!(f, "unknown link: {name}"),
        }
    }
}

impl From<JournalError> for CoreError {
    fn from(e: JournalError) -> Self {
        CoreError::new(CoreErrorKind::Journal(e))
    }
}
