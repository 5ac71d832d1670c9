// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bookkeeping for outbound events that are currently in flight (published but not yet
//! acknowledged) on a single link.
//!
//! This module tracks *which* events are in flight and how many slots remain; the actual
//! I/O (reading the backlog from the journal, publishing, scheduling ack-timeout timers)
//! is orchestrated by the dispatcher, matching the split between bookkeeping and
//! orchestration the rest of this crate uses throughout.

use std::collections::HashMap;

use crate::transport::PublishTicket;

/// Tracks in-flight outbound events for one link, bounding concurrent publishes to
/// `max_in_flight` and ensuring at most one [`PublishTicket`] maps to any given event id.
pub struct AckEngine {
    max_in_flight: usize,
    in_flight: HashMap<PublishTicket, u64>,
}

impl AckEngine {
    /// Create a new engine with the given in-flight budget.
    #[must_use]
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            max_in_flight,
            in_flight: HashMap::new(),
        }
    }

    /// Number of free publish slots remaining.
    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.max_in_flight.saturating_sub(self.in_flight.len())
    }

    /// Number of events currently in flight.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Returns true if `event_id` currently has an outstanding, unacknowledged publish.
    #[must_use]
    pub fn event_in_flight(&self, event_id: u64) -> bool {
        self.in_flight.values().any(|id| *id == event_id)
    }

    /// Record that `event_id` was published under `ticket`, consuming one slot.
    pub fn register_in_flight(&mut self, ticket: PublishTicket, event_id: u64) {
        debug_assert!(
            !self.event_in_flight(event_id),
            "event {event_id} published twice while already in flight"
        );
        self.in_flight.insert(ticket, event_id);
    }

    /// Record that `ticket` was acknowledged, freeing its slot.
    ///
    /// Returns the acknowledged event id, or `None` if `ticket` was not outstanding
    /// (a duplicate or unexpected ack).
    pub fn ack(&mut self, ticket: PublishTicket) -> Option<u64> {
        self.in_flight.remove(&ticket)
    }

    /// Discard all in-flight bookkeeping, e.g. when the link leaves the Active state.
    ///
    /// The underlying events remain journaled and will be republished when the link
    /// reactivates; this only clears the in-memory in-flight tracking.
    pub fn discard_all(&mut self) -> Vec<u64> {
        self.in_flight.drain().map(|(_, id)| id).collect()
    }
}
