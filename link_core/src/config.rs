// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Configuration for the link core and the links it manages.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::reconnect::{ExponentialBackoffWithJitter, ReconnectPolicy};

/// Configuration for a single link to an external peer.
#[derive(Builder, Clone)]
#[builder(pattern = "owned", setter(into), build_fn(validate = "Self::validate"))]
pub struct LinkConfig {
    /// Stable name identifying this link.
    pub(crate) name: String,
    /// Topic patterns this link subscribes to for inbound peer traffic.
    pub(crate) ingress_topics: Vec<String>,
    /// Topic this link publishes outbound events to.
    pub(crate) egress_topic: String,
    /// How long to wait for a peer message before demoting an Active link.
    #[builder(default = "Duration::from_secs(60)")]
    pub(crate) peer_silence_timeout: Duration,
    /// How long to wait for a `PubAck` before demoting an Active link.
    #[builder(default = "Duration::from_secs(5)")]
    pub(crate) ack_timeout: Duration,
    /// Maximum number of outbound events in flight at once for this link.
    #[builder(default = "8")]
    pub(crate) max_in_flight: usize,
}

impl LinkConfigBuilder {
    /// Validate the [`LinkConfig`].
    ///
    /// # Errors
    /// Returns a `String` describing the error if `name` is empty, `egress_topic` is empty,
    /// or `ingress_topics` is empty.
    fn validate(&self) -> Result<(), String> {
        if let Some(name) = &self.name {
            if name.is_empty() {
                return Err("link name cannot be empty".to_string());
            }
        }
        if let Some(egress_topic) = &self.egress_topic {
            if egress_topic.is_empty() {
                return Err("egress_topic cannot be empty".to_string());
            }
        }
        if let Some(ingress_topics) = &self.ingress_topics {
            if ingress_topics.is_empty() {
                return Err(
                    "ingress_topics must contain at least one topic pattern".to_string(),
                );
            }
        }
        Ok(())
    }
}

/// Options for configuring a new link core.
#[derive(Builder)]
#[builder(pattern = "owned", setter(into))]
pub struct CoreConfig {
    /// Configuration for every link managed by this core.
    pub(crate) links: Vec<LinkConfig>,
    /// Directory the event journal persists unacked events under.
    pub(crate) journal_dir: PathBuf,
    /// Reconnect policy used by links after a failed or dropped transport connection.
    #[builder(default = "Box::new(ExponentialBackoffWithJitter::default())")]
    pub(crate) reconnect_policy: Box<dyn ReconnectPolicy>,
    /// Maximum time to wait for a graceful stop before forcing shutdown.
    #[builder(default = "Duration::from_secs(5)")]
    pub(crate) stop_deadline: Duration,
    /// Capacity of the dispatcher's ingress queue.
    #[builder(default = "256")]
    pub(crate) channel_capacity: usize,
    /// Source of monotonic time for every timer and state transition the dispatcher
    /// drives. Defaults to the real clock; tests substitute a fake to control timeouts
    /// deterministically without sleeping for real.
    #[builder(default = "Arc::new(SystemClock)")]
    pub(crate) clock: Arc<dyn Clock>,
}
