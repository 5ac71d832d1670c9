// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reconnect policies used by the link state machine when a transport connect attempt fails.

use std::fmt::Debug;
use std::time::Duration;

use rand::Rng;

/// A policy that determines how long to wait before the next reconnect attempt.
pub trait ReconnectPolicy: Debug + Send + Sync {
    /// Return the delay to wait before the next reconnect attempt, or `None` to stop
    /// retrying entirely.
    ///
    /// # Arguments
    /// * `prev_attempts` - The number of reconnect attempts already made since the last
    ///   successful connection.
    fn next_reconnect_delay(&self, prev_attempts: u32) -> Option<Duration>;
}

/// Exponential backoff with jitter, capped at a maximum wait duration.
///
/// The delay before attempt `n` is `min(base * 2^n, max_wait)`, multiplied by a uniform
/// random jitter factor in `[0.90, 1.0]` to avoid synchronized reconnect storms across
/// many links.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffWithJitter {
    /// Starting delay for the first reconnect attempt.
    pub base_delay: Duration,
    /// Maximum delay between reconnect attempts.
    pub max_wait: Duration,
    /// Maximum number of reconnect attempts before giving up, or `None` to retry forever.
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for ExponentialBackoffWithJitter {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_wait: Duration::from_secs(60),
            max_reconnect_attempts: None,
        }
    }
}

impl ReconnectPolicy for ExponentialBackoffWithJitter {
    fn next_reconnect_delay(&self, prev_attempts: u32) -> Option<Duration> {
        if let Some(max) = self.max_reconnect_attempts {
            if prev_attempts >= max {
                return None;
            }
        }
        Some(calculate_delay(
            prev_attempts,
            self.base_delay,
            self.max_wait,
        ))
    }
}

fn calculate_delay(prev_attempts: u32, base_delay: Duration, max_wait: Duration) -> Duration {
    let exponent = prev_attempts.min(32);
    let unjittered = base_delay
        .saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX))
        .min(max_wait);
    let jitter = rand::thread_rng().gen_range(0.90..=1.0);
    unjittered.mul_f64(jitter).min(max_wait)
}
