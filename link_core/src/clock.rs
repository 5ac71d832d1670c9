// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Monotonic clock and one-shot timer scheduling for the dispatcher.

use std::time::{Duration, Instant};

use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

/// Source of monotonic time, abstracted so tests can substitute a controllable clock.
pub trait Clock: Send + Sync {
    /// Return the current instant.
    fn now(&self) -> Instant;
}

/// A [`Clock`] backed by tokio's monotonic clock.
///
/// Deliberately goes through `tokio::time::Instant::now()` rather than
/// `std::time::Instant::now()`: under `#[tokio::test(start_paused = true)]` the former
/// tracks the runtime's mockable clock (advanced by `tokio::time::advance`) while the
/// latter always reflects real wall-clock time. Every `Instant` the dispatcher hands to
/// the link FSM and ack/retransmit engine flows through this type, so a paused-time test
/// can deterministically drive silence and ack timeouts without sleeping for real.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into()
    }
}

/// A handle to a scheduled one-shot timer. Dropping or cancelling it prevents the timer
/// event from being delivered.
pub struct TimerHandle {
    cancel: CancellationToken,
}

impl TimerHandle {
    /// Cancel the timer. A no-op if it already fired.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Schedules a one-shot timer that, after `delay`, sends `event` on `sender` unless
/// cancelled first via the returned [`TimerHandle`].
///
/// This never blocks the caller: the wait happens on a spawned task, matching the
/// dispatcher's rule that handlers never suspend.
pub fn schedule_once<T>(delay: Duration, event: T, sender: Sender<T>) -> TimerHandle
where
    T: Send + 'static,
{
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            () = task_cancel.cancelled() => {}
            () = tokio::time::sleep(delay) => {
                // Ignore send errors: the dispatcher has shut down.
                let _ = sender.send(event).await;
            }
        }
    });
    TimerHandle { cancel }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let (tx, mut rx) = mpsc::channel(1);
        let _handle = schedule_once(Duration::from_millis(50), "fired", tx);
        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(rx.recv().await, Some("fired"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_delivery() {
        let (tx, mut rx) = mpsc::channel(1);
        let handle = schedule_once(Duration::from_millis(50), "fired", tx.clone());
        handle.cancel();
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(rx.try_recv(), Err(mpsc::error::TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn system_clock_tracks_the_paused_runtime_clock() {
        let clock = SystemClock;
        let before = clock.now();
        tokio::time::advance(Duration::from_secs(60)).await;
        let after = clock.now();
        assert_eq!(after - before, Duration::from_secs(60));
    }
}
