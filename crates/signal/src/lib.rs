#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! A cooperative stop signal shared between the shutdown coordinator, the
//! retry manager, and a writer's process loop.
//!
//! The queue each writer owns is a discard-policy bounded buffer, not a
//! channel, so the timed wait for new messages lives on the queue itself.
//! What every long-lived wait in this workspace still needs is a way to be
//! woken up early when `stop()` is called instead of running out its full
//! timeout. `StopSignal` is that single mechanism: a thin wrapper around a
//! `tokio::sync::watch<bool>` pair.

use std::time::Duration;

use tokio::sync::watch;

/// The sending half of a stop signal. Owned by whoever decides when a writer
/// should stop (the shutdown coordinator, or a test harness).
#[derive(Debug, Clone)]
pub struct StopSender {
    sender: watch::Sender<bool>,
}

/// The receiving half of a stop signal. Cloned freely and handed to the
/// retry manager, the process loop, and anything else that suspends and
/// must be cancellable.
#[derive(Debug, Clone)]
pub struct StopReceiver {
    receiver: watch::Receiver<bool>,
}

/// Creates a new, not-yet-triggered stop signal pair.
pub fn stop_signal() -> (StopSender, StopReceiver) {
    let (sender, receiver) = watch::channel(false);
    (StopSender { sender }, StopReceiver { receiver })
}

impl StopSender {
    /// Triggers the stop signal. Idempotent: triggering twice is a no-op the
    /// second time.
    pub fn trigger(&self) {
        if !*self.sender.borrow() {
            tracing::debug!("stop signal triggered");
        }
        // A watch channel coalesces identical values, so sending `true`
        // again when already stopped does not wake anyone spuriously.
        let _ = self.sender.send(true);
    }

    /// Returns `true` if `trigger` has been called.
    pub fn is_stopped(&self) -> bool {
        *self.sender.borrow()
    }
}

impl StopReceiver {
    /// Returns `true` if the signal has already been triggered.
    pub fn is_stopped(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Waits until the signal is triggered. Returns immediately if it
    /// already has been.
    pub async fn wait(&mut self) {
        if self.is_stopped() {
            return;
        }
        while self.receiver.changed().await.is_ok() {
            if *self.receiver.borrow() {
                return;
            }
        }
    }

    /// Sleeps for `duration`, or returns early if the stop signal fires
    /// first. Returns `true` if the sleep ran to completion, `false` if it
    /// was interrupted by a stop signal.
    pub async fn sleep_or_stop(&mut self, duration: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(duration) => true,
            () = self.wait() => false,
        }
    }
}
