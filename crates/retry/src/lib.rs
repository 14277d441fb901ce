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

//! A timed retry loop with linear or exponential backoff and a hard
//! deadline, used by facade polling loops (wait for a stream to become
//! active, wait for a created group to become visible) and by the writer's
//! own send retry.

use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use signal::StopReceiver;

/// Either a constant interval between attempts, or a doubling interval
/// capped at a maximum.
#[derive(Debug, Clone)]
pub enum BackoffPolicy {
    /// A fixed interval between every attempt.
    Linear {
        /// The interval between attempts.
        interval: Duration,
    },
    /// A doubling interval, capped.
    Exponential {
        /// The delay before the first retry.
        initial: Duration,
        /// The maximum delay between attempts.
        cap: Duration,
    },
}

impl BackoffPolicy {
    /// The delay to wait before attempt number `attempt` (1-based: the
    /// delay before the *first* retry is `delay_for_attempt(1)`).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            BackoffPolicy::Linear { interval } => *interval,
            BackoffPolicy::Exponential { initial, cap } => {
                let shift = attempt.saturating_sub(1).min(63);
                let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
                let millis = (initial.as_millis() as u64).saturating_mul(factor);
                Duration::from_millis(millis).min(*cap)
            }
        }
    }
}

/// An injectable sleep primitive so retry (and anything built on top of it)
/// never depends on wall-clock time in tests.
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Sleeps for `duration`, returning early (with `false`) if `stop`
    /// fires first.
    async fn sleep_or_stop(&self, duration: Duration, stop: &mut StopReceiver) -> bool;
}

/// The production [`Sleeper`]: a real, cancellable sleep.
#[derive(Debug, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep_or_stop(&self, duration: Duration, stop: &mut StopReceiver) -> bool {
        stop.sleep_or_stop(duration).await
    }
}

/// A test [`Sleeper`] that never actually waits; it records every requested
/// duration so tests can assert on the backoff schedule without incurring
/// it.
#[derive(Debug, Default)]
pub struct ManualSleeper {
    requested: Mutex<Vec<Duration>>,
}

impl ManualSleeper {
    /// Creates a new manual sleeper.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every duration requested so far, in call order.
    pub fn requested_durations(&self) -> Vec<Duration> {
        self.requested.lock().expect("manual sleeper mutex poisoned").clone()
    }
}

#[async_trait]
impl Sleeper for ManualSleeper {
    async fn sleep_or_stop(&self, duration: Duration, stop: &mut StopReceiver) -> bool {
        self.requested
            .lock()
            .expect("manual sleeper mutex poisoned")
            .push(duration);
        !stop.is_stopped()
    }
}

/// A timed retry loop.
#[derive(Clone)]
pub struct RetryManager {
    policy: BackoffPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryManager {
    /// Builds a retry manager with the given backoff policy and sleeper.
    pub fn new(policy: BackoffPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { policy, sleeper }
    }

    /// Calls `op` repeatedly until it returns `Ok(Some(value))`, `op`
    /// returns an error (propagated immediately, abandoning the retry), the
    /// deadline elapses, or `stop` fires.
    ///
    /// `op` is invoked with the 0-based attempt number. Returns
    /// `Ok(Some(value))` on success, `Ok(None)` on timeout or stop.
    pub async fn invoke<T, E, F, Fut>(&self, stop: &mut StopReceiver, timeout: Duration, mut op: F) -> Result<Option<T>, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        let deadline = Instant::now() + timeout;
        let mut attempt: u32 = 0;

        loop {
            if let Some(value) = op(attempt).await? {
                return Ok(Some(value));
            }

            attempt += 1;

            let now = Instant::now();
            if now >= deadline || stop.is_stopped() {
                return Ok(None);
            }

            let delay = self.policy.delay_for_attempt(attempt);
            let remaining = deadline.saturating_duration_since(now);
            let wait = delay.min(remaining);

            if !self.sleeper.sleep_or_stop(wait, stop).await {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::convert::Infallible;

    use signal::stop_signal;

    use super::*;

    #[test]
    fn linear_backoff_is_constant() {
        let policy = BackoffPolicy::Linear {
            interval: Duration::from_millis(250),
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(250));
    }

    #[test]
    fn exponential_backoff_doubles_then_caps() {
        let policy = BackoffPolicy::Exponential {
            initial: Duration::from_millis(250),
            cap: Duration::from_secs(5),
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt_without_sleeping() {
        let sleeper = Arc::new(ManualSleeper::new());
        let manager = RetryManager::new(
            BackoffPolicy::Linear {
                interval: Duration::from_millis(250),
            },
            sleeper.clone(),
        );
        let (_tx, mut stop) = stop_signal();

        let result: Result<Option<u32>, Infallible> = manager
            .invoke(&mut stop, Duration::from_secs(1), |_attempt| async { Ok(Some(42)) })
            .await;

        assert_eq!(result.unwrap(), Some(42));
        assert!(sleeper.requested_durations().is_empty());
    }

    #[tokio::test]
    async fn retries_until_success_using_the_backoff_schedule() {
        let sleeper = Arc::new(ManualSleeper::new());
        let manager = RetryManager::new(
            BackoffPolicy::Exponential {
                initial: Duration::from_millis(250),
                cap: Duration::from_secs(5),
            },
            sleeper.clone(),
        );
        let (_tx, mut stop) = stop_signal();

        let result: Result<Option<u32>, Infallible> = manager
            .invoke(&mut stop, Duration::from_secs(60), |attempt| async move {
                Ok(if attempt < 3 { None } else { Some(7) })
            })
            .await;

        assert_eq!(result.unwrap(), Some(7));
        assert_eq!(
            sleeper.requested_durations(),
            vec![Duration::from_millis(250), Duration::from_millis(500), Duration::from_millis(1000)]
        );
    }

    #[tokio::test]
    async fn propagates_operation_errors_immediately() {
        let sleeper = Arc::new(ManualSleeper::new());
        let manager = RetryManager::new(
            BackoffPolicy::Linear {
                interval: Duration::from_millis(10),
            },
            sleeper.clone(),
        );
        let (_tx, mut stop) = stop_signal();

        let result: Result<Option<u32>, &'static str> = manager
            .invoke(&mut stop, Duration::from_secs(1), |_attempt| async { Err("boom") })
            .await;

        assert_eq!(result, Err("boom"));
        assert!(sleeper.requested_durations().is_empty());
    }

    #[tokio::test]
    async fn timeout_returns_none() {
        let sleeper = Arc::new(ManualSleeper::new());
        let manager = RetryManager::new(
            BackoffPolicy::Linear {
                interval: Duration::from_secs(3600),
            },
            sleeper.clone(),
        );
        let (_tx, mut stop) = stop_signal();

        let result: Result<Option<u32>, Infallible> = manager
            .invoke(&mut stop, Duration::from_millis(0), |_attempt| async { Ok(None) })
            .await;

        assert_eq!(result.unwrap(), None);
    }

    #[tokio::test]
    async fn stop_signal_interrupts_retry() {
        let sleeper = Arc::new(ManualSleeper::new());
        let manager = RetryManager::new(
            BackoffPolicy::Linear {
                interval: Duration::from_millis(10),
            },
            sleeper.clone(),
        );
        let (tx, mut stop) = stop_signal();
        tx.trigger();

        let result: Result<Option<u32>, Infallible> = manager
            .invoke(&mut stop, Duration::from_secs(60), |_attempt| async { Ok(None) })
            .await;

        assert_eq!(result.unwrap(), None);
    }
}
