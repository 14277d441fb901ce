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

//! Coordinates an orderly stop across every writer registered with a shared
//! [`TaskManager`]: a single [`StopSender::trigger`] call fans out through
//! each writer's [`StopReceiver`], and [`ShutdownCoordinator::wait_until_stopped`]
//! blocks until every registered task has drained and cleaned up (or a
//! deadline passes).

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use signal::{stop_signal, StopReceiver, StopSender};
use task::TaskManager;

/// Errors raised while coordinating shutdown.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A process-wide Ctrl+C / SIGTERM hook could not be installed, usually
    /// because one was already installed (by this coordinator or anyone
    /// else in the process).
    #[error("failed to install shutdown hook: {0}")]
    HookInstall(#[from] ctrlc::Error),
}

/// Drives a coordinated stop across every writer sharing this coordinator's
/// [`TaskManager`].
#[derive(Clone)]
pub struct ShutdownCoordinator {
    stop_tx: StopSender,
    task_manager: TaskManager,
}

impl ShutdownCoordinator {
    /// Builds a coordinator around a task manager writers are registered
    /// with, and the stop-signal sender that will be handed to each writer
    /// at construction time.
    pub fn new(task_manager: TaskManager) -> (Self, StopReceiver) {
        let (stop_tx, stop_rx) = stop_signal();
        (Self { stop_tx, task_manager }, stop_rx)
    }

    /// Requests a stop. Idempotent; safe to call from any thread, including
    /// a signal handler.
    pub fn stop(&self) {
        self.stop_tx.trigger();
    }

    /// Returns `true` if `stop` has already been called.
    pub fn is_stopping(&self) -> bool {
        self.stop_tx.is_stopped()
    }

    /// Waits for every registered writer to finish draining and shut down,
    /// up to `timeout`. Returns `true` if they all stopped in time, `false`
    /// on timeout (the writers keep running in the background regardless).
    pub async fn wait_until_stopped(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.task_manager.join()).await.is_ok()
    }

    /// Installs a process-wide Ctrl+C / SIGTERM handler that calls
    /// [`ShutdownCoordinator::stop`]. May be called at most once per
    /// process; a second call (from this or any other coordinator) returns
    /// [`Error::HookInstall`].
    ///
    /// `ctrlc` exposes no API to remove a registered handler, so the OS-level
    /// registration itself outlives the returned [`ShutdownHookGuard`]. What
    /// the guard controls is whether that handler still does anything: while
    /// held, a delivered signal calls `stop()`; once dropped, the same
    /// signal is observed and logged but no longer triggers a stop. Drop the
    /// guard once shutdown has already been driven through the API, so a
    /// signal arriving afterward (e.g. during final process teardown) is a
    /// no-op instead of a redundant `stop()`.
    pub fn install_shutdown_hook(&self) -> Result<ShutdownHookGuard, Error> {
        let stop_tx = self.stop_tx.clone();
        let active = Arc::new(AtomicBool::new(true));
        let handler_active = active.clone();
        ctrlc::set_handler(move || {
            if handler_active.load(Ordering::Acquire) {
                tracing::info!("shutdown signal received");
                stop_tx.trigger();
            } else {
                tracing::debug!("shutdown signal received after hook was unregistered, ignoring");
            }
        })?;
        Ok(ShutdownHookGuard { active })
    }
}

/// Returned by [`ShutdownCoordinator::install_shutdown_hook`]. Dropping it
/// makes the process-wide signal handler inert: `ctrlc` has no API to
/// actually remove the handler, so this is the closest equivalent to
/// unregistering it.
pub struct ShutdownHookGuard {
    active: Arc<AtomicBool>,
}

impl Drop for ShutdownHookGuard {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use task::{labels::TaskLabels, TaskManager};

    use super::*;

    #[tokio::test]
    async fn stop_is_idempotent_and_observable() {
        let (coordinator, _rx) = ShutdownCoordinator::new(TaskManager::new());
        assert!(!coordinator.is_stopping());
        coordinator.stop();
        coordinator.stop();
        assert!(coordinator.is_stopping());
    }

    #[tokio::test]
    async fn wait_until_stopped_returns_once_every_task_finishes() {
        let mut task_manager = TaskManager::new();
        let (coordinator, mut stop_rx) = ShutdownCoordinator::new(task_manager.clone());

        let join_handle = tokio::spawn(async move {
            stop_rx.wait().await;
            TaskManager::no_task_cleaner(Default::default(), TaskLabels::new("test", "t", "src"))
        });
        task_manager.register(join_handle, &TaskLabels::new("test", "t", "src"));

        coordinator.stop();
        let finished = coordinator.wait_until_stopped(Duration::from_secs(1)).await;
        assert!(finished);
    }

    #[test]
    fn dropping_the_shutdown_hook_guard_marks_it_inert() {
        // Exercises the guard's Drop behavior directly rather than through
        // `install_shutdown_hook`: `ctrlc::set_handler` may only succeed
        // once per process, so a test that called it would break every
        // other test sharing the process.
        let active = Arc::new(AtomicBool::new(true));
        let guard = ShutdownHookGuard { active: active.clone() };
        assert!(active.load(Ordering::Acquire));
        drop(guard);
        assert!(!active.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn wait_until_stopped_times_out_on_a_stuck_task() {
        let mut task_manager = TaskManager::new();
        let (coordinator, _rx) = ShutdownCoordinator::new(task_manager.clone());

        let join_handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            TaskManager::no_task_cleaner(Default::default(), TaskLabels::new("test", "stuck", "src"))
        });
        task_manager.register(join_handle, &TaskLabels::new("test", "stuck", "src"));

        let finished = coordinator.wait_until_stopped(Duration::from_millis(50)).await;
        assert!(!finished);
    }
}
