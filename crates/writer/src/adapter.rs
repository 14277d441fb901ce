//! The per-destination seam: everything that differs between the
//! log-group, partitioned-stream, and topic writers is captured behind
//! [`DestinationAdapter`], so the batch-send loop in [`crate::Writer`] is
//! written once and shared by all three.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use async_trait::async_trait;
use facade::{FacadeError, ReasonCode};
use queue::LogMessage;
use retry::{BackoffPolicy, RetryManager, Sleeper};
use signal::stop_signal;

/// What a successful [`DestinationAdapter::send`] accomplished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Every message in the batch was accepted.
    Accepted,
    /// Some messages were accepted; the given indices (into the batch that
    /// was sent) must be requeued.
    PartiallyAccepted {
        /// Indices, into the sent batch, that were not acknowledged.
        failed_indices: Vec<usize>,
    },
}

/// How the writer's send loop should react to a [`FacadeError`], derived
/// from its [`ReasonCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Back off and retry the same batch, up to the attempt budget.
    Backoff,
    /// Refresh the cached cursor (sequence token) and retry, up to the
    /// attempt budget.
    RefreshCursor,
    /// Not actually an error: the batch was already accepted by a prior,
    /// seemingly-failed attempt.
    TreatAsSuccess,
    /// The destination itself is gone; recreate it, then requeue the whole
    /// batch.
    Recreate,
    /// Requeue the whole batch and continue; no special recovery.
    RequeueAndContinue,
    /// Unrecoverable; the writer should stop.
    Fatal,
}

/// Classifies a [`FacadeError`] by its reason code.
pub fn classify(reason: ReasonCode) -> ErrorCategory {
    match reason {
        ReasonCode::Throttling | ReasonCode::Aborted => ErrorCategory::Backoff,
        ReasonCode::InvalidSequenceToken => ErrorCategory::RefreshCursor,
        ReasonCode::AlreadyProcessed => ErrorCategory::TreatAsSuccess,
        ReasonCode::MissingLogGroup | ReasonCode::MissingLogStream => ErrorCategory::Recreate,
        ReasonCode::InvalidConfiguration => ErrorCategory::Fatal,
        ReasonCode::UnexpectedException => ErrorCategory::RequeueAndContinue,
        _ => ErrorCategory::RequeueAndContinue,
    }
}

/// Interval/timeout pair for a create-style call (create a group, stream,
/// or topic): up to 12 attempts at a 5s interval.
pub(crate) const CREATE_RETRY: (Duration, Duration) = (Duration::from_secs(5), Duration::from_secs(60));

/// Interval/timeout pair for a describe-style call (find/list, used to
/// check whether something already exists before creating it): up to 300
/// attempts at a 100ms interval.
pub(crate) const DESCRIBE_RETRY: (Duration, Duration) = (Duration::from_millis(100), Duration::from_secs(30));

/// Runs `op` against a throttle-tolerant retry loop: a `Throttling` error
/// is retried up to `interval`/`timeout`'s attempt budget, anything else is
/// a fatal, immediate failure. Used by the log-group and topic adapters'
/// `initialize`/`recreate` paths, whose create/describe calls must ride
/// out startup throttling instead of failing the writer permanently.
pub(crate) async fn retry_on_throttling<T, S, F>(
    sleeper: Arc<dyn Sleeper>,
    (interval, timeout): (Duration, Duration),
    state: &mut S,
    mut op: F,
) -> Result<T, FacadeError>
where
    S: ?Sized,
    F: for<'a> FnMut(&'a mut S) -> Pin<Box<dyn Future<Output = Result<T, FacadeError>> + Send + 'a>>,
{
    let manager = RetryManager::new(BackoffPolicy::Linear { interval }, sleeper);
    let (_stop_tx, mut stop) = stop_signal();
    // A private, never-triggered stop signal: these retries run during
    // `initialize`/`recreate`, before the writer is in a state where its
    // own shutdown signal should interrupt them.
    manager
        .invoke(&mut stop, timeout, |_attempt| {
            let fut = op(state);
            async move {
                match fut.await {
                    Ok(value) => Ok(Some(value)),
                    Err(err) if err.reason == ReasonCode::Throttling => Ok(None),
                    Err(err) => Err(err),
                }
            }
        })
        .await?
        .ok_or_else(|| FacadeError::throttling("timed out waiting for throttling to clear"))
}

/// A stand-in adapter for a destination whose configuration failed
/// validation. `initialize` always fails with [`FacadeError::invalid_configuration`]
/// (the reason given is the validation failure), driving the writer straight
/// to `INIT_FAILED` with its discard threshold forced to zero; `send`/`recreate`
/// are never reached because a writer that never leaves `INIT_FAILED` never
/// runs its send loop.
pub struct InvalidConfigAdapter {
    reason: String,
}

impl InvalidConfigAdapter {
    /// Builds an adapter that always fails initialization with `reason`.
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

#[async_trait]
impl DestinationAdapter for InvalidConfigAdapter {
    async fn initialize(&mut self) -> Result<(), FacadeError> {
        Err(FacadeError::invalid_configuration(self.reason.clone()))
    }

    async fn send(&mut self, _batch: &[LogMessage]) -> Result<SendOutcome, FacadeError> {
        unreachable!("a writer stuck in INIT_FAILED never reaches the send loop")
    }

    async fn recreate(&mut self) -> Result<(), FacadeError> {
        Err(FacadeError::invalid_configuration(self.reason.clone()))
    }

    async fn shutdown(&mut self) {}
}

/// The narrow contract the shared send loop needs from a concrete
/// destination (log group, partitioned stream, or topic).
#[async_trait]
pub trait DestinationAdapter: Send {
    /// Ensures the destination exists (creating it, and setting its
    /// retention policy, if absent) and any cursor state is primed. Called
    /// once during `INITIALIZING`.
    async fn initialize(&mut self) -> Result<(), FacadeError>;

    /// Sends `batch`, already sorted and capped by the batch builder.
    async fn send(&mut self, batch: &[LogMessage]) -> Result<SendOutcome, FacadeError>;

    /// Refreshes whatever cursor state `send` depends on (the cached
    /// sequence token, for the log-group destination). A no-op for
    /// destinations with no such cursor.
    async fn refresh_cursor(&mut self) -> Result<(), FacadeError> {
        Ok(())
    }

    /// Recreates the destination after it was found to be missing.
    async fn recreate(&mut self) -> Result<(), FacadeError>;

    /// Releases the underlying facade's resources.
    async fn shutdown(&mut self);
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn invalid_config_adapter_always_fails_initialization_with_its_reason() {
        let mut adapter = InvalidConfigAdapter::new("invalid log group name");
        let err = adapter.initialize().await.expect_err("a misconfigured destination never initializes");
        assert_eq!(err.reason, ReasonCode::InvalidConfiguration);
        assert!(err.message.contains("invalid log group name"));
    }
}
