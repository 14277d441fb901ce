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

//! The log writer: a per-destination background task that pulls batches
//! from a [`MessageQueue`], sends them through a [`DestinationAdapter`],
//! and applies the shared outcome policy (backoff retry, sequence-token
//! refresh, destination recreation, partial-failure requeue) so the three
//! concrete destinations only differ in [`adapter`].

pub mod adapter;
pub mod log_group;
pub mod partitioned_stream;
pub mod state;
pub mod topic;

use std::{collections::HashSet, sync::Arc, time::Duration};

use queue::{DiscardAction, LogMessage, MessageQueue};
use retry::{BackoffPolicy, Sleeper};
use signal::{stop_signal, StopReceiver, StopSender};
use stats::{LastError, StatsSnapshot, WriterStatistics};
use task::{
    labels::{ProcessLabels, TaskLabels},
    TaskManager,
};
use tokio::{runtime::Handle, sync::watch};

use crate::adapter::{classify, DestinationAdapter, ErrorCategory, SendOutcome};
pub use crate::state::WriterState;

/// How many times a single batch is retried against `Throttling`,
/// `Aborted`, or `InvalidSequenceToken` before it is requeued and the
/// writer moves on to the next batch.
const MAX_SEND_ATTEMPTS: u32 = 4;

/// Fixed, per-writer construction parameters: the batch cap, the queue's
/// discard policy, and the retry backoff schedule.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// The destination's batch size/count caps.
    pub batch_policy: batch::BatchPolicy,
    /// The queue's discard threshold (message count).
    pub discard_threshold: usize,
    /// What the queue does when `discard_threshold` would be exceeded.
    pub discard_action: DiscardAction,
    /// Whether oversize messages are truncated (`true`) or dropped
    /// (`false`).
    pub truncate_oversize: bool,
    /// How long a single `dequeue_batch` call waits for the first message.
    pub max_wait: Duration,
    /// The backoff schedule for batch send retries.
    pub backoff: BackoffPolicy,
    /// When `true`, `add_message` drives a single process-loop iteration
    /// inline on the caller's thread instead of enqueueing for a
    /// background worker. `max_wait` is forced to zero in this mode: the
    /// caller only ever sees messages already in the queue, never waits
    /// for more to arrive.
    pub synchronous: bool,
    /// When `true`, logs a DEBUG event before and after every batch send
    /// attempt.
    pub enable_batch_logging: bool,
}

/// A cheaply clonable view onto a running writer: enqueue messages, read
/// its statistics and lifecycle state, and request a stop.
#[derive(Clone)]
pub struct WriterHandle {
    queue: Arc<MessageQueue>,
    stats: Arc<WriterStatistics>,
    state: watch::Receiver<WriterState>,
    stop: StopSender,
    /// `Some` for a synchronous writer: no background task was spawned, so
    /// `add_message`/`stop` drive the worker inline instead.
    inline: Option<Arc<tokio::sync::Mutex<Worker>>>,
}

impl WriterHandle {
    /// Enqueues a message for this writer to send. Never blocks the queue
    /// itself, but in synchronous mode this drives one inline send
    /// attempt on the caller's thread before returning.
    pub fn add_message(&self, message: LogMessage) {
        self.queue.enqueue(message);
        if let Some(worker) = self.inline.clone() {
            tokio::task::block_in_place(move || {
                Handle::current().block_on(async move {
                    let mut worker = worker.lock().await;
                    let (_stop_tx, mut stop) = stop_signal();
                    worker.process_once(&mut stop).await;
                });
            });
        }
    }

    /// The number of messages currently queued and not yet sent.
    pub fn queue_size(&self) -> usize {
        self.queue.size()
    }

    /// A point-in-time snapshot of this writer's counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// This writer's current lifecycle phase.
    pub fn state(&self) -> WriterState {
        *self.state.borrow()
    }

    /// Requests that the writer stop: it finishes draining the queue under
    /// its current batch, then shuts down. Idempotent. For a synchronous
    /// writer this runs the shutdown inline, on the caller's thread.
    pub fn stop(&self) {
        let already_stopped = self.stop.is_stopped();
        self.stop.trigger();
        if !already_stopped {
            if let Some(worker) = self.inline.clone() {
                tokio::task::block_in_place(move || {
                    Handle::current().block_on(async move {
                        let mut worker = worker.lock().await;
                        worker.shutdown_phase().await;
                    });
                });
            }
        }
    }
}

/// Builds and spawns a writer as a background task registered with
/// `task_manager`, returning a handle to interact with it.
pub struct Writer;

impl Writer {
    /// Spawns a writer over `adapter`, named `name` for task-manager
    /// bookkeeping.
    pub fn spawn(
        name: impl Into<String>,
        adapter: Box<dyn DestinationAdapter>,
        config: WriterConfig,
        sleeper: Arc<dyn Sleeper>,
        task_manager: &mut TaskManager,
    ) -> WriterHandle {
        let queue = Arc::new(MessageQueue::new(
            config.discard_threshold,
            config.discard_action,
            config.batch_policy.max_message_bytes,
            config.truncate_oversize,
        ));
        let stats = Arc::new(WriterStatistics::new());
        let (state_tx, state_rx) = watch::channel(WriterState::New);
        let (stop_tx, stop_rx) = stop_signal();

        let name = name.into();
        let mut worker = Worker {
            adapter,
            queue: queue.clone(),
            stats: stats.clone(),
            policy: config.batch_policy,
            backoff: config.backoff,
            max_wait: if config.synchronous { Duration::ZERO } else { config.max_wait },
            sleeper,
            state_tx,
            name: name.clone(),
            enable_batch_logging: config.enable_batch_logging,
        };

        if config.synchronous {
            // No background task: initialize right here, on the caller's
            // thread, so the writer is already RUNNING (or INIT_FAILED) by
            // the time `spawn` returns.
            tokio::task::block_in_place(|| Handle::current().block_on(worker.initialize_phase()));
            return WriterHandle {
                queue,
                stats,
                state: state_rx,
                stop: stop_tx,
                inline: Some(Arc::new(tokio::sync::Mutex::new(worker))),
            };
        }

        let handle = WriterHandle {
            queue,
            stats,
            state: state_rx,
            stop: stop_tx,
            inline: None,
        };

        let join_handle = tokio::spawn(worker.run(stop_rx));
        task_manager.register(join_handle, &TaskLabels::new("writer", &name, "log-shipper"));

        handle
    }
}

struct Worker {
    adapter: Box<dyn DestinationAdapter>,
    queue: Arc<MessageQueue>,
    stats: Arc<WriterStatistics>,
    policy: batch::BatchPolicy,
    backoff: BackoffPolicy,
    max_wait: Duration,
    sleeper: Arc<dyn Sleeper>,
    state_tx: watch::Sender<WriterState>,
    name: String,
    enable_batch_logging: bool,
}

impl Worker {
    /// Runs the `INITIALIZING` step, transitioning to `RUNNING` on success
    /// or `INIT_FAILED` (with the queue's discard threshold dropped to
    /// zero, so a permanently broken writer drains everything) on failure.
    /// Shared by the background `run` loop and a synchronous writer's
    /// inline `spawn`.
    async fn initialize_phase(&mut self) -> bool {
        let _ = self.state_tx.send(WriterState::Initializing);

        if let Err(err) = self.adapter.initialize().await {
            tracing::error!(writer = %self.name, error = %err, "writer initialization failed");
            self.stats.record_error(to_last_error(&err));
            self.queue.set_discard_threshold(0);
            let _ = self.state_tx.send(WriterState::InitFailed);
            return false;
        }

        let _ = self.state_tx.send(WriterState::Running);
        tracing::info!(writer = %self.name, "writer running");
        true
    }

    /// Pulls and sends a single batch if one is ready, without waiting for
    /// more messages to arrive. Used by a synchronous writer's
    /// `add_message`.
    async fn process_once(&mut self, stop: &mut StopReceiver) {
        let batch = batch::build_batch(&self.queue, &self.policy, Duration::ZERO, stop).await;
        if !batch.is_empty() {
            self.send_batch(batch, stop).await;
        }
    }

    /// Runs the `STOPPING`/`STOPPED` transition and releases the adapter.
    /// Shared by the background `run` loop and a synchronous writer's
    /// inline `stop`.
    async fn shutdown_phase(&mut self) {
        let _ = self.state_tx.send(WriterState::Stopping);
        self.adapter.shutdown().await;
        let _ = self.state_tx.send(WriterState::Stopped);
        tracing::info!(writer = %self.name, "writer stopped");
    }

    async fn run(mut self, mut stop: StopReceiver) -> Box<dyn task::TaskCleaner> {
        if !self.initialize_phase().await {
            return self.cleaner("init-failed");
        }

        loop {
            if stop.is_stopped() && self.queue.size() == 0 {
                break;
            }

            let batch = batch::build_batch(&self.queue, &self.policy, self.max_wait, &mut stop).await;
            if batch.is_empty() {
                if stop.is_stopped() {
                    break;
                }
                continue;
            }

            self.send_batch(batch, &mut stop).await;
        }

        self.shutdown_phase().await;
        self.cleaner("stopped")
    }

    fn cleaner(&self, phase: &str) -> Box<dyn task::TaskCleaner> {
        TaskManager::no_task_cleaner(ProcessLabels::default(), TaskLabels::new("writer", &self.name, phase))
    }

    async fn send_batch(&mut self, batch: Vec<LogMessage>, stop: &mut StopReceiver) {
        let total = batch.len() as u64;
        let mut attempt = 0u32;
        let mut current = batch;

        loop {
            if self.enable_batch_logging {
                tracing::debug!(writer = %self.name, count = current.len(), attempt, "sending batch");
            }
            let outcome = self.adapter.send(&current).await;
            if self.enable_batch_logging {
                tracing::debug!(writer = %self.name, ok = outcome.is_ok(), "batch send finished");
            }
            match outcome {
                Ok(SendOutcome::Accepted) => {
                    self.stats.record_batch(current.len() as u64, 0);
                    return;
                }
                Ok(SendOutcome::PartiallyAccepted { failed_indices }) => {
                    let mut failed: HashSet<usize> = failed_indices.into_iter().collect();
                    let failed_count = failed.len() as u64;
                    let mut requeue = Vec::with_capacity(failed.len());
                    for (index, message) in current.into_iter().enumerate() {
                        if failed.remove(&index) {
                            requeue.push(message);
                        }
                    }
                    self.stats.record_batch(total - failed_count, failed_count);
                    self.queue.requeue_head(requeue);
                    return;
                }
                Err(err) => match classify(err.reason) {
                    ErrorCategory::Backoff => {
                        if err.reason == facade::ReasonCode::Throttling {
                            self.stats.record_throttle();
                        }
                        attempt += 1;
                        if attempt >= MAX_SEND_ATTEMPTS || stop.is_stopped() {
                            self.give_up(current, total, err);
                            return;
                        }
                        let delay = self.backoff.delay_for_attempt(attempt);
                        if !self.sleeper.sleep_or_stop(delay, stop).await {
                            self.give_up(current, total, err);
                            return;
                        }
                    }
                    ErrorCategory::RefreshCursor => {
                        self.stats.record_race_retry();
                        attempt += 1;
                        if attempt >= MAX_SEND_ATTEMPTS {
                            self.stats.record_unrecovered_race_retry();
                            self.give_up(current, total, err);
                            return;
                        }
                        if let Err(refresh_err) = self.adapter.refresh_cursor().await {
                            self.give_up(current, total, refresh_err);
                            return;
                        }
                    }
                    ErrorCategory::TreatAsSuccess => {
                        self.stats.record_batch(current.len() as u64, 0);
                        return;
                    }
                    ErrorCategory::Recreate => {
                        tracing::warn!(writer = %self.name, error = %err, "destination missing; recreating");
                        if let Err(recreate_err) = self.adapter.recreate().await {
                            tracing::error!(writer = %self.name, error = %recreate_err, "failed to recreate destination");
                        }
                        self.give_up(current, total, err);
                        return;
                    }
                    ErrorCategory::RequeueAndContinue => {
                        self.give_up(current, total, err);
                        return;
                    }
                    ErrorCategory::Fatal => {
                        tracing::error!(writer = %self.name, error = %err, "fatal facade error while sending a batch");
                        self.give_up(current, total, err);
                        return;
                    }
                },
            }
        }
    }

    fn give_up(&self, batch: Vec<LogMessage>, total: u64, err: facade::FacadeError) {
        self.stats.record_error(to_last_error(&err));
        self.stats.record_batch(0, total);
        self.queue.requeue_head(batch);
    }
}

fn to_last_error(err: &facade::FacadeError) -> LastError {
    LastError {
        reason: err.reason,
        retryable: err.retryable,
        message: err.message.clone(),
    }
}
