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

//! Lock-free counters a running writer updates on every batch, plus the
//! most recent error it saw. Cheap enough to touch on every send without
//! contending with the send path itself; a [`StatsSnapshot`] is the
//! point-in-time view handed to callers and monitoring code.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};

use facade::ReasonCode;

/// The most recent failure a writer observed, kept around for diagnostics
/// until the next failure overwrites it.
#[derive(Debug, Clone)]
pub struct LastError {
    /// The failure's reason code.
    pub reason: ReasonCode,
    /// Whether the writer considered the failure retryable.
    pub retryable: bool,
    /// A human-readable description of the failure.
    pub message: String,
}

/// A point-in-time copy of a writer's counters.
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    /// Total messages successfully sent over the writer's lifetime.
    pub messages_sent: u64,
    /// Messages successfully sent in the most recently completed batch.
    pub messages_sent_last_batch: u64,
    /// Messages returned to the queue from the most recently completed
    /// batch (partial failures, or the whole batch on a retryable error).
    pub messages_requeued_last_batch: u64,
    /// Size of the most recently completed batch, sent plus requeued.
    pub last_batch_size: u64,
    /// Number of send attempts that failed with `Throttling`.
    pub throttled_writes: u64,
    /// Number of times an `InvalidSequenceToken` error triggered a token
    /// refresh and retry.
    pub writer_race_retries: u64,
    /// Number of `writer_race_retries` that still failed after the retry
    /// budget was exhausted.
    pub unrecovered_writer_race_retries: u64,
    /// The most recent failure observed, if any.
    pub last_error: Option<LastError>,
}

/// Atomic counters tracking one writer's send activity, safe to read from
/// any thread while the writer's background task updates them.
#[derive(Debug, Default)]
pub struct WriterStatistics {
    messages_sent: AtomicU64,
    messages_sent_last_batch: AtomicU64,
    messages_requeued_last_batch: AtomicU64,
    last_batch_size: AtomicU64,
    throttled_writes: AtomicU64,
    writer_race_retries: AtomicU64,
    unrecovered_writer_race_retries: AtomicU64,
    last_error: Mutex<Option<LastError>>,
}

impl WriterStatistics {
    /// Creates a fresh, zeroed set of counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the outcome of one completed batch: `sent` messages
    /// succeeded, `requeued` were returned to the queue.
    pub fn record_batch(&self, sent: u64, requeued: u64) {
        let _ = self.messages_sent.fetch_add(sent, Ordering::Relaxed);
        self.messages_sent_last_batch.store(sent, Ordering::Relaxed);
        self.messages_requeued_last_batch.store(requeued, Ordering::Relaxed);
        self.last_batch_size.store(sent + requeued, Ordering::Relaxed);
    }

    /// Records one throttled send attempt.
    pub fn record_throttle(&self) {
        let _ = self.throttled_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one sequence-token race that triggered a refresh-and-retry.
    pub fn record_race_retry(&self) {
        let _ = self.writer_race_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one sequence-token race retry that still failed once the
    /// retry budget was exhausted.
    pub fn record_unrecovered_race_retry(&self) {
        let _ = self.unrecovered_writer_race_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the most recent failure, overwriting whatever was recorded
    /// before it.
    pub fn record_error(&self, error: LastError) {
        *self.last_error.lock().expect("stats mutex poisoned") = Some(error);
    }

    /// Takes a point-in-time snapshot of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_sent_last_batch: self.messages_sent_last_batch.load(Ordering::Relaxed),
            messages_requeued_last_batch: self.messages_requeued_last_batch.load(Ordering::Relaxed),
            last_batch_size: self.last_batch_size.load(Ordering::Relaxed),
            throttled_writes: self.throttled_writes.load(Ordering::Relaxed),
            writer_race_retries: self.writer_race_retries.load(Ordering::Relaxed),
            unrecovered_writer_race_retries: self.unrecovered_writer_race_retries.load(Ordering::Relaxed),
            last_error: self.last_error.lock().expect("stats mutex poisoned").clone(),
        }
    }
}
