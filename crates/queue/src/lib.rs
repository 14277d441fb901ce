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

//! A bounded, thread-safe FIFO queue of log messages with a configurable
//! discard policy.
//!
//! Producers call [`MessageQueue::enqueue`] from arbitrary threads; it never
//! blocks. A single writer task calls [`MessageQueue::dequeue_batch`] to pull
//! a service-sized batch, and [`MessageQueue::requeue_head`] to put a failed
//! batch back in front of everything else.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};

use signal::StopReceiver;
use tokio::sync::Notify;

/// An immutable log event: an epoch-millisecond timestamp and a UTF-8
/// payload. Created by the host application; never mutated after
/// construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    timestamp_ms: i64,
    payload: String,
}

impl LogMessage {
    /// Creates a new log message.
    pub fn new(timestamp_ms: i64, payload: impl Into<String>) -> Self {
        Self {
            timestamp_ms,
            payload: payload.into(),
        }
    }

    /// The epoch-millisecond timestamp of this message.
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    /// The message payload.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// The UTF-8 byte length of the payload, which is how size is defined
    /// for every capacity and batching computation in this workspace.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// What happens to the queue when an `enqueue` would push its count over the
/// discard threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardAction {
    /// Drop the oldest message in the queue, keeping the incoming one.
    Oldest,
    /// Drop the incoming message, keeping the queue as-is.
    Newest,
    /// Never discard; the queue grows without bound.
    None,
}

struct Inner {
    queue: VecDeque<LogMessage>,
}

/// A bounded FIFO queue of [`LogMessage`] with a discard policy, shared
/// between arbitrary producer threads and a single writer task.
pub struct MessageQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    discard_threshold: AtomicUsize,
    discard_action: Mutex<DiscardAction>,
    max_message_bytes: usize,
    truncate_oversize: bool,
}

impl MessageQueue {
    /// Creates a new queue.
    ///
    /// `max_message_bytes` and `truncate_oversize` come from the
    /// destination's batch policy and are fixed for the lifetime of the
    /// queue; `discard_threshold` and `discard_action` may be changed later
    /// via [`MessageQueue::set_discard_threshold`] and
    /// [`MessageQueue::set_discard_action`].
    pub fn new(
        discard_threshold: usize,
        discard_action: DiscardAction,
        max_message_bytes: usize,
        truncate_oversize: bool,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner { queue: VecDeque::new() }),
            notify: Notify::new(),
            discard_threshold: AtomicUsize::new(discard_threshold),
            discard_action: Mutex::new(discard_action),
            max_message_bytes,
            truncate_oversize,
        }
    }

    /// Inserts `msg` at the tail, applying the discard policy if the queue
    /// would exceed its threshold. Never blocks.
    ///
    /// Empty messages are silently dropped with a warning and never enter
    /// the queue. Messages larger than the per-service maximum are either
    /// truncated (if configured) or dropped with a warning.
    pub fn enqueue(&self, msg: LogMessage) {
        if msg.payload.is_empty() {
            tracing::warn!("dropping empty log message");
            return;
        }

        let Some(msg) = self.admit_size(msg) else {
            return;
        };

        let action = *self.discard_action.lock().expect("discard_action mutex poisoned");
        let threshold = self.discard_threshold.load(Ordering::Relaxed);

        let mut inner = self.inner.lock().expect("queue mutex poisoned");

        if action == DiscardAction::Newest && inner.queue.len() >= threshold {
            tracing::warn!(threshold, "discarding incoming message (queue at capacity)");
            return;
        }

        inner.queue.push_back(msg);

        if inner.queue.len() > threshold {
            match action {
                DiscardAction::Oldest => {
                    let _ = inner.queue.pop_front();
                    tracing::warn!(threshold, "discarding oldest message (queue over capacity)");
                }
                DiscardAction::Newest => unreachable!("newest discards before insertion"),
                DiscardAction::None => {}
            }
        }

        drop(inner);
        self.notify.notify_one();
    }

    fn admit_size(&self, msg: LogMessage) -> Option<LogMessage> {
        if msg.size() <= self.max_message_bytes {
            return Some(msg);
        }

        if self.truncate_oversize {
            let truncated = truncate_utf8(&msg.payload, self.max_message_bytes);
            tracing::warn!(
                original_bytes = msg.size(),
                max_bytes = self.max_message_bytes,
                "truncating oversize log message"
            );
            Some(LogMessage::new(msg.timestamp_ms, truncated))
        } else {
            tracing::warn!(
                size_bytes = msg.size(),
                max_bytes = self.max_message_bytes,
                "dropping oversize log message"
            );
            None
        }
    }

    /// Waits up to `max_wait` for at least one message, then pulls
    /// additional messages while `count < max_count` and
    /// `total_bytes + msg_size + overhead_per_msg <= max_bytes`.
    ///
    /// Returns an empty batch if `max_wait` elapses with nothing queued, or
    /// if `stop` fires first.
    pub async fn dequeue_batch(
        &self,
        max_wait: Duration,
        max_count: usize,
        max_bytes: usize,
        overhead_per_msg: usize,
        stop: &mut StopReceiver,
    ) -> Vec<LogMessage> {
        if stop.is_stopped() {
            return Vec::new();
        }

        let deadline = Instant::now() + max_wait;

        loop {
            let notified = self.notify.notified();

            {
                let inner = self.inner.lock().expect("queue mutex poisoned");
                if !inner.queue.is_empty() {
                    break;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Vec::new();
            }
            let remaining = deadline - now;

            tokio::pin!(notified);
            tokio::select! {
                () = &mut notified => continue,
                () = tokio::time::sleep(remaining) => return Vec::new(),
                () = stop.wait() => return Vec::new(),
            }
        }

        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        let mut batch = Vec::new();
        let mut total_bytes = 0usize;

        while batch.len() < max_count {
            let Some(front) = inner.queue.front() else { break };
            let projected = total_bytes + front.size() + overhead_per_msg;
            if projected > max_bytes {
                break;
            }
            total_bytes = projected;
            batch.push(inner.queue.pop_front().expect("front just peeked"));
        }

        tracing::debug!(batch_len = batch.len(), total_bytes, "dequeued batch");
        batch
    }

    /// Restores `batch` to the front of the queue, in its original order,
    /// without counting against the discard threshold (these messages were
    /// already accepted once).
    pub fn requeue_head(&self, batch: Vec<LogMessage>) {
        if batch.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        for msg in batch.into_iter().rev() {
            inner.queue.push_front(msg);
        }
        drop(inner);
        self.notify.notify_one();
    }

    /// The current number of queued messages.
    pub fn size(&self) -> usize {
        self.inner.lock().expect("queue mutex poisoned").queue.len()
    }

    /// Changes the discard threshold at runtime.
    pub fn set_discard_threshold(&self, threshold: usize) {
        self.discard_threshold.store(threshold, Ordering::Relaxed);
    }

    /// Changes the discard action at runtime.
    pub fn set_discard_action(&self, action: DiscardAction) {
        *self.discard_action.lock().expect("discard_action mutex poisoned") = action;
    }
}

/// Truncates `s` to at most `max_bytes` UTF-8 bytes without splitting a
/// multi-byte character.
fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use signal::stop_signal;

    use super::*;

    fn msg(ts: i64, payload: &str) -> LogMessage {
        LogMessage::new(ts, payload.to_string())
    }

    #[test]
    fn fifo_order_is_preserved() {
        let queue = MessageQueue::new(100, DiscardAction::Oldest, 1024, false);
        queue.enqueue(msg(1, "a"));
        queue.enqueue(msg(2, "b"));
        queue.enqueue(msg(3, "c"));
        assert_eq!(queue.size(), 3);
    }

    #[test]
    fn empty_messages_are_dropped() {
        let queue = MessageQueue::new(100, DiscardAction::Oldest, 1024, false);
        queue.enqueue(msg(1, ""));
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn discard_oldest_keeps_the_most_recent_t() {
        let threshold = 10;
        let queue = MessageQueue::new(threshold, DiscardAction::Oldest, 1024, false);
        for i in 0..20 {
            queue.enqueue(msg(i, &format!("m{i}")));
        }
        assert_eq!(queue.size(), threshold);
    }

    #[test]
    fn discard_newest_keeps_the_oldest_t() {
        let threshold = 10;
        let queue = MessageQueue::new(threshold, DiscardAction::Newest, 1024, false);
        for i in 0..20 {
            queue.enqueue(msg(i, &format!("m{i}")));
        }
        assert_eq!(queue.size(), threshold);
    }

    #[test]
    fn discard_none_never_drops() {
        let threshold = 10;
        let queue = MessageQueue::new(threshold, DiscardAction::None, 1024, false);
        for i in 0..20 {
            queue.enqueue(msg(i, &format!("m{i}")));
        }
        assert_eq!(queue.size(), 20);
    }

    #[test]
    fn oversize_message_is_dropped_without_truncation() {
        let queue = MessageQueue::new(100, DiscardAction::Oldest, 4, false);
        queue.enqueue(msg(1, "12345"));
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn oversize_message_is_truncated_when_enabled() {
        let queue = MessageQueue::new(100, DiscardAction::Oldest, 4, true);
        queue.enqueue(msg(1, "12345"));
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn exact_max_size_message_is_sent_verbatim() {
        let queue = MessageQueue::new(100, DiscardAction::Oldest, 5, true);
        queue.enqueue(msg(1, "12345"));
        assert_eq!(queue.size(), 1);
    }

    #[tokio::test]
    async fn dequeue_batch_returns_empty_on_timeout() {
        let queue = MessageQueue::new(100, DiscardAction::Oldest, 1024, false);
        let (_tx, mut stop) = stop_signal();
        let batch = queue
            .dequeue_batch(Duration::from_millis(20), 10, 1024, 0, &mut stop)
            .await;
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn dequeue_batch_respects_max_count() {
        let queue = MessageQueue::new(100, DiscardAction::Oldest, 1024, false);
        for i in 0..5 {
            queue.enqueue(msg(i, "x"));
        }
        let (_tx, mut stop) = stop_signal();
        let batch = queue
            .dequeue_batch(Duration::from_millis(100), 3, 1024, 0, &mut stop)
            .await;
        assert_eq!(batch.len(), 3);
        assert_eq!(queue.size(), 2);
    }

    #[tokio::test]
    async fn dequeue_batch_respects_max_bytes() {
        let queue = MessageQueue::new(100, DiscardAction::Oldest, 1024, false);
        for i in 0..5 {
            queue.enqueue(msg(i, "xx"));
        }
        let (_tx, mut stop) = stop_signal();
        // Each message is 2 bytes with a 1 byte overhead; cap of 7 bytes
        // admits 2 messages (6 bytes) but not a third (9 bytes).
        let batch = queue
            .dequeue_batch(Duration::from_millis(100), 100, 7, 1, &mut stop)
            .await;
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn requeue_head_restores_original_order_without_discard() {
        let queue = MessageQueue::new(1, DiscardAction::Oldest, 1024, false);
        let (_tx, mut stop) = stop_signal();
        queue.enqueue(msg(1, "a"));
        let batch = queue
            .dequeue_batch(Duration::from_millis(50), 10, 1024, 0, &mut stop)
            .await;
        assert_eq!(batch.len(), 1);

        queue.enqueue(msg(2, "b"));
        queue.enqueue(msg(3, "c"));
        // Threshold is 1: "c" alone would survive a fresh enqueue sequence,
        // but requeue_head must not apply the discard policy at all.
        queue.requeue_head(batch);

        assert_eq!(queue.size(), 3);
        let all = queue
            .dequeue_batch(Duration::from_millis(50), 10, 1024, 0, &mut stop)
            .await;
        assert_eq!(all.iter().map(LogMessage::payload).collect::<Vec<_>>(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn dequeue_batch_interrupted_by_stop_signal() {
        let queue = MessageQueue::new(100, DiscardAction::Oldest, 1024, false);
        let (tx, mut stop) = stop_signal();
        tx.trigger();
        let batch = queue
            .dequeue_batch(Duration::from_secs(60), 10, 1024, 0, &mut stop)
            .await;
        assert!(batch.is_empty());
    }
}
