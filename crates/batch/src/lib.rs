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

//! Packs pending messages from a [`MessageQueue`] into a batch respecting
//! the per-destination size and count caps, then sorts the batch by
//! timestamp ascending (required by the log-group destination, beneficial
//! to the others) with ties broken by original enqueue order.

use std::time::Duration;

use queue::{LogMessage, MessageQueue};
use signal::StopReceiver;

/// The size/count caps for one destination kind. These are bit-exact
/// contracts, not tunables: the literal values come from each service's own
/// API limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    /// Maximum number of messages in one batch.
    pub max_count: usize,
    /// Maximum total bytes in one batch, including per-message overhead.
    pub max_bytes: usize,
    /// Bytes charged against `max_bytes` for every message in addition to
    /// its payload (a fixed per-event overhead for the log-group
    /// destination, the partition key length for the partitioned-stream
    /// destination, zero for the topic destination).
    pub overhead_per_message: usize,
    /// Maximum payload size for a single message.
    pub max_message_bytes: usize,
}

impl BatchPolicy {
    /// Per-batch message count cap for the log-group destination.
    pub const LOG_GROUP_MAX_COUNT: usize = 10_000;
    /// Per-batch byte cap for the log-group destination.
    pub const LOG_GROUP_MAX_BYTES: usize = 1_048_576;
    /// Per-event overhead charged by the log-group destination.
    pub const LOG_GROUP_OVERHEAD_PER_MESSAGE: usize = 26;
    /// Per-message payload cap for the log-group destination
    /// (262,144 minus the per-event overhead).
    pub const LOG_GROUP_MAX_MESSAGE_BYTES: usize = 262_144 - Self::LOG_GROUP_OVERHEAD_PER_MESSAGE;

    /// Per-batch record count cap for the partitioned-stream destination.
    pub const PARTITIONED_STREAM_MAX_COUNT: usize = 500;
    /// Per-batch byte cap for the partitioned-stream destination.
    pub const PARTITIONED_STREAM_MAX_BYTES: usize = 5_242_880;
    /// Per-record payload cap for the partitioned-stream destination,
    /// including the partition key.
    pub const PARTITIONED_STREAM_MAX_RECORD_BYTES: usize = 1_048_576;

    /// Per-message byte cap for the topic destination.
    pub const TOPIC_MAX_BYTES: usize = 262_144;

    /// The log-group batch policy.
    pub fn log_group() -> Self {
        Self {
            max_count: Self::LOG_GROUP_MAX_COUNT,
            max_bytes: Self::LOG_GROUP_MAX_BYTES,
            overhead_per_message: Self::LOG_GROUP_OVERHEAD_PER_MESSAGE,
            max_message_bytes: Self::LOG_GROUP_MAX_MESSAGE_BYTES,
        }
    }

    /// The partitioned-stream batch policy for a given partition key
    /// length (in bytes), which counts against every record's size cap and
    /// the batch's byte cap.
    pub fn partitioned_stream(partition_key_bytes: usize) -> Self {
        Self {
            max_count: Self::PARTITIONED_STREAM_MAX_COUNT,
            max_bytes: Self::PARTITIONED_STREAM_MAX_BYTES,
            overhead_per_message: partition_key_bytes,
            max_message_bytes: Self::PARTITIONED_STREAM_MAX_RECORD_BYTES.saturating_sub(partition_key_bytes),
        }
    }

    /// The topic batch policy: exactly one message per "batch", no
    /// batching.
    pub fn topic() -> Self {
        Self {
            max_count: 1,
            max_bytes: Self::TOPIC_MAX_BYTES,
            overhead_per_message: 0,
            max_message_bytes: Self::TOPIC_MAX_BYTES,
        }
    }
}

/// Pulls a batch from `queue` under `policy`'s caps and returns it sorted by
/// timestamp ascending, ties broken by original enqueue (FIFO) order.
pub async fn build_batch(
    queue: &MessageQueue,
    policy: &BatchPolicy,
    max_wait: Duration,
    stop: &mut StopReceiver,
) -> Vec<LogMessage> {
    let mut batch = queue
        .dequeue_batch(max_wait, policy.max_count, policy.max_bytes, policy.overhead_per_message, stop)
        .await;

    // `sort_by_key` is stable, so messages with equal timestamps keep the
    // relative order `dequeue_batch` handed them in (original enqueue
    // order), satisfying the tie-break rule.
    batch.sort_by_key(LogMessage::timestamp_ms);

    batch
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use proptest::prelude::*;
    use queue::DiscardAction;
    use signal::stop_signal;

    use super::*;

    #[tokio::test]
    async fn log_group_caps_split_by_count_when_small() {
        let policy = BatchPolicy::log_group();
        let mq = MessageQueue::new(20_000, DiscardAction::None, policy.max_message_bytes, false);
        for i in 0..15_000i64 {
            mq.enqueue(LogMessage::new(i, "x"));
        }
        let (_tx, mut stop) = stop_signal();

        let first = build_batch(&mq, &policy, Duration::from_millis(50), &mut stop).await;
        assert_eq!(first.len(), 10_000);

        let second = build_batch(&mq, &policy, Duration::from_millis(50), &mut stop).await;
        assert_eq!(second.len(), 5_000);
    }

    #[tokio::test]
    async fn log_group_caps_split_by_bytes_when_large() {
        let policy = BatchPolicy::log_group();
        let mq = MessageQueue::new(2_000, DiscardAction::None, policy.max_message_bytes, false);
        let payload = "x".repeat(1024);
        for i in 0..1_500i64 {
            mq.enqueue(LogMessage::new(i, payload.clone()));
        }
        let (_tx, mut stop) = stop_signal();

        let first = build_batch(&mq, &policy, Duration::from_millis(50), &mut stop).await;
        assert_eq!(first.len(), 998);

        let second = build_batch(&mq, &policy, Duration::from_millis(50), &mut stop).await;
        assert_eq!(second.len(), 502);
    }

    #[tokio::test]
    async fn topic_policy_never_batches() {
        let policy = BatchPolicy::topic();
        let mq = MessageQueue::new(10, DiscardAction::None, policy.max_message_bytes, false);
        mq.enqueue(LogMessage::new(1, "a"));
        mq.enqueue(LogMessage::new(2, "b"));
        let (_tx, mut stop) = stop_signal();

        let batch = build_batch(&mq, &policy, Duration::from_millis(50), &mut stop).await;
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn batch_is_sorted_by_timestamp_with_stable_tie_break() {
        let policy = BatchPolicy::log_group();
        let mq = MessageQueue::new(10, DiscardAction::None, policy.max_message_bytes, false);
        mq.enqueue(LogMessage::new(5, "second"));
        mq.enqueue(LogMessage::new(1, "first"));
        mq.enqueue(LogMessage::new(1, "also-first"));
        let (_tx, mut stop) = stop_signal();

        let batch = build_batch(&mq, &policy, Duration::from_millis(50), &mut stop).await;
        let timestamps: Vec<_> = batch.iter().map(LogMessage::timestamp_ms).collect();
        assert_eq!(timestamps, vec![1, 1, 5]);
        // Among the two timestamp=1 messages, enqueue order is preserved.
        assert_eq!(batch[0].payload(), "first");
        assert_eq!(batch[1].payload(), "also-first");
    }

    proptest! {
        #[test]
        fn batch_timestamps_are_never_decreasing(mut timestamps in proptest::collection::vec(-1_000i64..1_000, 1..200)) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let policy = BatchPolicy::log_group();
                let mq = MessageQueue::new(timestamps.len() * 2, DiscardAction::None, policy.max_message_bytes, false);
                for ts in timestamps.drain(..) {
                    mq.enqueue(LogMessage::new(ts, "m"));
                }
                let (_tx, mut stop) = stop_signal();
                let batch = build_batch(&mq, &policy, Duration::from_millis(50), &mut stop).await;
                let ordered = batch.windows(2).all(|w| w[0].timestamp_ms() <= w[1].timestamp_ms());
                prop_assert!(ordered);
                Ok(())
            })?;
        }
    }
}
