//! In-memory facade implementations used by the writer's own test suite
//! (and available to downstream adapter tests) so a simulated network fault
//! never needs a real service.
//!
//! Each mock is scripted with a queue of [`SendOutcome`]s: the Nth send call
//! consumes the Nth scripted outcome, defaulting to success once the script
//! is exhausted.

use std::collections::VecDeque;

use async_trait::async_trait;
use queue::LogMessage;

use crate::{FacadeError, LogGroupFacade, LogStreamDescriptor, PartitionedStreamFacade, SequenceToken, StreamState, TopicFacade};

/// What a scripted send call should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Accept the batch normally.
    Success,
    /// Fail with `Throttling`.
    Throttling,
    /// Fail with `Aborted`.
    Aborted,
    /// Fail with `InvalidSequenceToken` (log-group facade only).
    InvalidSequenceToken,
    /// Fail with `AlreadyProcessed`.
    AlreadyProcessed,
    /// Fail with `MissingLogStream`/stream-equivalent, and mark the
    /// destination as absent.
    MissingDestination,
    /// Fail with `UnexpectedException`.
    Unexpected,
}

/// A scriptable [`LogGroupFacade`].
#[derive(Debug, Default)]
pub struct MockLogGroupFacade {
    /// Set to simulate the group already existing at construction time.
    pub group_exists: bool,
    /// Set to simulate the stream already existing at construction time.
    pub stream_exists: bool,
    outcomes: VecDeque<SendOutcome>,
    /// Scripted outcomes for the describe/create calls `initialize`/
    /// `recreate` make, consumed one per call in call order; a given
    /// outcome is only replayed as a failure, every other call behaves as
    /// if the queue were empty (proceeds normally).
    init_outcomes: VecDeque<SendOutcome>,
    token_seq: u64,
    current_token: Option<SequenceToken>,
    /// Every batch passed to `put_events`, in call order.
    pub put_events_calls: Vec<Vec<LogMessage>>,
    /// Number of `find_log_group` + `find_log_stream` calls.
    pub describe_calls: usize,
    /// Number of `create_log_group` calls.
    pub create_group_calls: usize,
    /// Number of `create_log_stream` calls.
    pub create_stream_calls: usize,
    /// Number of `set_log_group_retention` calls.
    pub retention_calls: usize,
    /// Number of `shutdown` calls.
    pub shutdown_calls: usize,
}

impl MockLogGroupFacade {
    /// Creates a mock with the group and stream already present and a
    /// given scripted outcome sequence for `put_events`.
    pub fn new(outcomes: impl IntoIterator<Item = SendOutcome>) -> Self {
        Self {
            group_exists: true,
            stream_exists: true,
            outcomes: outcomes.into_iter().collect(),
            current_token: Some(SequenceToken::new("token-0")),
            ..Default::default()
        }
    }

    /// Creates a mock where neither the group nor the stream exist yet.
    pub fn new_absent() -> Self {
        Self::default()
    }

    /// Scripts the outcomes replayed, in order, by the describe/create
    /// calls `initialize`/`recreate` make (`find_log_group`,
    /// `create_log_group`, `set_log_group_retention`, `find_log_stream`,
    /// `create_log_stream`, `retrieve_sequence_token`).
    pub fn with_init_outcomes(mut self, outcomes: impl IntoIterator<Item = SendOutcome>) -> Self {
        self.init_outcomes = outcomes.into_iter().collect();
        self
    }

    fn next_init_failure(&mut self) -> Option<FacadeError> {
        match self.init_outcomes.pop_front()? {
            SendOutcome::Success => None,
            SendOutcome::Throttling => Some(FacadeError::throttling("simulated throttling")),
            SendOutcome::Aborted => Some(FacadeError::aborted("simulated abort")),
            SendOutcome::InvalidSequenceToken => Some(FacadeError::invalid_sequence_token("simulated token race")),
            SendOutcome::AlreadyProcessed => Some(FacadeError::already_processed("simulated duplicate")),
            SendOutcome::MissingDestination => Some(FacadeError::missing_log_stream("simulated deleted stream")),
            SendOutcome::Unexpected => Some(FacadeError::unexpected("simulated unexpected failure")),
        }
    }
}

#[async_trait]
impl LogGroupFacade for MockLogGroupFacade {
    async fn find_log_group(&mut self, name: &str) -> Result<Option<String>, FacadeError> {
        self.describe_calls += 1;
        if let Some(err) = self.next_init_failure() {
            return Err(err);
        }
        Ok(self.group_exists.then(|| format!("arn:log-group:{name}")))
    }

    async fn create_log_group(&mut self, _name: &str) -> Result<(), FacadeError> {
        self.create_group_calls += 1;
        if let Some(err) = self.next_init_failure() {
            return Err(err);
        }
        self.group_exists = true;
        Ok(())
    }

    async fn set_log_group_retention(&mut self, _name: &str, _retention_days: u32) -> Result<(), FacadeError> {
        self.retention_calls += 1;
        if let Some(err) = self.next_init_failure() {
            return Err(err);
        }
        Ok(())
    }

    async fn find_log_stream(
        &mut self,
        _group: &str,
        stream: &str,
    ) -> Result<Option<LogStreamDescriptor>, FacadeError> {
        self.describe_calls += 1;
        if let Some(err) = self.next_init_failure() {
            return Err(err);
        }
        Ok(self.stream_exists.then(|| LogStreamDescriptor {
            name: stream.to_string(),
        }))
    }

    async fn create_log_stream(&mut self, _group: &str, _stream: &str) -> Result<(), FacadeError> {
        self.create_stream_calls += 1;
        if let Some(err) = self.next_init_failure() {
            return Err(err);
        }
        self.stream_exists = true;
        if self.current_token.is_none() {
            self.current_token = Some(SequenceToken::new("token-0"));
        }
        Ok(())
    }

    async fn retrieve_sequence_token(
        &mut self,
        _group: &str,
        _stream: &str,
    ) -> Result<Option<SequenceToken>, FacadeError> {
        if let Some(err) = self.next_init_failure() {
            return Err(err);
        }
        Ok(self.current_token.clone())
    }

    async fn put_events(
        &mut self,
        _group: &str,
        _stream: &str,
        _token: Option<&SequenceToken>,
        messages: &[LogMessage],
    ) -> Result<SequenceToken, FacadeError> {
        self.put_events_calls.push(messages.to_vec());

        match self.outcomes.pop_front().unwrap_or(SendOutcome::Success) {
            SendOutcome::Success => {
                self.token_seq += 1;
                let token = SequenceToken::new(format!("token-{}", self.token_seq));
                self.current_token = Some(token.clone());
                Ok(token)
            }
            SendOutcome::Throttling => Err(FacadeError::throttling("simulated throttling")),
            SendOutcome::Aborted => Err(FacadeError::aborted("simulated abort")),
            SendOutcome::InvalidSequenceToken => Err(FacadeError::invalid_sequence_token("simulated token race")),
            SendOutcome::AlreadyProcessed => Err(FacadeError::already_processed("simulated duplicate")),
            SendOutcome::MissingDestination => {
                self.stream_exists = false;
                Err(FacadeError::missing_log_stream("simulated deleted stream"))
            }
            SendOutcome::Unexpected => Err(FacadeError::unexpected("simulated unexpected failure")),
        }
    }

    async fn shutdown(&mut self) {
        self.shutdown_calls += 1;
    }
}

/// A scriptable [`PartitionedStreamFacade`].
#[derive(Debug, Default)]
pub struct MockPartitionedStreamFacade {
    /// The status returned by `retrieve_stream_status`.
    pub status: Option<StreamState>,
    outcomes: VecDeque<SendOutcome>,
    /// Every batch passed to `put_records`, in call order.
    pub put_records_calls: Vec<Vec<LogMessage>>,
    /// Number of `retrieve_stream_status` calls.
    pub describe_calls: usize,
    /// Number of `create_stream` calls.
    pub create_calls: usize,
    /// Number of `shutdown` calls.
    pub shutdown_calls: usize,
}

impl MockPartitionedStreamFacade {
    /// Creates a mock with an already-active stream and a scripted
    /// `put_records` outcome sequence.
    pub fn new(outcomes: impl IntoIterator<Item = SendOutcome>) -> Self {
        Self {
            status: Some(StreamState::Active),
            outcomes: outcomes.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Creates a mock where the stream does not exist yet.
    pub fn new_absent() -> Self {
        Self {
            status: Some(StreamState::Absent),
            ..Default::default()
        }
    }
}

#[async_trait]
impl PartitionedStreamFacade for MockPartitionedStreamFacade {
    async fn retrieve_stream_status(&mut self, _stream: &str) -> Result<StreamState, FacadeError> {
        self.describe_calls += 1;
        Ok(self.status.unwrap_or(StreamState::Unknown))
    }

    async fn create_stream(&mut self, _stream: &str, _shard_count: u32) -> Result<(), FacadeError> {
        self.create_calls += 1;
        self.status = Some(StreamState::Active);
        Ok(())
    }

    async fn set_retention_period(&mut self, _stream: &str, _retention_hours: u32) -> Result<(), FacadeError> {
        Ok(())
    }

    async fn put_records(
        &mut self,
        _stream: &str,
        _partition_key: &str,
        batch: &[LogMessage],
    ) -> Result<Vec<usize>, FacadeError> {
        self.put_records_calls.push(batch.to_vec());

        match self.outcomes.pop_front().unwrap_or(SendOutcome::Success) {
            SendOutcome::Success => Ok(Vec::new()),
            SendOutcome::Throttling => Err(FacadeError::throttling("simulated throttling")),
            SendOutcome::Aborted => Err(FacadeError::aborted("simulated abort")),
            SendOutcome::InvalidSequenceToken => {
                unreachable!("partitioned streams have no sequence token")
            }
            SendOutcome::AlreadyProcessed => Err(FacadeError::already_processed("simulated duplicate")),
            SendOutcome::MissingDestination => {
                self.status = Some(StreamState::Absent);
                Err(FacadeError::missing_log_stream("simulated deleted stream"))
            }
            SendOutcome::Unexpected => Err(FacadeError::unexpected("simulated unexpected failure")),
        }
    }

    async fn shutdown(&mut self) {
        self.shutdown_calls += 1;
    }
}

/// A scriptable [`TopicFacade`].
#[derive(Debug, Default)]
pub struct MockTopicFacade {
    /// Topics known to already exist, by ARN.
    pub topics: Vec<String>,
    outcomes: VecDeque<SendOutcome>,
    /// Scripted outcomes for `list_topics`/`create_topic`, consumed one
    /// per call in call order; see [`MockLogGroupFacade::with_init_outcomes`].
    init_outcomes: VecDeque<SendOutcome>,
    /// Every message body passed to `publish`, in call order.
    pub publish_calls: Vec<String>,
    /// Number of `create_topic` calls.
    pub create_calls: usize,
    /// Number of `shutdown` calls.
    pub shutdown_calls: usize,
}

impl MockTopicFacade {
    /// Creates a mock with a scripted `publish` outcome sequence.
    pub fn new(outcomes: impl IntoIterator<Item = SendOutcome>) -> Self {
        Self {
            outcomes: outcomes.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Scripts the outcomes replayed, in order, by `list_topics`/
    /// `create_topic`.
    pub fn with_init_outcomes(mut self, outcomes: impl IntoIterator<Item = SendOutcome>) -> Self {
        self.init_outcomes = outcomes.into_iter().collect();
        self
    }

    fn next_init_failure(&mut self) -> Option<FacadeError> {
        match self.init_outcomes.pop_front()? {
            SendOutcome::Success => None,
            SendOutcome::Throttling => Some(FacadeError::throttling("simulated throttling")),
            SendOutcome::Aborted => Some(FacadeError::aborted("simulated abort")),
            SendOutcome::InvalidSequenceToken => unreachable!("topics have no sequence token"),
            SendOutcome::AlreadyProcessed => Some(FacadeError::already_processed("simulated duplicate")),
            SendOutcome::MissingDestination => Some(FacadeError::unexpected("topics are never recreated implicitly")),
            SendOutcome::Unexpected => Some(FacadeError::unexpected("simulated unexpected failure")),
        }
    }
}

#[async_trait]
impl TopicFacade for MockTopicFacade {
    async fn list_topics(&mut self) -> Result<Vec<String>, FacadeError> {
        if let Some(err) = self.next_init_failure() {
            return Err(err);
        }
        Ok(self.topics.clone())
    }

    async fn create_topic(&mut self, name: &str) -> Result<String, FacadeError> {
        self.create_calls += 1;
        if let Some(err) = self.next_init_failure() {
            return Err(err);
        }
        let arn = format!("arn:topic:{name}");
        self.topics.push(arn.clone());
        Ok(arn)
    }

    async fn publish(&mut self, _topic_arn: &str, _subject: Option<&str>, body: &str) -> Result<String, FacadeError> {
        self.publish_calls.push(body.to_string());

        match self.outcomes.pop_front().unwrap_or(SendOutcome::Success) {
            SendOutcome::Success => Ok(format!("msg-{}", self.publish_calls.len())),
            SendOutcome::Throttling => Err(FacadeError::throttling("simulated throttling")),
            SendOutcome::Aborted => Err(FacadeError::aborted("simulated abort")),
            SendOutcome::InvalidSequenceToken => unreachable!("topics have no sequence token"),
            SendOutcome::AlreadyProcessed => Err(FacadeError::already_processed("simulated duplicate")),
            SendOutcome::MissingDestination => Err(FacadeError::unexpected("topics are never recreated implicitly")),
            SendOutcome::Unexpected => Err(FacadeError::unexpected("simulated unexpected failure")),
        }
    }

    async fn shutdown(&mut self) {
        self.shutdown_calls += 1;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn log_group_mock_replays_scripted_outcomes_in_order() {
        let mut facade = MockLogGroupFacade::new([SendOutcome::Throttling, SendOutcome::Success]);
        let messages = vec![LogMessage::new(1, "m")];

        let err = facade
            .put_events("g", "s", None, &messages)
            .await
            .expect_err("first call should throttle");
        assert_eq!(err.reason, crate::ReasonCode::Throttling);

        let token = facade.put_events("g", "s", None, &messages).await.expect("second call succeeds");
        assert_eq!(token.as_str(), "token-1");
        assert_eq!(facade.put_events_calls.len(), 2);
    }

    #[tokio::test]
    async fn partitioned_stream_mock_tracks_create_calls() {
        let mut facade = MockPartitionedStreamFacade::new_absent();
        assert_eq!(facade.retrieve_stream_status("s").await.unwrap(), StreamState::Absent);
        facade.create_stream("s", 1).await.unwrap();
        assert_eq!(facade.retrieve_stream_status("s").await.unwrap(), StreamState::Active);
        assert_eq!(facade.create_calls, 1);
    }

    #[tokio::test]
    async fn topic_mock_assigns_increasing_message_ids() {
        let mut facade = MockTopicFacade::default();
        let id1 = facade.publish("arn", None, "a").await.unwrap();
        let id2 = facade.publish("arn", None, "b").await.unwrap();
        assert_ne!(id1, id2);
    }
}
