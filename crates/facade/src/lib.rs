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

//! The service facade: a narrow, uniform contract over a remote log
//! destination that maps low-level service errors onto a small reason-code
//! taxonomy. This is the only layer in the workspace that knows about a
//! concrete service SDK; the writer's decision logic is identical across
//! the three destination kinds because it only ever sees a [`FacadeError`].

pub mod mock;

use async_trait::async_trait;
use queue::LogMessage;

/// The reason a facade operation failed, reported to statistics and the
/// internal log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReasonCode {
    /// The service is throttling this client; retryable.
    Throttling,
    /// A transient, retryable failure reported by the service.
    Aborted,
    /// The cached sequence token raced with another publisher.
    InvalidSequenceToken,
    /// The configuration supplied to the facade is invalid; fatal to
    /// initialization.
    InvalidConfiguration,
    /// The log group no longer exists.
    MissingLogGroup,
    /// The log stream no longer exists.
    MissingLogStream,
    /// The previous attempt actually succeeded; this one is a duplicate.
    AlreadyProcessed,
    /// An error outside the known taxonomy.
    UnexpectedException,
}

/// An error raised by a facade operation. Carries the [`ReasonCode`] the
/// writer's decision logic branches on, plus whether the operation is safe
/// to retry.
#[derive(Debug, thiserror::Error)]
#[error("facade error (reason: {reason:?}, retryable: {retryable}): {message}")]
pub struct FacadeError {
    /// The taxonomy reason for this failure.
    pub reason: ReasonCode,
    /// Whether the writer should retry the operation that produced this
    /// error.
    pub retryable: bool,
    /// A human-readable description, usually the underlying SDK error.
    pub message: String,
}

impl FacadeError {
    /// Builds a new facade error.
    pub fn new(reason: ReasonCode, retryable: bool, message: impl Into<String>) -> Self {
        Self {
            reason,
            retryable,
            message: message.into(),
        }
    }

    /// A throttling error (always retryable).
    pub fn throttling(message: impl Into<String>) -> Self {
        Self::new(ReasonCode::Throttling, true, message)
    }

    /// A transient, retryable error.
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(ReasonCode::Aborted, true, message)
    }

    /// A sequence-token race (log-group destination only); retryable after
    /// refreshing the token.
    pub fn invalid_sequence_token(message: impl Into<String>) -> Self {
        Self::new(ReasonCode::InvalidSequenceToken, true, message)
    }

    /// A fatal configuration error.
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::new(ReasonCode::InvalidConfiguration, false, message)
    }

    /// The log group is missing; retryable after recreating it.
    pub fn missing_log_group(message: impl Into<String>) -> Self {
        Self::new(ReasonCode::MissingLogGroup, true, message)
    }

    /// The log stream is missing; retryable after recreating it.
    pub fn missing_log_stream(message: impl Into<String>) -> Self {
        Self::new(ReasonCode::MissingLogStream, true, message)
    }

    /// The batch was already accepted by a previous, seemingly-failed call.
    pub fn already_processed(message: impl Into<String>) -> Self {
        Self::new(ReasonCode::AlreadyProcessed, false, message)
    }

    /// An error outside the known taxonomy; requeue and continue.
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(ReasonCode::UnexpectedException, true, message)
    }
}

/// An opaque per-stream cursor required by the log-group destination to
/// detect concurrent writers. Treated as a cached optimistic value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceToken(String);

impl SequenceToken {
    /// Wraps a raw token string.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Describes an existing log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogStreamDescriptor {
    /// The stream's name.
    pub name: String,
}

/// The lifecycle phase of a partitioned stream, obtained by polling the
/// facade. Only `Active` permits sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// The stream does not exist.
    Absent,
    /// The stream is being created.
    Creating,
    /// The stream accepts writes.
    Active,
    /// The stream is being reconfigured (e.g. resharded).
    Updating,
    /// The stream is being deleted.
    Deleting,
    /// The status could not be determined.
    Unknown,
}

/// The narrow contract over a cloud log-group/stream service.
#[async_trait]
pub trait LogGroupFacade: Send {
    /// Looks up a log group by name, returning its ARN if it exists.
    async fn find_log_group(&mut self, name: &str) -> Result<Option<String>, FacadeError>;

    /// Creates a log group. Implementations must tolerate the group already
    /// existing (idempotent on `ResourceAlreadyExists`).
    async fn create_log_group(&mut self, name: &str) -> Result<(), FacadeError>;

    /// Sets the retention policy on a log group. Called at most once per
    /// initialization.
    async fn set_log_group_retention(&mut self, name: &str, retention_days: u32) -> Result<(), FacadeError>;

    /// Looks up a log stream within a group.
    async fn find_log_stream(
        &mut self,
        group: &str,
        stream: &str,
    ) -> Result<Option<LogStreamDescriptor>, FacadeError>;

    /// Creates a log stream within a group.
    async fn create_log_stream(&mut self, group: &str, stream: &str) -> Result<(), FacadeError>;

    /// Retrieves the current sequence token for a stream, if any.
    async fn retrieve_sequence_token(
        &mut self,
        group: &str,
        stream: &str,
    ) -> Result<Option<SequenceToken>, FacadeError>;

    /// Sends a batch of events, pre-sorted by timestamp ascending. Returns
    /// the token to use for the next call.
    async fn put_events(
        &mut self,
        group: &str,
        stream: &str,
        token: Option<&SequenceToken>,
        messages: &[LogMessage],
    ) -> Result<SequenceToken, FacadeError>;

    /// Releases any resources held by this facade (network client, etc).
    async fn shutdown(&mut self);
}

/// The narrow contract over a partitioned record stream.
#[async_trait]
pub trait PartitionedStreamFacade: Send {
    /// Polls the stream's current lifecycle phase.
    async fn retrieve_stream_status(&mut self, stream: &str) -> Result<StreamState, FacadeError>;

    /// Creates a stream with the given shard count.
    async fn create_stream(&mut self, stream: &str, shard_count: u32) -> Result<(), FacadeError>;

    /// Sets the retention period, in hours.
    async fn set_retention_period(&mut self, stream: &str, retention_hours: u32) -> Result<(), FacadeError>;

    /// Sends a batch of records under a single partition key. Returns the
    /// indices, into `batch`, of records that were not acknowledged and
    /// must be requeued.
    async fn put_records(
        &mut self,
        stream: &str,
        partition_key: &str,
        batch: &[LogMessage],
    ) -> Result<Vec<usize>, FacadeError>;

    /// Releases any resources held by this facade.
    async fn shutdown(&mut self);
}

/// The narrow contract over a pub/sub topic service.
#[async_trait]
pub trait TopicFacade: Send {
    /// Lists every topic ARN, transparently following pagination tokens.
    async fn list_topics(&mut self) -> Result<Vec<String>, FacadeError>;

    /// Creates a topic, returning its ARN.
    async fn create_topic(&mut self, name: &str) -> Result<String, FacadeError>;

    /// Publishes a single message, returning the service-assigned message
    /// id.
    async fn publish(&mut self, topic_arn: &str, subject: Option<&str>, body: &str) -> Result<String, FacadeError>;

    /// Releases any resources held by this facade.
    async fn shutdown(&mut self);
}

/// Builds a [`LogGroupFacade`] on demand, so a writer can be handed a real
/// network client or a test double without knowing which.
pub trait LogGroupFacadeFactory: Send + Sync {
    /// Builds a new facade instance.
    fn build(&self) -> Box<dyn LogGroupFacade>;
}

impl<F> LogGroupFacadeFactory for F
where
    F: Fn() -> Box<dyn LogGroupFacade> + Send + Sync,
{
    fn build(&self) -> Box<dyn LogGroupFacade> {
        (self)()
    }
}

/// Builds a [`PartitionedStreamFacade`] on demand.
pub trait PartitionedStreamFacadeFactory: Send + Sync {
    /// Builds a new facade instance.
    fn build(&self) -> Box<dyn PartitionedStreamFacade>;
}

impl<F> PartitionedStreamFacadeFactory for F
where
    F: Fn() -> Box<dyn PartitionedStreamFacade> + Send + Sync,
{
    fn build(&self) -> Box<dyn PartitionedStreamFacade> {
        (self)()
    }
}

/// Builds a [`TopicFacade`] on demand.
pub trait TopicFacadeFactory: Send + Sync {
    /// Builds a new facade instance.
    fn build(&self) -> Box<dyn TopicFacade>;
}

impl<F> TopicFacadeFactory for F
where
    F: Fn() -> Box<dyn TopicFacade> + Send + Sync,
{
    fn build(&self) -> Box<dyn TopicFacade> {
        (self)()
    }
}
