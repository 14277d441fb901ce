//! The topic destination adapter: publishes one message at a time (the
//! batch builder's [`batch::BatchPolicy::topic`] caps every batch at a
//! single message), creating the topic on first use if a name rather than
//! an ARN was configured.

use std::sync::Arc;

use async_trait::async_trait;
use facade::{FacadeError, TopicFacade};
use queue::LogMessage;
use retry::Sleeper;

use crate::adapter::{retry_on_throttling, DestinationAdapter, SendOutcome, CREATE_RETRY, DESCRIBE_RETRY};

/// Either an existing topic's ARN, or a name to create (or look up) one
/// under.
#[derive(Debug, Clone)]
pub enum TopicIdentity {
    /// The topic's ARN; never created or looked up by name.
    Arn(String),
    /// The topic's name; resolved to an ARN (creating it if missing) during
    /// `initialize`.
    Name(String),
}

/// Optional per-message subject line (only meaningful for destinations that
/// support message filtering by subject).
#[derive(Debug, Clone, Default)]
pub struct TopicTarget {
    /// The topic to publish to.
    pub identity: TopicIdentity,
    /// A static subject attached to every publish call.
    pub subject: Option<String>,
}

impl Default for TopicIdentity {
    fn default() -> Self {
        TopicIdentity::Name(String::new())
    }
}

/// The [`DestinationAdapter`] for the topic destination.
pub struct TopicAdapter {
    facade: Box<dyn TopicFacade>,
    target: TopicTarget,
    resolved_arn: Option<String>,
    sleeper: Arc<dyn Sleeper>,
}

impl TopicAdapter {
    /// Builds an adapter over a concrete facade instance. `sleeper` drives
    /// the throttle-tolerant retry loop `initialize` runs around
    /// `list_topics`/`create_topic`.
    pub fn new(facade: Box<dyn TopicFacade>, target: TopicTarget, sleeper: Arc<dyn Sleeper>) -> Self {
        let resolved_arn = match &target.identity {
            TopicIdentity::Arn(arn) => Some(arn.clone()),
            TopicIdentity::Name(_) => None,
        };
        Self {
            facade,
            target,
            resolved_arn,
            sleeper,
        }
    }
}

#[async_trait]
impl DestinationAdapter for TopicAdapter {
    async fn initialize(&mut self) -> Result<(), FacadeError> {
        if self.resolved_arn.is_some() {
            return Ok(());
        }
        let TopicIdentity::Name(name) = &self.target.identity else {
            unreachable!("resolved_arn is only None for a Name identity")
        };
        let facade = &mut self.facade;
        let sleeper = self.sleeper.clone();

        let existing = retry_on_throttling(sleeper.clone(), DESCRIBE_RETRY, async || facade.list_topics().await).await?;
        let suffix = format!(":{name}");
        if let Some(arn) = existing.into_iter().find(|arn| arn.ends_with(&suffix)) {
            self.resolved_arn = Some(arn);
        } else {
            let arn = retry_on_throttling(sleeper, CREATE_RETRY, async || facade.create_topic(name).await).await?;
            self.resolved_arn = Some(arn);
        }
        Ok(())
    }

    async fn send(&mut self, batch: &[LogMessage]) -> Result<SendOutcome, FacadeError> {
        let arn = self.resolved_arn.as_deref().expect("initialize resolves an ARN before send is called");
        for message in batch {
            let _message_id = self.facade.publish(arn, self.target.subject.as_deref(), message.payload()).await?;
        }
        Ok(SendOutcome::Accepted)
    }

    async fn recreate(&mut self) -> Result<(), FacadeError> {
        self.resolved_arn = None;
        self.initialize().await
    }

    async fn shutdown(&mut self) {
        self.facade.shutdown().await;
    }
}

#[cfg(test)]
mod test {
    use facade::mock::{MockTopicFacade, SendOutcome as MockSendOutcome};
    use retry::{ManualSleeper, TokioSleeper};

    use super::*;

    #[tokio::test]
    async fn initialize_creates_the_topic_when_named_and_absent() {
        let mock = MockTopicFacade::default();
        let mut adapter = TopicAdapter::new(
            Box::new(mock),
            TopicTarget {
                identity: TopicIdentity::Name("alerts".to_string()),
                subject: None,
            },
            Arc::new(TokioSleeper),
        );
        adapter.initialize().await.expect("initialize should succeed");
        assert_eq!(adapter.resolved_arn.as_deref(), Some("arn:topic:alerts"));
    }

    #[tokio::test]
    async fn arn_identity_skips_lookup_entirely() {
        let mock = MockTopicFacade::default();
        let mut adapter = TopicAdapter::new(
            Box::new(mock),
            TopicTarget {
                identity: TopicIdentity::Arn("arn:topic:existing".to_string()),
                subject: None,
            },
            Arc::new(TokioSleeper),
        );
        adapter.initialize().await.unwrap();
        assert_eq!(adapter.resolved_arn.as_deref(), Some("arn:topic:existing"));
    }

    #[tokio::test]
    async fn send_publishes_every_message_in_the_batch() {
        let mock = MockTopicFacade::default();
        let mut adapter = TopicAdapter::new(
            Box::new(mock),
            TopicTarget {
                identity: TopicIdentity::Arn("arn:topic:x".to_string()),
                subject: Some("evt".to_string()),
            },
            Arc::new(TokioSleeper),
        );
        adapter.initialize().await.unwrap();
        let batch = vec![LogMessage::new(1, "only")];
        let outcome = adapter.send(&batch).await.unwrap();
        assert_eq!(outcome, SendOutcome::Accepted);
    }

    #[tokio::test]
    async fn initialize_retries_through_throttling_on_list_and_create() {
        let mock = MockTopicFacade::default().with_init_outcomes([MockSendOutcome::Throttling, MockSendOutcome::Throttling]);
        let mut adapter = TopicAdapter::new(
            Box::new(mock),
            TopicTarget {
                identity: TopicIdentity::Name("alerts".to_string()),
                subject: None,
            },
            Arc::new(ManualSleeper::new()),
        );
        adapter.initialize().await.expect("a throttled list/create should still be retried to success");
    }
}
