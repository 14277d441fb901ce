//! The log-group/stream destination adapter: creates the group and stream
//! if absent, sets retention once, and caches the sequence token the
//! service requires on every `put_events` call.

use std::sync::Arc;

use async_trait::async_trait;
use facade::{FacadeError, LogGroupFacade, SequenceToken};
use queue::LogMessage;
use retry::Sleeper;

use crate::adapter::{retry_on_throttling, DestinationAdapter, SendOutcome, CREATE_RETRY, DESCRIBE_RETRY};

/// Whether the cached sequence token is safe to reuse across sends without
/// re-fetching it first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenCacheMode {
    /// This writer is the only one writing to the stream: cache the token
    /// returned by the previous `put_events` and reuse it unconditionally.
    Dedicated,
    /// Other writers may also be appending to the stream: re-fetch the
    /// token before every send, trading an extra round trip for fewer
    /// `InvalidSequenceToken` races.
    Shared,
}

/// Where to send: a log group and one of its streams.
#[derive(Debug, Clone)]
pub struct LogGroupTarget {
    /// The log group's name.
    pub group: String,
    /// The stream's name within that group.
    pub stream: String,
    /// Retention, in days; `None` leaves the service default in place.
    pub retention_days: Option<u32>,
    /// The sequence-token caching strategy for this writer.
    pub cache_mode: TokenCacheMode,
}

/// The [`DestinationAdapter`] for the log-group destination.
pub struct LogGroupAdapter {
    facade: Box<dyn LogGroupFacade>,
    target: LogGroupTarget,
    cached_token: Option<SequenceToken>,
    sleeper: Arc<dyn Sleeper>,
}

impl LogGroupAdapter {
    /// Builds an adapter over a concrete facade instance. `sleeper` drives
    /// the throttle-tolerant retry loops `initialize`/`recreate` run around
    /// every create/describe call.
    pub fn new(facade: Box<dyn LogGroupFacade>, target: LogGroupTarget, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            facade,
            target,
            cached_token: None,
            sleeper,
        }
    }

    async fn current_token(&mut self) -> Result<Option<SequenceToken>, FacadeError> {
        match self.target.cache_mode {
            TokenCacheMode::Dedicated => Ok(self.cached_token.clone()),
            TokenCacheMode::Shared => {
                self.cached_token = self.facade.retrieve_sequence_token(&self.target.group, &self.target.stream).await?;
                Ok(self.cached_token.clone())
            }
        }
    }
}

#[async_trait]
impl DestinationAdapter for LogGroupAdapter {
    async fn initialize(&mut self) -> Result<(), FacadeError> {
        let sleeper = self.sleeper.clone();
        let group = self.target.group.clone();
        let stream = self.target.stream.clone();

        let existing_group = retry_on_throttling(sleeper.clone(), DESCRIBE_RETRY, self.facade.as_mut(), |facade| {
            let group = group.clone();
            Box::pin(async move { facade.find_log_group(&group).await })
        })
        .await?;
        if existing_group.is_none() {
            retry_on_throttling(sleeper.clone(), CREATE_RETRY, self.facade.as_mut(), |facade| {
                let group = group.clone();
                Box::pin(async move { facade.create_log_group(&group).await })
            })
            .await?;
        }

        if let Some(days) = self.target.retention_days {
            retry_on_throttling(sleeper.clone(), CREATE_RETRY, self.facade.as_mut(), |facade| {
                let group = group.clone();
                Box::pin(async move { facade.set_log_group_retention(&group, days).await })
            })
            .await?;
        }

        let existing_stream = retry_on_throttling(sleeper.clone(), DESCRIBE_RETRY, self.facade.as_mut(), |facade| {
            let group = group.clone();
            let stream = stream.clone();
            Box::pin(async move { facade.find_log_stream(&group, &stream).await })
        })
        .await?;
        if existing_stream.is_none() {
            retry_on_throttling(sleeper.clone(), CREATE_RETRY, self.facade.as_mut(), |facade| {
                let group = group.clone();
                let stream = stream.clone();
                Box::pin(async move { facade.create_log_stream(&group, &stream).await })
            })
            .await?;
        }

        self.cached_token = retry_on_throttling(sleeper, DESCRIBE_RETRY, self.facade.as_mut(), |facade| {
            let group = group.clone();
            let stream = stream.clone();
            Box::pin(async move { facade.retrieve_sequence_token(&group, &stream).await })
        })
        .await?;
        Ok(())
    }

    async fn send(&mut self, batch: &[LogMessage]) -> Result<SendOutcome, FacadeError> {
        let token = self.current_token().await?;
        let next_token = self
            .facade
            .put_events(&self.target.group, &self.target.stream, token.as_ref(), batch)
            .await?;
        self.cached_token = Some(next_token);
        Ok(SendOutcome::Accepted)
    }

    async fn refresh_cursor(&mut self) -> Result<(), FacadeError> {
        self.cached_token = self.facade.retrieve_sequence_token(&self.target.group, &self.target.stream).await?;
        Ok(())
    }

    async fn recreate(&mut self) -> Result<(), FacadeError> {
        let sleeper = self.sleeper.clone();
        let group = self.target.group.clone();
        let stream = self.target.stream.clone();

        let existing_group = retry_on_throttling(sleeper.clone(), DESCRIBE_RETRY, self.facade.as_mut(), |facade| {
            let group = group.clone();
            Box::pin(async move { facade.find_log_group(&group).await })
        })
        .await?;
        if existing_group.is_none() {
            retry_on_throttling(sleeper.clone(), CREATE_RETRY, self.facade.as_mut(), |facade| {
                let group = group.clone();
                Box::pin(async move { facade.create_log_group(&group).await })
            })
            .await?;
        }

        retry_on_throttling(sleeper.clone(), CREATE_RETRY, self.facade.as_mut(), |facade| {
            let group = group.clone();
            let stream = stream.clone();
            Box::pin(async move { facade.create_log_stream(&group, &stream).await })
        })
        .await?;

        self.cached_token = retry_on_throttling(sleeper, DESCRIBE_RETRY, self.facade.as_mut(), |facade| {
            let group = group.clone();
            let stream = stream.clone();
            Box::pin(async move { facade.retrieve_sequence_token(&group, &stream).await })
        })
        .await?;
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.facade.shutdown().await;
    }
}
