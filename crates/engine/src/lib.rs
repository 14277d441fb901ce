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

//! Runs every configured destination's writer concurrently under one
//! runtime: [`WriterRuntime::start`] builds a [`writer::Writer`] per
//! destination from a loaded [`config::DestinationConfig`] map and a set of
//! facade factories, forwards `add_message` calls by destination name, and
//! drives a single coordinated [`WriterRuntime::shutdown_all`] across every
//! writer it owns.

use std::{collections::HashMap, sync::Arc, time::Duration};

use config::DestinationConfig;
use facade::{LogGroupFacadeFactory, PartitionedStreamFacadeFactory, TopicFacadeFactory};
use queue::LogMessage;
use retry::{BackoffPolicy, Sleeper};
use task::{labels::ProcessLabels, TaskManager};
use writer::{
    adapter::{DestinationAdapter, InvalidConfigAdapter},
    log_group::{LogGroupAdapter, LogGroupTarget, TokenCacheMode},
    partitioned_stream::{PartitionedStreamAdapter, PartitionedStreamTarget},
    topic::{TopicAdapter, TopicIdentity, TopicTarget},
    Writer, WriterConfig, WriterHandle,
};

/// The backoff schedule applied to every writer's batch-send retries. Not
/// exposed through `config::CommonWriterConfig`; the literal retry-attempt
/// budget (`MAX_SEND_ATTEMPTS`) is what spec.md fixes, the interval between
/// attempts is not.
fn default_backoff() -> BackoffPolicy {
    BackoffPolicy::Exponential {
        initial: Duration::from_millis(250),
        cap: Duration::from_secs(5),
    }
}

/// Errors raised while starting or driving a [`WriterRuntime`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// `add_message` was called with a destination name that was never
    /// configured.
    #[error("unknown destination '{0}'")]
    UnknownDestination(String),
}

/// The three facade factories a [`WriterRuntime`] needs to build an adapter
/// for every destination kind it might be asked to start. A production
/// caller supplies factories that build real network clients; tests supply
/// factories that build `facade::mock` doubles.
pub struct FacadeFactories {
    /// Builds the facade behind every log-group destination.
    pub log_group: Arc<dyn LogGroupFacadeFactory>,
    /// Builds the facade behind every partitioned-stream destination.
    pub partitioned_stream: Arc<dyn PartitionedStreamFacadeFactory>,
    /// Builds the facade behind every topic destination.
    pub topic: Arc<dyn TopicFacadeFactory>,
}

fn build_adapter(config: &DestinationConfig, factories: &FacadeFactories, sleeper: Arc<dyn Sleeper>) -> Box<dyn DestinationAdapter> {
    // A destination's field-level validity is only checked here, lazily,
    // rather than at load time: a malformed destination still gets a
    // writer, one that is permanently stuck in `INIT_FAILED` instead of
    // preventing every other destination's writer from starting.
    if let Err(reason) = config.validate() {
        return Box::new(InvalidConfigAdapter::new(reason));
    }

    match config {
        DestinationConfig::LogGroup(c) => {
            let target = LogGroupTarget {
                group: c.group.clone(),
                stream: c.stream.clone(),
                retention_days: c.retention_days,
                cache_mode: if c.shared_token_cache { TokenCacheMode::Shared } else { TokenCacheMode::Dedicated },
            };
            Box::new(LogGroupAdapter::new(factories.log_group.build(), target, sleeper))
        }
        DestinationConfig::PartitionedStream(c) => {
            let target = PartitionedStreamTarget {
                stream: c.stream.clone(),
                shard_count: c.shard_count,
                retention_hours: c.retention_hours,
                partition_key: c.partition_key.clone(),
            };
            let initialization_timeout = Duration::from_millis(c.common.initialization_timeout_ms);
            Box::new(PartitionedStreamAdapter::new(factories.partitioned_stream.build(), target, sleeper, initialization_timeout))
        }
        DestinationConfig::Topic(c) => {
            let identity = match (&c.topic_arn, &c.topic_name) {
                (Some(arn), _) => TopicIdentity::Arn(arn.clone()),
                (None, Some(name)) => TopicIdentity::Name(name.clone()),
                (None, None) => unreachable!("DestinationConfig::validate rejects a topic with neither name nor arn"),
            };
            let target = TopicTarget {
                identity,
                subject: c.subject.clone(),
            };
            Box::new(TopicAdapter::new(factories.topic.build(), target, sleeper))
        }
    }
}

fn writer_config(config: &DestinationConfig) -> WriterConfig {
    let common = config.common();
    WriterConfig {
        batch_policy: config.batch_policy(),
        discard_threshold: common.discard_threshold,
        discard_action: common.discard_action.into(),
        truncate_oversize: common.truncate_oversize,
        max_wait: Duration::from_millis(common.max_wait_ms),
        backoff: default_backoff(),
        synchronous: common.synchronous,
        enable_batch_logging: common.enable_batch_logging,
    }
}

/// Owns one writer per configured destination and coordinates their
/// shutdown.
pub struct WriterRuntime {
    writers: HashMap<String, WriterHandle>,
    task_manager: TaskManager,
}

impl WriterRuntime {
    /// Starts one writer per entry in `destinations`, registering each under
    /// a shared [`TaskManager`].
    pub fn start(
        destinations: &HashMap<String, DestinationConfig>,
        factories: &FacadeFactories,
        sleeper: Arc<dyn Sleeper>,
        process_labels: ProcessLabels,
    ) -> Self {
        let mut task_manager = TaskManager::with_process_labels(process_labels);
        let mut writers = HashMap::with_capacity(destinations.len());

        for (name, config) in destinations {
            let adapter = build_adapter(config, factories, sleeper.clone());
            let handle = Writer::spawn(name.clone(), adapter, writer_config(config), sleeper.clone(), &mut task_manager);
            tracing::info!(destination = %name, "writer started");
            let _ = writers.insert(name.clone(), handle);
        }

        Self { writers, task_manager }
    }

    /// Enqueues `message` on the named destination's writer.
    pub fn add_message(&self, destination: &str, message: LogMessage) -> Result<(), Error> {
        self.writers
            .get(destination)
            .map(|handle| handle.add_message(message))
            .ok_or_else(|| Error::UnknownDestination(destination.to_string()))
    }

    /// A handle onto the named destination's writer, for reading its state
    /// or statistics directly.
    pub fn writer(&self, destination: &str) -> Option<&WriterHandle> {
        self.writers.get(destination)
    }

    /// Every destination name this runtime started a writer for.
    pub fn destination_names(&self) -> impl Iterator<Item = &str> {
        self.writers.keys().map(String::as_str)
    }

    /// Requests that every writer stop, then waits up to `timeout` for all
    /// of them to finish draining and shut down. Returns `true` if every
    /// writer stopped in time.
    pub async fn shutdown_all(&self, timeout: Duration) -> bool {
        for handle in self.writers.values() {
            handle.stop();
        }
        tokio::time::timeout(timeout, self.task_manager.join()).await.is_ok()
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use facade::mock::{MockLogGroupFacade, MockPartitionedStreamFacade, MockTopicFacade};
    use retry::TokioSleeper;

    use super::*;

    fn factories() -> FacadeFactories {
        FacadeFactories {
            log_group: Arc::new(|| Box::new(MockLogGroupFacade::new_absent()) as Box<dyn facade::LogGroupFacade>),
            partitioned_stream: Arc::new(|| {
                let mut mock = MockPartitionedStreamFacade::new([]);
                mock.status = Some(facade::StreamState::Active);
                Box::new(mock) as Box<dyn facade::PartitionedStreamFacade>
            }),
            topic: Arc::new(|| Box::new(MockTopicFacade::default()) as Box<dyn facade::TopicFacade>),
        }
    }

    fn destinations() -> HashMap<String, DestinationConfig> {
        let mut destinations = HashMap::new();
        let _ = destinations.insert(
            "app-logs".to_string(),
            DestinationConfig::LogGroup(config::LogGroupConfig {
                group: "g".to_string(),
                stream: "s".to_string(),
                retention_days: None,
                shared_token_cache: false,
                common: config::CommonWriterConfig::default(),
            }),
        );
        let _ = destinations.insert(
            "alerts".to_string(),
            DestinationConfig::Topic(config::TopicConfig {
                topic_name: Some("alerts".to_string()),
                topic_arn: None,
                subject: None,
                common: config::CommonWriterConfig::default(),
            }),
        );
        destinations
    }

    #[tokio::test]
    async fn starts_one_writer_per_destination_and_forwards_messages() {
        let runtime = WriterRuntime::start(&destinations(), &factories(), Arc::new(TokioSleeper), ProcessLabels::default());

        assert_eq!(runtime.destination_names().count(), 2);
        runtime.add_message("app-logs", LogMessage::new(1, "hello")).expect("app-logs is configured");
        runtime.add_message("alerts", LogMessage::new(2, "world")).expect("alerts is configured");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runtime.writer("app-logs").unwrap().stats().messages_sent, 1);
        assert_eq!(runtime.writer("alerts").unwrap().stats().messages_sent, 1);
    }

    #[tokio::test]
    async fn add_message_rejects_an_unconfigured_destination() {
        let runtime = WriterRuntime::start(&destinations(), &factories(), Arc::new(TokioSleeper), ProcessLabels::default());
        let err = runtime.add_message("does-not-exist", LogMessage::new(1, "x")).unwrap_err();
        assert!(matches!(err, Error::UnknownDestination(name) if name == "does-not-exist"));
    }

    #[tokio::test]
    async fn shutdown_all_stops_every_writer_before_the_timeout() {
        let runtime = WriterRuntime::start(&destinations(), &factories(), Arc::new(TokioSleeper), ProcessLabels::default());
        let finished = runtime.shutdown_all(Duration::from_secs(1)).await;
        assert!(finished);
        assert_eq!(runtime.writer("app-logs").unwrap().state(), writer::WriterState::Stopped);
    }

    #[tokio::test]
    async fn a_malformed_destination_reaches_init_failed_without_blocking_its_siblings() {
        let mut destinations = destinations();
        let _ = destinations.insert(
            "broken".to_string(),
            DestinationConfig::LogGroup(config::LogGroupConfig {
                group: "I'm No Good!".to_string(),
                stream: "  ".to_string(),
                retention_days: Some(897),
                shared_token_cache: false,
                common: config::CommonWriterConfig::default(),
            }),
        );
        let runtime = WriterRuntime::start(&destinations, &factories(), Arc::new(TokioSleeper), ProcessLabels::default());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runtime.writer("broken").unwrap().state(), writer::WriterState::InitFailed);
        runtime.add_message("broken", LogMessage::new(1, "dropped")).expect("broken is still a configured destination");
        assert_eq!(
            runtime.writer("broken").unwrap().queue_size(),
            0,
            "discard threshold is forced to zero once initialization fails"
        );

        runtime.add_message("app-logs", LogMessage::new(1, "hello")).expect("app-logs is configured");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runtime.writer("app-logs").unwrap().state(), writer::WriterState::Running);
        assert_eq!(runtime.writer("app-logs").unwrap().stats().messages_sent, 1);
    }
}
