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

//! Loads and validates named destination configurations from a YAML file:
//! one entry per log-group, partitioned-stream, or topic writer the engine
//! should start.

use std::{collections::HashMap, fs::File, io::BufReader, path::Path};

use batch::BatchPolicy;
use queue::DiscardAction;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use validator::{Validate, ValidationError};

/// Errors for the config module.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The config file could not be read or parsed.
    #[error("invalid configuration file `{file}` - {message}")]
    InvalidConfig {
        /// The path to the config file.
        file: String,
        /// The error message.
        message: String,
    },

    /// At least 2 destinations with the same name have been found.
    #[error("duplicate destination '{destination}' found (config file '{file}')")]
    DuplicateDestination {
        /// The path to the config file.
        file: String,
        /// The destination name.
        destination: String,
    },

    /// A destination was not found.
    #[error("destination '{destination}' not found (config file '{file}')")]
    DestinationNotFound {
        /// The path to the config file.
        file: String,
        /// The destination name.
        destination: String,
    },

}

/// How the queue behaves once `discard_threshold` messages are buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardActionConfig {
    /// Drop the oldest queued message.
    #[default]
    Oldest,
    /// Drop the incoming message.
    Newest,
    /// Never discard; the queue grows without bound.
    None,
}

impl From<DiscardActionConfig> for DiscardAction {
    fn from(value: DiscardActionConfig) -> Self {
        match value {
            DiscardActionConfig::Oldest => DiscardAction::Oldest,
            DiscardActionConfig::Newest => DiscardAction::Newest,
            DiscardActionConfig::None => DiscardAction::None,
        }
    }
}

fn default_discard_threshold() -> usize {
    10_000
}

fn default_max_wait_ms() -> u64 {
    5_000
}

fn default_initialization_timeout_ms() -> u64 {
    60_000
}

/// Settings shared by every destination kind: the queue's discard policy
/// and how long a batch waits to fill before sending whatever it has.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CommonWriterConfig {
    /// Maximum number of queued messages before the discard policy kicks
    /// in.
    #[serde(default = "default_discard_threshold")]
    #[validate(range(min = 1))]
    pub discard_threshold: usize,
    /// What happens to new or old messages once `discard_threshold` is
    /// exceeded.
    #[serde(default)]
    pub discard_action: DiscardActionConfig,
    /// Whether a message larger than the destination's per-message cap is
    /// truncated (`true`) or dropped (`false`).
    #[serde(default)]
    pub truncate_oversize: bool,
    /// How long, in milliseconds, a batch waits for its first message
    /// before the writer checks whether it should stop.
    #[serde(default = "default_max_wait_ms")]
    #[validate(range(min = 1))]
    pub max_wait_ms: u64,
    /// How long, in milliseconds, `initialize` may spend waiting for the
    /// destination to become ready (a partitioned stream's create-then-
    /// become-active poll; the create/describe retry budgets for the other
    /// destinations are fixed and don't draw against this).
    #[serde(default = "default_initialization_timeout_ms")]
    #[validate(range(min = 1))]
    pub initialization_timeout_ms: u64,
    /// When `true`, `add_message` sends inline on the caller's thread
    /// instead of handing off to a background worker.
    #[serde(default)]
    pub synchronous: bool,
    /// When `true`, logs a DEBUG event before and after every batch send
    /// attempt.
    #[serde(default)]
    pub enable_batch_logging: bool,
}

impl Default for CommonWriterConfig {
    fn default() -> Self {
        Self {
            discard_threshold: default_discard_threshold(),
            discard_action: DiscardActionConfig::default(),
            truncate_oversize: false,
            max_wait_ms: default_max_wait_ms(),
            initialization_timeout_ms: default_initialization_timeout_ms(),
            synchronous: false,
            enable_batch_logging: false,
        }
    }
}

/// The literal set of retention periods the log-group destination accepts,
/// in days.
const ALLOWED_LOG_GROUP_RETENTION_DAYS: &[u32] = &[
    1, 3, 5, 7, 14, 30, 60, 90, 120, 150, 180, 365, 400, 545, 731, 1096, 1827, 2192, 2557, 2922, 3288, 3653,
];

fn validate_retention_days(days: &u32) -> Result<(), ValidationError> {
    if ALLOWED_LOG_GROUP_RETENTION_DAYS.contains(days) {
        Ok(())
    } else {
        Err(ValidationError::new("retention_days").with_message(format!("invalid retention period: {days}").into()))
    }
}

/// A destination name (log group, stream, or partitioned-stream stream):
/// 1-128 characters, restricted to `[A-Za-z0-9_.-]`.
fn is_valid_destination_name(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 128
        && value.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn validate_log_group_name(value: &str) -> Result<(), ValidationError> {
    if is_valid_destination_name(value) {
        Ok(())
    } else {
        Err(ValidationError::new("group").with_message("invalid log group name".into()))
    }
}

fn validate_log_stream_name(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::new("stream").with_message("blank log stream name".into()))
    } else if is_valid_destination_name(value) {
        Ok(())
    } else {
        Err(ValidationError::new("stream").with_message("invalid log stream name".into()))
    }
}

fn validate_stream_name(value: &str) -> Result<(), ValidationError> {
    if is_valid_destination_name(value) {
        Ok(())
    } else {
        Err(ValidationError::new("stream").with_message("invalid stream name".into()))
    }
}

/// A topic subject line: at most 100 ASCII characters.
fn validate_subject(value: &str) -> Result<(), ValidationError> {
    if value.len() <= 100 && value.is_ascii() {
        Ok(())
    } else {
        Err(ValidationError::new("subject").with_message("invalid subject: must be at most 100 ASCII characters".into()))
    }
}

/// Configuration for a log-group/stream destination.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LogGroupConfig {
    /// The log group's name.
    #[validate(custom(function = "validate_log_group_name"))]
    pub group: String,
    /// The stream's name within that group.
    #[validate(custom(function = "validate_log_stream_name"))]
    pub stream: String,
    /// Retention, in days; must be one of the service's accepted values.
    /// Left unset, the service's own default retention applies.
    #[validate(custom(function = "validate_retention_days"))]
    pub retention_days: Option<u32>,
    /// Whether other writers may also be appending to this stream. When
    /// `true`, the cached sequence token is re-fetched before every send
    /// instead of being reused from the previous response.
    #[serde(default)]
    pub shared_token_cache: bool,
    /// Settings shared by every destination kind.
    #[serde(flatten)]
    #[validate(nested)]
    pub common: CommonWriterConfig,
}

/// Configuration for a partitioned-stream destination.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PartitionedStreamConfig {
    /// The stream's name.
    #[validate(custom(function = "validate_stream_name"))]
    pub stream: String,
    /// The shard count to request if the stream must be created.
    #[validate(range(min = 1, max = 10_000))]
    pub shard_count: u32,
    /// Retention, in hours. Left unset, the service's own default applies.
    #[validate(range(min = 24, max = 8_760))]
    pub retention_hours: Option<u32>,
    /// The partition key every record from this writer is sent under, 1 to
    /// 256 bytes.
    #[validate(length(min = 1, max = 256))]
    pub partition_key: String,
    /// Settings shared by every destination kind.
    #[serde(flatten)]
    #[validate(nested)]
    pub common: CommonWriterConfig,
}

/// Configuration for a topic destination. Exactly one of `topic_name` or
/// `topic_arn` must be set.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TopicConfig {
    /// The topic's name; resolved to an ARN (creating it if missing) at
    /// startup. Mutually exclusive with `topic_arn`.
    pub topic_name: Option<String>,
    /// An existing topic's ARN, used as-is. Mutually exclusive with
    /// `topic_name`.
    pub topic_arn: Option<String>,
    /// A static subject attached to every published message, at most 100
    /// ASCII characters.
    #[validate(custom(function = "validate_subject"))]
    pub subject: Option<String>,
    /// Settings shared by every destination kind.
    #[serde(flatten)]
    #[validate(nested)]
    pub common: CommonWriterConfig,
}

/// One named destination's configuration, as loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DestinationConfig {
    /// A log-group/stream destination.
    LogGroup(LogGroupConfig),
    /// A partitioned-stream destination.
    PartitionedStream(PartitionedStreamConfig),
    /// A topic destination.
    Topic(TopicConfig),
}

impl DestinationConfig {
    /// Validates the per-kind field constraints and the cross-field
    /// invariants `validator`'s derive can't express (the topic
    /// destination's mutually-exclusive identity). A destination that
    /// fails this is still loaded by [`load_destinations`]; the engine
    /// turns the failure into that one writer's `INIT_FAILED` state
    /// instead of refusing to start the others.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            DestinationConfig::LogGroup(config) => config.validate().map_err(|err| err.to_string()),
            DestinationConfig::PartitionedStream(config) => config.validate().map_err(|err| err.to_string()),
            DestinationConfig::Topic(config) => {
                config.validate().map_err(|err| err.to_string())?;
                match (&config.topic_name, &config.topic_arn) {
                    (Some(_), None) | (None, Some(_)) => Ok(()),
                    (Some(_), Some(_)) => Err("exactly one of topic_name or topic_arn must be set, not both".to_string()),
                    (None, None) => Err("one of topic_name or topic_arn must be set".to_string()),
                }
            }
        }
    }

    /// The batch policy implied by this destination's kind (and, for a
    /// partitioned stream, its partition key length).
    pub fn batch_policy(&self) -> BatchPolicy {
        match self {
            DestinationConfig::LogGroup(_) => BatchPolicy::log_group(),
            DestinationConfig::PartitionedStream(config) => BatchPolicy::partitioned_stream(config.partition_key.len()),
            DestinationConfig::Topic(_) => BatchPolicy::topic(),
        }
    }

    /// Settings shared by every destination kind.
    pub fn common(&self) -> &CommonWriterConfig {
        match self {
            DestinationConfig::LogGroup(config) => &config.common,
            DestinationConfig::PartitionedStream(config) => &config.common,
            DestinationConfig::Topic(config) => &config.common,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NamedDestination {
    name: String,
    #[serde(flatten)]
    config: DestinationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawConfig {
    destinations: Vec<NamedDestination>,
}

/// Loads every named destination from a YAML file, rejecting duplicate
/// names and destinations that fail validation.
pub fn load_destinations<P: AsRef<Path>>(config_file_path: P) -> Result<HashMap<String, DestinationConfig>, Error> {
    let file_name = config_file_path.as_ref().display().to_string();
    debug!("loading {}", file_name);

    let file = File::open(&config_file_path).map_err(|err| Error::InvalidConfig {
        file: file_name.clone(),
        message: err.to_string(),
    })?;
    let reader = BufReader::new(file);
    let raw: RawConfig = serde_yaml::from_reader(reader).map_err(|err| Error::InvalidConfig {
        file: file_name.clone(),
        message: err.to_string(),
    })?;

    let mut destinations = HashMap::with_capacity(raw.destinations.len());
    for named in raw.destinations {
        // A destination's own field validity is checked lazily by the
        // engine when it builds that destination's adapter, not here: one
        // malformed destination must not prevent its siblings from
        // loading and starting.
        if destinations.insert(named.name.clone(), named.config).is_some() {
            return Err(Error::DuplicateDestination {
                file: file_name,
                destination: named.name,
            });
        }
    }

    debug!("{} loaded ({} destinations)", file_name, destinations.len());
    Ok(destinations)
}

/// Looks up a destination by name, for use by callers (the engine) that
/// already hold the map `load_destinations` returned.
pub fn resolve<'a>(
    destinations: &'a HashMap<String, DestinationConfig>,
    name: &str,
    config_file_path: impl AsRef<Path>,
) -> Result<&'a DestinationConfig, Error> {
    destinations.get(name).ok_or_else(|| Error::DestinationNotFound {
        file: config_file_path.as_ref().display().to_string(),
        destination: name.to_string(),
    })
}
