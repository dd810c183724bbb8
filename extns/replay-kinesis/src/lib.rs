//! Amazon Kinesis data stream as the replay destination.
//!
//! Events are batched into `PutRecords` calls by a producer actor, watermark records are written
//! one at a time with `PutRecord` and an explicit hash key, and partitions map onto shards listed
//! through `ListShards`.
use std::time::Duration;

use aws_config::meta::region::RegionProviderChain;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_kinesis::Client;
use aws_sdk_kinesis::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use tokio::sync::oneshot;

mod producer;
pub mod stream;

pub use stream::KinesisStream;

pub const KINESIS_DEFAULT_REGION: &str = "eu-west-1";

/// Upper bound of records per `PutRecords` request.
pub const MAX_BATCH_RECORDS: usize = 500;

/// Upper bound of the payload size of a single `PutRecords` request.
pub(crate) const MAX_BATCH_BYTES: usize = 5 * 1024 * 1024;

const MAX_STREAM_NAME_LEN: usize = 128;

/// Error codes Kinesis (and the KMS key behind an encrypted stream) return when a request is
/// rate limited or a quota is exceeded.
const THROTTLING_CODES: &[&str] = &[
    "LimitExceededException",
    "ProvisionedThroughputExceededException",
    "ThrottlingException",
    "KMSThrottlingException",
    "SlowDown",
    "RequestLimitExceeded",
];

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed with Kinesis error - {0}")]
    Kinesis(String),

    #[error("Throttled by Kinesis - {0}")]
    Throttled(String),

    #[error("Failed to receive message from channel. Actor task is terminated: {0:?}")]
    ActorTaskTerminated(oneshot::error::RecvError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = core::result::Result<T, Error>;

impl From<String> for Error {
    fn from(value: String) -> Self {
        Error::Other(value)
    }
}

impl From<Error> for replay_core::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Throttled(msg) => replay_core::Error::Throttled(msg),
            Error::InvalidConfig(msg) => replay_core::Error::Config(msg),
            other => replay_core::Error::Destination(other.to_string()),
        }
    }
}

pub(crate) fn is_throttling_code(code: &str) -> bool {
    THROTTLING_CODES.contains(&code)
}

/// Converts an SDK error, keeping the error code and message, and singles out throttling.
pub(crate) fn extract_aws_error<E, R>(err: &SdkError<E, R>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = match (err.code(), err.message()) {
        (Some(code), Some(message)) => format!("{code}: {message}"),
        (Some(code), None) => code.to_string(),
        _ => DisplayErrorContext(err).to_string(),
    };
    match err.code() {
        Some(code) if is_throttling_code(code) => Error::Throttled(message),
        _ => Error::Kinesis(message),
    }
}

/// Connection and producer settings of the destination stream.
#[derive(Debug, Clone, PartialEq)]
pub struct KinesisConfig {
    pub region: String,
    pub stream_name: String,
    /// Custom endpoint, e.g. a LocalStack instance.
    pub endpoint_url: Option<String>,
    /// How long a record may wait for its batch to fill up.
    pub max_buffered_time: Duration,
    pub max_batch_records: usize,
    /// Number of `PutRecords` requests allowed in flight at the same time.
    pub max_outstanding_batches: usize,
    /// Attempts per record before a throttled record is failed.
    pub max_record_attempts: u32,
}

impl KinesisConfig {
    pub fn new(region: impl Into<String>, stream_name: impl Into<String>) -> Self {
        KinesisConfig {
            region: region.into(),
            stream_name: stream_name.into(),
            endpoint_url: None,
            max_buffered_time: Duration::from_millis(100),
            max_batch_records: MAX_BATCH_RECORDS,
            max_outstanding_batches: 16,
            max_record_attempts: 5,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.region.is_empty() {
            return Err(Error::InvalidConfig("region is required".to_string()));
        }
        if self.stream_name.is_empty() || self.stream_name.len() > MAX_STREAM_NAME_LEN {
            return Err(Error::InvalidConfig(format!(
                "stream name must be between 1 and {MAX_STREAM_NAME_LEN} characters"
            )));
        }
        if self.max_buffered_time.is_zero() {
            return Err(Error::InvalidConfig(
                "max_buffered_time must be greater than zero".to_string(),
            ));
        }
        if !(1..=MAX_BATCH_RECORDS).contains(&self.max_batch_records) {
            return Err(Error::InvalidConfig(format!(
                "max_batch_records must be between 1 and {MAX_BATCH_RECORDS}"
            )));
        }
        if self.max_outstanding_batches == 0 {
            return Err(Error::InvalidConfig(
                "max_outstanding_batches must be greater than zero".to_string(),
            ));
        }
        if self.max_record_attempts == 0 {
            return Err(Error::InvalidConfig(
                "max_record_attempts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Creates a Kinesis client for the configured region and endpoint, using the default credential
/// chain.
pub async fn create_kinesis_client(config: &KinesisConfig) -> Result<Client> {
    config.validate()?;

    tracing::info!(region = %config.region, "Creating Kinesis client in region");

    let region_provider = RegionProviderChain::first_try(Region::new(config.region.clone()))
        .or_default_provider()
        .or_else(Region::new(KINESIS_DEFAULT_REGION));

    let mut config_builder = aws_config::defaults(BehaviorVersion::latest()).region(region_provider);
    if let Some(endpoint_url) = &config.endpoint_url {
        config_builder = config_builder.endpoint_url(endpoint_url);
    }
    let shared_config = config_builder.load().await;

    Ok(Client::new(&shared_config))
}

#[cfg(test)]
pub(crate) mod test_utils {
    use aws_config::BehaviorVersion;
    use aws_sdk_kinesis::config::retry::RetryConfig;
    use aws_sdk_kinesis::{Client, Config};
    use aws_smithy_mocks::{MockResponseInterceptor, create_mock_http_client};

    /// Client answered by the interceptor's rules. SDK retries are off, so each request consumes
    /// exactly one rule.
    pub(crate) fn mock_client(interceptor: MockResponseInterceptor) -> Client {
        Client::from_conf(
            Config::builder()
                .behavior_version(BehaviorVersion::latest())
                .credentials_provider(make_kinesis_test_credentials())
                .region(aws_sdk_kinesis::config::Region::new("eu-west-1"))
                .http_client(create_mock_http_client())
                .retry_config(RetryConfig::disabled())
                .interceptor(interceptor)
                .build(),
        )
    }

    fn make_kinesis_test_credentials() -> aws_sdk_kinesis::config::Credentials {
        aws_sdk_kinesis::config::Credentials::new(
            "ATESTCLIENT",
            "astestsecretkey",
            Some("atestsessiontoken".to_string()),
            None,
            "",
        )
    }
}
