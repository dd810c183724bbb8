//! Replays events stored as JSON-lines objects in S3.
//!
//! All objects under a prefix are read in key order, one event per line, as if they were one
//! continuous file.
use aws_config::meta::region::RegionProviderChain;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};

pub mod source;

pub use source::S3EventSource;

pub const S3_DEFAULT_REGION: &str = "eu-west-1";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed with S3 error - {0}")]
    S3(String),

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
            Error::InvalidConfig(msg) => replay_core::Error::Config(msg),
            other => replay_core::Error::Source(other.to_string()),
        }
    }
}

pub(crate) fn extract_aws_error<E, R>(err: &SdkError<E, R>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    match (err.code(), err.message()) {
        (Some(code), Some(message)) => Error::S3(format!("{code}: {message}")),
        (Some(code), None) => Error::S3(code.to_string()),
        _ => Error::S3(DisplayErrorContext(err).to_string()),
    }
}

/// Location and format of the replayed objects.
#[derive(Debug, Clone, PartialEq)]
pub struct S3SourceConfig {
    pub region: String,
    pub bucket: String,
    pub prefix: String,
    pub endpoint_url: Option<String>,
    /// JSON field holding the event time of each line.
    pub timestamp_field: String,
}

impl S3SourceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.region.is_empty() {
            return Err(Error::InvalidConfig("region is required".to_string()));
        }
        if self.bucket.is_empty() {
            return Err(Error::InvalidConfig("bucket is required".to_string()));
        }
        if self.timestamp_field.is_empty() {
            return Err(Error::InvalidConfig(
                "timestamp field is required".to_string(),
            ));
        }
        Ok(())
    }
}

pub async fn create_s3_client(config: &S3SourceConfig) -> Result<Client> {
    config.validate()?;

    tracing::info!(region = %config.region, "Creating S3 client in region");

    let region_provider = RegionProviderChain::first_try(Region::new(config.region.clone()))
        .or_default_provider()
        .or_else(Region::new(S3_DEFAULT_REGION));

    let mut config_builder = aws_config::defaults(BehaviorVersion::latest()).region(region_provider);
    if let Some(endpoint_url) = &config.endpoint_url {
        config_builder = config_builder.endpoint_url(endpoint_url);
    }
    let shared_config = config_builder.load().await;

    // LocalStack and other S3 compatible endpoints usually do not resolve bucket subdomains
    let s3_config = aws_sdk_s3::config::Builder::from(&shared_config)
        .force_path_style(config.endpoint_url.is_some())
        .build();
    Ok(Client::from_conf(s3_config))
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    fn config() -> S3SourceConfig {
        S3SourceConfig {
            region: "eu-west-1".to_string(),
            bucket: "aws-bigdata-blog".to_string(),
            prefix: "artifacts/flink-refarch/data/".to_string(),
            endpoint_url: None,
            timestamp_field: "dropoff_datetime".to_string(),
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(config().validate().is_ok());
        let invalid = S3SourceConfig {
            bucket: String::new(),
            ..config()
        };
        assert!(matches!(invalid.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test(tokio::test)]
    async fn test_client_creation() {
        let config = S3SourceConfig {
            endpoint_url: Some("http://localhost:4566".to_string()),
            ..config()
        };
        assert!(create_s3_client(&config).await.is_ok());
    }

    #[test]
    fn test_error_conversion() {
        let err: replay_core::Error = Error::S3("NoSuchBucket".to_string()).into();
        assert!(matches!(err, replay_core::Error::Source(_)));
        let err: replay_core::Error = Error::InvalidConfig("bucket".to_string()).into();
        assert!(matches!(err, replay_core::Error::Config(_)));
    }
}
