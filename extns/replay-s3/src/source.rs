use std::collections::VecDeque;

use aws_sdk_s3::Client;
use replay_core::Event;
use replay_core::source::{EventDecoder, EventSource};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tracing::{debug, info};

use crate::{Error, Result, S3SourceConfig, create_s3_client, extract_aws_error};

type ObjectReader = Box<dyn AsyncBufRead + Unpin + Send>;

struct OpenObject {
    key: String,
    lines: Lines<ObjectReader>,
    line_number: usize,
}

/// Reads the events of every object under the prefix, object after object in key order.
pub struct S3EventSource {
    client: Client,
    bucket: String,
    keys: VecDeque<String>,
    current: Option<OpenObject>,
    decoder: EventDecoder,
}

impl S3EventSource {
    pub async fn connect(config: S3SourceConfig) -> Result<Self> {
        let client = create_s3_client(&config).await?;
        Self::with_client(client, config).await
    }

    /// Lists the objects to replay. An empty listing is not an error, the replay just has
    /// nothing to do.
    pub async fn with_client(client: Client, config: S3SourceConfig) -> Result<Self> {
        config.validate()?;
        let keys = list_keys(&client, &config.bucket, &config.prefix).await?;
        info!(
            bucket = %config.bucket,
            prefix = %config.prefix,
            objects = keys.len(),
            "Listed objects to replay"
        );
        Ok(S3EventSource {
            client,
            bucket: config.bucket,
            keys: keys.into(),
            current: None,
            decoder: EventDecoder::new(config.timestamp_field),
        })
    }
}

async fn open_object(client: &Client, bucket: &str, key: String) -> Result<OpenObject> {
    debug!(%bucket, %key, "Reading object");
    let output = client
        .get_object()
        .bucket(bucket)
        .key(&key)
        .send()
        .await
        .map_err(|e| extract_aws_error(&e))?;
    let reader: ObjectReader = Box::new(output.body.into_async_read());
    Ok(OpenObject {
        key,
        lines: reader.lines(),
        line_number: 0,
    })
}

async fn list_keys(client: &Client, bucket: &str, prefix: &str) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    let mut continuation_token = None;
    loop {
        let output = client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .set_continuation_token(continuation_token)
            .send()
            .await
            .map_err(|e| extract_aws_error(&e))?;

        keys.extend(
            output
                .contents()
                .iter()
                .filter(|object| object.size().unwrap_or_default() > 0)
                .filter_map(|object| object.key())
                .filter(|key| !key.ends_with('/'))
                .map(str::to_string),
        );

        match output.next_continuation_token() {
            Some(token) => continuation_token = Some(token.to_string()),
            None => break,
        }
    }
    keys.sort();
    Ok(keys)
}

impl EventSource for S3EventSource {
    async fn next(&mut self) -> replay_core::Result<Option<Event>> {
        loop {
            if let Some(object) = self.current.as_mut() {
                let line = object.lines.next_line().await.map_err(|e| {
                    Error::S3(format!("reading s3://{}/{}: {e}", self.bucket, object.key))
                })?;
                let Some(line) = line else {
                    self.current = None;
                    continue;
                };
                object.line_number += 1;
                match self.decoder.decode(object.line_number, &line) {
                    Ok(Some(event)) => return Ok(Some(event)),
                    Ok(None) => continue,
                    Err(replay_core::Error::Source(msg)) => {
                        return Err(replay_core::Error::Source(format!(
                            "s3://{}/{} {msg}",
                            self.bucket, object.key
                        )));
                    }
                    Err(e) => return Err(e),
                }
            }

            let Some(key) = self.keys.pop_front() else {
                return Ok(None);
            };
            self.current = Some(open_object(&self.client, &self.bucket, key).await?);
        }
    }
}

#[cfg(test)]
mod tests {
    use aws_config::BehaviorVersion;
    use aws_sdk_s3::config::retry::RetryConfig;
    use aws_sdk_s3::operation::get_object::{GetObjectError, GetObjectOutput};
    use aws_sdk_s3::operation::list_objects_v2::ListObjectsV2Output;
    use aws_sdk_s3::primitives::ByteStream;
    use aws_sdk_s3::types::Object;
    use aws_smithy_mocks::{MockResponseInterceptor, Rule, RuleMode, create_mock_http_client, mock};
    use aws_smithy_types::error::ErrorMetadata;
    use test_log::test;

    use super::*;

    const BUCKET: &str = "aws-bigdata-blog";
    const PREFIX: &str = "artifacts/flink-refarch/data/";

    fn config() -> S3SourceConfig {
        S3SourceConfig {
            region: "eu-west-1".to_string(),
            bucket: BUCKET.to_string(),
            prefix: PREFIX.to_string(),
            endpoint_url: None,
            timestamp_field: "dropoff_datetime".to_string(),
        }
    }

    fn object(key: &str, size: i64) -> Object {
        Object::builder().key(key).size(size).build()
    }

    fn listing_rules() -> Vec<Rule> {
        let first = mock!(aws_sdk_s3::Client::list_objects_v2)
            .match_requests(|req| {
                req.continuation_token().is_none()
                    && req.bucket() == Some(BUCKET)
                    && req.prefix() == Some(PREFIX)
            })
            .then_output(|| {
                ListObjectsV2Output::builder()
                    .contents(object("artifacts/flink-refarch/data/", 0))
                    .contents(object("artifacts/flink-refarch/data/part-2.json", 64))
                    .is_truncated(true)
                    .next_continuation_token("page-2")
                    .build()
            });
        let second = mock!(aws_sdk_s3::Client::list_objects_v2)
            .match_requests(|req| req.continuation_token() == Some("page-2"))
            .then_output(|| {
                ListObjectsV2Output::builder()
                    .contents(object("artifacts/flink-refarch/data/part-1.json", 64))
                    .is_truncated(false)
                    .build()
            });
        vec![first, second]
    }

    fn object_rule(key: &'static str, body: &'static str) -> Rule {
        mock!(aws_sdk_s3::Client::get_object)
            .match_requests(move |req| req.key() == Some(key))
            .then_output(move || {
                GetObjectOutput::builder()
                    .body(ByteStream::from_static(body.as_bytes()))
                    .build()
            })
    }

    fn mock_client(rules: &[Rule]) -> Client {
        let mut interceptor = MockResponseInterceptor::new().rule_mode(RuleMode::MatchAny);
        for rule in rules {
            interceptor = interceptor.with_rule(rule);
        }
        Client::from_conf(
            aws_sdk_s3::Config::builder()
                .behavior_version(BehaviorVersion::latest())
                .credentials_provider(aws_sdk_s3::config::Credentials::new(
                    "ATESTCLIENT",
                    "astestsecretkey",
                    Some("atestsessiontoken".to_string()),
                    None,
                    "",
                ))
                .region(aws_sdk_s3::config::Region::new("eu-west-1"))
                .http_client(create_mock_http_client())
                .retry_config(RetryConfig::disabled())
                .interceptor(interceptor)
                .build(),
        )
    }

    #[test(tokio::test)]
    async fn test_reads_objects_in_key_order() {
        let mut rules = listing_rules();
        rules.push(object_rule(
            "artifacts/flink-refarch/data/part-1.json",
            "{\"dropoff_datetime\": \"2015-01-01 00:00:01\"}\n{\"dropoff_datetime\": \"2015-01-01 00:00:02\"}\n",
        ));
        rules.push(object_rule(
            "artifacts/flink-refarch/data/part-2.json",
            "\n{\"dropoff_datetime\": \"2015-01-01 00:00:03\"}",
        ));
        let mut source = S3EventSource::with_client(mock_client(&rules), config())
            .await
            .unwrap();

        let mut events = vec![];
        while let Some(event) = source.next().await.unwrap() {
            events.push(event);
        }
        let timestamps: Vec<i64> = events.iter().map(|e| e.timestamp % 10_000).collect();
        assert_eq!(timestamps, vec![1_000, 2_000, 3_000]);
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[test(tokio::test)]
    async fn test_decode_error_names_object_and_line() {
        let mut rules = listing_rules();
        rules.push(object_rule(
            "artifacts/flink-refarch/data/part-1.json",
            "{\"dropoff_datetime\": \"2015-01-01 00:00:01\"}\n{\"fare\": 3}\n",
        ));
        let mut source = S3EventSource::with_client(mock_client(&rules), config())
            .await
            .unwrap();

        assert!(source.next().await.unwrap().is_some());
        let err = source.next().await.unwrap_err().to_string();
        assert!(err.contains("s3://aws-bigdata-blog/artifacts/flink-refarch/data/part-1.json"), "{err}");
        assert!(err.contains("line 2"), "{err}");
    }

    #[test(tokio::test)]
    async fn test_missing_object_is_fatal() {
        let mut rules = listing_rules();
        rules.push(mock!(aws_sdk_s3::Client::get_object).then_error(|| {
            GetObjectError::generic(
                ErrorMetadata::builder()
                    .code("NoSuchKey")
                    .message("The specified key does not exist.")
                    .build(),
            )
        }));
        let mut source = S3EventSource::with_client(mock_client(&rules), config())
            .await
            .unwrap();
        let err = source.next().await.unwrap_err();
        assert!(matches!(err, replay_core::Error::Source(_)));
        assert!(err.to_string().contains("NoSuchKey"));
    }
}
