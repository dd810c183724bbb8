use std::time::Duration;

use aws_sdk_kinesis::Client;
use aws_sdk_kinesis::primitives::Blob;
use aws_sdk_kinesis::types::StreamStatus;
use replay_core::backoff::Exponential;
use replay_core::destination::{
    Ack, Destination, PartitionDescriptor, PartitionPage, PendingSubmit, Record,
};
use tracing::{info, warn};

use crate::producer::Producer;
use crate::{Error, KinesisConfig, Result, create_kinesis_client, extract_aws_error};

const STREAM_WAIT_ATTEMPTS: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Ready,
    Pending,
    Unusable,
}

fn readiness(status: &StreamStatus) -> Readiness {
    match status {
        StreamStatus::Active => Readiness::Ready,
        StreamStatus::Creating | StreamStatus::Updating => Readiness::Pending,
        _ => Readiness::Unusable,
    }
}

/// A Kinesis data stream. Every shard is a partition, its hash-key range lower bound routes the
/// watermark records.
pub struct KinesisStream {
    client: Client,
    stream_name: String,
    producer: Producer,
}

impl KinesisStream {
    /// Creates the client and connects to the configured stream.
    pub async fn connect(config: KinesisConfig) -> Result<Self> {
        let client = create_kinesis_client(&config).await?;
        Self::with_client(client, config).await
    }

    /// Connects with an existing client. Fails if the stream does not exist or is being deleted,
    /// and waits while it is still being created or updated.
    pub async fn with_client(client: Client, config: KinesisConfig) -> Result<Self> {
        config.validate()?;
        wait_until_active(&client, &config.stream_name).await?;
        info!(stream = %config.stream_name, "Kinesis stream is active");

        let producer = Producer::start(client.clone(), &config);
        Ok(KinesisStream {
            client,
            stream_name: config.stream_name,
            producer,
        })
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    async fn put_record(&self, record: Record) -> Result<Ack> {
        let output = self
            .client
            .put_record()
            .stream_name(&self.stream_name)
            .data(Blob::new(record.payload.to_vec()))
            .partition_key(record.routing.partition_key())
            .set_explicit_hash_key(record.routing.explicit_hash_key().map(str::to_string))
            .send()
            .await
            .map_err(|e| extract_aws_error(&e))?;

        Ok(Ack {
            partition_id: output.shard_id().to_string(),
            sequence_number: Some(output.sequence_number().to_string()),
        })
    }

    async fn list_shards(&self, next_token: Option<String>) -> Result<PartitionPage> {
        // the stream name must not be set together with a continuation token
        let request = match next_token {
            Some(token) => self.client.list_shards().next_token(token),
            None => self.client.list_shards().stream_name(&self.stream_name),
        };
        let output = request.send().await.map_err(|e| extract_aws_error(&e))?;

        let partitions = output
            .shards()
            .iter()
            .map(|shard| {
                let lower_bound = shard
                    .hash_key_range()
                    .map(|range| range.starting_hash_key().to_string())
                    .ok_or_else(|| {
                        Error::Kinesis(format!("shard {} has no hash key range", shard.shard_id()))
                    })?;
                Ok(PartitionDescriptor {
                    partition_id: shard.shard_id().to_string(),
                    hash_range_lower_bound: lower_bound,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(PartitionPage {
            partitions,
            next_token: output.next_token().map(str::to_string),
        })
    }
}

async fn wait_until_active(client: &Client, stream_name: &str) -> Result<()> {
    let mut backoff = Exponential::new(
        Duration::from_secs(1),
        Duration::from_secs(10),
        1.5,
        0.2,
        Some(STREAM_WAIT_ATTEMPTS),
    );
    loop {
        let output = client
            .describe_stream_summary()
            .stream_name(stream_name)
            .send()
            .await
            .map_err(|e| extract_aws_error(&e))?;
        let status = output
            .stream_description_summary()
            .map(|summary| summary.stream_status().clone())
            .ok_or_else(|| Error::Kinesis(format!("no description for stream {stream_name}")))?;

        match readiness(&status) {
            Readiness::Ready => return Ok(()),
            Readiness::Unusable => {
                return Err(Error::Kinesis(format!(
                    "stream {stream_name} is {}, cannot write to it",
                    status.as_str()
                )));
            }
            Readiness::Pending => match backoff.next() {
                Some(delay) => {
                    warn!(
                        stream = stream_name,
                        status = status.as_str(),
                        ?delay,
                        "Waiting for stream to become active"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Err(Error::Kinesis(format!(
                        "stream {stream_name} did not become active, still {}",
                        status.as_str()
                    )));
                }
            },
        }
    }
}

impl Destination for KinesisStream {
    fn submit(&self, record: Record) -> replay_core::Result<PendingSubmit> {
        Ok(self.producer.submit(record)?)
    }

    async fn put(&self, record: Record) -> replay_core::Result<Ack> {
        Ok(self.put_record(record).await?)
    }

    async fn list_partitions(
        &self,
        next_token: Option<String>,
    ) -> replay_core::Result<PartitionPage> {
        Ok(self.list_shards(next_token).await?)
    }

    async fn flush(&self) -> replay_core::Result<()> {
        Ok(self.producer.flush().await?)
    }
}

#[cfg(test)]
mod tests {
    use aws_sdk_kinesis::operation::describe_stream_summary::{
        DescribeStreamSummaryError, DescribeStreamSummaryOutput,
    };
    use aws_sdk_kinesis::operation::list_shards::{ListShardsError, ListShardsOutput};
    use aws_sdk_kinesis::operation::put_record::PutRecordOutput;
    use aws_sdk_kinesis::types::{
        EncryptionType, HashKeyRange, SequenceNumberRange, Shard, StreamDescriptionSummary,
        StreamMode, StreamModeDetails,
    };
    use aws_smithy_mocks::{MockResponseInterceptor, Rule, RuleMode, mock};
    use aws_smithy_types::DateTime;
    use aws_smithy_types::error::ErrorMetadata;
    use replay_core::WatermarkRecord;
    use test_log::test;

    use super::*;
    use crate::test_utils::mock_client;

    const STREAM: &str = "taxi-trip-events";

    fn describe_rule(status: StreamStatus) -> Rule {
        mock!(aws_sdk_kinesis::Client::describe_stream_summary)
            .match_requests(|req| req.stream_name() == Some(STREAM))
            .then_output(move || {
                let summary = StreamDescriptionSummary::builder()
                    .stream_name(STREAM)
                    .stream_arn("arn:aws:kinesis:eu-west-1:123456789012:stream/taxi-trip-events")
                    .stream_status(status.clone())
                    .stream_mode_details(
                        StreamModeDetails::builder()
                            .stream_mode(StreamMode::Provisioned)
                            .build()
                            .unwrap(),
                    )
                    .retention_period_hours(24)
                    .stream_creation_timestamp(DateTime::from_secs(0))
                    .encryption_type(EncryptionType::None)
                    .open_shard_count(3)
                    .set_enhanced_monitoring(Some(vec![]))
                    .build()
                    .unwrap();
                DescribeStreamSummaryOutput::builder()
                    .stream_description_summary(summary)
                    .build()
            })
    }

    fn shard(id: &str, lower: &str, upper: &str) -> Shard {
        Shard::builder()
            .shard_id(id)
            .hash_key_range(
                HashKeyRange::builder()
                    .starting_hash_key(lower)
                    .ending_hash_key(upper)
                    .build()
                    .unwrap(),
            )
            .sequence_number_range(
                SequenceNumberRange::builder()
                    .starting_sequence_number("0")
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap()
    }

    fn list_shards_rules() -> (Rule, Rule) {
        let first = mock!(aws_sdk_kinesis::Client::list_shards)
            .match_requests(|req| req.next_token().is_none() && req.stream_name() == Some(STREAM))
            .then_output(|| {
                ListShardsOutput::builder()
                    .shards(shard("shardId-000000000000", "0", "99"))
                    .shards(shard("shardId-000000000001", "100", "199"))
                    .next_token("page-2")
                    .build()
            });
        let second = mock!(aws_sdk_kinesis::Client::list_shards)
            .match_requests(|req| req.next_token() == Some("page-2") && req.stream_name().is_none())
            .then_output(|| {
                ListShardsOutput::builder()
                    .shards(shard("shardId-000000000002", "200", "340282366920938463463374607431768211455"))
                    .build()
            });
        (first, second)
    }

    fn interceptor(rules: &[&Rule]) -> MockResponseInterceptor {
        let mut interceptor = MockResponseInterceptor::new().rule_mode(RuleMode::MatchAny);
        for rule in rules {
            interceptor = interceptor.with_rule(rule);
        }
        interceptor
    }

    async fn stream(rules: &[&Rule]) -> Result<KinesisStream> {
        KinesisStream::with_client(
            mock_client(interceptor(rules)),
            KinesisConfig::new("eu-west-1", STREAM),
        )
        .await
    }

    #[test]
    fn test_stream_readiness() {
        assert_eq!(readiness(&StreamStatus::Active), Readiness::Ready);
        assert_eq!(readiness(&StreamStatus::Creating), Readiness::Pending);
        assert_eq!(readiness(&StreamStatus::Updating), Readiness::Pending);
        assert_eq!(readiness(&StreamStatus::Deleting), Readiness::Unusable);
    }

    #[test(tokio::test)]
    async fn test_missing_stream_is_fatal() {
        let rule = mock!(aws_sdk_kinesis::Client::describe_stream_summary).then_error(|| {
            DescribeStreamSummaryError::generic(
                ErrorMetadata::builder()
                    .code("ResourceNotFoundException")
                    .message("Stream taxi-trip-events under account 123456789012 not found.")
                    .build(),
            )
        });
        let err = stream(&[&rule]).await.err().unwrap();
        assert!(matches!(err, Error::Kinesis(_)));
        assert!(err.to_string().contains("ResourceNotFoundException"));
    }

    #[test(tokio::test)]
    async fn test_deleting_stream_is_fatal() {
        let rule = describe_rule(StreamStatus::Deleting);
        let err = stream(&[&rule]).await.err().unwrap();
        assert!(err.to_string().contains("cannot write to it"));
    }

    #[test(tokio::test)]
    async fn test_list_partitions_follows_next_token() {
        let describe = describe_rule(StreamStatus::Active);
        let (first, second) = list_shards_rules();
        let stream = stream(&[&describe, &first, &second]).await.unwrap();

        let page = stream.list_partitions(None).await.unwrap();
        assert_eq!(page.partitions.len(), 2);
        assert_eq!(page.partitions[1].hash_range_lower_bound, "100");
        assert_eq!(page.next_token.as_deref(), Some("page-2"));

        let page = stream.list_partitions(page.next_token).await.unwrap();
        assert_eq!(page.partitions[0].partition_id, "shardId-000000000002");
        assert!(page.next_token.is_none());
    }

    #[test(tokio::test)]
    async fn test_list_partitions_throttled() {
        let describe = describe_rule(StreamStatus::Active);
        let throttled = mock!(aws_sdk_kinesis::Client::list_shards).then_error(|| {
            ListShardsError::generic(
                ErrorMetadata::builder()
                    .code("LimitExceededException")
                    .message("Rate exceeded for stream taxi-trip-events")
                    .build(),
            )
        });
        let stream = stream(&[&describe, &throttled]).await.unwrap();
        let err = stream.list_partitions(None).await.unwrap_err();
        assert!(err.is_throttled());
    }

    #[test(tokio::test)]
    async fn test_watermark_put_uses_explicit_hash_key() {
        let describe = describe_rule(StreamStatus::Active);
        let put = mock!(aws_sdk_kinesis::Client::put_record)
            .match_requests(|req| {
                req.explicit_hash_key() == Some("100")
                    && req.partition_key() == Some("23")
                    && req.stream_name() == Some(STREAM)
            })
            .then_output(|| {
                PutRecordOutput::builder()
                    .shard_id("shardId-000000000001")
                    .sequence_number("49590338271490256608559692538361571095921575989136588898")
                    .build()
                    .unwrap()
            });
        let stream = stream(&[&describe, &put]).await.unwrap();

        let record = Record::for_watermark(&WatermarkRecord::new(1_420_070_400_000), "100");
        let ack = stream.put(record).await.unwrap();
        assert_eq!(ack.partition_id, "shardId-000000000001");
    }
}
