use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Arg, ArgAction, ArgMatches, Command};
use replay_core::{ReplayConfig, WatermarkConfig};
use replay_kinesis::KinesisConfig;
use replay_s3::S3SourceConfig;

pub(super) fn root_cli() -> Command {
    Command::new("replay")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Replays historic events into a Kinesis data stream, paced by their event time")
        .arg(
            Arg::new("region")
                .long("region")
                .help("AWS region of the source bucket and the destination stream")
                .default_value("eu-west-1"),
        )
        .arg(
            Arg::new("bucket")
                .long("bucket")
                .help("Bucket holding the events to replay")
                .default_value("aws-bigdata-blog"),
        )
        .arg(
            Arg::new("prefix")
                .long("prefix")
                .help("Prefix of the objects to replay")
                .default_value("artifacts/flink-refarch/data/"),
        )
        .arg(
            Arg::new("input-file")
                .long("input-file")
                .help("Replay a local JSON lines file instead of the objects in S3")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(PathBuf))
                .conflicts_with_all(["bucket", "prefix"]),
        )
        .arg(
            Arg::new("stream")
                .long("stream")
                .help("Name of the Kinesis data stream the events are written to")
                .default_value("taxi-trip-events"),
        )
        .arg(
            Arg::new("speedup")
                .long("speedup")
                .help("Factor by which the replay runs faster than the original events")
                .value_parser(clap::value_parser!(f64))
                .default_value("1440"),
        )
        .arg(
            Arg::new("no-watermark")
                .long("no-watermark")
                .help("Do not write watermark records to the stream")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("timestamp-field")
                .long("timestamp-field")
                .help("JSON field holding the event time of each event")
                .default_value("dropoff_datetime"),
        )
        .arg(
            Arg::new("endpoint-url")
                .long("endpoint-url")
                .help("Custom AWS endpoint, e.g. http://localhost:4566 for LocalStack")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("metrics-addr")
                .long("metrics-addr")
                .help("Address to serve Prometheus metrics on, e.g. 0.0.0.0:9090")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(SocketAddr)),
        )
}

/// Replay settings as given on the command line.
#[derive(Debug, Clone, PartialEq)]
pub(super) struct ReplayArgs {
    pub(super) region: String,
    pub(super) bucket: String,
    pub(super) prefix: String,
    pub(super) input_file: Option<PathBuf>,
    pub(super) stream: String,
    pub(super) speedup: f64,
    pub(super) watermarks: bool,
    pub(super) timestamp_field: String,
    pub(super) endpoint_url: Option<String>,
    pub(super) metrics_addr: Option<SocketAddr>,
}

impl ReplayArgs {
    pub(super) fn from_matches(matches: &ArgMatches) -> Self {
        let string = |id: &str| {
            matches
                .get_one::<String>(id)
                .cloned()
                .unwrap_or_default()
        };
        ReplayArgs {
            region: string("region"),
            bucket: string("bucket"),
            prefix: string("prefix"),
            input_file: matches.get_one::<PathBuf>("input-file").cloned(),
            stream: string("stream"),
            // a missing value fails validation of the replay config
            speedup: matches
                .get_one::<f64>("speedup")
                .copied()
                .unwrap_or_default(),
            watermarks: !matches.get_flag("no-watermark"),
            timestamp_field: string("timestamp-field"),
            endpoint_url: matches.get_one::<String>("endpoint-url").cloned(),
            metrics_addr: matches.get_one::<SocketAddr>("metrics-addr").copied(),
        }
    }

    pub(super) fn replay_config(&self) -> ReplayConfig {
        ReplayConfig {
            speedup: self.speedup,
            watermark: WatermarkConfig {
                enabled: self.watermarks,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub(super) fn kinesis_config(&self) -> KinesisConfig {
        KinesisConfig {
            endpoint_url: self.endpoint_url.clone(),
            ..KinesisConfig::new(self.region.clone(), self.stream.clone())
        }
    }

    pub(super) fn s3_config(&self) -> S3SourceConfig {
        S3SourceConfig {
            region: self.region.clone(),
            bucket: self.bucket.clone(),
            prefix: self.prefix.clone(),
            endpoint_url: self.endpoint_url.clone(),
            timestamp_field: self.timestamp_field.clone(),
        }
    }
}
