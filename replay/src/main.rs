use std::error::Error;
use std::future;
use std::sync::Arc;

use replay_core::metrics::start_metrics_server;
use replay_core::source::{EventDecoder, EventSource, LineSource};
use replay_core::{ReplayConfig, ReplaySummary, Replayer};
use replay_kinesis::KinesisStream;
use replay_s3::S3EventSource;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cmdline::ReplayArgs;

mod cmdline;
mod setup_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    // prints help or version and exits when asked to
    let matches = cmdline::root_cli().get_matches();
    let args = ReplayArgs::from_matches(&matches);

    if let Err(e) = run(args).await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run(args: ReplayArgs) -> Result<(), Box<dyn Error>> {
    info!(?args, "Starting replay with args");
    let config = args.replay_config();
    config.validate()?;

    let cln_token = CancellationToken::new();
    let shutdown_cln_token = cln_token.clone();

    // wait for SIG{INT,TERM} and invoke cancellation token.
    let shutdown_handle = tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_cln_token.cancel();
    });

    // stops together with the replay, also when the replay ended on its own
    let metrics_cln_token = cln_token.child_token();
    let metrics_handle = args.metrics_addr.map(|addr| {
        let metrics_cln_token = metrics_cln_token.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(addr, metrics_cln_token).await {
                error!(?e, "Metrics server failed");
            }
        })
    });

    let result = replay(&args, config, cln_token).await;

    metrics_cln_token.cancel();
    if let Some(handle) = metrics_handle {
        if let Err(e) = handle.await {
            warn!(?e, "Metrics server task failed");
        }
    }
    if !shutdown_handle.is_finished() {
        shutdown_handle.abort();
    }

    let summary = result?;
    info!(
        events_sent = summary.events_sent,
        send_failures = summary.send_failures,
        watermarks_emitted = summary.watermarks_emitted,
        watermark_cycles_skipped = summary.watermark_cycles_skipped,
        last_watermark = ?summary.last_watermark,
        "Replay finished"
    );
    Ok(())
}

async fn replay(
    args: &ReplayArgs,
    config: ReplayConfig,
    cln_token: CancellationToken,
) -> Result<ReplaySummary, Box<dyn Error>> {
    let destination = Arc::new(KinesisStream::connect(args.kinesis_config()).await?);

    match &args.input_file {
        Some(path) => {
            info!(path = %path.display(), "Replaying events from local file");
            let decoder = EventDecoder::new(args.timestamp_field.clone());
            let source = LineSource::open(path, decoder).await?;
            replay_from(source, destination, config, cln_token).await
        }
        None => {
            let source = S3EventSource::connect(args.s3_config()).await?;
            replay_from(source, destination, config, cln_token).await
        }
    }
}

async fn replay_from<S>(
    source: S,
    destination: Arc<KinesisStream>,
    config: ReplayConfig,
    cln_token: CancellationToken,
) -> Result<ReplaySummary, Box<dyn Error>>
where
    S: EventSource + Send,
{
    let summary = Replayer::new(source, destination, config, cln_token)
        .run()
        .await?;
    Ok(summary)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => {
                error!(?e, "Failed to install Ctrl+C handler");
                future::pending::<()>().await;
            }
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                error!(?e, "Failed to install terminate signal handler");
                future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
