//! Prometheus metrics for the replay, kept in a process wide registry and optionally served over
//! HTTP on `/metrics`.

use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::body::Body;
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use axum::{Router, routing::get};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{Error, Result};

const EVENTS_SENT: &str = "replay_events_sent";
const EVENT_SEND_FAILURES: &str = "replay_event_send_failures";
const WATERMARKS_EMITTED: &str = "replay_watermarks_emitted";
const WATERMARK_CYCLES_SKIPPED: &str = "replay_watermark_cycles_skipped";
const IN_FLIGHT_EVENTS: &str = "replay_in_flight_events";
const WATERMARK_MILLIS: &str = "replay_watermark_millis";
const LAG_SECONDS: &str = "replay_lag_seconds";

/// The global register of all metrics.
#[derive(Default)]
struct GlobalRegistry {
    // metrics are registered once, contention is not a concern
    registry: parking_lot::Mutex<Registry>,
}

static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(GlobalRegistry::default)
}

/// Metrics updated by the replay loop, the dispatcher and the watermark emitter. Counters get a
/// `_total` suffix when encoded.
pub struct ReplayMetrics {
    pub events_sent: Counter,
    pub send_failures: Counter,
    pub watermarks_emitted: Counter,
    pub watermark_cycles_skipped: Counter,
    pub in_flight: Gauge,
    pub watermark: Gauge,
    pub lag_seconds: Gauge,
}

impl ReplayMetrics {
    fn new() -> Self {
        let metrics = ReplayMetrics {
            events_sent: Counter::default(),
            send_failures: Counter::default(),
            watermarks_emitted: Counter::default(),
            watermark_cycles_skipped: Counter::default(),
            in_flight: Gauge::default(),
            watermark: Gauge::default(),
            lag_seconds: Gauge::default(),
        };

        let mut registry = global_registry().registry.lock();
        registry.register(
            EVENTS_SENT,
            "Total number of events handed to the destination stream",
            metrics.events_sent.clone(),
        );
        registry.register(
            EVENT_SEND_FAILURES,
            "Total number of events the destination stream failed to accept",
            metrics.send_failures.clone(),
        );
        registry.register(
            WATERMARKS_EMITTED,
            "Total number of watermark records written, one per partition per cycle",
            metrics.watermarks_emitted.clone(),
        );
        registry.register(
            WATERMARK_CYCLES_SKIPPED,
            "Total number of watermark cycles abandoned because of throttling",
            metrics.watermark_cycles_skipped.clone(),
        );
        registry.register(
            IN_FLIGHT_EVENTS,
            "Number of events sent but not yet acknowledged",
            metrics.in_flight.clone(),
        );
        registry.register(
            WATERMARK_MILLIS,
            "Last computed watermark in epoch milliseconds",
            metrics.watermark.clone(),
        );
        registry.register(
            LAG_SECONDS,
            "Seconds the replay runs behind the target pace",
            metrics.lag_seconds.clone(),
        );
        metrics
    }
}

static REPLAY_METRICS: OnceLock<ReplayMetrics> = OnceLock::new();

pub fn replay_metrics() -> &'static ReplayMetrics {
    REPLAY_METRICS.get_or_init(ReplayMetrics::new)
}

/// Snapshot of the global registry in the OpenMetrics text format.
pub fn encode_metrics() -> Result<String> {
    // make sure the replay metrics are registered even if nothing touched them yet
    replay_metrics();
    let registry = global_registry().registry.lock();
    let mut buffer = String::new();
    encode(&mut buffer, &registry).map_err(|e| Error::Metrics(e.to_string()))?;
    Ok(buffer)
}

async fn metrics_handler() -> impl IntoResponse {
    match encode_metrics() {
        Ok(buffer) => {
            debug!("Exposing metrics: {:?}", buffer);
            Response::builder()
                .status(StatusCode::OK)
                .header(
                    axum::http::header::CONTENT_TYPE,
                    "application/openmetrics-text; version=1.0.0; charset=utf-8",
                )
                .body(Body::from(buffer))
                .unwrap_or_default()
        }
        Err(e) => {
            error!(error = ?e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn livez() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

fn metrics_router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/livez", get(livez))
}

/// Serves `/metrics` and `/livez` on `addr` until the token is cancelled.
pub async fn start_metrics_server(addr: SocketAddr, cln_token: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Metrics(format!("Binding metrics server to {addr}: {e}")))?;
    info!(?addr, "Starting metrics server");

    axum::serve(listener, metrics_router())
        .with_graceful_shutdown(async move { cln_token.cancelled().await })
        .await
        .map_err(|e| Error::Metrics(format!("Running metrics server: {e}")))
}
