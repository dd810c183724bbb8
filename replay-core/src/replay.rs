//! The driving loop.
//!
//! ```text
//!              +--------------------------- wait (capped at the next watermark deadline)
//!              v                          |
//! (first) -> [pending event] --pace--> due? --yes--> dispatch --> pull next
//!              |      ^                                               |
//!              |      +---------------- watermark check <-------------+
//!              v
//!        exhausted / cancelled --> drain --> summary
//! ```
//!
//! Everything but the in-flight tracker is owned by the loop. The loop never waits for a single
//! send to complete; only the final drain does.

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ReplayConfig;
use crate::destination::Destination;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::event::{Event, format_millis};
use crate::metrics::replay_metrics;
use crate::pacing::{Pacing, ReplayClock};
use crate::source::EventSource;
use crate::statistics::StatisticsReporter;
use crate::tracker::InFlightTracker;
use crate::watermark::WatermarkEmitter;

/// Totals of a finished replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub events_sent: u64,
    pub send_failures: u64,
    /// Watermark records written, one per partition per completed cycle.
    pub watermarks_emitted: u64,
    pub watermark_cycles_skipped: u64,
    pub last_watermark: Option<i64>,
}

pub struct Replayer<S, D> {
    source: S,
    destination: Arc<D>,
    config: ReplayConfig,
    tracker: InFlightTracker,
    cln_token: CancellationToken,
}

impl<S, D> Replayer<S, D>
where
    S: EventSource + Send,
    D: Destination + Send + Sync + 'static,
{
    pub fn new(
        source: S,
        destination: Arc<D>,
        config: ReplayConfig,
        cln_token: CancellationToken,
    ) -> Self {
        Replayer {
            source,
            destination,
            config,
            tracker: InFlightTracker::new(),
            cln_token,
        }
    }

    /// Shares an existing tracker with the replay, e.g. to observe the in-flight set from outside.
    pub fn with_tracker(mut self, tracker: InFlightTracker) -> Self {
        self.tracker = tracker;
        self
    }

    /// Replays the whole source. Outstanding sends are drained before returning, also when the
    /// replay was cancelled or failed.
    pub async fn run(mut self) -> Result<ReplaySummary> {
        self.config.validate()?;

        let dispatcher = Dispatcher::new(Arc::clone(&self.destination), self.tracker.clone());
        let mut watermarks = WatermarkEmitter::new(
            Arc::clone(&self.destination),
            self.tracker.clone(),
            self.config.watermark.clone(),
        );

        let outcome = self.replay(&dispatcher, &mut watermarks).await;

        info!(in_flight = dispatcher.tracker().len(), "Draining in-flight events");
        let drained = dispatcher.drain().await;
        let events_sent = outcome?;
        drained?;

        let summary = ReplaySummary {
            events_sent,
            send_failures: dispatcher.send_failures(),
            watermarks_emitted: watermarks.records_emitted(),
            watermark_cycles_skipped: watermarks.cycles_skipped(),
            last_watermark: watermarks.last_watermark(),
        };
        info!(?summary, "Replay finished");
        Ok(summary)
    }

    async fn replay(
        &mut self,
        dispatcher: &Dispatcher<D>,
        watermarks: &mut WatermarkEmitter<D>,
    ) -> Result<u64> {
        let Some(first) = self.pull().await? else {
            info!("No events to replay");
            return Ok(0);
        };

        let clock = ReplayClock::start(first.timestamp, self.config.speedup, self.config.min_sleep);
        let mut statistics = StatisticsReporter::new(self.config.statistics_interval, clock.wall_zero());
        info!(
            first_event = %format_millis(first.timestamp),
            speedup = clock.speedup(),
            "Starting replay"
        );

        let mut pending = Some(first);
        let mut previous_timestamp = None;
        let mut lag_secs = 0;
        let mut events_sent = 0;

        while let Some(event) = pending.take() {
            if self.cln_token.is_cancelled() {
                info!("Replay cancelled");
                break;
            }

            let now = Instant::now();
            match clock.decide_at(now, event.timestamp) {
                Pacing::Due { gap_millis } => {
                    if let Some(previous) = previous_timestamp.filter(|p| event.timestamp < *p) {
                        warn!(
                            ?event,
                            previous = %format_millis(previous),
                            "source yielded an event older than its predecessor"
                        );
                    }
                    previous_timestamp = Some(event.timestamp);
                    lag_secs = clock.lag_secs(gap_millis);

                    dispatcher.send(event);
                    events_sent += 1;
                    replay_metrics().events_sent.inc();
                    watermarks.record_event();
                    statistics.record_event();

                    pending = self.pull().await?;
                }
                Pacing::Wait(wait) => {
                    // keep watermarks flowing while the replay is stalled on a distant event
                    let wait = wait
                        .min(watermarks.time_until_due(now))
                        .max(self.config.min_sleep);
                    tokio::select! {
                        biased;
                        _ = self.cln_token.cancelled() => {
                            info!("Replay cancelled");
                            break;
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                    pending = Some(event);
                }
            }

            let Some(next) = &pending else {
                break;
            };
            let now = Instant::now();
            watermarks
                .maybe_emit(now, next.timestamp)
                .await
                .map_err(|e| Error::Watermark(e.to_string()))?;
            statistics.maybe_report(now, watermarks.last_watermark(), lag_secs);
        }

        Ok(events_sent)
    }

    /// Next event from the source, `None` when it is exhausted or the replay is cancelled.
    async fn pull(&mut self) -> Result<Option<Event>> {
        tokio::select! {
            biased;
            _ = self.cln_token.cancelled() => Ok(None),
            next = self.source.next() => next,
        }
    }
}
