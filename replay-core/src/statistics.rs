//! Periodic throughput and lag logging.

use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

use crate::event::format_millis;
use crate::metrics::replay_metrics;

/// One status line, as logged by [StatisticsReporter::maybe_report].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Report {
    pub events_per_sec: f64,
    pub lag_secs: i64,
    pub last_watermark: Option<i64>,
}

#[derive(Debug)]
pub struct StatisticsReporter {
    interval: Duration,
    last_report: Instant,
    events_since_last_report: u64,
}

impl StatisticsReporter {
    pub fn new(interval: Duration, start: Instant) -> Self {
        StatisticsReporter {
            interval,
            last_report: start,
            events_since_last_report: 0,
        }
    }

    pub fn record_event(&mut self) {
        self.events_since_last_report += 1;
    }

    pub fn time_until_due(&self, now: Instant) -> Duration {
        self.interval
            .saturating_sub(now.saturating_duration_since(self.last_report))
    }

    /// Logs a status line when the interval elapsed and starts a new one.
    pub fn maybe_report(
        &mut self,
        now: Instant,
        last_watermark: Option<i64>,
        lag_secs: i64,
    ) -> Option<Report> {
        let elapsed = now.saturating_duration_since(self.last_report);
        if elapsed < self.interval {
            return None;
        }

        let report = Report {
            events_per_sec: self.events_since_last_report as f64 / elapsed.as_secs_f64(),
            lag_secs,
            last_watermark,
        };
        replay_metrics().lag_seconds.set(lag_secs);

        match last_watermark {
            Some(watermark) => info!(
                "all events with event time before {} have been sent ({:.0} events/sec, {} sec replay lag)",
                format_millis(watermark),
                report.events_per_sec,
                lag_secs
            ),
            None => info!(
                "no watermark yet ({:.0} events/sec, {} sec replay lag)",
                report.events_per_sec, lag_secs
            ),
        }

        self.last_report = now;
        self.events_since_last_report = 0;
        Some(report)
    }
}
