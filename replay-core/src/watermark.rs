//! Periodic watermark generation.
//!
//! A watermark cycle is due every `interval` or after `event_count` sent events, whichever comes
//! first. The watermark is one millisecond before the oldest in-flight event, or, when nothing is
//! in flight, one millisecond before the next event about to be sent. That fallback may include
//! the pending event's own timestamp in the "older than" guarantee for a moment, which is accepted.
//!
//! ```text
//! (due?) --> (oldest in flight - 1) --> (list partitions, page by page) --> (put to each)
//!                                               |                             |
//!                                               +------- throttled -----------+--> skip cycle
//! ```
//!
//! Partitions are listed fresh on every cycle since the topology can change in between. Each
//! partition receives one record routed by an explicit hash key equal to the lower bound of its
//! range, so the marker lands in that exact partition. Throttling abandons the whole cycle, the
//! next one tries again. Any other failure is fatal.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::WatermarkConfig;
use crate::destination::{Destination, PartitionDescriptor, Record};
use crate::error::Result;
use crate::event::{WatermarkRecord, format_millis};
use crate::metrics::replay_metrics;
use crate::tracker::InFlightTracker;

/// What happened to the watermark of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    /// One record was written to each of the listed partitions.
    Emitted { partitions: usize },
    /// The destination throttled the cycle, nothing more was written.
    Skipped,
    /// Watermark emission is turned off.
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatermarkCycle {
    pub watermark: i64,
    pub outcome: EmitOutcome,
}

pub struct WatermarkEmitter<D> {
    destination: Arc<D>,
    tracker: InFlightTracker,
    config: WatermarkConfig,
    last_cycle: Option<Instant>,
    events_since_last_cycle: u64,
    last_watermark: Option<i64>,
    records_emitted: u64,
    cycles_skipped: u64,
}

impl<D> WatermarkEmitter<D>
where
    D: Destination + Send + Sync + 'static,
{
    pub fn new(destination: Arc<D>, tracker: InFlightTracker, config: WatermarkConfig) -> Self {
        WatermarkEmitter {
            destination,
            tracker,
            config,
            last_cycle: None,
            events_since_last_cycle: 0,
            last_watermark: None,
            records_emitted: 0,
            cycles_skipped: 0,
        }
    }

    /// Counts a sent event towards the event-count trigger.
    pub fn record_event(&mut self) {
        self.events_since_last_cycle += 1;
    }

    /// The last computed watermark, whether or not it could be written.
    pub fn last_watermark(&self) -> Option<i64> {
        self.last_watermark
    }

    /// Watermark records written by completed cycles.
    pub fn records_emitted(&self) -> u64 {
        self.records_emitted
    }

    pub fn cycles_skipped(&self) -> u64 {
        self.cycles_skipped
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.time_until_due(now).is_zero()
    }

    /// Time left until the interval trigger fires. Zero when a cycle is due already.
    pub fn time_until_due(&self, now: Instant) -> Duration {
        if self.events_since_last_cycle >= self.config.event_count {
            return Duration::ZERO;
        }
        match self.last_cycle {
            None => Duration::ZERO,
            Some(last) => self
                .config
                .interval
                .saturating_sub(now.saturating_duration_since(last)),
        }
    }

    /// The current watermark: the oldest in-flight event's timestamp minus one, or the next
    /// pending event's timestamp minus one when nothing is in flight.
    pub fn compute(&self, next_pending: i64) -> i64 {
        self.tracker
            .peek_oldest()
            .map_or(next_pending, |oldest| oldest.timestamp)
            .saturating_sub(1)
    }

    /// Runs a watermark cycle if one is due. The trigger is reset even when emission is disabled
    /// or the cycle was skipped.
    pub async fn maybe_emit(
        &mut self,
        now: Instant,
        next_pending: i64,
    ) -> Result<Option<WatermarkCycle>> {
        if !self.is_due(now) {
            return Ok(None);
        }

        let watermark = self.compute(next_pending);
        let outcome = if self.config.enabled {
            self.emit(watermark).await?
        } else {
            EmitOutcome::Disabled
        };
        match outcome {
            EmitOutcome::Emitted { partitions } => self.records_emitted += partitions as u64,
            EmitOutcome::Skipped => self.cycles_skipped += 1,
            EmitOutcome::Disabled => {}
        }

        self.events_since_last_cycle = 0;
        self.last_cycle = Some(Instant::now());
        self.last_watermark = Some(watermark);
        replay_metrics().watermark.set(watermark);

        Ok(Some(WatermarkCycle { watermark, outcome }))
    }

    /// Writes the watermark to every partition of the destination. Throttling skips the cycle.
    pub async fn emit(&self, watermark: i64) -> Result<EmitOutcome> {
        match self.emit_to_all_partitions(watermark).await {
            Ok(partitions) => {
                debug!(watermark = %format_millis(watermark), partitions, "sent watermark");
                Ok(EmitOutcome::Emitted { partitions })
            }
            Err(e) if e.is_throttled() => {
                replay_metrics().watermark_cycles_skipped.inc();
                warn!(error = ?e, "skipping watermark due to limit exceeded");
                Ok(EmitOutcome::Skipped)
            }
            Err(e) => Err(e),
        }
    }

    async fn emit_to_all_partitions(&self, watermark: i64) -> Result<usize> {
        let partitions = self.list_all_partitions().await?;
        let record = WatermarkRecord::new(watermark);
        for partition in &partitions {
            let ack = self
                .destination
                .put(Record::for_watermark(
                    &record,
                    &partition.hash_range_lower_bound,
                ))
                .await?;
            replay_metrics().watermarks_emitted.inc();
            trace!(
                watermark = %format_millis(watermark),
                partition = %partition.partition_id,
                acked_by = %ack.partition_id,
                "sent watermark to partition"
            );
        }
        Ok(partitions.len())
    }

    /// Enumerates every partition, following continuation tokens until exhausted.
    pub async fn list_all_partitions(&self) -> Result<Vec<PartitionDescriptor>> {
        let mut partitions = Vec::new();
        let mut next_token = None;
        loop {
            let page = self.destination.list_partitions(next_token).await?;
            partitions.extend(page.partitions);
            match page.next_token {
                Some(token) => next_token = Some(token),
                None => return Ok(partitions),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::memory::MemoryStream;
    use crate::error::Error;
    use crate::event::Event;

    fn emitter(stream: &Arc<MemoryStream>, config: WatermarkConfig) -> WatermarkEmitter<MemoryStream> {
        WatermarkEmitter::new(Arc::clone(stream), InFlightTracker::new(), config)
    }

    #[tokio::test]
    async fn test_compute_uses_oldest_in_flight() {
        let stream = Arc::new(MemoryStream::new(1));
        let emitter = emitter(&stream, WatermarkConfig::default());
        assert_eq!(emitter.compute(500), 499);

        emitter.tracker.add(&Event::new(200, "b", 2));
        emitter.tracker.add(&Event::new(100, "a", 1));
        assert_eq!(emitter.compute(500), 99);
    }

    #[tokio::test]
    async fn test_compute_at_the_lowest_timestamp() {
        let stream = Arc::new(MemoryStream::new(1));
        let emitter = emitter(&stream, WatermarkConfig::default());
        assert_eq!(emitter.compute(i64::MIN), i64::MIN);
    }

    #[tokio::test]
    async fn test_trigger_by_count_and_time() {
        let stream = Arc::new(MemoryStream::new(1));
        let config = WatermarkConfig {
            enabled: true,
            interval: Duration::from_secs(10),
            event_count: 3,
        };
        let mut emitter = emitter(&stream, config);
        let now = Instant::now();

        // the very first check is always due
        assert!(emitter.is_due(now));
        assert!(emitter.maybe_emit(now, 10).await.unwrap().is_some());
        let now = Instant::now();
        assert!(!emitter.is_due(now));

        emitter.record_event();
        emitter.record_event();
        assert!(!emitter.is_due(now));
        emitter.record_event();
        assert!(emitter.is_due(now));
        assert!(emitter.maybe_emit(now, 10).await.unwrap().is_some());

        let now = Instant::now();
        assert!(!emitter.is_due(now + Duration::from_secs(9)));
        assert!(emitter.is_due(now + Duration::from_secs(11)));
        assert!(emitter.time_until_due(now) <= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_one_record_per_partition_across_pages() {
        let stream = Arc::new(MemoryStream::new(7).with_page_size(3));
        let emitter = emitter(&stream, WatermarkConfig::default());

        let outcome = emitter.emit(1234).await.unwrap();
        assert_eq!(outcome, EmitOutcome::Emitted { partitions: 7 });
        assert_eq!(stream.list_calls(), 3);
        assert_eq!(stream.put_calls(), 7);

        let mut partitions: Vec<String> = stream.watermarks().into_iter().map(|(p, _)| p).collect();
        partitions.sort();
        partitions.dedup();
        assert_eq!(partitions, stream.partition_ids());
    }

    #[tokio::test]
    async fn test_throttled_listing_skips_cycle() {
        let stream = Arc::new(MemoryStream::new(3));
        stream.error_injector().throttle_listings(1);
        let emitter = emitter(&stream, WatermarkConfig::default());

        assert_eq!(emitter.emit(1).await.unwrap(), EmitOutcome::Skipped);
        assert!(stream.watermarks().is_empty());

        assert_eq!(
            emitter.emit(2).await.unwrap(),
            EmitOutcome::Emitted { partitions: 3 }
        );
    }

    #[tokio::test]
    async fn test_throttled_put_abandons_rest_of_cycle() {
        let stream = Arc::new(MemoryStream::new(3));
        stream.error_injector().throttle_puts(1);
        let emitter = emitter(&stream, WatermarkConfig::default());

        assert_eq!(emitter.emit(1).await.unwrap(), EmitOutcome::Skipped);
        assert_eq!(stream.put_calls(), 1);
        assert!(stream.watermarks().is_empty());
    }

    #[tokio::test]
    async fn test_other_listing_failures_are_fatal() {
        let stream = Arc::new(MemoryStream::new(3));
        stream.error_injector().fail_listings(1);
        let emitter = emitter(&stream, WatermarkConfig::default());
        assert!(matches!(emitter.emit(1).await, Err(Error::Destination(_))));
    }

    #[tokio::test]
    async fn test_disabled_resets_trigger_without_writing() {
        let stream = Arc::new(MemoryStream::new(2));
        let config = WatermarkConfig {
            enabled: false,
            ..Default::default()
        };
        let mut emitter = emitter(&stream, config);
        let cycle = emitter.maybe_emit(Instant::now(), 42).await.unwrap().unwrap();
        assert_eq!(
            cycle,
            WatermarkCycle {
                watermark: 41,
                outcome: EmitOutcome::Disabled
            }
        );
        assert_eq!(emitter.last_watermark(), Some(41));
        assert!(!emitter.is_due(Instant::now()));
        assert_eq!(stream.list_calls(), 0);
        assert!(stream.written().is_empty());
    }

    #[tokio::test]
    async fn test_partitions_are_listed_fresh_each_cycle() {
        let stream = Arc::new(MemoryStream::new(2));
        let emitter = emitter(&stream, WatermarkConfig::default());
        emitter.emit(1).await.unwrap();
        stream.reshard(4);
        assert_eq!(
            emitter.emit(2).await.unwrap(),
            EmitOutcome::Emitted { partitions: 4 }
        );
    }
}
