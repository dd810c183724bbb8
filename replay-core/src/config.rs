//! Knobs for pacing, watermark generation and statistics. Everything here is fixed once the
//! replay starts.

use std::time::Duration;

use crate::error::{Error, Result};

const DEFAULT_SPEEDUP: f64 = 1440.0;
const DEFAULT_MIN_SLEEP_MILLIS: u64 = 10;
const DEFAULT_STATISTICS_INTERVAL_SECS: u64 = 60;
const DEFAULT_WATERMARK_INTERVAL_MILLIS: u64 = 10_000;
const DEFAULT_WATERMARK_EVENT_COUNT: u64 = 10_000;

/// Watermark generation settings. A watermark is sent every `interval` or every `event_count`
/// events, whichever comes first.
#[derive(Debug, Clone, PartialEq)]
pub struct WatermarkConfig {
    /// When disabled the trigger still fires and resets, but nothing is written.
    pub enabled: bool,
    pub interval: Duration,
    pub event_count: u64,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        WatermarkConfig {
            enabled: true,
            interval: Duration::from_millis(DEFAULT_WATERMARK_INTERVAL_MILLIS),
            event_count: DEFAULT_WATERMARK_EVENT_COUNT,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayConfig {
    /// Multiplier from wall-clock time to event time. 1.0 replays in real time.
    pub speedup: f64,
    /// Lower bound for a single pacing sleep, avoids spinning on tiny negative gaps.
    pub min_sleep: Duration,
    pub statistics_interval: Duration,
    pub watermark: WatermarkConfig,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        ReplayConfig {
            speedup: DEFAULT_SPEEDUP,
            min_sleep: Duration::from_millis(DEFAULT_MIN_SLEEP_MILLIS),
            statistics_interval: Duration::from_secs(DEFAULT_STATISTICS_INTERVAL_SECS),
            watermark: WatermarkConfig::default(),
        }
    }
}

impl ReplayConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.speedup.is_finite() || self.speedup <= 0.0 {
            return Err(Error::Config(format!(
                "speedup factor must be a positive number, got {}",
                self.speedup
            )));
        }
        if self.min_sleep.is_zero() {
            return Err(Error::Config("min_sleep must be greater than zero".into()));
        }
        if self.statistics_interval.is_zero() {
            return Err(Error::Config(
                "statistics_interval must be greater than zero".into(),
            ));
        }
        if self.watermark.interval.is_zero() {
            return Err(Error::Config(
                "watermark interval must be greater than zero".into(),
            ));
        }
        if self.watermark.event_count == 0 {
            return Err(Error::Config(
                "watermark event count must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
