//! Maps wall-clock progress onto event time. Two reference points are captured when the first
//! event is read (the wall clock and that event's timestamp) and every later decision is a pure
//! function of them, the speedup factor and "now".
//!
//! ```text
//! gap = (now - wall_zero) * speedup - (event.timestamp - log_zero)
//!
//! gap <  0  -> the event lies in the simulated future, sleep max(-gap / speedup, min_sleep)
//! gap >= 0  -> the event is due, send it
//! ```

use std::time::Duration;

use tokio::time::Instant;

/// Outcome of a pacing decision for the pending event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pacing {
    /// The event is due. `gap_millis` is how far (in event-time millis) the replay is behind.
    Due { gap_millis: f64 },
    /// The event must not be sent yet; re-evaluate after sleeping this long.
    Wait(Duration),
}

#[derive(Debug, Clone)]
pub struct ReplayClock {
    wall_zero: Instant,
    log_zero: i64,
    speedup: f64,
    min_sleep: Duration,
}

impl ReplayClock {
    /// Anchors the clock at the current instant and the timestamp of the first event.
    pub fn start(log_zero: i64, speedup: f64, min_sleep: Duration) -> Self {
        Self::start_at(Instant::now(), log_zero, speedup, min_sleep)
    }

    pub fn start_at(wall_zero: Instant, log_zero: i64, speedup: f64, min_sleep: Duration) -> Self {
        ReplayClock {
            wall_zero,
            log_zero,
            speedup,
            min_sleep,
        }
    }

    pub fn wall_zero(&self) -> Instant {
        self.wall_zero
    }

    pub fn speedup(&self) -> f64 {
        self.speedup
    }

    /// Simulated event time elapsed minus the event time of `timestamp`, in millis.
    pub fn gap_at(&self, now: Instant, timestamp: i64) -> f64 {
        let wall_elapsed = now.saturating_duration_since(self.wall_zero).as_secs_f64() * 1000.0;
        // source timestamps are arbitrary i64s, so the difference may not fit into one
        let log_elapsed = timestamp as f64 - self.log_zero as f64;
        wall_elapsed * self.speedup - log_elapsed
    }

    pub fn decide(&self, timestamp: i64) -> Pacing {
        self.decide_at(Instant::now(), timestamp)
    }

    pub fn decide_at(&self, now: Instant, timestamp: i64) -> Pacing {
        let gap = self.gap_at(now, timestamp);
        if gap >= 0.0 {
            return Pacing::Due { gap_millis: gap };
        }
        // a tiny speedup can stretch the wait beyond what a Duration holds
        let sleep =
            Duration::try_from_secs_f64(-gap / self.speedup / 1000.0).unwrap_or(Duration::MAX);
        Pacing::Wait(sleep.max(self.min_sleep))
    }

    /// How many wall-clock seconds the replay runs behind the target pace for the given gap.
    pub fn lag_secs(&self, gap_millis: f64) -> i64 {
        (gap_millis / self.speedup / 1000.0).round() as i64
    }
}
