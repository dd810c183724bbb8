//! Exponential backoff with jitter, used when the destination asks us to slow down.
//!
//! The n-th delay is `base * factor^(n - 1)`, multiplied by a random factor drawn from
//! `[1 - jitter, 1 + jitter]` and capped at `max`. The iterator ends after `max_attempts` delays.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct Exponential {
    base: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
    max_attempts: Option<u32>,
    attempt: u32,
}

impl Exponential {
    /// `jitter` is clamped to `[0, 1]`.
    pub fn new(
        base: Duration,
        max: Duration,
        factor: f64,
        jitter: f64,
        max_attempts: Option<u32>,
    ) -> Self {
        Exponential {
            base,
            max,
            factor,
            jitter: jitter.clamp(0.0, 1.0),
            max_attempts,
            attempt: 0,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let mut millis = self.base.as_millis() as f64 * self.factor.powi(exponent);
        if self.jitter > 0.0 {
            millis *= rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        }
        if !millis.is_finite() || millis >= self.max.as_millis() as f64 {
            return self.max;
        }
        Duration::from_millis(millis as u64)
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| self.attempt >= max) {
            return None;
        }
        self.attempt += 1;
        Some(self.delay(self.attempt))
    }
}

/// Runs `operation` until it succeeds, the error is not retryable, or the backoff runs out. The
/// last error is returned in the latter two cases.
pub async fn retry<T, E, Fut>(
    mut backoff: impl Iterator<Item = Duration>,
    mut operation: impl FnMut() -> Fut,
    retryable: impl Fn(&E) -> bool,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
{
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if retryable(&e) => match backoff.next() {
                Some(delay) => tokio::time::sleep(delay).await,
                None => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }
}
