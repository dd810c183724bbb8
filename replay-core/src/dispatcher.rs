//! Fire-and-forget dispatch of events to the destination.
//!
//! ```text
//! (replay loop) --send--> {track} --submit--> [destination]
//!                                                  |
//!                              (completion task) <-+  ack / failure
//!                                     |
//!                                  {untrack}
//! ```
//!
//! The event is registered with the [InFlightTracker] before it is submitted, so a watermark cycle
//! never observes an event that was sent but is not tracked. The removal is owned by a guard that
//! lives in the completion task and therefore runs exactly once, on success and on failure alike.
//! Failed sends are logged and dropped; retrying is left to the destination client.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{trace, warn};

use crate::destination::{Destination, Record};
use crate::error::Result;
use crate::event::Event;
use crate::metrics::replay_metrics;
use crate::tracker::{InFlightGuard, InFlightTracker};

pub struct Dispatcher<D> {
    destination: Arc<D>,
    tracker: InFlightTracker,
    completions: TaskTracker,
    failures: Arc<AtomicU64>,
}

impl<D> Dispatcher<D>
where
    D: Destination + Send + Sync + 'static,
{
    pub fn new(destination: Arc<D>, tracker: InFlightTracker) -> Self {
        Dispatcher {
            destination,
            tracker,
            completions: TaskTracker::new(),
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn tracker(&self) -> &InFlightTracker {
        &self.tracker
    }

    /// Number of sends that completed with a failure so far.
    pub fn send_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Submits the event and returns the handle of its completion task. The caller does not have
    /// to await the handle; [Dispatcher::drain] waits for every outstanding completion.
    pub fn send(&self, event: Event) -> JoinHandle<()> {
        let guard = InFlightGuard::register(&self.tracker, &event);
        replay_metrics().in_flight.set(self.tracker.len() as i64);
        trace!(?event, "sent event");

        let pending = self.destination.submit(Record::for_event(&event));
        let tracker = self.tracker.clone();
        let failures = Arc::clone(&self.failures);
        self.completions.spawn(async move {
            let outcome = match pending {
                Ok(pending) => pending.await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(ack) => {
                    trace!(?event, partition = %ack.partition_id, "event acknowledged");
                }
                Err(e) => {
                    failures.fetch_add(1, Ordering::Relaxed);
                    replay_metrics().send_failures.inc();
                    warn!(?event, error = ?e, "failed to send event");
                }
            }
            drop(guard);
            replay_metrics().in_flight.set(tracker.len() as i64);
        })
    }

    /// Waits for every outstanding send to complete and then flushes the destination client.
    pub async fn drain(&self) -> Result<()> {
        self.completions.close();
        self.destination.flush().await?;
        self.completions.wait().await;
        Ok(())
    }
}
