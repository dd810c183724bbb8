//! In-memory destination stream.
//!
//! It mimics a hash-partitioned stream closely enough to exercise the replay end to end:
//! partitions split the 128-bit hash-key space evenly, listings are paginated, every write is
//! kept in a global log (in write order) and acknowledgements can be immediate, delayed or held
//! back until the test releases them. Failures are injected through the [ErrorInjector].
//!
//! # Example
//! ```ignore
//! use replay_core::destination::memory::{AckMode, MemoryStream};
//!
//! let stream = MemoryStream::new(4).with_page_size(2).with_ack_mode(AckMode::Manual);
//! stream.error_injector().throttle_listings(1);
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::{Notify, oneshot};
use tokio_util::task::TaskTracker;

use crate::destination::{
    Ack, Destination, PartitionDescriptor, PartitionPage, PendingSubmit, Record, Routing,
};
use crate::error::{Error, Result};

const DEFAULT_PAGE_SIZE: usize = 100;

/// When submitted records get acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Acknowledged as part of the submit call.
    Immediate,
    /// Acknowledged by a background task after the delay.
    Delayed(Duration),
    /// Held until [MemoryStream::release] or [MemoryStream::release_all] is called.
    Manual,
}

/// Controller for injecting failures. Every knob fails the next N calls of the operation.
#[derive(Debug, Default)]
pub struct ErrorInjector {
    throttle_next_listings: AtomicUsize,
    fail_next_listings: AtomicUsize,
    throttle_next_puts: AtomicUsize,
    fail_next_puts: AtomicUsize,
    fail_next_submits: AtomicUsize,
}

impl ErrorInjector {
    pub fn throttle_listings(&self, count: usize) {
        self.throttle_next_listings.store(count, Ordering::SeqCst);
    }

    pub fn fail_listings(&self, count: usize) {
        self.fail_next_listings.store(count, Ordering::SeqCst);
    }

    pub fn throttle_puts(&self, count: usize) {
        self.throttle_next_puts.store(count, Ordering::SeqCst);
    }

    pub fn fail_puts(&self, count: usize) {
        self.fail_next_puts.store(count, Ordering::SeqCst);
    }

    /// The next N submitted records are rejected through their completion handle.
    pub fn fail_submits(&self, count: usize) {
        self.fail_next_submits.store(count, Ordering::SeqCst);
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// A record as written into the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenRecord {
    pub partition_id: String,
    pub sequence_number: u64,
    pub record: Record,
}

impl WrittenRecord {
    /// The watermark carried by this record, if it is a watermark record.
    pub fn watermark(&self) -> Option<i64> {
        let value: serde_json::Value = serde_json::from_slice(&self.record.payload).ok()?;
        if value.get("type")?.as_str()? != "watermark" {
            return None;
        }
        value.get("watermark")?.as_i64()
    }
}

#[derive(Debug)]
struct Partition {
    id: String,
    lower: u128,
    upper: u128,
}

#[derive(Debug)]
struct HeldAck {
    respond_to: oneshot::Sender<Result<Ack>>,
    ack: Ack,
}

#[derive(Debug, Default)]
struct State {
    partitions: Vec<Partition>,
    log: Vec<WrittenRecord>,
    held: Vec<HeldAck>,
    next_sequence: u64,
    next_partition_id: usize,
}

impl State {
    fn write(&mut self, record: Record) -> Result<Ack> {
        let hash = match &record.routing {
            Routing::PartitionKey(key) => hash_partition_key(key),
            Routing::ExplicitHashKey { hash_key, .. } => hash_key.parse::<u128>().map_err(|e| {
                Error::Destination(format!("invalid explicit hash key {hash_key}: {e}"))
            })?,
        };
        let partition = self
            .partitions
            .iter()
            .find(|p| p.lower <= hash && hash <= p.upper)
            .ok_or_else(|| Error::Destination(format!("no partition covers hash key {hash}")))?;

        let partition_id = partition.id.clone();
        self.next_sequence += 1;
        self.log.push(WrittenRecord {
            partition_id: partition_id.clone(),
            sequence_number: self.next_sequence,
            record,
        });
        Ok(Ack {
            partition_id,
            sequence_number: Some(self.next_sequence.to_string()),
        })
    }
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    ack_mode: AckMode,
    page_size: usize,
    error_injector: ErrorInjector,
    list_calls: AtomicUsize,
    put_calls: AtomicUsize,
    delayed_acks: TaskTracker,
    released: Notify,
}

/// Cloneable handle to a shared in-memory stream.
#[derive(Debug, Clone)]
pub struct MemoryStream {
    inner: Arc<Inner>,
}

impl MemoryStream {
    /// Creates a stream with `partitions` partitions evenly splitting the hash-key space.
    pub fn new(partitions: usize) -> Self {
        let state = State {
            partitions: build_partitions(partitions, 0),
            next_partition_id: partitions.max(1),
            ..Default::default()
        };
        MemoryStream {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                ack_mode: AckMode::Immediate,
                page_size: DEFAULT_PAGE_SIZE,
                error_injector: ErrorInjector::default(),
                list_calls: AtomicUsize::new(0),
                put_calls: AtomicUsize::new(0),
                delayed_acks: TaskTracker::new(),
                released: Notify::new(),
            }),
        }
    }

    /// Sets the listing page size. Must be called before the stream is shared.
    pub fn with_page_size(self, page_size: usize) -> Self {
        self.reconfigure(|inner| inner.page_size = page_size.max(1))
    }

    /// Sets the ack mode. Must be called before the stream is shared.
    pub fn with_ack_mode(self, ack_mode: AckMode) -> Self {
        self.reconfigure(|inner| inner.ack_mode = ack_mode)
    }

    fn reconfigure(self, f: impl FnOnce(&mut Inner)) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                f(&mut inner);
                MemoryStream {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => {
                tracing::warn!("memory stream is already shared, ignoring reconfiguration");
                MemoryStream { inner }
            }
        }
    }

    pub fn error_injector(&self) -> &ErrorInjector {
        &self.inner.error_injector
    }

    /// Replaces the partition topology, as a reshard would. New partition ids never reuse old
    /// ones.
    pub fn reshard(&self, partitions: usize) {
        let mut state = self.inner.state.lock();
        let first_id = state.next_partition_id;
        state.partitions = build_partitions(partitions, first_id);
        state.next_partition_id += partitions.max(1);
    }

    pub fn partition_ids(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        state.partitions.iter().map(|p| p.id.clone()).collect()
    }

    /// Every record written so far, in write order.
    pub fn written(&self) -> Vec<WrittenRecord> {
        self.inner.state.lock().log.clone()
    }

    /// Payloads of the written domain events (non-watermark records), in write order.
    pub fn event_payloads(&self) -> Vec<Bytes> {
        self.written()
            .into_iter()
            .filter(|r| r.watermark().is_none())
            .map(|r| r.record.payload)
            .collect()
    }

    /// `(partition id, watermark)` of the written watermark records, in write order.
    pub fn watermarks(&self) -> Vec<(String, i64)> {
        self.written()
            .into_iter()
            .filter_map(|r| r.watermark().map(|wm| (r.partition_id, wm)))
            .collect()
    }

    /// Number of `list_partitions` calls, failed ones included.
    pub fn list_calls(&self) -> usize {
        self.inner.list_calls.load(Ordering::SeqCst)
    }

    /// Number of `put` calls, failed ones included.
    pub fn put_calls(&self) -> usize {
        self.inner.put_calls.load(Ordering::SeqCst)
    }

    /// Number of acknowledgements held back in [AckMode::Manual].
    pub fn held(&self) -> usize {
        self.inner.state.lock().held.len()
    }

    /// Releases the held acknowledgement at `index` (in submit order among the held ones), either
    /// as a success or as a failure. Returns false if there is no such held ack.
    pub fn release(&self, index: usize, success: bool) -> bool {
        let held = {
            let mut state = self.inner.state.lock();
            if index >= state.held.len() {
                return false;
            }
            state.held.remove(index)
        };
        let result = if success {
            Ok(held.ack)
        } else {
            Err(Error::Destination("released as failed".to_string()))
        };
        let _ = held.respond_to.send(result);
        self.inner.released.notify_waiters();
        true
    }

    /// Releases every held acknowledgement as a success.
    pub fn release_all(&self) {
        let held = std::mem::take(&mut self.inner.state.lock().held);
        for held in held {
            let _ = held.respond_to.send(Ok(held.ack));
        }
        self.inner.released.notify_waiters();
    }
}

impl Destination for MemoryStream {
    fn submit(&self, record: Record) -> Result<PendingSubmit> {
        let (respond_to, pending) = PendingSubmit::channel();

        if ErrorInjector::take(&self.inner.error_injector.fail_next_submits) {
            let _ = respond_to.send(Err(Error::Destination(
                "injected submit failure".to_string(),
            )));
            return Ok(pending);
        }

        let mut state = self.inner.state.lock();
        let ack = match state.write(record) {
            Ok(ack) => ack,
            Err(e) => {
                let _ = respond_to.send(Err(e));
                return Ok(pending);
            }
        };

        match self.inner.ack_mode {
            AckMode::Immediate => {
                let _ = respond_to.send(Ok(ack));
            }
            AckMode::Delayed(delay) => {
                self.inner.delayed_acks.spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = respond_to.send(Ok(ack));
                });
            }
            AckMode::Manual => state.held.push(HeldAck { respond_to, ack }),
        }
        Ok(pending)
    }

    async fn put(&self, record: Record) -> Result<Ack> {
        self.inner.put_calls.fetch_add(1, Ordering::SeqCst);
        let injector = &self.inner.error_injector;
        if ErrorInjector::take(&injector.throttle_next_puts) {
            return Err(Error::Throttled("injected put throttling".to_string()));
        }
        if ErrorInjector::take(&injector.fail_next_puts) {
            return Err(Error::Destination("injected put failure".to_string()));
        }
        self.inner.state.lock().write(record)
    }

    async fn list_partitions(&self, next_token: Option<String>) -> Result<PartitionPage> {
        self.inner.list_calls.fetch_add(1, Ordering::SeqCst);
        let injector = &self.inner.error_injector;
        if ErrorInjector::take(&injector.throttle_next_listings) {
            return Err(Error::Throttled("injected listing throttling".to_string()));
        }
        if ErrorInjector::take(&injector.fail_next_listings) {
            return Err(Error::Destination("injected listing failure".to_string()));
        }

        let start = match next_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| Error::Destination(format!("invalid next token {token}")))?,
            None => 0,
        };
        let state = self.inner.state.lock();
        let end = (start + self.inner.page_size).min(state.partitions.len());
        let partitions = state
            .partitions
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .map(|p| PartitionDescriptor {
                partition_id: p.id.clone(),
                hash_range_lower_bound: p.lower.to_string(),
            })
            .collect();
        let next_token = (end < state.partitions.len()).then(|| end.to_string());
        Ok(PartitionPage {
            partitions,
            next_token,
        })
    }

    async fn flush(&self) -> Result<()> {
        self.inner.delayed_acks.close();
        self.inner.delayed_acks.wait().await;
        self.inner.delayed_acks.reopen();

        loop {
            let released = self.inner.released.notified();
            if self.inner.state.lock().held.is_empty() {
                return Ok(());
            }
            released.await;
        }
    }
}

fn build_partitions(count: usize, first_id: usize) -> Vec<Partition> {
    let count = count.max(1);
    let width = u128::MAX / count as u128;
    (0..count)
        .map(|i| {
            let lower = width * i as u128;
            let upper = if i + 1 == count {
                u128::MAX
            } else {
                width * (i as u128 + 1) - 1
            };
            Partition {
                id: format!("shardId-{:012}", first_id + i),
                lower,
                upper,
            }
        })
        .collect()
}

/// Maps a partition key onto the 128-bit hash key space like Kinesis does with MD5, here with the
/// leading half of a SHA-256 digest.
fn hash_partition_key(key: &str) -> u128 {
    let digest = Sha256::digest(key.as_bytes());
    digest
        .as_slice()
        .first_chunk::<16>()
        .map_or(0, |bytes| u128::from_be_bytes(*bytes))
}
