//! The partitioned, append-only stream the events are replayed into.
//!
//! Events go through [Destination::submit], which only enqueues the record and hands back a
//! [PendingSubmit] that resolves once the backend acknowledged (or rejected) it. Watermark records
//! are written with [Destination::put] straight to a given partition, and the partition topology
//! is enumerated through [Destination::list_partitions] on every watermark cycle.

use std::future::{Future, IntoFuture};
use std::pin::Pin;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::event::{Event, WATERMARK_PARTITION_KEY, WatermarkRecord};

/// In-memory destination stream, used to exercise the replay without a backend.
pub mod memory;

/// How a record is mapped onto a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routing {
    /// Partition is derived by hashing the key.
    PartitionKey(String),
    /// Partition is the one whose hash-key range contains `hash_key`.
    ExplicitHashKey {
        partition_key: String,
        hash_key: String,
    },
}

impl Routing {
    pub fn partition_key(&self) -> &str {
        match self {
            Routing::PartitionKey(key) => key,
            Routing::ExplicitHashKey { partition_key, .. } => partition_key,
        }
    }

    pub fn explicit_hash_key(&self) -> Option<&str> {
        match self {
            Routing::PartitionKey(_) => None,
            Routing::ExplicitHashKey { hash_key, .. } => Some(hash_key),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub payload: Bytes,
    pub routing: Routing,
}

impl Record {
    pub fn for_event(event: &Event) -> Self {
        Record {
            payload: event.payload.clone(),
            routing: Routing::PartitionKey(event.partition_key.clone()),
        }
    }

    /// A watermark record pinned to the partition whose range starts at `hash_key`.
    pub fn for_watermark(watermark: &WatermarkRecord, hash_key: &str) -> Self {
        Record {
            payload: watermark.payload(),
            routing: Routing::ExplicitHashKey {
                partition_key: WATERMARK_PARTITION_KEY.to_string(),
                hash_key: hash_key.to_string(),
            },
        }
    }
}

/// Acknowledgement of a written record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub partition_id: String,
    pub sequence_number: Option<String>,
}

/// Identity of a destination partition together with the lower bound of its hash-key range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDescriptor {
    pub partition_id: String,
    pub hash_range_lower_bound: String,
}

/// One page of a partition listing. `next_token` is set when more pages follow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionPage {
    pub partitions: Vec<PartitionDescriptor>,
    pub next_token: Option<String>,
}

/// Completion handle of a submitted record. Awaiting it yields the backend's verdict.
#[derive(Debug)]
pub struct PendingSubmit {
    receiver: oneshot::Receiver<Result<Ack>>,
}

impl PendingSubmit {
    /// Creates a handle along with the sender the backend resolves it with.
    pub fn channel() -> (oneshot::Sender<Result<Ack>>, PendingSubmit) {
        let (tx, rx) = oneshot::channel();
        (tx, PendingSubmit { receiver: rx })
    }
}

impl IntoFuture for PendingSubmit {
    type Output = Result<Ack>;
    type IntoFuture = Pin<Box<dyn Future<Output = Result<Ack>> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            self.receiver.await.map_err(|_| {
                Error::Destination("record was dropped before it was acknowledged".to_string())
            })?
        })
    }
}

/// Set of operations the replay needs from the destination stream.
#[trait_variant::make(Destination: Send)]
#[allow(dead_code)]
pub trait LocalDestination {
    /// Enqueues the record without waiting for it to be written. Records are written in the
    /// order they were submitted.
    fn submit(&self, record: Record) -> Result<PendingSubmit>;

    /// Writes a single record and waits for the acknowledgement.
    async fn put(&self, record: Record) -> Result<Ack>;

    /// Lists one page of partitions, starting after `next_token` when given.
    async fn list_partitions(&self, next_token: Option<String>) -> Result<PartitionPage>;

    /// Blocks until every submitted record has been acknowledged or rejected.
    async fn flush(&self) -> Result<()>;
}
