//! Event and watermark records as they travel from the source to the destination stream.

use std::cmp::Ordering;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Partition key reserved for watermark records. Domain events derive their keys from the
/// payload hash.
pub const WATERMARK_PARTITION_KEY: &str = "23";

/// A domain event read from the source. Events are totally ordered by `(timestamp, sequence)`,
/// the sequence being assigned by the source in read order so that two events with the same
/// timestamp (or even the same payload) stay distinct.
#[derive(Clone)]
pub struct Event {
    /// Event time in epoch milliseconds.
    pub timestamp: i64,
    pub payload: Bytes,
    pub partition_key: String,
    pub sequence: u64,
}

impl Event {
    /// Creates an event whose partition key is a hash of the payload, the first four bytes of its
    /// SHA-256 digest. Equal payloads map to the same key across runs and builds.
    pub fn new(timestamp: i64, payload: impl Into<Bytes>, sequence: u64) -> Self {
        let payload = payload.into();
        let partition_key = payload_hash(&payload).to_string();
        Event {
            timestamp,
            payload,
            partition_key,
            sequence,
        }
    }

    pub fn key(&self) -> EventKey {
        EventKey {
            timestamp: self.timestamp,
            sequence: self.sequence,
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("timestamp", &format_millis(self.timestamp))
            .field("sequence", &self.sequence)
            .field("partition_key", &self.partition_key)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// The ordering identity of an [Event], cheap to copy into ordered collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventKey {
    pub timestamp: i64,
    pub sequence: u64,
}

/// Marker telling downstream consumers that no event older than `watermark` will follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WatermarkRecord {
    #[serde(rename = "type")]
    kind: &'static str,
    pub watermark: i64,
}

impl WatermarkRecord {
    pub fn new(watermark: i64) -> Self {
        WatermarkRecord {
            kind: "watermark",
            watermark,
        }
    }

    pub fn payload(&self) -> Bytes {
        // serializing a struct of a str and an integer cannot fail
        Bytes::from(serde_json::to_vec(self).unwrap_or_default())
    }
}

fn payload_hash(payload: &[u8]) -> u32 {
    let digest = Sha256::digest(payload);
    digest
        .as_slice()
        .first_chunk::<4>()
        .map_or(0, |bytes| u32::from_be_bytes(*bytes))
}

/// Renders epoch milliseconds for log lines, falling back to the raw number when out of range.
pub fn format_millis(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}
