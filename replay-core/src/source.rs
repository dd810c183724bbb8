//! Where the replayed events come from.
//!
//! A source yields events in non-decreasing timestamp order until it is exhausted. It is pulled
//! one event at a time by the replay loop and cannot be restarted.

use std::collections::VecDeque;

use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::event::Event;

/// JSON-lines source over any async buffered reader.
pub mod lines;

pub use lines::LineSource;

/// Timestamp format of the reference taxi trip dataset. Fractional seconds are optional.
const NAIVE_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

#[trait_variant::make(EventSource: Send)]
#[allow(dead_code)]
pub trait LocalEventSource {
    /// Pulls the next event, `None` once the source is exhausted.
    async fn next(&mut self) -> Result<Option<Event>>;
}

/// A source over events already in memory.
#[derive(Debug, Default)]
pub struct VecSource {
    events: VecDeque<Event>,
}

impl VecSource {
    pub fn new(events: impl IntoIterator<Item = Event>) -> Self {
        VecSource {
            events: events.into_iter().collect(),
        }
    }

    /// Events with the given timestamps, sequenced in order and carrying the timestamp as payload.
    pub fn from_timestamps(timestamps: impl IntoIterator<Item = i64>) -> Self {
        Self::new(
            timestamps
                .into_iter()
                .enumerate()
                .map(|(i, ts)| Event::new(ts, ts.to_string(), i as u64)),
        )
    }
}

impl EventSource for VecSource {
    async fn next(&mut self) -> Result<Option<Event>> {
        Ok(self.events.pop_front())
    }
}

/// Turns JSON lines into [Event]s. The line itself becomes the payload and the event time is
/// read from `timestamp_field`. Sequence numbers keep counting across everything decoded by the
/// same decoder.
#[derive(Debug, Clone)]
pub struct EventDecoder {
    timestamp_field: String,
    next_sequence: u64,
}

impl EventDecoder {
    pub fn new(timestamp_field: impl Into<String>) -> Self {
        EventDecoder {
            timestamp_field: timestamp_field.into(),
            next_sequence: 0,
        }
    }

    /// Decodes one line. Blank lines yield `None`.
    pub fn decode(&mut self, line_number: usize, line: &str) -> Result<Option<Event>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let value: Value = serde_json::from_str(line)
            .map_err(|e| Error::Source(format!("line {line_number}: invalid JSON: {e}")))?;
        let field = value.get(&self.timestamp_field).ok_or_else(|| {
            Error::Source(format!(
                "line {line_number}: missing timestamp field {}",
                self.timestamp_field
            ))
        })?;
        let timestamp = parse_timestamp(field).ok_or_else(|| {
            Error::Source(format!(
                "line {line_number}: cannot parse timestamp {field} in field {}",
                self.timestamp_field
            ))
        })?;

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        Ok(Some(Event::new(
            timestamp,
            Bytes::copy_from_slice(line.as_bytes()),
            sequence,
        )))
    }
}

/// Epoch millis from an integer, an RFC 3339 string or a naive UTC date time string.
fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .or_else(|_| {
                NaiveDateTime::parse_from_str(s, NAIVE_DATETIME_FORMAT)
                    .map(|dt| dt.and_utc().timestamp_millis())
            })
            .ok(),
        _ => None,
    }
}
