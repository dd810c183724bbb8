//! Replays a timestamp-ordered event log into a partitioned stream at a configurable pace, while
//! injecting low watermarks into every partition.
//!
//! The [Replayer] pulls events from an [EventSource], holds each one back until the scaled wall
//! clock reaches its event time, hands it to the [Dispatcher] and periodically lets the
//! [WatermarkEmitter] write `oldest in-flight event - 1` into each partition of the
//! [Destination].
//!
//! [Replayer]: replay::Replayer
//! [EventSource]: source::EventSource
//! [Dispatcher]: dispatcher::Dispatcher
//! [WatermarkEmitter]: watermark::WatermarkEmitter
//! [Destination]: destination::Destination

pub mod backoff;
pub mod config;
pub mod destination;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod metrics;
pub mod pacing;
pub mod replay;
pub mod source;
pub mod statistics;
pub mod tracker;
pub mod watermark;

pub use crate::config::{ReplayConfig, WatermarkConfig};
pub use crate::error::{Error, Result};
pub use crate::event::{Event, WatermarkRecord};
pub use crate::replay::{ReplaySummary, Replayer};
