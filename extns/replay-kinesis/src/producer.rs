//! Batching producer for submitted events.
//!
//! ```text
//! submit --> [unbounded channel] --> (actor) --buffer--> full / max_buffered_time elapsed
//!                                                          |
//!                                          (batch task) <--+  at most max_outstanding_batches
//!                                               |
//!                                 PutRecords, throttled entries retried with backoff
//!                                               |
//!                                   resolve each record's completion handle
//! ```
//!
//! Records leave the actor in submit order. A batch is one `PutRecords` call (plus retries of its
//! throttled entries), so ordering across concurrent batches is not guaranteed by Kinesis.

use std::sync::Arc;
use std::time::Duration;

use aws_sdk_kinesis::Client;
use aws_sdk_kinesis::primitives::Blob;
use aws_sdk_kinesis::types::PutRecordsRequestEntry;
use replay_core::backoff::Exponential;
use replay_core::destination::{Ack, PendingSubmit, Record};
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::{Error, KinesisConfig, MAX_BATCH_BYTES, Result, extract_aws_error, is_throttling_code};

const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_MAX: Duration = Duration::from_secs(5);

struct BufferedRecord {
    record: Record,
    respond_to: oneshot::Sender<replay_core::Result<Ack>>,
    attempts: u32,
}

impl BufferedRecord {
    fn size(&self) -> usize {
        self.record.payload.len() + self.record.routing.partition_key().len()
    }

    fn resolve(self, result: replay_core::Result<Ack>) {
        // the submitter may have stopped waiting, nothing to do then
        let _ = self.respond_to.send(result);
    }

    fn entry(&self) -> Result<PutRecordsRequestEntry> {
        PutRecordsRequestEntry::builder()
            .data(Blob::new(self.record.payload.to_vec()))
            .partition_key(self.record.routing.partition_key())
            .set_explicit_hash_key(self.record.routing.explicit_hash_key().map(str::to_string))
            .build()
            .map_err(|e| Error::Other(format!("Failed to build record entry: {e}")))
    }
}

enum ProducerMessage {
    Submit(BufferedRecord),
    Flush { respond_to: oneshot::Sender<()> },
}

/// Handle to the producer actor. The actor stops once every handle is dropped, after writing what
/// it still buffers.
#[derive(Clone)]
pub(crate) struct Producer {
    actor_tx: mpsc::UnboundedSender<ProducerMessage>,
}

impl Producer {
    pub(crate) fn start(client: Client, config: &KinesisConfig) -> Self {
        let (actor_tx, handler_rx) = mpsc::unbounded_channel();
        let actor = ProducerActor {
            handler_rx,
            client,
            stream_name: config.stream_name.clone(),
            max_buffered_time: config.max_buffered_time,
            max_batch_records: config.max_batch_records,
            max_record_attempts: config.max_record_attempts,
            outstanding: Arc::new(Semaphore::new(config.max_outstanding_batches)),
            batches: TaskTracker::new(),
            buffer: Vec::new(),
            buffered_bytes: 0,
        };
        tokio::spawn(actor.run());
        Producer { actor_tx }
    }

    /// Queues the record. Never waits, the returned handle resolves once Kinesis accepted or
    /// rejected the record.
    pub(crate) fn submit(&self, record: Record) -> Result<PendingSubmit> {
        let (respond_to, pending) = PendingSubmit::channel();
        let message = ProducerMessage::Submit(BufferedRecord {
            record,
            respond_to,
            attempts: 0,
        });
        self.actor_tx
            .send(message)
            .map_err(|_| Error::Other("producer actor is not running".to_string()))?;
        Ok(pending)
    }

    /// Writes out the buffer and waits for every outstanding batch.
    pub(crate) async fn flush(&self) -> Result<()> {
        let (respond_to, done) = oneshot::channel();
        self.actor_tx
            .send(ProducerMessage::Flush { respond_to })
            .map_err(|_| Error::Other("producer actor is not running".to_string()))?;
        done.await.map_err(Error::ActorTaskTerminated)
    }
}

struct ProducerActor {
    handler_rx: mpsc::UnboundedReceiver<ProducerMessage>,
    client: Client,
    stream_name: String,
    max_buffered_time: Duration,
    max_batch_records: usize,
    max_record_attempts: u32,
    outstanding: Arc<Semaphore>,
    batches: TaskTracker,
    buffer: Vec<BufferedRecord>,
    buffered_bytes: usize,
}

impl ProducerActor {
    async fn run(mut self) {
        let mut deadline: Option<Instant> = None;
        loop {
            tokio::select! {
                message = self.handler_rx.recv() => match message {
                    Some(ProducerMessage::Submit(record)) => {
                        if self.buffered_bytes + record.size() > MAX_BATCH_BYTES {
                            self.dispatch_batch().await;
                            deadline = None;
                        }
                        if self.buffer.is_empty() {
                            deadline = Some(Instant::now() + self.max_buffered_time);
                        }
                        self.buffered_bytes += record.size();
                        self.buffer.push(record);
                        if self.buffer.len() >= self.max_batch_records {
                            self.dispatch_batch().await;
                            deadline = None;
                        }
                    }
                    Some(ProducerMessage::Flush { respond_to }) => {
                        self.dispatch_batch().await;
                        deadline = None;
                        self.wait_for_batches().await;
                        let _ = respond_to.send(());
                    }
                    None => {
                        self.dispatch_batch().await;
                        self.wait_for_batches().await;
                        debug!("Producer actor stopped");
                        return;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.dispatch_batch().await;
                    deadline = None;
                }
            }
        }
    }

    async fn wait_for_batches(&self) {
        self.batches.close();
        self.batches.wait().await;
        self.batches.reopen();
    }

    async fn dispatch_batch(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.buffer);
        self.buffered_bytes = 0;

        // the semaphore is never closed
        let Ok(permit) = Arc::clone(&self.outstanding).acquire_owned().await else {
            return;
        };
        let client = self.client.clone();
        let stream_name = self.stream_name.clone();
        let max_record_attempts = self.max_record_attempts;
        self.batches.spawn(async move {
            put_batch(&client, &stream_name, batch, max_record_attempts).await;
            drop(permit);
        });
    }
}

/// Writes the batch, retrying throttled entries until they succeed or run out of attempts. Every
/// record's handle is resolved before this returns.
async fn put_batch(
    client: &Client,
    stream_name: &str,
    mut batch: Vec<BufferedRecord>,
    max_record_attempts: u32,
) {
    let mut backoff = Exponential::new(RETRY_BASE, RETRY_MAX, 2.0, 0.5, None);

    while !batch.is_empty() {
        let mut entries = Vec::with_capacity(batch.len());
        let mut sendable = Vec::with_capacity(batch.len());
        for mut record in batch {
            match record.entry() {
                Ok(entry) => {
                    record.attempts += 1;
                    entries.push(entry);
                    sendable.push(record);
                }
                Err(e) => record.resolve(Err(e.into())),
            }
        }
        if sendable.is_empty() {
            return;
        }

        let response = client
            .put_records()
            .stream_name(stream_name)
            .set_records(Some(entries))
            .send()
            .await;

        let mut retry = Vec::new();
        match response {
            Ok(output) => {
                debug!(
                    records = sendable.len(),
                    failed = output.failed_record_count().unwrap_or_default(),
                    "PutRecords completed"
                );
                for (record, result) in sendable.into_iter().zip(output.records()) {
                    match result.error_code() {
                        None => record.resolve(Ok(Ack {
                            partition_id: result.shard_id().unwrap_or_default().to_string(),
                            sequence_number: result.sequence_number().map(str::to_string),
                        })),
                        Some(code) => {
                            let message =
                                format!("{code}: {}", result.error_message().unwrap_or_default());
                            let error = if is_throttling_code(code) {
                                Error::Throttled(message)
                            } else {
                                Error::Kinesis(message)
                            };
                            retry_or_fail(record, error, max_record_attempts, &mut retry);
                        }
                    }
                }
            }
            Err(e) => {
                let error = extract_aws_error(&e);
                warn!(?error, records = sendable.len(), "PutRecords failed");
                for record in sendable {
                    let error = match &error {
                        Error::Throttled(msg) => Error::Throttled(msg.clone()),
                        other => Error::Kinesis(other.to_string()),
                    };
                    retry_or_fail(record, error, max_record_attempts, &mut retry);
                }
            }
        }

        batch = retry;
        if !batch.is_empty() {
            let delay = backoff.next().unwrap_or(RETRY_MAX);
            debug!(records = batch.len(), ?delay, "Retrying throttled records");
            tokio::time::sleep(delay).await;
        }
    }
}

fn retry_or_fail(
    record: BufferedRecord,
    error: Error,
    max_record_attempts: u32,
    retry: &mut Vec<BufferedRecord>,
) {
    if matches!(error, Error::Throttled(_)) && record.attempts < max_record_attempts {
        retry.push(record);
    } else {
        record.resolve(Err(error.into()));
    }
}
