//! # Event streaming
//!
//! Drains one kernel buffer map, decodes each record and forwards it over a
//! bounded channel.
//!
//! - A record that fails to decode is logged and dropped; the stream keeps
//!   running.
//! - When the channel is full the [`BackpressurePolicy`] decides between
//!   dropping the new event (default) and waiting for the sink.
//! - Cancellation is observed between reads; a batch already read from the
//!   kernel is always finished before the consumer returns.

pub mod decode;

use crate::errors::CaatError;
use crate::kernel::{RawEventRecord, RecordSource};
use decode::{Event, RecordDecoder};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde_derive::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Drop the event that did not fit and count it.
    #[default]
    DropNewest,
    /// Wait for room in the channel, pushing back into the kernel buffer.
    Block,
}

/// Counters for one stream. Written by its consumer only.
#[derive(Debug, Default)]
pub struct StreamMetrics {
    records_read: AtomicU64,
    records_decoded: AtomicU64,
    dropped_decode: AtomicU64,
    dropped_backpressure: AtomicU64,
    blocked_sends: AtomicU64,
    lost_kernel: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub records_read: u64,
    pub records_decoded: u64,
    pub dropped_decode: u64,
    pub dropped_backpressure: u64,
    pub blocked_sends: u64,
    pub lost_kernel: u64,
}

impl StreamMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_read: self.records_read.load(Ordering::Relaxed),
            records_decoded: self.records_decoded.load(Ordering::Relaxed),
            dropped_decode: self.dropped_decode.load(Ordering::Relaxed),
            dropped_backpressure: self.dropped_backpressure.load(Ordering::Relaxed),
            blocked_sends: self.blocked_sends.load(Ordering::Relaxed),
            lost_kernel: self.lost_kernel.load(Ordering::Relaxed),
        }
    }

    fn inc(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

enum Delivery {
    Sent,
    Cancelled,
}

pub struct EventStreamConsumer<S: RecordSource, D: RecordDecoder> {
    map: String,
    source: S,
    decoder: Arc<D>,
    sink: Sender<Event>,
    policy: BackpressurePolicy,
    metrics: Arc<StreamMetrics>,
}

impl<S: RecordSource, D: RecordDecoder> EventStreamConsumer<S, D> {
    pub fn new(
        map: &str,
        source: S,
        decoder: Arc<D>,
        sink: Sender<Event>,
        policy: BackpressurePolicy,
    ) -> EventStreamConsumer<S, D> {
        EventStreamConsumer {
            map: map.to_string(),
            source,
            decoder,
            sink,
            policy,
            metrics: Arc::new(StreamMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<StreamMetrics> {
        self.metrics.clone()
    }

    /// Runs until `cancel` fires (clean, `Ok`) or the source/sink fails.
    /// The sink sender is dropped on return.
    pub async fn consume(mut self, cancel: CancellationToken) -> Result<(), CaatError> {
        let mut batch: Vec<RawEventRecord> = Vec::new();
        debug!("Consumer for {} started", self.map);

        loop {
            let stats = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                res = self.source.read_batch(&mut batch) => res?,
            };

            if stats.lost > 0 {
                StreamMetrics::inc(&self.metrics.lost_kernel, stats.lost);
                warn!(target: "error", "Events lost in {}: {}", self.map, stats.lost);
            }
            StreamMetrics::inc(&self.metrics.records_read, batch.len() as u64);

            let mut cancelled = false;
            for raw in batch.drain(..) {
                let event = match self.decoder.decode(&raw) {
                    Ok(e) => e,
                    Err(e) => {
                        StreamMetrics::inc(&self.metrics.dropped_decode, 1);
                        warn!(target: "error", "Dropping undecodable record from {}: {}", self.map, e);
                        continue;
                    }
                };
                StreamMetrics::inc(&self.metrics.records_decoded, 1);

                if cancelled {
                    StreamMetrics::inc(&self.metrics.dropped_backpressure, 1);
                    continue;
                }
                let delivery =
                    deliver(&self.sink, self.policy, &self.metrics, event, &cancel).await?;
                if let Delivery::Cancelled = delivery {
                    cancelled = true;
                }
            }

            if cancelled {
                break;
            }
        }

        debug!("Consumer for {} stopped: {:?}", self.map, self.metrics.snapshot());
        Ok(())
    }
}

async fn deliver(
    sink: &Sender<Event>,
    policy: BackpressurePolicy,
    metrics: &StreamMetrics,
    event: Event,
    cancel: &CancellationToken,
) -> Result<Delivery, CaatError> {
    let event = match sink.try_send(event) {
        Ok(()) => return Ok(Delivery::Sent),
        Err(TrySendError::Closed(_)) => return Err(CaatError::SinkClosed),
        Err(TrySendError::Full(event)) => event,
    };

    match policy {
        BackpressurePolicy::DropNewest => {
            StreamMetrics::inc(&metrics.dropped_backpressure, 1);
            Ok(Delivery::Sent)
        }
        BackpressurePolicy::Block => {
            StreamMetrics::inc(&metrics.blocked_sends, 1);
            tokio::select! {
                biased;
                res = sink.send(event) => {
                    res.map_err(|_| CaatError::SinkClosed)?;
                    Ok(Delivery::Sent)
                }
                _ = cancel.cancelled() => {
                    StreamMetrics::inc(&metrics.dropped_backpressure, 1);
                    Ok(Delivery::Cancelled)
                }
            }
        }
    }
}
