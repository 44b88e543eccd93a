//! The consume loop: one delivery at a time, in arrival order.
//!
//! A delivery is received, processed, and settled before the next one is
//! pulled from the stream, so acknowledgments never overlap or reorder.

use crate::broker::{Delivery, DeliveryStream};
use crate::model::{DeliveryCounts, DeliveryOutcome};
use crate::processor::Processor;
use crate::telemetry::delivery::{record_outcome, start_delivery_span};
use crate::telemetry::metrics;
use futures::StreamExt;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

// ---------------------------------------------------------------------------
// In-flight tracking
// ---------------------------------------------------------------------------

#[derive(Default)]
struct InFlightState {
    count: AtomicUsize,
    idle: Notify,
}

/// Counts deliveries currently being processed and lets shutdown wait for
/// the count to reach zero.
#[derive(Clone, Default)]
pub(crate) struct InFlightTracker {
    inner: Arc<InFlightState>,
}

impl InFlightTracker {
    pub(crate) fn enter(&self) -> InFlightGuard {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub(crate) fn current(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Resolve once nothing is in flight.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent exit cannot be missed.
            notified.as_mut().enable();
            if self.current() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub(crate) struct InFlightGuard {
    inner: Arc<InFlightState>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct DeliveryStats {
    received: AtomicU64,
    acked: AtomicU64,
    ack_failures: AtomicU64,
    rejected: AtomicU64,
}

impl DeliveryStats {
    fn record(&self, outcome: DeliveryOutcome) {
        let counter = match outcome {
            DeliveryOutcome::Acked => &self.acked,
            DeliveryOutcome::AckFailed => &self.ack_failures,
            DeliveryOutcome::Rejected | DeliveryOutcome::RejectFailed => &self.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> DeliveryCounts {
        DeliveryCounts {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

pub(crate) struct ConsumeLoop {
    pub(crate) queue: String,
    pub(crate) processor: Arc<dyn Processor>,
    pub(crate) requeue_failed: bool,
    pub(crate) in_flight: InFlightTracker,
    pub(crate) stats: Arc<DeliveryStats>,
    pub(crate) shutdown: CancellationToken,
}

impl ConsumeLoop {
    /// Drain `deliveries` until the stream ends or shutdown is requested.
    /// Shutdown is only observed between deliveries.
    pub(crate) async fn run(self, mut deliveries: DeliveryStream) {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!(queue = %self.queue, "consume loop stopping");
                    break;
                }
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    error!(queue = %self.queue, error = %e, "delivery stream failed");
                    break;
                }
                None => {
                    warn!(queue = %self.queue, "delivery stream closed");
                    break;
                }
            };

            let _guard = self.in_flight.enter();
            let span =
                start_delivery_span(&self.queue, delivery.delivery_tag, delivery.redelivered);
            let outcome = self.handle(delivery).instrument(span.clone()).await;
            record_outcome(&span, outcome);
        }
    }

    async fn handle(&self, delivery: Delivery) -> DeliveryOutcome {
        let queue_label = KeyValue::new("queue", self.queue.clone());

        self.stats.received.fetch_add(1, Ordering::Relaxed);
        metrics::deliveries_received().add(1, std::slice::from_ref(&queue_label));
        info!(payload = %delivery.payload_lossy(), "received message");

        let started = Instant::now();
        let processed = self.processor.process(&delivery.payload).await;
        metrics::processing_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            std::slice::from_ref(&queue_label),
        );

        let outcome = match processed {
            Ok(()) => match delivery.ack().await {
                Ok(()) => {
                    info!("confirmed message");
                    DeliveryOutcome::Acked
                }
                Err(e) => {
                    error!(error = %e, "ack failed");
                    DeliveryOutcome::AckFailed
                }
            },
            Err(e) => {
                warn!(error = %e, requeue = self.requeue_failed, "processing failed, rejecting");
                match delivery.reject(self.requeue_failed).await {
                    Ok(()) => DeliveryOutcome::Rejected,
                    Err(e) => {
                        error!(error = %e, "reject failed");
                        DeliveryOutcome::RejectFailed
                    }
                }
            }
        };

        self.stats.record(outcome);
        metrics::deliveries_settled().add(
            1,
            &[queue_label, KeyValue::new("outcome", outcome.as_str())],
        );
        outcome
    }
}
