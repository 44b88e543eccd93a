//! Worker lifecycle: connect, declare, consume, and drain on stop.

use crate::broker::{Channel, Connection, ConsumerSpec, Connector, QueueSpec};
use crate::config::{Config, DEFAULT_QUEUE_NAME};
use crate::error::{Error, Result};
use crate::model::{DeliveryCounts, ShutdownReport, StartupStage, WorkerState};
use crate::processor::{Processor, SimulatedWork};
use crate::retry::{RetryPolicy, retry};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use super::consume::{ConsumeLoop, DeliveryStats, InFlightTracker};

/// What the worker consumes and how patient it is.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub queue: QueueSpec,
    pub consumer: ConsumerSpec,
    /// Upper bound on how long stop waits for in-flight work.
    pub shutdown_grace: Duration,
    pub connect_retry: RetryPolicy,
    /// Requeue deliveries whose processing failed.
    pub requeue_failed: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            queue: QueueSpec::durable(DEFAULT_QUEUE_NAME),
            consumer: ConsumerSpec::default(),
            shutdown_grace: Duration::from_secs(1),
            connect_retry: RetryPolicy::default(),
            requeue_failed: true,
        }
    }
}

impl From<&Config> for WorkerSettings {
    fn from(config: &Config) -> Self {
        Self {
            queue: QueueSpec::durable(&config.queue_name),
            consumer: ConsumerSpec::new(&config.consumer_tag),
            shutdown_grace: config.shutdown_grace,
            connect_retry: RetryPolicy {
                max_attempts: config.connect_max_attempts,
                initial_backoff: config.connect_backoff,
                max_backoff: config.connect_max_backoff,
            },
            requeue_failed: config.requeue_failed,
        }
    }
}

/// Builder for [`Worker`].
pub struct WorkerBuilder<C> {
    connector: C,
    settings: WorkerSettings,
    processor: Option<Arc<dyn Processor>>,
}

impl<C: Connector> WorkerBuilder<C> {
    pub fn settings(mut self, settings: WorkerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn queue(mut self, name: impl Into<String>) -> Self {
        self.settings.queue.name = name.into();
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.settings.shutdown_grace = grace;
        self
    }

    pub fn connect_retry(mut self, policy: RetryPolicy) -> Self {
        self.settings.connect_retry = policy;
        self
    }

    /// Replace the default [`SimulatedWork`] processor.
    pub fn processor(mut self, processor: impl Processor + 'static) -> Self {
        self.processor = Some(Arc::new(processor));
        self
    }

    pub fn build(self) -> Worker<C> {
        let (state, _) = watch::channel(WorkerState::Starting);
        Worker {
            connector: self.connector,
            settings: self.settings,
            processor: self
                .processor
                .unwrap_or_else(|| Arc::new(SimulatedWork::default())),
            state,
            shutdown: CancellationToken::new(),
            in_flight: InFlightTracker::default(),
            stats: Arc::new(DeliveryStats::default()),
            session: None,
        }
    }
}

/// Broker resources held while consuming.
struct Session<Conn: Connection> {
    connection: Conn,
    channel: Conn::Channel,
    consumer: JoinHandle<()>,
}

/// A single-consumer, at-least-once worker on one queue.
pub struct Worker<C: Connector> {
    connector: C,
    settings: WorkerSettings,
    processor: Arc<dyn Processor>,
    state: watch::Sender<WorkerState>,
    shutdown: CancellationToken,
    in_flight: InFlightTracker,
    stats: Arc<DeliveryStats>,
    session: Option<Session<C::Connection>>,
}

impl<C: Connector> Worker<C> {
    pub fn builder(connector: C) -> WorkerBuilder<C> {
        WorkerBuilder {
            connector,
            settings: WorkerSettings::default(),
            processor: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    pub fn counts(&self) -> DeliveryCounts {
        self.stats.snapshot()
    }

    /// Deliveries currently being processed (0 or 1).
    pub fn in_flight(&self) -> usize {
        self.in_flight.current()
    }

    /// Connect, open a channel, declare the queue, register the consumer,
    /// and start processing deliveries in the background.
    ///
    /// Only connecting is retried. Any failure is fatal: no later stage is
    /// attempted, whatever was opened is closed, and the worker terminates.
    /// Startup also gives up, with [`Error::Cancelled`], once the worker's
    /// shutdown has been requested by [`Worker::run_until`].
    pub async fn start(&mut self) -> Result<()> {
        let current = self.state();
        if current != WorkerState::Starting {
            return Err(Error::InvalidState(current));
        }

        let connector = &self.connector;
        let connecting = retry(&self.settings.connect_retry, "connect", move || {
            connector.connect()
        });
        let connection = match self.unless_cancelled(connecting).await {
            Ok(connection) => connection,
            Err(e) => return Err(self.abort_startup(StartupStage::Connect, e)),
        };

        let channel = match self.unless_cancelled(connection.open_channel()).await {
            Ok(channel) => channel,
            Err(e) => {
                release(&connection, None).await;
                return Err(self.abort_startup(StartupStage::OpenChannel, e));
            }
        };

        if let Err(e) = self
            .unless_cancelled(channel.declare_queue(&self.settings.queue))
            .await
        {
            release(&connection, Some(&channel)).await;
            return Err(self.abort_startup(StartupStage::DeclareQueue, e));
        }

        let deliveries = match self
            .unless_cancelled(channel.consume(&self.settings.queue.name, &self.settings.consumer))
            .await
        {
            Ok(deliveries) => deliveries,
            Err(e) => {
                release(&connection, Some(&channel)).await;
                return Err(self.abort_startup(StartupStage::RegisterConsumer, e));
            }
        };

        let consume = ConsumeLoop {
            queue: self.settings.queue.name.clone(),
            processor: Arc::clone(&self.processor),
            requeue_failed: self.settings.requeue_failed,
            in_flight: self.in_flight.clone(),
            stats: Arc::clone(&self.stats),
            shutdown: self.shutdown.clone(),
        };
        // The consume task logs under the caller's span.
        let consumer = tokio::spawn(consume.run(deliveries).in_current_span());

        self.session = Some(Session {
            connection,
            channel,
            consumer,
        });
        self.transition(WorkerState::Consuming);
        info!(queue = %self.settings.queue.name, "worker initialized, waiting for messages");
        Ok(())
    }

    /// Stop consuming, wait up to the grace period for the current
    /// delivery, then release the channel and connection.
    ///
    /// Deliveries still unacknowledged when the grace period elapses are
    /// left for the broker to requeue when the channel closes.
    pub async fn stop(&mut self) -> Result<ShutdownReport> {
        let Some(session) = self.session.take() else {
            match self.state() {
                WorkerState::Starting => self.transition(WorkerState::Terminated),
                WorkerState::Terminated => {}
                other => return Err(Error::InvalidState(other)),
            }
            return Ok(ShutdownReport {
                drained: true,
                abandoned: 0,
                counts: self.counts(),
            });
        };

        self.transition(WorkerState::ShuttingDown);
        info!(queue = %self.settings.queue.name, "shutdown signal received, terminating");

        let grace = self.settings.shutdown_grace;
        let deadline = tokio::time::Instant::now() + grace;
        self.shutdown.cancel();

        let Session {
            connection,
            channel,
            mut consumer,
        } = session;

        let idle = tokio::time::timeout_at(deadline, self.in_flight.wait_idle())
            .await
            .is_ok();
        let joined = idle
            && match tokio::time::timeout_at(deadline, &mut consumer).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    warn!(error = %e, "consume task ended abnormally");
                    true
                }
                Err(_) => false,
            };

        let abandoned = if joined { 0 } else { self.in_flight.current() };
        if !joined {
            warn!(
                in_flight = abandoned,
                grace_ms = grace.as_millis() as u64,
                "grace period elapsed with work in flight, leaving it unacknowledged"
            );
            consumer.abort();
            let _ = consumer.await;
        }

        release(&connection, Some(&channel)).await;
        self.transition(WorkerState::Terminated);

        let report = ShutdownReport {
            drained: joined,
            abandoned,
            counts: self.counts(),
        };
        info!(
            drained = report.drained,
            abandoned = report.abandoned,
            received = report.counts.received,
            acked = report.counts.acked,
            ack_failures = report.counts.ack_failures,
            "shutdown completed"
        );
        Ok(report)
    }

    /// Start, wait for `signal`, then stop.
    ///
    /// `signal` is polled before and during startup. If it resolves first,
    /// startup is abandoned (including any connect backoff), whatever was
    /// opened is closed, and the worker terminates without consuming.
    pub async fn run_until<F>(&mut self, signal: F) -> Result<ShutdownReport>
    where
        F: Future,
    {
        tokio::pin!(signal);
        let shutdown = self.shutdown.clone();
        let mut signalled = false;

        let started = {
            let start = self.start();
            tokio::pin!(start);
            tokio::select! {
                biased;
                _ = &mut signal => {
                    signalled = true;
                    shutdown.cancel();
                    start.await
                }
                started = &mut start => started,
            }
        };

        match started {
            Ok(()) if !signalled => {
                signal.await;
            }
            Ok(()) => {}
            Err(Error::Cancelled) => {}
            Err(e) => return Err(e),
        }
        self.stop().await
    }

    /// Run one startup stage unless shutdown was requested first.
    async fn unless_cancelled<T>(&self, stage: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(Error::Cancelled),
            result = stage => result,
        }
    }

    fn abort_startup(&self, stage: StartupStage, e: Error) -> Error {
        self.transition(WorkerState::Terminated);
        if matches!(e, Error::Cancelled) {
            info!(%stage, "termination requested during startup, not consuming");
            return e;
        }
        error!(%stage, error = %e, "worker startup failed");
        metrics::startup_failures().add(1, &[KeyValue::new("stage", stage.as_str())]);
        Error::Startup {
            stage,
            source: Box::new(e),
        }
    }

    fn transition(&self, to: WorkerState) {
        let from = self.state.send_replace(to);
        debug_assert!(
            from.can_transition_to(to),
            "invalid worker transition {from} -> {to}"
        );
        debug!(%from, %to, "worker state transition");
    }
}

impl<C: Connector> Drop for Worker<C> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.shutdown.cancel();
            session.consumer.abort();
        }
    }
}

/// Close what startup or shutdown opened. Errors are logged, not returned.
async fn release<Conn: Connection>(connection: &Conn, channel: Option<&Conn::Channel>) {
    if let Some(channel) = channel {
        if let Err(e) = channel.close().await {
            warn!(error = %e, "failed to close channel");
        }
    }
    if let Err(e) = connection.close().await {
        warn!(error = %e, "failed to close connection");
    }
}
