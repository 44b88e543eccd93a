//! Integration tests for the worker against the in-memory broker.
//!
//! Runs on tokio's paused clock, so the fixed processing delays and the
//! shutdown grace period elapse instantly.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use weather_worker::broker::QueueSpec;
use weather_worker::broker::memory::{MemoryBroker, Operation};
use weather_worker::error::{Error, Result};
use weather_worker::model::{StartupStage, WorkerState};
use weather_worker::processor::{Processor, SimulatedWork};
use weather_worker::retry::RetryPolicy;
use weather_worker::worker::Worker;

const QUEUE: &str = "local_weather";

fn broker_with(payloads: &[&str]) -> MemoryBroker {
    let broker = MemoryBroker::new();
    broker.declare(&QueueSpec::durable(QUEUE)).unwrap();
    for payload in payloads {
        broker.publish(QUEUE, payload.as_bytes()).unwrap();
    }
    broker
}

/// Poll `cond` on the paused clock until it holds or a minute passes.
async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..6000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn acked_strings(broker: &MemoryBroker) -> Vec<String> {
    broker
        .acked(QUEUE)
        .into_iter()
        .map(|p| String::from_utf8(p).unwrap())
        .collect()
}

/// Records the start of each processing call together with how many
/// deliveries had been acknowledged at that moment.
struct RecordingProcessor {
    broker: MemoryBroker,
    delay: Duration,
    starts: Arc<Mutex<Vec<(String, usize)>>>,
}

#[async_trait]
impl Processor for RecordingProcessor {
    async fn process(&self, payload: &[u8]) -> Result<()> {
        let acked = self.broker.acked(QUEUE).len();
        self.starts
            .lock()
            .unwrap()
            .push((String::from_utf8_lossy(payload).into_owned(), acked));
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

/// Fails the first attempt at one specific payload.
struct FailFirst {
    payload: &'static str,
    failed: AtomicBool,
}

impl FailFirst {
    fn new(payload: &'static str) -> Self {
        Self {
            payload,
            failed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Processor for FailFirst {
    async fn process(&self, payload: &[u8]) -> Result<()> {
        if payload == self.payload.as_bytes() && !self.failed.swap(true, Ordering::SeqCst) {
            return Err(Error::Processing(format!("cannot handle {}", self.payload)));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Processing
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
#[tracing_test::traced_test]
async fn weather_reports_are_received_and_confirmed_in_order() {
    let broker = broker_with(&["clear", "rain", "storm"]);
    let mut worker = Worker::builder(broker.clone()).build();

    worker.start().await.unwrap();
    assert_eq!(worker.state(), WorkerState::Consuming);

    wait_until(|| broker.acked(QUEUE).len() == 3).await;
    assert_eq!(acked_strings(&broker), ["clear", "rain", "storm"]);

    let report = worker.stop().await.unwrap();
    assert!(report.drained);
    assert_eq!(report.counts.received, 3);
    assert_eq!(report.counts.acked, 3);

    logs_assert(|lines: &[&str]| {
        let events: Vec<String> = lines
            .iter()
            .filter_map(|line| {
                if line.contains("received message") {
                    ["clear", "rain", "storm"]
                        .iter()
                        .find(|p| line.contains(*p))
                        .map(|p| format!("received {p}"))
                } else if line.contains("confirmed message") {
                    Some("confirmed".to_string())
                } else {
                    None
                }
            })
            .collect();
        let expected = [
            "received clear",
            "confirmed",
            "received rain",
            "confirmed",
            "received storm",
            "confirmed",
        ];
        if events == expected {
            Ok(())
        } else {
            Err(format!("unexpected log sequence: {events:?}"))
        }
    });
}

#[tokio::test(start_paused = true)]
#[tracing_test::traced_test]
async fn non_utf8_payload_is_logged_lossily_and_acked() {
    let broker = broker_with(&[]);
    broker.publish(QUEUE, vec![0xff, 0xfe, b'x']).unwrap();
    let mut worker = Worker::builder(broker.clone()).build();

    worker.start().await.unwrap();
    wait_until(|| broker.acked(QUEUE).len() == 1).await;
    worker.stop().await.unwrap();

    assert_eq!(broker.acked(QUEUE), [vec![0xff, 0xfe, b'x']]);
    assert!(logs_contain("received message"));
    assert!(logs_contain("\u{FFFD}\u{FFFD}x"));
    assert!(logs_contain("confirmed message"));
}

#[tokio::test(start_paused = true)]
async fn next_delivery_waits_for_previous_ack() {
    let payloads: Vec<String> = (0..8).map(|i| format!("report-{i}")).collect();
    let refs: Vec<&str> = payloads.iter().map(String::as_str).collect();
    let broker = broker_with(&refs);

    let starts = Arc::new(Mutex::new(Vec::new()));
    let mut worker = Worker::builder(broker.clone())
        .processor(RecordingProcessor {
            broker: broker.clone(),
            delay: Duration::from_secs(2),
            starts: Arc::clone(&starts),
        })
        .build();

    worker.start().await.unwrap();
    wait_until(|| broker.acked(QUEUE).len() == payloads.len()).await;
    worker.stop().await.unwrap();

    let starts = starts.lock().unwrap().clone();
    let expected: Vec<(String, usize)> = payloads
        .iter()
        .enumerate()
        .map(|(i, p)| (p.clone(), i))
        .collect();
    // Delivery i starts processing only once exactly i acks have landed.
    assert_eq!(starts, expected);
    assert_eq!(acked_strings(&broker), payloads);
}

#[tokio::test(start_paused = true)]
async fn processing_takes_the_configured_delay() {
    let broker = broker_with(&["clear"]);
    let mut worker = Worker::builder(broker.clone())
        .processor(SimulatedWork::new(Duration::from_secs(2)))
        .build();

    let started = tokio::time::Instant::now();
    worker.start().await.unwrap();
    wait_until(|| broker.acked(QUEUE).len() == 1).await;

    assert!(started.elapsed() >= Duration::from_secs(2));
    worker.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn ack_failure_does_not_stop_the_loop() {
    let broker = broker_with(&["clear", "rain", "storm"]);
    broker.fail_next(Operation::Ack);
    let mut worker = Worker::builder(broker.clone()).build();

    worker.start().await.unwrap();
    wait_until(|| worker.counts().received == 3 && worker.in_flight() == 0).await;

    let counts = worker.counts();
    assert_eq!(counts.ack_failures, 1);
    assert_eq!(counts.acked, 2);
    assert_eq!(acked_strings(&broker), ["rain", "storm"]);
    let acks = broker
        .journal()
        .into_iter()
        .filter(|op| *op == Operation::Ack)
        .count();
    assert_eq!(acks, 3, "every delivery gets exactly one ack attempt");

    // The failed delivery stays unacknowledged until the channel closes.
    assert_eq!(broker.unacked_count(QUEUE), 1);
    worker.stop().await.unwrap();
    assert_eq!(broker.ready_count(QUEUE), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_processing_is_rejected_and_requeued() {
    let broker = broker_with(&["garbage"]);
    let mut worker = Worker::builder(broker.clone())
        .processor(FailFirst::new("garbage"))
        .build();

    worker.start().await.unwrap();
    wait_until(|| broker.acked(QUEUE).len() == 1).await;
    let report = worker.stop().await.unwrap();

    assert!(broker.journal().contains(&Operation::Nack));
    assert_eq!(report.counts.received, 2);
    assert_eq!(report.counts.rejected, 1);
    assert_eq!(report.counts.acked, 1);
    assert_eq!(broker.ready_count(QUEUE), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_processing_can_be_dropped() {
    let broker = broker_with(&["garbage", "clear"]);
    let mut settings = weather_worker::worker::WorkerSettings::default();
    settings.requeue_failed = false;
    let mut worker = Worker::builder(broker.clone())
        .settings(settings)
        .processor(FailFirst::new("garbage"))
        .build();

    worker.start().await.unwrap();
    wait_until(|| worker.counts().received == 2 && worker.in_flight() == 0).await;
    worker.stop().await.unwrap();

    assert_eq!(acked_strings(&broker), ["clear"]);
    assert_eq!(broker.ready_count(QUEUE), 0);
    assert_eq!(broker.unacked_count(QUEUE), 0);
}

#[tokio::test(start_paused = true)]
async fn messages_published_after_start_are_consumed() {
    let broker = broker_with(&[]);
    let mut worker = Worker::builder(broker.clone()).build();
    worker.start().await.unwrap();

    broker.publish(QUEUE, "fog").unwrap();
    wait_until(|| broker.acked(QUEUE).len() == 1).await;
    assert_eq!(acked_strings(&broker), ["fog"]);

    worker.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn stop_waits_for_in_flight_delivery_within_grace() {
    let broker = broker_with(&["clear", "rain"]);
    let mut worker = Worker::builder(broker.clone())
        .processor(SimulatedWork::new(Duration::from_secs(2)))
        .shutdown_grace(Duration::from_secs(5))
        .build();

    worker.start().await.unwrap();
    wait_until(|| worker.in_flight() == 1).await;

    let report = worker.stop().await.unwrap();
    assert!(report.drained);
    assert_eq!(report.abandoned, 0);
    assert_eq!(acked_strings(&broker), ["clear"]);
    // The second report was never processed and goes back to the queue.
    assert_eq!(broker.ready_count(QUEUE), 1);
    assert_eq!(worker.state(), WorkerState::Terminated);
}

#[tokio::test(start_paused = true)]
async fn stop_does_not_wait_past_the_grace_period() {
    let broker = broker_with(&["storm"]);
    let mut worker = Worker::builder(broker.clone())
        .processor(SimulatedWork::new(Duration::from_secs(60)))
        .shutdown_grace(Duration::from_secs(1))
        .build();

    worker.start().await.unwrap();
    wait_until(|| worker.in_flight() == 1).await;

    let stop_requested = tokio::time::Instant::now();
    let report = worker.stop().await.unwrap();
    let waited = stop_requested.elapsed();

    assert!(waited >= Duration::from_secs(1));
    assert!(waited < Duration::from_secs(60));
    assert!(!report.drained);
    assert_eq!(report.abandoned, 1);
    assert_eq!(report.counts.acked, 0);

    // Left unacknowledged; the broker requeues it as a redelivery.
    assert!(broker.acked(QUEUE).is_empty());
    assert_eq!(broker.ready_count(QUEUE), 1);
    assert!(!broker.has_consumer(QUEUE));
}

#[tokio::test(start_paused = true)]
async fn run_until_stops_when_signal_fires() {
    let broker = broker_with(&["clear", "rain", "storm"]);
    let mut worker = Worker::builder(broker.clone()).build();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let observer = broker.clone();
    tokio::spawn(async move {
        wait_until(|| observer.acked(QUEUE).len() == 3).await;
        let _ = tx.send(());
    });

    let report = worker
        .run_until(async {
            let _ = rx.await;
        })
        .await
        .unwrap();

    assert_eq!(report.counts.acked, 3);
    assert_eq!(worker.state(), WorkerState::Terminated);
    let journal = broker.journal();
    let tail = &journal[journal.len() - 2..];
    assert_eq!(tail, [Operation::CloseChannel, Operation::CloseConnection]);
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn startup_failure_stops_before_later_stages() {
    let failing_op = |stage: StartupStage| match stage {
        StartupStage::Connect => Operation::Connect,
        StartupStage::OpenChannel => Operation::OpenChannel,
        StartupStage::DeclareQueue => Operation::DeclareQueue,
        StartupStage::RegisterConsumer => Operation::Consume,
    };

    for stage in StartupStage::ALL {
        let broker = broker_with(&["clear"]);
        broker.fail_next(failing_op(stage));
        let mut worker = Worker::builder(broker.clone())
            .connect_retry(RetryPolicy::none())
            .build();

        let err = worker.start().await.unwrap_err();
        assert_eq!(err.startup_stage(), Some(stage), "{stage}");
        assert_eq!(worker.state(), WorkerState::Terminated, "{stage}");

        let journal = broker.journal();
        let attempted: Vec<Operation> = journal
            .iter()
            .copied()
            .filter(|op| !matches!(op, Operation::CloseChannel | Operation::CloseConnection))
            .collect();
        // The producer-side declare and publish come first.
        let steps = &attempted[2..];
        let expected: Vec<Operation> = StartupStage::ALL
            .iter()
            .take_while(|s| **s != stage)
            .map(|s| failing_op(*s))
            .chain(std::iter::once(failing_op(stage)))
            .collect();
        assert_eq!(steps, expected.as_slice(), "{stage}");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(worker.counts().received, 0, "{stage}");
        assert!(!broker.has_consumer(QUEUE), "{stage}");
        assert!(broker.acked(QUEUE).is_empty(), "{stage}");
    }
}

#[tokio::test(start_paused = true)]
async fn startup_failure_releases_opened_resources() {
    let broker = broker_with(&[]);
    broker.fail_next(Operation::Consume);
    let mut worker = Worker::builder(broker.clone()).build();

    assert!(worker.start().await.is_err());
    let journal = broker.journal();
    assert!(journal.contains(&Operation::CloseChannel));
    assert!(journal.contains(&Operation::CloseConnection));
}

#[tokio::test(start_paused = true)]
async fn declaring_with_conflicting_properties_is_fatal() {
    let broker = MemoryBroker::new();
    broker
        .declare(&QueueSpec {
            durable: false,
            ..QueueSpec::durable(QUEUE)
        })
        .unwrap();
    let mut worker = Worker::builder(broker.clone()).build();

    let err = worker.start().await.unwrap_err();
    assert_eq!(err.startup_stage(), Some(StartupStage::DeclareQueue));
}

#[tokio::test(start_paused = true)]
async fn connect_is_retried_before_giving_up() {
    let broker = broker_with(&["clear"]);
    broker.fail_next(Operation::Connect);
    broker.fail_next(Operation::Connect);
    let mut worker = Worker::builder(broker.clone())
        .connect_retry(RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        })
        .build();

    worker.start().await.unwrap();
    let connects = broker
        .journal()
        .into_iter()
        .filter(|op| *op == Operation::Connect)
        .count();
    assert_eq!(connects, 3);
    wait_until(|| broker.acked(QUEUE).len() == 1).await;
    worker.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn connect_gives_up_after_max_attempts() {
    let broker = broker_with(&[]);
    for _ in 0..3 {
        broker.fail_next(Operation::Connect);
    }
    let mut worker = Worker::builder(broker.clone())
        .connect_retry(RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        })
        .build();

    let err = worker.start().await.unwrap_err();
    assert_eq!(err.startup_stage(), Some(StartupStage::Connect));
    assert!(!broker.journal().contains(&Operation::OpenChannel));
}

#[tokio::test(start_paused = true)]
async fn termination_before_startup_skips_connecting() {
    let broker = broker_with(&["clear"]);
    for _ in 0..4 {
        broker.fail_next(Operation::Connect);
    }
    let mut worker = Worker::builder(broker.clone()).build();

    let started = tokio::time::Instant::now();
    let report = worker.run_until(std::future::ready(())).await.unwrap();

    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(worker.state(), WorkerState::Terminated);
    assert_eq!(report.counts.received, 0);
    assert!(!broker.journal().contains(&Operation::Connect));
    assert_eq!(broker.ready_count(QUEUE), 1);
}

#[tokio::test(start_paused = true)]
async fn termination_during_connect_backoff_stops_retrying() {
    let broker = broker_with(&["clear"]);
    for _ in 0..4 {
        broker.fail_next(Operation::Connect);
    }
    // Attempts at 0ms and 500ms fail; the next one would be at 1500ms.
    let mut worker = Worker::builder(broker.clone())
        .connect_retry(RetryPolicy::default())
        .build();
    let mut states = worker.subscribe();

    let started = tokio::time::Instant::now();
    let report = worker
        .run_until(tokio::time::sleep(Duration::from_millis(700)))
        .await
        .unwrap();

    assert_eq!(started.elapsed(), Duration::from_millis(700));
    assert_eq!(worker.state(), WorkerState::Terminated);
    assert_eq!(*states.borrow_and_update(), WorkerState::Terminated);
    assert_eq!(report.counts.received, 0);
    let connects = broker
        .journal()
        .into_iter()
        .filter(|op| *op == Operation::Connect)
        .count();
    assert_eq!(connects, 2);
    assert!(!broker.journal().contains(&Operation::OpenChannel));
    assert!(!broker.has_consumer(QUEUE));
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn start_twice_is_rejected() {
    let broker = broker_with(&[]);
    let mut worker = Worker::builder(broker.clone()).build();
    worker.start().await.unwrap();

    let err = worker.start().await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(WorkerState::Consuming)));
    worker.stop().await.unwrap();

    let err = worker.start().await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(WorkerState::Terminated)));
}

#[tokio::test(start_paused = true)]
async fn stop_before_start_terminates() {
    let broker = broker_with(&[]);
    let mut worker = Worker::builder(broker.clone()).build();

    let report = worker.stop().await.unwrap();
    assert!(report.drained);
    assert_eq!(worker.state(), WorkerState::Terminated);
    assert!(broker.journal().iter().all(|op| *op != Operation::Connect));

    // Idempotent once terminated.
    assert!(worker.stop().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn state_changes_are_observable() {
    let broker = broker_with(&[]);
    let mut worker = Worker::builder(broker.clone()).build();
    let mut states = worker.subscribe();
    assert_eq!(*states.borrow(), WorkerState::Starting);

    worker.start().await.unwrap();
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), WorkerState::Consuming);

    worker.stop().await.unwrap();
    assert_eq!(*states.borrow_and_update(), WorkerState::Terminated);
}
