//! Core data model.
//!
//! The worker moves through a small lifecycle: it starts, consumes until
//! asked to stop, drains, and terminates. Startup is a fixed sequence of
//! broker stages, any of which may fail fatally.

// ---------------------------------------------------------------------------
// Worker State
// ---------------------------------------------------------------------------

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// Constructed, broker session not yet established.
    Starting,
    /// Consumer registered, deliveries are being processed.
    Consuming,
    /// Stop requested, draining in-flight work.
    ShuttingDown,
    /// Broker session released. Terminal.
    Terminated,
}

impl WorkerState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, to),
            (Starting, Consuming)
                | (Starting, Terminated) // startup failure or stop before start
                | (Consuming, ShuttingDown)
                | (ShuttingDown, Terminated)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Terminated)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerState::Starting => "starting",
            WorkerState::Consuming => "consuming",
            WorkerState::ShuttingDown => "shutting_down",
            WorkerState::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Startup Stage
// ---------------------------------------------------------------------------

/// The ordered steps of worker startup. A failure at any stage is fatal
/// and no later stage is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StartupStage {
    Connect,
    OpenChannel,
    DeclareQueue,
    RegisterConsumer,
}

impl StartupStage {
    pub const ALL: [StartupStage; 4] = [
        StartupStage::Connect,
        StartupStage::OpenChannel,
        StartupStage::DeclareQueue,
        StartupStage::RegisterConsumer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StartupStage::Connect => "connect",
            StartupStage::OpenChannel => "open_channel",
            StartupStage::DeclareQueue => "declare_queue",
            StartupStage::RegisterConsumer => "register_consumer",
        }
    }
}

impl std::fmt::Display for StartupStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Delivery Outcome
// ---------------------------------------------------------------------------

/// How a single delivery was settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryOutcome {
    /// Processed and acknowledged.
    Acked,
    /// Processed, but the acknowledgment call failed. The broker will
    /// redeliver according to its own policy.
    AckFailed,
    /// Processing failed and the delivery was negatively acknowledged.
    Rejected,
    /// Processing failed and the negative acknowledgment also failed.
    RejectFailed,
}

impl DeliveryOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryOutcome::Acked => "acked",
            DeliveryOutcome::AckFailed => "ack_failed",
            DeliveryOutcome::Rejected => "rejected",
            DeliveryOutcome::RejectFailed => "reject_failed",
        }
    }
}

impl std::fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Snapshot of delivery counters for one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryCounts {
    pub received: u64,
    pub acked: u64,
    pub ack_failures: u64,
    pub rejected: u64,
}

/// Summary returned by [`crate::worker::Worker::stop`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Whether all in-flight work finished within the grace period.
    pub drained: bool,
    /// Deliveries still in flight when the grace period elapsed. These
    /// stay unacknowledged and are returned to the queue by the broker.
    pub abandoned: usize,
    pub counts: DeliveryCounts,
}
