//! Broker capabilities the worker depends on.
//!
//! The worker only needs four things from a broker: connect, open a
//! channel, declare a queue, and consume with manual acknowledgment.
//! [`amqp`] provides them over lapin; [`memory`] provides an in-process
//! broker for tests and dry runs.

pub mod amqp;
pub mod memory;

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Stream of deliveries for one consumer. Ends when the channel or
/// connection is closed.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Establishes broker sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: Connection;

    async fn connect(&self) -> Result<Self::Connection>;
}

/// An established broker session.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    type Channel: Channel;

    async fn open_channel(&self) -> Result<Self::Channel>;

    async fn close(&self) -> Result<()>;
}

/// A channel multiplexed over a connection.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Declare a queue. Idempotent for equal properties; fails when the
    /// queue already exists with different ones.
    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()>;

    /// Register a manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str, consumer: &ConsumerSpec) -> Result<DeliveryStream>;

    /// Publish one persistent message to `queue` through the default exchange.
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<()>;

    /// Close the channel. Unacknowledged deliveries return to their queue.
    async fn close(&self) -> Result<()>;
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Acknowledge this delivery only (never `multiple`).
    async fn ack(&self) -> Result<()>;

    async fn nack(&self, requeue: bool) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Specs
// ---------------------------------------------------------------------------

/// Queue declaration properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    /// Survives broker restart.
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueSpec {
    /// A durable, shared, long-lived queue.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// Do two declarations of the same name agree on properties?
    pub fn is_equivalent(&self, other: &QueueSpec) -> bool {
        self.durable == other.durable
            && self.exclusive == other.exclusive
            && self.auto_delete == other.auto_delete
    }
}

/// Consumer registration properties. Acknowledgment is always manual.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerSpec {
    /// Empty lets the broker pick a tag.
    pub tag: String,
    pub exclusive: bool,
}

impl ConsumerSpec {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            exclusive: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// One message handed to a consumer, paired with its acknowledgment handle.
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub payload: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        redelivered: bool,
        payload: Vec<u8>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            redelivered,
            payload,
            acker,
        }
    }

    /// Payload as text for logging. Invalid UTF-8 is replaced, never parsed.
    pub fn payload_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Acknowledge successful processing of this delivery alone.
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Negatively acknowledge this delivery.
    pub async fn reject(self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}
