//! In-process broker.
//!
//! Implements the same capabilities as the AMQP broker with RabbitMQ's
//! observable semantics for the parts the worker uses: idempotent queue
//! declaration, manual acknowledgment, and requeue of unacknowledged
//! deliveries when the consuming channel closes. Every operation is
//! journaled, and one-shot faults can be injected per operation, so the
//! worker can be exercised without a live broker.
//!
//! Each queue accepts a single consumer at a time.

use super::{
    Acknowledger, Channel, Connection, ConsumerSpec, Connector, Delivery, DeliveryStream,
    QueueSpec,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A broker operation, as recorded in the journal and targeted by faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    OpenChannel,
    DeclareQueue,
    Consume,
    Publish,
    Ack,
    Nack,
    CloseChannel,
    CloseConnection,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Operation::Connect => "connect",
            Operation::OpenChannel => "open_channel",
            Operation::DeclareQueue => "declare_queue",
            Operation::Consume => "consume",
            Operation::Publish => "publish",
            Operation::Ack => "ack",
            Operation::Nack => "nack",
            Operation::CloseChannel => "close_channel",
            Operation::CloseConnection => "close_connection",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
struct Message {
    payload: Vec<u8>,
    redelivered: bool,
}

struct Consumer {
    channel_id: u64,
    sender: mpsc::UnboundedSender<Result<Delivery>>,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<Message>,
    unacked: BTreeMap<u64, Message>,
    acked: Vec<Vec<u8>>,
    consumer: Option<Consumer>,
}

impl QueueState {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            unacked: BTreeMap::new(),
            acked: Vec::new(),
            consumer: None,
        }
    }
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    journal: Vec<Operation>,
    faults: Vec<Operation>,
    next_tag: u64,
    next_channel: u64,
}

impl BrokerState {
    /// Journal `op` and fail it if a fault is pending for it.
    fn enter(&mut self, op: Operation) -> Result<()> {
        self.journal.push(op);
        if let Some(pos) = self.faults.iter().position(|f| *f == op) {
            self.faults.remove(pos);
            return Err(Error::Other(format!("injected {op} failure")));
        }
        Ok(())
    }

    fn queue_mut(&mut self, name: &str) -> Result<&mut QueueState> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| Error::Other(format!("NOT_FOUND - no queue '{name}'")))
    }

    /// Hand every ready message to the queue's consumer, if it has one.
    fn dispatch(&mut self, broker: &MemoryBroker, queue: &str) {
        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };
        let Some(consumer) = state.consumer.as_ref() else {
            return;
        };
        while let Some(message) = state.ready.pop_front() {
            self.next_tag += 1;
            let tag = self.next_tag;
            let delivery = Delivery::new(
                tag,
                message.redelivered,
                message.payload.clone(),
                Box::new(MemoryAcker {
                    broker: broker.clone(),
                    queue: queue.to_string(),
                    tag,
                }),
            );
            if consumer.sender.unbounded_send(Ok(delivery)).is_err() {
                // Receiver dropped without closing the channel.
                state.ready.push_front(message);
                state.consumer = None;
                return;
            }
            state.unacked.insert(tag, message);
        }
    }

    /// Detach consumers owned by `channel_id` and requeue their unacked
    /// deliveries at the head of the queue, in delivery order.
    fn release_channel(&mut self, channel_id: u64) {
        for state in self.queues.values_mut() {
            let owned = state
                .consumer
                .as_ref()
                .is_some_and(|c| c.channel_id == channel_id);
            if !owned {
                continue;
            }
            state.consumer = None;
            let unacked = std::mem::take(&mut state.unacked);
            for (_, mut message) in unacked.into_iter().rev() {
                message.redelivered = true;
                state.ready.push_front(message);
            }
        }
    }
}

/// Shared handle to an in-process broker. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next occurrence of `op` fail. Faults queue up: injecting
    /// the same operation twice fails its next two occurrences.
    pub fn fail_next(&self, op: Operation) {
        self.state().faults.push(op);
    }

    /// Every operation attempted so far, in order, including failed ones.
    pub fn journal(&self) -> Vec<Operation> {
        self.state().journal.clone()
    }

    /// Declare a queue outside any connection, as a producer would.
    pub fn declare(&self, spec: &QueueSpec) -> Result<()> {
        let mut state = self.state();
        declare_on(&mut state, spec)
    }

    /// Enqueue a message outside any connection.
    pub fn publish(&self, queue: &str, payload: impl Into<Vec<u8>>) -> Result<()> {
        let mut state = self.state();
        publish_on(&mut state, self, queue, payload.into())
    }

    /// Properties the queue was declared with.
    pub fn queue_spec(&self, queue: &str) -> Option<QueueSpec> {
        self.state().queues.get(queue).map(|q| q.spec.clone())
    }

    /// Messages waiting for a consumer.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages delivered but not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Payloads acknowledged so far, in acknowledgment order.
    pub fn acked(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.acked.clone())
            .unwrap_or_default()
    }

    pub fn has_consumer(&self, queue: &str) -> bool {
        self.state()
            .queues
            .get(queue)
            .is_some_and(|q| q.consumer.is_some())
    }

    fn settle(&self, op: Operation, queue: &str, tag: u64, requeue: bool) -> Result<()> {
        let mut state = self.state();
        state.enter(op)?;
        let q = state.queue_mut(queue)?;
        let message = q.unacked.remove(&tag).ok_or_else(|| {
            Error::Other(format!("PRECONDITION_FAILED - unknown delivery tag {tag}"))
        })?;
        match op {
            Operation::Ack => q.acked.push(message.payload),
            _ if requeue => {
                q.ready.push_front(Message {
                    redelivered: true,
                    ..message
                });
                state.dispatch(self, queue);
            }
            _ => {}
        }
        Ok(())
    }
}

fn declare_on(state: &mut BrokerState, spec: &QueueSpec) -> Result<()> {
    state.enter(Operation::DeclareQueue)?;
    match state.queues.get(&spec.name) {
        Some(existing) if !existing.spec.is_equivalent(spec) => Err(Error::Other(format!(
            "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
            spec.name
        ))),
        Some(_) => Ok(()),
        None => {
            state
                .queues
                .insert(spec.name.clone(), QueueState::new(spec.clone()));
            Ok(())
        }
    }
}

fn publish_on(
    state: &mut BrokerState,
    broker: &MemoryBroker,
    queue: &str,
    payload: Vec<u8>,
) -> Result<()> {
    state.enter(Operation::Publish)?;
    state.queue_mut(queue)?.ready.push_back(Message {
        payload,
        redelivered: false,
    });
    state.dispatch(broker, queue);
    Ok(())
}

#[async_trait]
impl Connector for MemoryBroker {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection> {
        self.state().enter(Operation::Connect)?;
        Ok(MemoryConnection {
            broker: self.clone(),
            channels: Mutex::new(Vec::new()),
        })
    }
}

/// A session on a [`MemoryBroker`].
pub struct MemoryConnection {
    broker: MemoryBroker,
    channels: Mutex<Vec<u64>>,
}

#[async_trait]
impl Connection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn open_channel(&self) -> Result<MemoryChannel> {
        let id = {
            let mut state = self.broker.state();
            state.enter(Operation::OpenChannel)?;
            state.next_channel += 1;
            state.next_channel
        };
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id);
        Ok(MemoryChannel {
            broker: self.broker.clone(),
            id,
        })
    }

    async fn close(&self) -> Result<()> {
        let channels = std::mem::take(
            &mut *self
                .channels
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let mut state = self.broker.state();
        state.enter(Operation::CloseConnection)?;
        for id in channels {
            state.release_channel(id);
        }
        Ok(())
    }
}

/// A channel on a [`MemoryConnection`].
pub struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()> {
        declare_on(&mut self.broker.state(), queue)
    }

    async fn consume(&self, queue: &str, _consumer: &ConsumerSpec) -> Result<DeliveryStream> {
        let mut state = self.broker.state();
        state.enter(Operation::Consume)?;
        let q = state.queue_mut(queue)?;
        if q.consumer.is_some() {
            return Err(Error::Other(format!(
                "ACCESS_REFUSED - queue '{queue}' already has a consumer"
            )));
        }
        let (sender, receiver) = mpsc::unbounded();
        q.consumer = Some(Consumer {
            channel_id: self.id,
            sender,
        });
        state.dispatch(&self.broker, queue);
        Ok(receiver.boxed())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<()> {
        publish_on(&mut self.broker.state(), &self.broker, queue, payload.to_vec())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.broker.state();
        state.enter(Operation::CloseChannel)?;
        state.release_channel(self.id);
        Ok(())
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    queue: String,
    tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.broker.settle(Operation::Ack, &self.queue, self.tag, false)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.broker.settle(Operation::Nack, &self.queue, self.tag, requeue)
    }
}
