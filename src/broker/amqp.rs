//! AMQP 0-9-1 broker access via lapin.
//!
//! Runs lapin on the ambient tokio runtime instead of its default
//! executor, so all broker I/O shares the worker's scheduler.

use super::{
    Acknowledger, Channel, Connection, ConsumerSpec, Connector, Delivery, DeliveryStream,
    QueueSpec,
};
use crate::config::secrets::{ExposeSecret, SecretString, redact_url};
use crate::error::Result;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, ConnectionProperties};
use tracing::debug;

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// Persistent delivery mode, so messages on durable queues survive restart.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Connects to a RabbitMQ broker at a fixed URL.
pub struct AmqpConnector {
    url: SecretString,
    connection_name: String,
}

impl AmqpConnector {
    pub fn new(url: SecretString) -> Self {
        Self {
            url,
            connection_name: "weather-worker".to_string(),
        }
    }

    /// Name shown for this connection in the broker's management UI.
    pub fn connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = name.into();
        self
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    type Connection = AmqpConnection;

    async fn connect(&self) -> Result<AmqpConnection> {
        debug!(url = %redact_url(&self.url), "connecting to broker");
        let properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio)
            .with_connection_name(self.connection_name.clone().into());
        let inner = lapin::Connection::connect(self.url.expose_secret(), properties).await?;
        Ok(AmqpConnection { inner })
    }
}

/// An open lapin connection.
pub struct AmqpConnection {
    inner: lapin::Connection,
}

#[async_trait]
impl Connection for AmqpConnection {
    type Channel = AmqpChannel;

    async fn open_channel(&self) -> Result<AmqpChannel> {
        let inner = self.inner.create_channel().await?;
        debug!(channel_id = inner.id(), "channel opened");
        Ok(AmqpChannel { inner })
    }

    async fn close(&self) -> Result<()> {
        if !self.inner.status().connected() {
            return Ok(());
        }
        self.inner.close(REPLY_SUCCESS, "worker shutdown").await?;
        Ok(())
    }
}

/// An open lapin channel.
pub struct AmqpChannel {
    inner: lapin::Channel,
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()> {
        let options = QueueDeclareOptions {
            passive: false,
            durable: queue.durable,
            exclusive: queue.exclusive,
            auto_delete: queue.auto_delete,
            nowait: false,
        };
        let declared = self
            .inner
            .queue_declare(&queue.name, options, FieldTable::default())
            .await?;
        debug!(
            queue = %queue.name,
            messages = declared.message_count(),
            consumers = declared.consumer_count(),
            "queue declared"
        );
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer: &ConsumerSpec) -> Result<DeliveryStream> {
        let options = BasicConsumeOptions {
            no_local: false,
            no_ack: false,
            exclusive: consumer.exclusive,
            nowait: false,
        };
        let inner = self
            .inner
            .basic_consume(queue, &consumer.tag, options, FieldTable::default())
            .await?;
        debug!(queue, consumer_tag = inner.tag().as_str(), "consumer registered");

        let stream = inner.map(|next| -> Result<Delivery> {
            let delivery = next?;
            Ok(Delivery::new(
                delivery.delivery_tag,
                delivery.redelivered,
                delivery.data,
                Box::new(AmqpAcker {
                    inner: delivery.acker,
                }),
            ))
        });
        Ok(stream.boxed())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<()> {
        let properties = BasicProperties::default()
            .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
            .with_message_id(uuid::Uuid::new_v4().to_string().into());
        self.inner
            .basic_publish("", queue, BasicPublishOptions::default(), payload, properties)
            .await?
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.inner.status().connected() {
            return Ok(());
        }
        self.inner.close(REPLY_SUCCESS, "worker shutdown").await?;
        Ok(())
    }
}

/// Acknowledgment handle for one lapin delivery.
struct AmqpAcker {
    inner: lapin::acker::Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.inner.ack(BasicAckOptions { multiple: false }).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.inner
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await?;
        Ok(())
    }
}
