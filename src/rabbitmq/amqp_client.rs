// src/rabbitmq/amqp_client.rs
//! lapin-backed implementation of the transport traits.

use async_trait::async_trait;
use futures::{future, StreamExt};
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use serde_json::Value;
use tracing::{debug, warn};

use super::errors::{MqError, Result};
use super::signal::{CloseFault, CloseSignal, SignalSlot};
use super::transport::{
    BrokerConnection, ConsumeOptions, Connector, Delivery, DeliveryStream, ExchangeOptions,
    Acknowledger, OutboundMessage, PublishOptions, Qos, QueueOptions, Session,
};
use crate::config::{Arguments, ExchangeKind};

/// AMQP delivery mode for messages the broker writes to disk.
const PERSISTENT: u8 = 2;

/// Connects to a real broker over AMQP 0-9-1.
#[derive(Clone, Default)]
pub struct AmqpConnector {
    properties: ConnectionProperties,
}

impl AmqpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `properties` for every connection, e.g. to set a connection name
    /// that shows up in the management UI.
    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, addr: &str) -> Result<Box<dyn BrokerConnection>> {
        let connection = Connection::connect(addr, self.properties.clone())
            .await
            .map_err(|e| MqError::ConnectionError(format!("Failed to connect: {}", e)))?;

        debug!("Connected to RabbitMQ");
        Ok(Box::new(AmqpConnection::new(connection)))
    }
}

struct AmqpConnection {
    inner: Connection,
    closed: SignalSlot,
}

impl AmqpConnection {
    fn new(inner: Connection) -> Self {
        let closed = SignalSlot::new();
        let slot = closed.clone();
        inner.on_error(move |err| {
            slot.fire(Some(CloseFault::new(err.to_string())));
        });
        Self { inner, closed }
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_session(&self) -> Result<Box<dyn Session>> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| MqError::ChannelError(format!("Failed to create channel: {}", e)))?;

        let session = AmqpSession::new(channel);
        self.closed.chain(session.closed.clone());
        Ok(Box::new(session))
    }

    fn notify_close(&self) -> CloseSignal {
        self.closed.subscribe()
    }

    fn is_closed(&self) -> bool {
        !self.inner.status().connected()
    }

    async fn close(&self) -> Result<()> {
        let result = self.inner.close(200, "Closing connection").await;
        self.closed.fire(None);
        result.map_err(|e| MqError::ConnectionError(format!("Failed to close connection: {}", e)))
    }
}

impl Drop for AmqpConnection {
    fn drop(&mut self) {
        self.closed.fire(None);
    }
}

struct AmqpSession {
    channel: Channel,
    closed: SignalSlot,
}

impl AmqpSession {
    fn new(channel: Channel) -> Self {
        let closed = SignalSlot::new();
        let slot = closed.clone();
        channel.on_error(move |err| {
            slot.fire(Some(CloseFault::new(err.to_string())));
        });
        Self { channel, closed }
    }
}

#[async_trait]
impl Session for AmqpSession {
    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
        args: &Arguments,
    ) -> Result<()> {
        self.channel
            .exchange_declare(
                exchange,
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    ..ExchangeDeclareOptions::default()
                },
                field_table(args),
            )
            .await
            .map_err(|e| MqError::topology("exchange_declare", e))
    }

    async fn queue_declare(&self, queue: &str, options: QueueOptions, args: &Arguments) -> Result<()> {
        let declared = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    exclusive: options.exclusive,
                    ..QueueDeclareOptions::default()
                },
                field_table(args),
            )
            .await
            .map_err(|e| MqError::topology("queue_declare", e))?;

        debug!(queue, messages = declared.message_count(), "Queue declared");
        Ok(())
    }

    async fn qos(&self, qos: Qos) -> Result<()> {
        if qos.prefetch_size != 0 {
            warn!(
                prefetch_size = qos.prefetch_size,
                "Prefetch size is not supported by the client library, ignoring it"
            );
        }
        self.channel
            .basic_qos(qos.prefetch_count, BasicQosOptions { global: qos.global })
            .await
            .map_err(|e| MqError::topology("basic_qos", e))
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        args: &Arguments,
    ) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                field_table(args),
            )
            .await
            .map_err(|e| MqError::topology("queue_bind", e))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: options.auto_ack,
                    exclusive: options.exclusive,
                    no_local: options.no_local,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MqError::ConsumeError(e.to_string()))?;

        let stream = consumer
            .take_while(|delivery| {
                if let Err(e) = delivery {
                    warn!(error = %e, "Delivery stream failed");
                }
                future::ready(delivery.is_ok())
            })
            .filter_map(|delivery| future::ready(delivery.ok()))
            .map(|delivery| {
                let lapin::message::Delivery {
                    delivery_tag,
                    redelivered,
                    data,
                    acker,
                    ..
                } = delivery;
                Delivery::new(delivery_tag, redelivered, data, Box::new(AmqpAcker(acker)))
            });

        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| MqError::ChannelError(format!("Failed to cancel consumer: {}", e)))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
        message: OutboundMessage,
    ) -> Result<()> {
        let mut properties =
            BasicProperties::default().with_content_type(message.content_type.into());
        if message.persistent {
            properties = properties.with_delivery_mode(PERSISTENT);
        }
        if let Some(id) = message.message_id {
            properties = properties.with_message_id(id.into());
        }
        if let Some(timestamp) = message.timestamp {
            properties = properties.with_timestamp(timestamp);
        }

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: options.mandatory,
                    ..BasicPublishOptions::default()
                },
                &message.body,
                properties,
            )
            .await
            .map_err(|e| MqError::PublishError(e.to_string()))?
            .await
            .map_err(|e| MqError::PublishError(e.to_string()))?;

        Ok(())
    }

    fn notify_close(&self) -> CloseSignal {
        self.closed.subscribe()
    }
}

impl Drop for AmqpSession {
    fn drop(&mut self) {
        self.closed.fire(None);
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| MqError::AckError(e.to_string()))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| MqError::AckError(e.to_string()))
    }
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

fn field_table(args: &Arguments) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in args {
        table.insert(key.clone().into(), amqp_value(value));
    }
    table
}

fn amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => AMQPValue::LongLongInt(i),
            None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => AMQPValue::LongString(s.clone().into()),
        other => AMQPValue::LongString(other.to_string().into()),
    }
}
