// src/rabbitmq/transport.rs
//! The broker operations the connection manager, consumer and producer need,
//! expressed as traits so that lapin and the in-memory broker are
//! interchangeable.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::errors::Result;
use super::signal::CloseSignal;
use crate::config::{Arguments, ExchangeKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

/// Prefetch limits. `global` applies them to the whole session rather than
/// to each consumer on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Qos {
    pub prefetch_count: u16,
    pub prefetch_size: u32,
    pub global: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumeOptions {
    pub auto_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishOptions {
    pub mandatory: bool,
}

/// A message on its way to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub content_type: String,
    pub persistent: bool,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
}

/// How a delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    /// Reject without requeue; the broker discards (or dead-letters) it.
    Reject,
    /// Reject with requeue; the broker redelivers it later.
    Requeue,
}

#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// One message received from a subscription.
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub data: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        redelivered: bool,
        data: Vec<u8>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            redelivered,
            data,
            acker,
        }
    }

    /// Settle the delivery. Takes `self` so it can only happen once.
    pub async fn resolve(self, outcome: Outcome) -> Result<()> {
        match outcome {
            Outcome::Ack => self.acker.ack().await,
            Outcome::Reject => self.acker.reject(false).await,
            Outcome::Requeue => self.acker.reject(true).await,
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Deliveries of one subscription. Ends when the subscription's session closes.
pub type DeliveryStream = BoxStream<'static, Delivery>;

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, addr: &str) -> Result<Box<dyn BrokerConnection>>;
}

/// A transport connection. Dropping the handle closes every close signal
/// registered on it or on its sessions.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn Session>>;

    fn notify_close(&self) -> CloseSignal;

    fn is_closed(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait Session: Send + Sync {
    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
        args: &Arguments,
    ) -> Result<()>;

    async fn queue_declare(&self, queue: &str, options: QueueOptions, args: &Arguments) -> Result<()>;

    async fn qos(&self, qos: Qos) -> Result<()>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        args: &Arguments,
    ) -> Result<()>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
        message: OutboundMessage,
    ) -> Result<()>;

    fn notify_close(&self) -> CloseSignal;
}
