//! A self-healing message-queue client.
//!
//! [`Consumer`] keeps a subscription alive across broker restarts and network
//! faults, replaying the exchange, queue and binding declarations on every
//! reconnect. [`Producer`] publishes JSON over a single eagerly opened
//! connection.

pub mod config;
pub mod env;
pub mod logging;
pub mod rabbitmq;

pub use config::{Arguments, BrokerConfig, ExchangeKind};
pub use rabbitmq::{Consumer, DeliveryContext, MqError, Producer, Result, Worker, WorkerError};

#[cfg(any(test, feature = "test-util"))]
pub use rabbitmq::MemoryBroker;
