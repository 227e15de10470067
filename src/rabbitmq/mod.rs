// src/rabbitmq/mod.rs
// Resilient consumer and producer over an AMQP broker

// Errors shared by every broker operation
pub mod errors;
pub mod connection;
pub mod consumer;
pub mod publisher;

// Transport seam and its two implementations
pub mod transport;
pub mod signal;
pub mod amqp_client;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::AmqpConnector;
pub use connection::{ConnectionManager, LinkState};
pub use consumer::{Consumer, DeliveryContext, Worker, WorkerError, RECONNECT_DELAY};
pub use errors::{MqError, Result};
#[cfg(any(test, feature = "test-util"))]
pub use memory::{BrokerOp, MemoryBroker, OpKind, Settlement};
pub use publisher::Producer;
pub use transport::Outcome;
