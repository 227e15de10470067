// src/rabbitmq/errors.rs

use serde_json::Error as SerdeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MqError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    /// The broker rejected a declare, QoS or bind call.
    #[error("RabbitMQ topology error during {step}: {reason}")]
    TopologyError { step: &'static str, reason: String },

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("No live connection to RabbitMQ")]
    NotConnected,

    #[error("Consumer has already been started")]
    AlreadyStarted,

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, MqError>;

impl MqError {
    pub(crate) fn topology(step: &'static str, reason: impl ToString) -> Self {
        MqError::TopologyError {
            step,
            reason: reason.to_string(),
        }
    }
}

impl From<std::num::ParseIntError> for MqError {
    fn from(err: std::num::ParseIntError) -> Self {
        MqError::ConfigError(format!("Parse error: {}", err))
    }
}
