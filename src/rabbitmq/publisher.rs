// src/rabbitmq/publisher.rs
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info_span, Instrument, Span};
use uuid::Uuid;

use super::amqp_client::AmqpConnector;
use super::connection::ConnectionManager;
use super::errors::{MqError, Result};
use super::transport::{Connector, OutboundMessage, PublishOptions};
use crate::config::BrokerConfig;

const CONTENT_TYPE_JSON: &str = "application/json";

/// Publishes JSON messages to the configured exchange and routing key.
///
/// The connection is made once, at construction. There is no reconnect: after
/// a transport failure the producer has to be rebuilt.
pub struct Producer {
    manager: ConnectionManager,
}

impl Producer {
    /// Connect to a real broker and declare the configured route.
    pub async fn connect(config: BrokerConfig) -> Result<Self> {
        Self::with_connector(config, Arc::new(AmqpConnector::new())).await
    }

    pub async fn with_connector(config: BrokerConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let span = info_span!("producer", exchange = %config.exchange, routing_key = %config.routing_key);
        Self::with_span(config, connector, span).await
    }

    pub async fn with_span(
        config: BrokerConfig,
        connector: Arc<dyn Connector>,
        span: Span,
    ) -> Result<Self> {
        let mut manager = ConnectionManager::new(Arc::new(config), connector).with_span(span);
        manager.init().await?;
        Ok(Self { manager })
    }

    /// Serialize `message` as JSON and publish it as a persistent, mandatory
    /// message. Errors are returned as-is; nothing is retried.
    pub async fn publish<T: Serialize + ?Sized>(&self, message: &T) -> Result<()> {
        let body = serde_json::to_vec(message)?;
        let session = self.manager.session().ok_or(MqError::NotConnected)?;
        let config = self.manager.config();

        let message = OutboundMessage {
            body,
            content_type: CONTENT_TYPE_JSON.to_string(),
            persistent: true,
            message_id: Some(Uuid::new_v4().to_string()),
            timestamp: Some(chrono::Utc::now().timestamp() as u64),
        };
        let message_id = message.message_id.clone();

        session
            .publish(
                &config.exchange,
                &config.routing_key,
                PublishOptions { mandatory: true },
                message,
            )
            .instrument(self.manager.span().clone())
            .await?;

        debug!(
            parent: self.manager.span(),
            message_id = message_id.as_deref().unwrap_or_default(),
            "Published message to exchange '{}' with routing key '{}'",
            config.exchange,
            config.routing_key
        );
        Ok(())
    }

    /// Close the connection.
    pub async fn destroy(mut self) {
        self.manager.stop().await;
    }
}
