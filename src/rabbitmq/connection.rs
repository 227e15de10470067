// src/rabbitmq/connection.rs
use std::sync::Arc;

use tracing::{debug, info, info_span, warn, Instrument, Span};

use super::errors::{MqError, Result};
use super::signal::CloseSignal;
use super::transport::{
    BrokerConnection, ConsumeOptions, Connector, DeliveryStream, ExchangeOptions, Qos,
    QueueOptions, Session,
};
use crate::config::BrokerConfig;

/// Lifecycle of the connection/session pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Absent,
    Connecting,
    Ready,
    Closing,
}

struct Link {
    connection: Box<dyn BrokerConnection>,
    session: Option<Box<dyn Session>>,
    subscription: Option<String>,
}

/// Owns one connection and one session, declares the configured route on
/// them, and tears both down together.
///
/// `init` and `stop` take `&mut self`, so they can never overlap on the same
/// manager.
pub struct ConnectionManager {
    config: Arc<BrokerConfig>,
    connector: Arc<dyn Connector>,
    link: Option<Link>,
    state: LinkState,
    span: Span,
}

impl ConnectionManager {
    pub fn new(config: Arc<BrokerConfig>, connector: Arc<dyn Connector>) -> Self {
        let span = info_span!("rabbitmq", exchange = %config.exchange, queue = %config.queue);
        Self {
            config,
            connector,
            link: None,
            state: LinkState::Absent,
            span,
        }
    }

    /// Log inside `span` instead of the default one.
    pub fn with_span(mut self, span: Span) -> Self {
        self.set_span(span);
        self
    }

    pub fn set_span(&mut self, span: Span) {
        self.span = span;
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn session(&self) -> Option<&dyn Session> {
        self.link.as_ref()?.session.as_deref()
    }

    /// Connect, open a session and declare exchange, queue, QoS and binding.
    ///
    /// A pair that is still around is torn down first. If any step fails,
    /// whatever was built is torn down before the error is returned.
    pub async fn init(&mut self) -> Result<()> {
        let span = self.span.clone();
        self.init_link().instrument(span).await
    }

    async fn init_link(&mut self) -> Result<()> {
        if self.link.is_some() {
            self.stop_link().await;
        }

        self.state = LinkState::Connecting;
        info!(addr = %redact(&self.config.addr), "Connecting to RabbitMQ");

        let connection = match self.connector.connect(&self.config.addr).await {
            Ok(connection) => connection,
            Err(err) => {
                self.state = LinkState::Absent;
                return Err(err);
            }
        };
        self.link = Some(Link {
            connection,
            session: None,
            subscription: None,
        });

        if let Err(err) = self.open_and_declare().await {
            self.stop_link().await;
            return Err(err);
        }

        self.state = LinkState::Ready;
        debug!("Topology declared");
        Ok(())
    }

    async fn open_and_declare(&mut self) -> Result<()> {
        let link = self.link.as_mut().ok_or(MqError::NotConnected)?;
        let session = link.connection.open_session().await?;
        let session = &**link.session.insert(session);
        declare_topology(session, &self.config).await
    }

    /// Open a manual-acknowledgement subscription on the configured queue.
    pub async fn consume(&mut self) -> Result<DeliveryStream> {
        let link = self.link.as_mut().ok_or(MqError::NotConnected)?;
        let session = link.session.as_deref().ok_or(MqError::NotConnected)?;

        let deliveries = session
            .consume(
                &self.config.queue,
                &self.config.consumer_tag,
                ConsumeOptions {
                    auto_ack: false,
                    exclusive: false,
                    no_local: false,
                },
            )
            .instrument(self.span.clone())
            .await?;

        link.subscription = Some(self.config.consumer_tag.clone());
        Ok(deliveries)
    }

    /// Fresh close signals for the current connection and session.
    pub fn notify_close(&self) -> Result<(CloseSignal, CloseSignal)> {
        let link = self.link.as_ref().ok_or(MqError::NotConnected)?;
        let session = link.session.as_deref().ok_or(MqError::NotConnected)?;
        Ok((link.connection.notify_close(), session.notify_close()))
    }

    /// Best-effort teardown. Does nothing when there is no connection.
    pub async fn stop(&mut self) {
        let span = self.span.clone();
        self.stop_link().instrument(span).await
    }

    async fn stop_link(&mut self) {
        let Some(link) = self.link.take() else {
            // an init that was dropped before connecting leaves only the state behind
            self.state = LinkState::Absent;
            return;
        };
        self.state = LinkState::Closing;

        if !link.connection.is_closed() {
            if let (Some(session), Some(tag)) = (link.session.as_deref(), link.subscription.as_deref()) {
                if let Err(err) = session.cancel(tag).await {
                    warn!(error = %err, "rabbitmq - channel cancel failed");
                }
            }

            if let Err(err) = link.connection.close().await {
                warn!(error = %err, "rabbitmq - connection close failed");
            }
        }

        drop(link);
        self.state = LinkState::Absent;
    }
}

async fn declare_topology(session: &dyn Session, config: &BrokerConfig) -> Result<()> {
    session
        .exchange_declare(
            &config.exchange,
            config.exchange_type,
            ExchangeOptions {
                durable: true,
                auto_delete: false,
            },
            &config.exchange_args,
        )
        .await?;

    session
        .queue_declare(
            &config.queue,
            QueueOptions {
                durable: true,
                auto_delete: false,
                exclusive: false,
            },
            &config.queue_args,
        )
        .await?;

    session
        .qos(Qos {
            prefetch_count: config.prefetch_count,
            prefetch_size: config.prefetch_size,
            global: true,
        })
        .await?;

    session
        .queue_bind(
            &config.queue,
            &config.exchange,
            &config.routing_key,
            &config.queue_bind_args,
        )
        .await
}

/// Strip credentials from an AMQP URI before it is logged.
fn redact(addr: &str) -> String {
    match (addr.find("://"), addr.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}://***@{}", &addr[..scheme], &addr[at + 1..])
        }
        _ => addr.to_string(),
    }
}
