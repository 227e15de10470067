// src/rabbitmq/consumer.rs
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use super::amqp_client::AmqpConnector;
use super::connection::ConnectionManager;
use super::errors::{MqError, Result};
use super::signal::CloseSignal;
use super::transport::{Connector, DeliveryStream, Outcome};
use crate::config::BrokerConfig;

/// Fixed pause between reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum WorkerError {
    /// The message can never be processed; the broker should drop it.
    #[error("unprocessed message")]
    ShouldDrop,

    /// Processing failed but may succeed later; the message is requeued.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl WorkerError {
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        WorkerError::Failed(anyhow::anyhow!("{}", reason))
    }
}

impl Outcome {
    /// Ok acks, `ShouldDrop` rejects for good, anything else requeues.
    /// `ShouldDrop` is also honoured when it sits anywhere in an error chain.
    pub fn from_result(result: &std::result::Result<(), WorkerError>) -> Self {
        match result {
            Ok(()) => Outcome::Ack,
            Err(WorkerError::ShouldDrop) => Outcome::Reject,
            Err(WorkerError::Failed(err)) if should_drop(err) => Outcome::Reject,
            Err(WorkerError::Failed(_)) => Outcome::Requeue,
        }
    }
}

fn should_drop(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<WorkerError>(),
            Some(WorkerError::ShouldDrop)
        )
    })
}

/// What the worker knows about the delivery it is handling.
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
}

/// Processes message bodies for a [`Consumer`].
///
/// A message may arrive more than once: if the process dies after `consume`
/// succeeds but before the ack reaches the broker, it is redelivered.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    async fn consume(&self, ctx: &DeliveryContext, body: &[u8]) -> std::result::Result<(), WorkerError>;
}

/// Close signals and delivery task of one connection epoch.
struct Epoch {
    connection: CloseSignal,
    session: CloseSignal,
    _deliveries: JoinHandle<()>,
}

impl Epoch {
    /// Both signals must complete before the epoch's resources are released.
    async fn drain(&mut self) {
        self.connection.drain().await;
        self.session.drain().await;
    }
}

/// The part of the consumer that owns the connection. After the first run it
/// lives inside the supervisor task, which is then the only writer of the
/// connection/session pair.
struct Runner {
    manager: ConnectionManager,
    worker: Arc<dyn Worker>,
    quit: watch::Receiver<bool>,
    reconnect_delay: Duration,
}

impl Runner {
    fn quit_requested(&self) -> bool {
        *self.quit.borrow()
    }

    async fn run(&mut self) -> Result<Epoch> {
        self.manager.init().await?;

        let deliveries = match self.manager.consume().await {
            Ok(deliveries) => deliveries,
            Err(err) => {
                self.manager.stop().await;
                return Err(err);
            }
        };

        let (connection, session) = match self.manager.notify_close() {
            Ok(signals) => signals,
            Err(err) => {
                self.manager.stop().await;
                return Err(err);
            }
        };

        let consumer_tag = self.manager.config().consumer_tag.clone();
        let task = tokio::spawn(
            handle(self.worker.clone(), deliveries, consumer_tag)
                .instrument(self.manager.span().clone()),
        );

        Ok(Epoch {
            connection,
            session,
            _deliveries: task,
        })
    }

    async fn supervise(mut self, mut epoch: Epoch) {
        'supervise: loop {
            tokio::select! {
                biased;
                _ = wait_for_quit(&mut self.quit) => break 'supervise,
                fault = epoch.connection.recv() => {
                    if let Some(fault) = fault {
                        warn!(error = %fault, "rabbitmq consumer - connection NotifyClose");
                    }
                }
                fault = epoch.session.recv() => {
                    if let Some(fault) = fault {
                        warn!(error = %fault, "rabbitmq consumer - channel NotifyClose");
                    }
                }
            }

            // backstop
            self.manager.stop().await;
            epoch.drain().await;

            loop {
                if self.quit_requested() {
                    return;
                }

                info!("rabbitmq consumer - reconnect");
                let mut quit = self.quit.clone();
                let attempt = tokio::select! {
                    biased;
                    _ = wait_for_quit(&mut quit) => None,
                    attempt = self.run() => Some(attempt),
                };
                let Some(attempt) = attempt else {
                    // the abandoned attempt may have left a half-built pair
                    self.manager.stop().await;
                    return;
                };

                match attempt {
                    Ok(next) => {
                        epoch = next;
                        break;
                    }
                    Err(err) => {
                        warn!(error = %err, delay = ?self.reconnect_delay, "rabbitmq consumer - reconnect failed");
                        tokio::select! {
                            biased;
                            _ = wait_for_quit(&mut self.quit) => return,
                            _ = tokio::time::sleep(self.reconnect_delay) => {}
                        }
                    }
                }
            }
        }

        self.manager.stop().await;
        epoch.drain().await;
        debug!("rabbitmq consumer - supervisor stopped");
    }
}

async fn wait_for_quit(quit: &mut watch::Receiver<bool>) {
    // a dropped sender means the consumer itself is gone
    let _ = quit.wait_for(|quit| *quit).await;
}

/// Settle every delivery of one subscription until its feed closes.
async fn handle(worker: Arc<dyn Worker>, mut deliveries: DeliveryStream, consumer_tag: String) {
    while let Some(delivery) = deliveries.next().await {
        let ctx = DeliveryContext {
            consumer_tag: consumer_tag.clone(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
        };

        let result = worker.consume(&ctx, &delivery.data).await;
        if let Err(err) = &result {
            debug!(delivery_tag = ctx.delivery_tag, error = %err, "Worker did not process message");
        }

        let outcome = Outcome::from_result(&result);
        if let Err(err) = delivery.resolve(outcome).await {
            warn!(delivery_tag = ctx.delivery_tag, ?outcome, error = %err, "Failed to settle delivery");
        }
    }
    debug!("Delivery feed closed");
}

/// Subscribes to the configured queue and keeps the subscription alive across
/// broker and network faults.
pub struct Consumer {
    runner: Mutex<Option<Runner>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    quit: watch::Sender<bool>,
    span: Span,
}

impl Consumer {
    /// A consumer for a real broker.
    pub fn new(config: BrokerConfig, worker: impl Worker) -> Self {
        Self::with_connector(config, worker, Arc::new(AmqpConnector::new()))
    }

    pub fn with_connector(
        mut config: BrokerConfig,
        worker: impl Worker,
        connector: Arc<dyn Connector>,
    ) -> Self {
        if config.consumer_tag.is_empty() {
            config.consumer_tag = format!("consumer-{}", &Uuid::new_v4().simple().to_string()[..8]);
        }

        let span = info_span!("consumer", queue = %config.queue, consumer_tag = %config.consumer_tag);
        let manager = ConnectionManager::new(Arc::new(config), connector).with_span(span.clone());
        let (quit, quit_rx) = watch::channel(false);

        Self {
            runner: Mutex::new(Some(Runner {
                manager,
                worker: Arc::new(worker),
                quit: quit_rx,
                reconnect_delay: RECONNECT_DELAY,
            })),
            supervisor: Mutex::new(None),
            quit,
            span,
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        if let Some(runner) = self.runner.get_mut().unwrap_or_else(PoisonError::into_inner).as_mut() {
            runner.reconnect_delay = delay;
        }
        self
    }

    /// Log inside `span` instead of the default consumer span.
    pub fn with_span(mut self, span: Span) -> Self {
        if let Some(runner) = self.runner.get_mut().unwrap_or_else(PoisonError::into_inner).as_mut() {
            runner.manager.set_span(span.clone());
        }
        self.span = span;
        self
    }

    /// Connect, subscribe and hand the connection to the supervisor task.
    ///
    /// Returns as soon as the first subscription is up. A failure here is not
    /// retried: a broker that is unreachable at startup is reported to the
    /// caller.
    pub async fn launch(&self) -> Result<()> {
        let mut runner = self
            .runner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(MqError::AlreadyStarted)?;

        let epoch = match runner.run().await {
            Ok(epoch) => epoch,
            Err(err) => {
                *self.runner.lock().unwrap_or_else(PoisonError::into_inner) = Some(runner);
                return Err(err);
            }
        };
        let handle = tokio::spawn(runner.supervise(epoch).instrument(self.span.clone()));
        *self.supervisor.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Launch and then wait forever. Only returns if the first connect fails.
    pub async fn start(&self) -> Result<()> {
        if let Err(err) = self.launch().await {
            error!(parent: &self.span, error = %err, "failed to run consumer");
            return Err(err);
        }

        info!(parent: &self.span, " [*] Waiting for messages. To exit press CTRL+C");
        futures::future::pending::<()>().await;
        Ok(())
    }

    /// Ask the supervisor to quit and wait until it has torn the connection
    /// down. Later calls do nothing.
    ///
    /// A reconnect attempt in flight is abandoned as soon as quit is seen, so
    /// a broker that never answers cannot hold this up. Closing a live
    /// connection still waits for the broker's close-ok.
    pub async fn stop(&self) {
        self.quit.send_replace(true);

        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(parent: &self.span, error = %err, "rabbitmq consumer - supervisor task failed");
            }
        }
    }
}
