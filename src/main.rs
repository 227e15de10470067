use std::env;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use lapin::ConnectionProperties;
use resilient_rabbitmq::logging::init_logging;
use resilient_rabbitmq::rabbitmq::AmqpConnector;
use resilient_rabbitmq::{BrokerConfig, Consumer, DeliveryContext, Producer, Worker, WorkerError};
use tracing::info;

const CONNECTION_NAME: &str = "resilient-rabbitmq";

const USAGE: &str = "usage: resilient-rabbitmq consume | publish '<json>'";

/// Logs every message and acknowledges it.
struct LogWorker;

#[async_trait]
impl Worker for LogWorker {
    async fn consume(&self, ctx: &DeliveryContext, body: &[u8]) -> Result<(), WorkerError> {
        let text = String::from_utf8_lossy(body);
        info!(
            delivery_tag = ctx.delivery_tag,
            redelivered = ctx.redelivered,
            "Received: {}",
            text
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_logging(env::var("MQ_DEBUG").is_ok());

    let config = BrokerConfig::from_env().context("loading broker configuration")?;
    let connector = Arc::new(AmqpConnector::with_properties(
        ConnectionProperties::default().with_connection_name(CONNECTION_NAME.into()),
    ));
    let mut args = env::args().skip(1);

    match args.next().as_deref() {
        Some("consume") => consume(config, connector).await,
        Some("publish") => {
            let Some(payload) = args.next() else {
                bail!(USAGE);
            };
            publish(config, connector, &payload).await
        }
        _ => bail!(USAGE),
    }
}

async fn consume(config: BrokerConfig, connector: Arc<AmqpConnector>) -> anyhow::Result<()> {
    let consumer = Consumer::with_connector(config, LogWorker, connector);

    tokio::select! {
        result = consumer.start() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            consumer.stop().await;
        }
    }
    Ok(())
}

async fn publish(
    config: BrokerConfig,
    connector: Arc<AmqpConnector>,
    payload: &str,
) -> anyhow::Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(payload).context("payload is not valid JSON")?;

    let producer = Producer::with_connector(config, connector).await?;
    let result = producer.publish(&value).await;
    producer.destroy().await;
    result?;

    info!("Message published");
    Ok(())
}
