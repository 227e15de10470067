use std::sync::Arc;
use std::time::Duration;

use resilient_rabbitmq::rabbitmq::{BrokerOp, OpKind, Outcome};
use resilient_rabbitmq::{Consumer, MemoryBroker, MqError, Producer};
use serde::Serialize;
use tokio::time::timeout;

use crate::common::{config, ops, ScriptedWorker};

#[derive(Serialize)]
struct JobCreated<'a> {
    id: u32,
    kind: &'a str,
}

#[tokio::test]
async fn published_json_reaches_the_consumer() {
    let broker = MemoryBroker::new();
    let worker = ScriptedWorker::default();
    let consumer = Consumer::with_connector(config(), worker.clone(), Arc::new(broker.clone()));
    consumer.launch().await.unwrap();

    let producer = Producer::with_connector(config(), Arc::new(broker.clone()))
        .await
        .unwrap();
    producer
        .publish(&JobCreated {
            id: 7,
            kind: "resize",
        })
        .await
        .unwrap();

    let settlements = timeout(Duration::from_secs(5), broker.wait_for_settlements(1))
        .await
        .unwrap();
    assert_eq!(settlements[0].outcome, Outcome::Ack);
    assert_eq!(
        worker.calls()[0].0,
        r#"{"id":7,"kind":"resize"}"#.to_string()
    );

    producer.destroy().await;
    consumer.stop().await;
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn every_publish_gets_its_own_message_id() {
    let broker = MemoryBroker::new();
    let producer = Producer::with_connector(config(), Arc::new(broker.clone()))
        .await
        .unwrap();

    producer.publish(&serde_json::json!({"n": 1})).await.unwrap();
    producer.publish(&serde_json::json!({"n": 2})).await.unwrap();

    let ids: Vec<String> = ops(&broker, OpKind::Publish)
        .into_iter()
        .filter_map(|op| match op {
            BrokerOp::Publish { message, .. } => message.message_id,
            _ => None,
        })
        .collect();
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);

    producer.destroy().await;
}

#[tokio::test]
async fn producer_declares_the_same_route_as_the_consumer() {
    let broker = MemoryBroker::new();
    let consumer = Consumer::with_connector(
        config(),
        ScriptedWorker::default(),
        Arc::new(broker.clone()),
    );
    consumer.launch().await.unwrap();
    let producer = Producer::with_connector(config(), Arc::new(broker.clone()))
        .await
        .unwrap();

    for kind in [OpKind::ExchangeDeclare, OpKind::QueueDeclare, OpKind::QueueBind] {
        let issued = ops(&broker, kind);
        assert_eq!(issued.len(), 2);
        assert_eq!(issued[0], issued[1]);
    }

    producer.destroy().await;
    consumer.stop().await;
}

#[tokio::test]
async fn unreachable_broker_fails_construction() {
    let broker = MemoryBroker::new();
    broker.fail_next(OpKind::Connect, 1);

    let result = Producer::with_connector(config(), Arc::new(broker.clone())).await;

    assert!(matches!(result, Err(MqError::ConnectionError(_))));
    assert_eq!(broker.count(OpKind::Connect), 1);
}
