// Tests against a live broker. Run them with `--ignored` once a RabbitMQ
// instance matching tests/fixtures/rabbitmq/configs/test_config.json is up.

use std::path::Path;
use std::time::Duration;

use resilient_rabbitmq::config::load_config_from;
use resilient_rabbitmq::{BrokerConfig, Consumer, Producer};
use tokio::time::{sleep, timeout};

use crate::common::ScriptedWorker;

fn load_test_config() -> BrokerConfig {
    let config_path = Path::new("tests/fixtures/rabbitmq/configs/test_config.json");
    load_config_from(config_path).expect("Failed to load test config")
}

#[test]
fn test_config_fixture_is_valid() {
    let config = load_test_config();
    assert_eq!(config.queue, "resilient_test_queue");
    assert_eq!(config.prefetch_count, 10);
}

#[tokio::test]
#[ignore] // Ignore by default as it requires a running RabbitMQ instance
async fn test_publish_and_consume_round_trip() {
    let config = load_test_config();
    let worker = ScriptedWorker::default();

    let consumer = Consumer::new(config.clone(), worker.clone());
    consumer.launch().await.expect("consumer should connect");

    let producer = Producer::connect(config).await.expect("producer should connect");
    producer
        .publish(&serde_json::json!({"content": "live round trip"}))
        .await
        .expect("publish should be confirmed");

    timeout(Duration::from_secs(10), async {
        while worker.calls().is_empty() {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("message should be consumed");

    producer.destroy().await;
    consumer.stop().await;
}
