use std::sync::Arc;
use std::time::Duration;

use resilient_rabbitmq::rabbitmq::transport::Qos;
use resilient_rabbitmq::rabbitmq::{BrokerOp, OpKind, Outcome, Settlement, RECONNECT_DELAY};
use resilient_rabbitmq::{Consumer, MemoryBroker, MqError};
use tokio::time::{sleep, timeout, Instant};

use crate::common::{config, ops, ScriptedWorker, QUEUE};

const WAIT: Duration = Duration::from_secs(5);

fn consumer(broker: &MemoryBroker, worker: ScriptedWorker) -> Consumer {
    Consumer::with_connector(config().with_prefetch(10, 0), worker, Arc::new(broker.clone()))
}

fn settled(body: &str, redelivered: bool, outcome: Outcome) -> Settlement {
    Settlement {
        body: body.as_bytes().to_vec(),
        redelivered,
        outcome,
    }
}

/// Put a message through and wait for it to be settled, which proves the
/// current epoch is fully wired up.
async fn round_trip(broker: &MemoryBroker, body: &str, settlements: usize) {
    broker.deliver(QUEUE, body);
    timeout(WAIT, broker.wait_for_settlements(settlements))
        .await
        .expect("message was not settled");
}

#[tokio::test]
async fn worker_results_drive_ack_reject_and_requeue() {
    let broker = MemoryBroker::new();
    let worker = ScriptedWorker::default();
    let consumer = consumer(&broker, worker.clone());
    consumer.launch().await.unwrap();

    broker.deliver(QUEUE, "m1");
    broker.deliver(QUEUE, "drop-m2");
    broker.deliver(QUEUE, "flaky-m3");

    let settlements = timeout(WAIT, broker.wait_for_settlements(4)).await.unwrap();
    assert_eq!(
        settlements,
        vec![
            settled("m1", false, Outcome::Ack),
            settled("drop-m2", false, Outcome::Reject),
            settled("flaky-m3", false, Outcome::Requeue),
            settled("flaky-m3", true, Outcome::Ack),
        ]
    );
    assert_eq!(
        worker.calls().last(),
        Some(&("flaky-m3".to_string(), true))
    );

    let qos = ops(&broker, OpKind::Qos);
    assert_eq!(
        qos,
        vec![BrokerOp::Qos(Qos {
            prefetch_count: 10,
            prefetch_size: 0,
            global: true,
        })]
    );

    consumer.stop().await;
    assert_eq!(broker.queue_depth(QUEUE), 0);
}

#[tokio::test]
async fn topology_is_replayed_identically_after_each_reconnect() {
    let broker = MemoryBroker::new();
    let consumer = consumer(&broker, ScriptedWorker::default());
    consumer.launch().await.unwrap();
    round_trip(&broker, "warmup", 1).await;

    const SEVERS: usize = 3;
    for i in 1..=SEVERS {
        broker.sever_connections("CONNECTION_FORCED - broker forced connection closure");
        round_trip(&broker, &format!("after-{}", i), i + 1).await;
        assert_eq!(broker.pending_close_waiters(), 2);
    }

    for kind in [
        OpKind::ExchangeDeclare,
        OpKind::QueueDeclare,
        OpKind::Qos,
        OpKind::QueueBind,
        OpKind::Consume,
    ] {
        let issued = ops(&broker, kind);
        assert_eq!(issued.len(), SEVERS + 1, "{:?}", kind);
        assert!(issued.iter().all(|op| *op == issued[0]), "{:?} changed", kind);
    }

    assert_eq!(broker.peak_open_connections(), 1);
    consumer.stop().await;
    assert_eq!(broker.pending_close_waiters(), 0);
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn session_close_alone_triggers_reconnect() {
    let broker = MemoryBroker::new();
    let consumer = consumer(&broker, ScriptedWorker::default());
    consumer.launch().await.unwrap();
    round_trip(&broker, "first", 1).await;

    for i in 1..=2 {
        broker.close_sessions("PRECONDITION_FAILED - unknown delivery tag");
        round_trip(&broker, &format!("again-{}", i), i + 1).await;
    }

    assert_eq!(broker.count(OpKind::Connect), 3);
    assert_eq!(broker.open_connections(), 1);
    assert_eq!(broker.open_sessions(), 1);
    assert_eq!(broker.peak_open_connections(), 1);
    assert_eq!(broker.pending_close_waiters(), 2);

    consumer.stop().await;
    assert_eq!(broker.pending_close_waiters(), 0);
}

#[tokio::test]
async fn messages_wait_in_queue_while_link_is_down() {
    let broker = MemoryBroker::new();
    let consumer = consumer(&broker, ScriptedWorker::default());
    consumer.launch().await.unwrap();

    // no subscriber while the link is down, so the message waits in the queue
    broker.fail_next(OpKind::Connect, 1);
    broker.sever_connections("CONNECTION_FORCED");
    timeout(WAIT, broker.wait_for_ops(OpKind::Connect, 2)).await.unwrap();
    broker.deliver(QUEUE, "queued-while-down");
    assert_eq!(broker.queue_depth(QUEUE), 1);

    consumer.stop().await;
    assert_eq!(broker.queue_depth(QUEUE), 1);
    assert!(broker.settlements().is_empty());
}

#[tokio::test(start_paused = true)]
async fn first_connect_failure_is_fatal() {
    let broker = MemoryBroker::new();
    broker.fail_next(OpKind::Connect, 1);
    let consumer = consumer(&broker, ScriptedWorker::default());

    let err = consumer.start().await.unwrap_err();
    assert!(matches!(err, MqError::ConnectionError(_)));

    sleep(RECONNECT_DELAY * 4).await;
    assert_eq!(broker.count(OpKind::Connect), 1);
}

#[tokio::test(start_paused = true)]
async fn first_run_failure_after_connect_is_also_fatal() {
    let broker = MemoryBroker::new();
    broker.fail_next(OpKind::Consume, 1);
    let consumer = consumer(&broker, ScriptedWorker::default());

    let err = consumer.start().await.unwrap_err();
    assert!(matches!(err, MqError::ConsumeError(_)));
    assert_eq!(broker.open_connections(), 0);

    sleep(RECONNECT_DELAY * 4).await;
    assert_eq!(broker.count(OpKind::Connect), 1);
}

#[tokio::test(start_paused = true)]
async fn reconnects_after_forced_close_without_caller_help() {
    let broker = MemoryBroker::new();
    let consumer = Arc::new(consumer(&broker, ScriptedWorker::default()));

    let started = Instant::now();
    let blocking = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.start().await }
    });
    broker.wait_for_subscribers(QUEUE, 1).await;

    sleep(Duration::from_secs(2)).await;
    // the first reconnect attempt is refused, the next one comes after the delay
    broker.fail_next(OpKind::Connect, 1);
    broker.sever_connections("CONNECTION_FORCED");
    let severed = Instant::now();

    broker.wait_for_ops(OpKind::ExchangeDeclare, 2).await;
    let recovered = severed.elapsed();
    assert!(recovered >= Duration::from_secs(5), "{:?}", recovered);
    assert!(recovered <= Duration::from_secs(10), "{:?}", recovered);

    broker.wait_for_subscribers(QUEUE, 1).await;
    round_trip(&broker, "resumed", 1).await;

    sleep(Duration::from_secs(60)).await;
    assert!(!blocking.is_finished());
    assert!(started.elapsed() >= Duration::from_secs(60));

    consumer.stop().await;
    blocking.abort();
}

#[tokio::test(start_paused = true)]
async fn retries_forever_at_a_fixed_delay() {
    let broker = MemoryBroker::new();
    let consumer = consumer(&broker, ScriptedWorker::default());
    consumer.launch().await.unwrap();

    broker.fail_next(OpKind::Connect, 4);
    broker.sever_connections("CONNECTION_FORCED");

    let severed = Instant::now();
    broker.wait_for_ops(OpKind::Connect, 6).await;
    // four refusals, each followed by one delay
    let waited = severed.elapsed();
    assert!(waited >= RECONNECT_DELAY * 4, "{:?}", waited);
    assert!(waited < RECONNECT_DELAY * 5, "{:?}", waited);

    broker.wait_for_subscribers(QUEUE, 1).await;
    consumer.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_during_backoff_prevents_further_attempts() {
    let broker = MemoryBroker::new();
    let consumer = consumer(&broker, ScriptedWorker::default());
    consumer.launch().await.unwrap();

    broker.fail_next(OpKind::Connect, usize::MAX);
    broker.sever_connections("CONNECTION_FORCED");
    broker.wait_for_ops(OpKind::Connect, 2).await;

    let stopping = Instant::now();
    consumer.stop().await;
    assert!(stopping.elapsed() < RECONNECT_DELAY);

    sleep(RECONNECT_DELAY * 10).await;
    assert_eq!(broker.count(OpKind::Connect), 2);
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn stop_abandons_a_connect_that_never_answers() {
    let broker = MemoryBroker::new();
    let consumer = consumer(&broker, ScriptedWorker::default());
    consumer.launch().await.unwrap();

    broker.stall_connects(true);
    broker.sever_connections("CONNECTION_FORCED");
    broker.wait_for_ops(OpKind::Connect, 2).await;

    timeout(Duration::from_secs(1), consumer.stop())
        .await
        .expect("stop waited on a connect attempt");

    broker.stall_connects(false);
    sleep(RECONNECT_DELAY * 10).await;
    assert_eq!(broker.count(OpKind::Connect), 2);
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(broker.pending_close_waiters(), 0);
}

#[tokio::test(start_paused = true)]
async fn quit_wins_over_a_concurrent_close() {
    let broker = MemoryBroker::new();
    let consumer = consumer(&broker, ScriptedWorker::default());
    consumer.launch().await.unwrap();

    // both are ready when the supervisor next looks
    broker.sever_connections("CONNECTION_FORCED");
    consumer.stop().await;

    sleep(RECONNECT_DELAY * 10).await;
    assert_eq!(broker.count(OpKind::Connect), 1);
    assert_eq!(broker.pending_close_waiters(), 0);
}

#[tokio::test]
async fn stop_is_idempotent_and_releases_everything() {
    let broker = MemoryBroker::new();
    let consumer = consumer(&broker, ScriptedWorker::default());
    consumer.launch().await.unwrap();
    round_trip(&broker, "m", 1).await;

    consumer.stop().await;
    consumer.stop().await;

    assert_eq!(broker.count(OpKind::Cancel), 1);
    assert_eq!(broker.count(OpKind::CloseConnection), 1);
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(broker.pending_close_waiters(), 0);
}

#[tokio::test]
async fn stop_before_launch_does_nothing() {
    let broker = MemoryBroker::new();
    let consumer = consumer(&broker, ScriptedWorker::default());

    consumer.stop().await;

    assert!(broker.journal().is_empty());
}
