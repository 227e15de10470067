// src/rabbitmq/memory.rs
//! An in-process broker implementing the transport traits.
//!
//! It keeps a journal of every broker call it receives, routes publishes to
//! bound queues, tracks unacknowledged deliveries per session and requeues
//! them when the session goes away. Faults can be injected at any step, and
//! connections or sessions can be severed from the outside.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use tokio::sync::Notify;

use super::errors::{MqError, Result};
use super::signal::{CloseFault, CloseSignal, SignalSlot};
use super::transport::{
    Acknowledger, BrokerConnection, ConsumeOptions, Connector, Delivery, DeliveryStream,
    ExchangeOptions, OutboundMessage, Outcome, PublishOptions, Qos, QueueOptions, Session,
};
use crate::config::{Arguments, ExchangeKind};

/// A broker call as it was issued by a client.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerOp {
    Connect {
        addr: String,
    },
    OpenSession,
    ExchangeDeclare {
        exchange: String,
        kind: ExchangeKind,
        options: ExchangeOptions,
        args: Arguments,
    },
    QueueDeclare {
        queue: String,
        options: QueueOptions,
        args: Arguments,
    },
    Qos(Qos),
    QueueBind {
        queue: String,
        exchange: String,
        routing_key: String,
        args: Arguments,
    },
    Consume {
        queue: String,
        consumer_tag: String,
        options: ConsumeOptions,
    },
    Cancel {
        consumer_tag: String,
    },
    CloseConnection,
    Publish {
        exchange: String,
        routing_key: String,
        options: PublishOptions,
        message: OutboundMessage,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Connect,
    OpenSession,
    ExchangeDeclare,
    QueueDeclare,
    Qos,
    QueueBind,
    Consume,
    Cancel,
    CloseConnection,
    Publish,
}

impl BrokerOp {
    pub fn kind(&self) -> OpKind {
        match self {
            BrokerOp::Connect { .. } => OpKind::Connect,
            BrokerOp::OpenSession => OpKind::OpenSession,
            BrokerOp::ExchangeDeclare { .. } => OpKind::ExchangeDeclare,
            BrokerOp::QueueDeclare { .. } => OpKind::QueueDeclare,
            BrokerOp::Qos(_) => OpKind::Qos,
            BrokerOp::QueueBind { .. } => OpKind::QueueBind,
            BrokerOp::Consume { .. } => OpKind::Consume,
            BrokerOp::Cancel { .. } => OpKind::Cancel,
            BrokerOp::CloseConnection => OpKind::CloseConnection,
            BrokerOp::Publish { .. } => OpKind::Publish,
        }
    }
}

/// How a delivery was settled by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub body: Vec<u8>,
    pub redelivered: bool,
    pub outcome: Outcome,
}

#[derive(Debug, Clone)]
struct Message {
    body: Vec<u8>,
    redelivered: bool,
}

struct ConnectionRecord {
    open: bool,
    closed: SignalSlot,
}

struct SessionRecord {
    connection: u64,
    open: bool,
    closed: SignalSlot,
}

struct Subscriber {
    session: u64,
    queue: String,
    consumer_tag: String,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct InFlight {
    session: u64,
    queue: String,
    message: Message,
}

#[derive(Default)]
struct BrokerState {
    handle: Weak<Mutex<BrokerState>>,
    changed: Arc<Notify>,
    journal: Vec<BrokerOp>,
    failures: HashMap<OpKind, usize>,
    stall_connects: bool,
    next_id: u64,
    connections: HashMap<u64, ConnectionRecord>,
    sessions: HashMap<u64, SessionRecord>,
    peak_open_connections: usize,
    exchanges: HashMap<String, ExchangeKind>,
    bindings: Vec<(String, String, String)>,
    queues: HashMap<String, VecDeque<Message>>,
    subscribers: Vec<Subscriber>,
    next_delivery_tag: u64,
    in_flight: HashMap<u64, InFlight>,
    settlements: Vec<Settlement>,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Journal the call and consume an injected failure for it, if any.
    fn issue(&mut self, op: BrokerOp) -> Result<()> {
        let kind = op.kind();
        self.journal.push(op);
        match self.failures.get_mut(&kind) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(injected(kind))
            }
            _ => Ok(()),
        }
    }

    fn open_connections(&self) -> usize {
        self.connections.values().filter(|c| c.open).count()
    }

    fn session_open(&self, session: u64) -> bool {
        self.sessions.get(&session).map_or(false, |s| s.open)
    }

    fn dispatch(&mut self, queue: &str) {
        loop {
            let Some(index) = self
                .subscribers
                .iter()
                .position(|s| s.queue == queue && !s.tx.is_closed())
            else {
                return;
            };
            let Some(message) = self.queues.get_mut(queue).and_then(|q| q.pop_front()) else {
                return;
            };

            self.next_delivery_tag += 1;
            let tag = self.next_delivery_tag;
            let session = self.subscribers[index].session;
            self.in_flight.insert(
                tag,
                InFlight {
                    session,
                    queue: queue.to_string(),
                    message: message.clone(),
                },
            );
            let acker = MemoryAcker {
                state: self.handle.clone(),
                changed: self.changed.clone(),
                tag,
            };
            let delivery = Delivery::new(tag, message.redelivered, message.body, Box::new(acker));
            if self.subscribers[index].tx.unbounded_send(delivery).is_err() {
                // receiver went away between the check and the send
                if let Some(lost) = self.in_flight.remove(&tag) {
                    self.requeue(&lost.queue, lost.message);
                }
                self.subscribers.remove(index);
            }
        }
    }

    fn requeue(&mut self, queue: &str, mut message: Message) {
        message.redelivered = true;
        self.queues
            .entry(queue.to_string())
            .or_default()
            .push_front(message);
    }

    fn close_session(&mut self, session: u64, fault: Option<CloseFault>) {
        let slot = match self.sessions.get_mut(&session) {
            Some(record) if record.open => {
                record.open = false;
                record.closed.clone()
            }
            _ => return,
        };

        self.subscribers.retain(|s| s.session != session);
        let mut orphaned: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.session == session)
            .map(|(tag, _)| *tag)
            .collect();
        // newest first, so requeueing at the front restores delivery order
        orphaned.sort_unstable_by(|a, b| b.cmp(a));
        let mut touched = Vec::new();
        for tag in orphaned {
            if let Some(lost) = self.in_flight.remove(&tag) {
                touched.push(lost.queue.clone());
                self.requeue(&lost.queue, lost.message);
            }
        }
        for queue in touched {
            self.dispatch(&queue);
        }
        slot.fire(fault);
    }

    fn close_connection(&mut self, connection: u64, fault: Option<CloseFault>) {
        let slot = match self.connections.get_mut(&connection) {
            Some(record) if record.open => {
                record.open = false;
                record.closed.clone()
            }
            _ => return,
        };

        let sessions: Vec<u64> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.connection == connection && s.open)
            .map(|(id, _)| *id)
            .collect();
        for session in sessions {
            self.close_session(session, fault.clone());
        }
        slot.fire(fault);
    }

    fn route(&mut self, exchange: &str, routing_key: &str, body: &[u8]) {
        let fanout = self.exchanges.get(exchange) == Some(&ExchangeKind::Fanout);
        let targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|(q_exchange, _, key)| q_exchange == exchange && (fanout || key == routing_key))
            .map(|(_, queue, _)| queue.clone())
            .collect();

        for queue in targets {
            self.queues.entry(queue.clone()).or_default().push_back(Message {
                body: body.to_vec(),
                redelivered: false,
            });
            self.dispatch(&queue);
        }
    }
}

fn injected(kind: OpKind) -> MqError {
    let reason = format!("injected {:?} failure", kind);
    match kind {
        OpKind::Connect | OpKind::CloseConnection => MqError::ConnectionError(reason),
        OpKind::OpenSession | OpKind::Cancel => MqError::ChannelError(reason),
        OpKind::ExchangeDeclare => MqError::topology("exchange_declare", reason),
        OpKind::QueueDeclare => MqError::topology("queue_declare", reason),
        OpKind::Qos => MqError::topology("basic_qos", reason),
        OpKind::QueueBind => MqError::topology("queue_bind", reason),
        OpKind::Consume => MqError::ConsumeError(reason),
        OpKind::Publish => MqError::PublishError(reason),
    }
}

/// In-process broker. Cloning shares the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    changed: Arc<Notify>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let changed = Arc::new(Notify::new());
        let state = Arc::new_cyclic(|handle| {
            Mutex::new(BrokerState {
                handle: handle.clone(),
                changed: changed.clone(),
                ..BrokerState::default()
            })
        });
        Self { state, changed }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut BrokerState) -> T) -> T {
        let result = f(&mut self.lock());
        self.changed.notify_waiters();
        result
    }

    /// Make the next `times` calls of `kind` fail.
    pub fn fail_next(&self, kind: OpKind, times: usize) {
        self.with_state(|state| {
            state.failures.insert(kind, times);
        });
    }

    /// While set, connection attempts are journaled and then never answered,
    /// like a host that silently drops packets.
    pub fn stall_connects(&self, stalled: bool) {
        self.with_state(|state| state.stall_connects = stalled);
    }

    /// Drop every open connection with `reason`, as a network fault would.
    pub fn sever_connections(&self, reason: &str) {
        self.with_state(|state| {
            let open: Vec<u64> = state
                .connections
                .iter()
                .filter(|(_, c)| c.open)
                .map(|(id, _)| *id)
                .collect();
            for id in open {
                state.close_connection(id, Some(CloseFault::new(reason)));
            }
        });
    }

    /// Close every open session with `reason`, leaving connections up.
    pub fn close_sessions(&self, reason: &str) {
        self.with_state(|state| {
            let open: Vec<u64> = state
                .sessions
                .iter()
                .filter(|(_, s)| s.open)
                .map(|(id, _)| *id)
                .collect();
            for id in open {
                state.close_session(id, Some(CloseFault::new(reason)));
            }
        });
    }

    /// Put a message straight onto `queue`.
    pub fn deliver(&self, queue: &str, body: impl Into<Vec<u8>>) {
        let body = body.into();
        self.with_state(|state| {
            state.queues.entry(queue.to_string()).or_default().push_back(Message {
                body,
                redelivered: false,
            });
            state.dispatch(queue);
        });
    }

    pub fn journal(&self) -> Vec<BrokerOp> {
        self.lock().journal.clone()
    }

    pub fn count(&self, kind: OpKind) -> usize {
        self.lock().journal.iter().filter(|op| op.kind() == kind).count()
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.lock().settlements.clone()
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.len())
    }

    pub fn open_connections(&self) -> usize {
        self.lock().open_connections()
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().sessions.values().filter(|s| s.open).count()
    }

    /// The most connections that were ever open at the same time.
    pub fn peak_open_connections(&self) -> usize {
        self.lock().peak_open_connections
    }

    /// Close subscribers still waiting on a close that never fired.
    pub fn pending_close_waiters(&self) -> usize {
        let state = self.lock();
        state.connections.values().map(|c| c.closed.pending()).sum::<usize>()
            + state.sessions.values().map(|s| s.closed.pending()).sum::<usize>()
    }

    async fn wait_until(&self, mut ready: impl FnMut(&BrokerState) -> bool) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if ready(&self.lock()) {
                return;
            }
            notified.await;
        }
    }

    /// Wait until at least `n` deliveries have been settled.
    pub async fn wait_for_settlements(&self, n: usize) -> Vec<Settlement> {
        self.wait_until(|state| state.settlements.len() >= n).await;
        self.settlements()
    }

    /// Wait until `kind` has been issued at least `n` times.
    pub async fn wait_for_ops(&self, kind: OpKind, n: usize) {
        self.wait_until(|state| state.journal.iter().filter(|op| op.kind() == kind).count() >= n)
            .await;
    }

    pub async fn wait_for_subscribers(&self, queue: &str, n: usize) {
        self.wait_until(|state| {
            state
                .subscribers
                .iter()
                .filter(|s| s.queue == queue && state.session_open(s.session))
                .count()
                >= n
        })
        .await;
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, addr: &str) -> Result<Box<dyn BrokerConnection>> {
        let id = self.with_state(|state| -> Result<Option<u64>> {
            state.issue(BrokerOp::Connect {
                addr: addr.to_string(),
            })?;
            if state.stall_connects {
                return Ok(None);
            }
            let id = state.next_id();
            state.connections.insert(
                id,
                ConnectionRecord {
                    open: true,
                    closed: SignalSlot::new(),
                },
            );
            state.peak_open_connections = state.peak_open_connections.max(state.open_connections());
            Ok(Some(id))
        })?;
        let Some(id) = id else {
            return futures::future::pending().await;
        };

        Ok(Box::new(MemoryConnection {
            broker: self.clone(),
            id,
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_session(&self) -> Result<Box<dyn Session>> {
        let id = self.broker.with_state(|state| -> Result<u64> {
            state.issue(BrokerOp::OpenSession)?;
            let parent = match state.connections.get(&self.id) {
                Some(record) if record.open => record.closed.clone(),
                _ => return Err(MqError::ConnectionError("connection is closed".to_string())),
            };
            let id = state.next_id();
            let closed = SignalSlot::new();
            parent.chain(closed.clone());
            state.sessions.insert(
                id,
                SessionRecord {
                    connection: self.id,
                    open: true,
                    closed,
                },
            );
            Ok(id)
        })?;

        Ok(Box::new(MemorySession {
            broker: self.broker.clone(),
            id,
        }))
    }

    fn notify_close(&self) -> CloseSignal {
        let state = self.broker.lock();
        match state.connections.get(&self.id) {
            Some(record) => record.closed.subscribe(),
            None => SignalSlot::new().subscribe(),
        }
    }

    fn is_closed(&self) -> bool {
        !self
            .broker
            .lock()
            .connections
            .get(&self.id)
            .map_or(false, |c| c.open)
    }

    async fn close(&self) -> Result<()> {
        self.broker.with_state(|state| -> Result<()> {
            state.issue(BrokerOp::CloseConnection)?;
            match state.connections.get(&self.id) {
                Some(record) if record.open => {
                    state.close_connection(self.id, None);
                    Ok(())
                }
                _ => Err(MqError::ConnectionError("connection already closed".to_string())),
            }
        })
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.broker
            .with_state(|state| state.close_connection(self.id, None));
    }
}

struct MemorySession {
    broker: MemoryBroker,
    id: u64,
}

impl MemorySession {
    /// Journal `op`, then run `f` if the session is still open.
    fn call<T>(&self, op: BrokerOp, f: impl FnOnce(&mut BrokerState) -> Result<T>) -> Result<T> {
        self.broker.with_state(|state| -> Result<T> {
            state.issue(op)?;
            if !state.session_open(self.id) {
                return Err(MqError::ChannelError("channel is closed".to_string()));
            }
            f(state)
        })
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
        args: &Arguments,
    ) -> Result<()> {
        let op = BrokerOp::ExchangeDeclare {
            exchange: exchange.to_string(),
            kind,
            options,
            args: args.clone(),
        };
        self.call(op, |state| match state.exchanges.get(exchange) {
            Some(existing) if *existing != kind => Err(MqError::topology(
                "exchange_declare",
                format!(
                    "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}'",
                    exchange
                ),
            )),
            _ => {
                state.exchanges.insert(exchange.to_string(), kind);
                Ok(())
            }
        })
    }

    async fn queue_declare(&self, queue: &str, options: QueueOptions, args: &Arguments) -> Result<()> {
        let op = BrokerOp::QueueDeclare {
            queue: queue.to_string(),
            options,
            args: args.clone(),
        };
        self.call(op, |state| {
            state.queues.entry(queue.to_string()).or_default();
            Ok(())
        })
    }

    async fn qos(&self, qos: Qos) -> Result<()> {
        self.call(BrokerOp::Qos(qos), |_| Ok(()))
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        args: &Arguments,
    ) -> Result<()> {
        let op = BrokerOp::QueueBind {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            args: args.clone(),
        };
        self.call(op, |state| {
            if !state.exchanges.contains_key(exchange) {
                return Err(MqError::topology(
                    "queue_bind",
                    format!("NOT_FOUND - no exchange '{}'", exchange),
                ));
            }
            let binding = (exchange.to_string(), queue.to_string(), routing_key.to_string());
            if !state.bindings.contains(&binding) {
                state.bindings.push(binding);
            }
            Ok(())
        })
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream> {
        let op = BrokerOp::Consume {
            queue: queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
            options,
        };
        let rx = self.call(op, |state| {
            let (tx, rx) = mpsc::unbounded();
            state.subscribers.push(Subscriber {
                session: self.id,
                queue: queue.to_string(),
                consumer_tag: consumer_tag.to_string(),
                tx,
            });
            state.dispatch(queue);
            Ok(rx)
        })?;
        Ok(rx.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let op = BrokerOp::Cancel {
            consumer_tag: consumer_tag.to_string(),
        };
        self.call(op, |state| {
            state
                .subscribers
                .retain(|s| !(s.session == self.id && s.consumer_tag == consumer_tag));
            Ok(())
        })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
        message: OutboundMessage,
    ) -> Result<()> {
        let body = message.body.clone();
        let op = BrokerOp::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            options,
            message,
        };
        self.call(op, |state| {
            state.route(exchange, routing_key, &body);
            Ok(())
        })
    }

    fn notify_close(&self) -> CloseSignal {
        let state = self.broker.lock();
        match state.sessions.get(&self.id) {
            Some(record) => record.closed.subscribe(),
            None => SignalSlot::new().subscribe(),
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.broker.with_state(|state| state.close_session(self.id, None));
    }
}

struct MemoryAcker {
    state: Weak<Mutex<BrokerState>>,
    changed: Arc<Notify>,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, outcome: Outcome) -> Result<()> {
        let state = self
            .state
            .upgrade()
            .ok_or_else(|| MqError::AckError("broker is gone".to_string()))?;
        {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            let in_flight = match state.in_flight.get(&self.tag) {
                Some(f) if state.session_open(f.session) => state.in_flight.remove(&self.tag),
                _ => None,
            };
            let Some(in_flight) = in_flight else {
                return Err(MqError::AckError(format!(
                    "unknown delivery tag {} (channel closed)",
                    self.tag
                )));
            };

            state.settlements.push(Settlement {
                body: in_flight.message.body.clone(),
                redelivered: in_flight.message.redelivered,
                outcome,
            });
            if outcome == Outcome::Requeue {
                state.requeue(&in_flight.queue, in_flight.message);
                state.dispatch(&in_flight.queue);
            }
        }
        self.changed.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(Outcome::Ack)
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.settle(if requeue { Outcome::Requeue } else { Outcome::Reject })
    }
}
