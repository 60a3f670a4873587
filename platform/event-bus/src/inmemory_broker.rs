//! In-memory implementation of the transport seam for testing and development

use crate::transport::{
    Acknowledger, AutoAcked, Channel, Connection, Connector, Delivery, ExchangeKind,
    MessageProperties, QueueInfo, QueueOptions,
};
use crate::{BusError, BusResult};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

/// Process-local broker with AMQP 0-9-1 routing semantics
///
/// This implementation is suitable for:
/// - Unit tests (no external dependencies)
/// - Local development without Docker
/// - Integration tests that need fast, isolated brokers
///
/// It models exchanges (default, direct, fanout, topic), durable and
/// exclusive queues, bindings, dead-letter exchanges, requeue-at-head with
/// the `redelivered` flag, per-consumer prefetch, and connection loss.
/// Clones share the same server state, so a `Broker` and an `RpcClient`
/// built from clones of one `InMemoryBroker` talk to each other.
///
/// # Example
/// ```rust
/// use event_bus::{Broker, InMemoryBroker, ExchangeKind, PublishOptions, QueueOptions};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let server = InMemoryBroker::new();
/// let broker = Broker::new(Arc::new(server.clone()));
///
/// broker.declare_exchange("orders", ExchangeKind::Topic, true).await?;
/// broker.declare_queue("orders.audit", &QueueOptions::durable()).await?;
/// broker.bind_queue("orders", "orders.audit", "order.#").await?;
/// broker
///     .publish("orders", "order.placed", &serde_json::json!({"id": 1}), PublishOptions::persistent())
///     .await?;
///
/// assert_eq!(server.queue_depth("orders.audit"), Some(1));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    server: Arc<Server>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ready messages in a queue, or `None` if it does not exist
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.server.state().queues.get(queue).map(|q| q.messages.len())
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.server.state().queues.contains_key(queue)
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.server.state().exchanges.contains_key(exchange)
    }

    /// Number of connections currently open
    pub fn open_connections(&self) -> usize {
        lock(&self.server.connections)
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| c.is_open())
            .count()
    }

    /// Drop every open connection, as a broker restart or network partition would
    pub fn disconnect_all(&self) {
        let connections: Vec<_> = lock(&self.server.connections)
            .drain(..)
            .filter_map(|c| c.upgrade())
            .collect();

        for connection in &connections {
            self.server.close_connection(connection);
        }

        warn!(count = connections.len(), "In-memory broker dropped all connections");
    }

    /// Make subsequent connection attempts fail (or succeed again)
    pub fn set_reachable(&self, reachable: bool) {
        self.server.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self) -> BusResult<Arc<dyn Connection>> {
        if !self.server.reachable.load(Ordering::SeqCst) {
            return Err(BusError::ConnectionError(
                "in-memory broker is unreachable".to_string(),
            ));
        }

        let state = Arc::new(ConnectionState {
            id: self.server.next_connection_id.fetch_add(1, Ordering::SeqCst),
            open: AtomicBool::new(true),
            closed: Notify::new(),
        });

        let mut connections = lock(&self.server.connections);
        connections.retain(|c| c.strong_count() > 0);
        connections.push(Arc::downgrade(&state));

        Ok(Arc::new(InMemoryConnection {
            server: self.server.clone(),
            state,
        }))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Check if a routing key matches a topic binding pattern
///
/// Supports AMQP topic wildcards:
/// - `*` matches exactly one word
/// - `#` matches zero or more words
///
/// # Examples
/// - `order.#` matches `order`, `order.placed` and `order.line.added`
/// - `order.*` matches `order.placed` but not `order.line.added`
/// - `#` matches everything
pub(crate) fn topic_matches(routing_key: &str, pattern: &str) -> bool {
    let words: Vec<&str> = routing_key.split('.').collect();
    let pattern: Vec<&str> = pattern.split('.').collect();
    match_words(&words, &pattern)
}

fn match_words(words: &[&str], pattern: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((token, rest)) if *token == "#" => {
            (0..=words.len()).any(|skip| match_words(&words[skip..], rest))
        }
        Some((token, rest)) if *token == "*" => !words.is_empty() && match_words(&words[1..], rest),
        Some((token, rest)) => words.first() == Some(token) && match_words(&words[1..], rest),
    }
}

struct Server {
    state: Mutex<ServerState>,
    connections: Mutex<Vec<Weak<ConnectionState>>>,
    reachable: AtomicBool,
    next_connection_id: AtomicU64,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            state: Mutex::new(ServerState::default()),
            connections: Mutex::new(Vec::new()),
            reachable: AtomicBool::new(true),
            next_connection_id: AtomicU64::new(1),
        }
    }
}

#[derive(Default)]
struct ServerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
}

struct ExchangeState {
    kind: ExchangeKind,
    durable: bool,
    /// (queue, binding key)
    bindings: Vec<(String, String)>,
}

struct QueueState {
    options: QueueOptions,
    /// Owning connection for exclusive queues
    owner: Option<u64>,
    messages: VecDeque<StoredMessage>,
    consumers: usize,
    notify: Arc<Notify>,
}

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

impl StoredMessage {
    fn into_delivery(self, acker: Box<dyn Acknowledger>) -> Delivery {
        Delivery::new(
            self.exchange,
            self.routing_key,
            self.body,
            self.properties,
            self.redelivered,
            acker,
        )
    }
}

impl ServerState {
    /// Enqueue on every queue the exchange routes to; returns the number of queues hit
    fn route(&mut self, exchange: &str, routing_key: &str, message: StoredMessage) -> BusResult<usize> {
        let targets: Vec<String> = if exchange.is_empty() {
            // Default exchange: implicit binding of every queue under its own name
            if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            let state = self.exchanges.get(exchange).ok_or_else(|| {
                BusError::PublishError(format!("no exchange '{}'", exchange))
            })?;

            let mut targets: Vec<String> = Vec::new();
            for (queue, key) in &state.bindings {
                let hit = match state.kind {
                    ExchangeKind::Direct => key == routing_key,
                    ExchangeKind::Fanout => true,
                    ExchangeKind::Topic => topic_matches(routing_key, key),
                };
                if hit && !targets.contains(queue) {
                    targets.push(queue.clone());
                }
            }
            targets
        };

        for name in &targets {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.messages.push_back(message.clone());
                queue.notify.notify_waiters();
            }
        }

        Ok(targets.len())
    }

    fn delete_queue(&mut self, name: &str) {
        if let Some(queue) = self.queues.remove(name) {
            queue.notify.notify_waiters();
        }
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|(queue, _)| queue != name);
        }
    }
}

impl Server {
    fn state(&self) -> MutexGuard<'_, ServerState> {
        lock(&self.state)
    }

    fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> BusResult<()> {
        if name.is_empty() {
            return Err(BusError::InvalidTopology(
                "the default exchange cannot be declared".to_string(),
            ));
        }

        let mut state = self.state();
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind || existing.durable != durable => {
                Err(BusError::TopologyConflict(format!(
                    "exchange '{}' exists as {} (durable={}), requested {} (durable={})",
                    name, existing.kind, existing.durable, kind, durable
                )))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind,
                        durable,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    fn declare_queue(&self, owner: u64, name: &str, options: &QueueOptions) -> BusResult<QueueInfo> {
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        let mut state = self.state();
        if let Some(existing) = state.queues.get(&name) {
            if existing.options != *options {
                return Err(BusError::TopologyConflict(format!(
                    "queue '{}' already declared with different parameters",
                    name
                )));
            }
            if existing.owner.is_some_and(|id| id != owner) {
                return Err(BusError::TopologyConflict(format!(
                    "queue '{}' is exclusive to another connection",
                    name
                )));
            }
            return Ok(QueueInfo {
                message_count: u32::try_from(existing.messages.len()).unwrap_or(u32::MAX),
                name,
            });
        }

        state.queues.insert(
            name.clone(),
            QueueState {
                options: options.clone(),
                owner: options.exclusive.then_some(owner),
                messages: VecDeque::new(),
                consumers: 0,
                notify: Arc::new(Notify::new()),
            },
        );

        Ok(QueueInfo {
            name,
            message_count: 0,
        })
    }

    fn bind(&self, exchange: &str, queue: &str, routing_key: &str) -> BusResult<()> {
        let mut state = self.state();
        if !state.queues.contains_key(queue) {
            return Err(BusError::InvalidTopology(format!("no queue '{}'", queue)));
        }
        let exchange_state = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BusError::InvalidTopology(format!("no exchange '{}'", exchange)))?;

        let binding = (queue.to_string(), routing_key.to_string());
        if !exchange_state.bindings.contains(&binding) {
            exchange_state.bindings.push(binding);
        }
        Ok(())
    }

    fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>, properties: MessageProperties) -> BusResult<()> {
        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body,
            properties,
            redelivered: false,
        };

        let routed = self.state().route(exchange, routing_key, message)?;
        if routed == 0 {
            debug!(exchange = %exchange, routing_key = %routing_key, "Message unroutable, dropped");
        }
        Ok(())
    }

    /// Next ready message; `Err` once the queue no longer exists
    fn pop(&self, queue: &str) -> BusResult<Option<StoredMessage>> {
        self.state()
            .queues
            .get_mut(queue)
            .map(|q| q.messages.pop_front())
            .ok_or_else(|| BusError::InvalidTopology(format!("no queue '{}'", queue)))
    }

    fn requeue(&self, queue: &str, mut message: StoredMessage) {
        message.redelivered = true;
        if let Some(state) = self.state().queues.get_mut(queue) {
            state.messages.push_front(message);
            state.notify.notify_waiters();
        }
    }

    fn dead_letter(&self, queue: &str, message: StoredMessage) {
        let mut state = self.state();
        let Some(options) = state.queues.get(queue).map(|q| q.options.clone()) else {
            return;
        };
        let Some(exchange) = options.dead_letter_exchange else {
            debug!(queue = %queue, "Rejected message dropped (no dead-letter exchange)");
            return;
        };
        let routing_key = options
            .dead_letter_routing_key
            .unwrap_or_else(|| message.routing_key.clone());

        let message = StoredMessage {
            exchange: exchange.clone(),
            routing_key: routing_key.clone(),
            redelivered: false,
            ..message
        };

        match state.route(&exchange, &routing_key, message) {
            Ok(routed) => debug!(
                queue = %queue,
                dead_letter_exchange = %exchange,
                routing_key = %routing_key,
                routed = routed,
                "Message dead-lettered"
            ),
            Err(e) => warn!(queue = %queue, error = %e, "Dead-lettering failed, message dropped"),
        }
    }

    fn attach_consumer(&self, queue: &str) -> BusResult<Arc<Notify>> {
        let mut state = self.state();
        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BusError::SubscribeError(format!("no queue '{}'", queue)))?;
        queue_state.consumers += 1;
        Ok(queue_state.notify.clone())
    }

    fn detach_consumer(&self, queue: &str) {
        let mut state = self.state();
        let delete = match state.queues.get_mut(queue) {
            Some(q) => {
                q.consumers = q.consumers.saturating_sub(1);
                q.consumers == 0 && q.options.auto_delete
            }
            None => false,
        };
        if delete {
            debug!(queue = %queue, "Auto-delete queue lost its last consumer");
            state.delete_queue(queue);
        }
    }

    fn close_connection(&self, connection: &ConnectionState) {
        if !connection.open.swap(false, Ordering::SeqCst) {
            return;
        }
        connection.closed.notify_waiters();

        let mut state = self.state();
        let owned: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(connection.id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            state.delete_queue(&name);
        }
    }
}

struct ConnectionState {
    id: u64,
    open: AtomicBool,
    closed: Notify,
}

impl ConnectionState {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

struct InMemoryConnection {
    server: Arc<Server>,
    state: Arc<ConnectionState>,
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn create_channel(&self) -> BusResult<Arc<dyn Channel>> {
        if !self.state.is_open() {
            return Err(BusError::ChannelClosed("connection is closed".to_string()));
        }
        Ok(Arc::new(InMemoryChannel {
            server: self.server.clone(),
            state: Arc::new(ChannelState {
                connection: self.state.clone(),
                open: AtomicBool::new(true),
                closed: Notify::new(),
            }),
            prefetch: AtomicU16::new(0),
        }))
    }

    fn is_open(&self) -> bool {
        self.state.is_open()
    }

    async fn close(&self) -> BusResult<()> {
        self.server.close_connection(&self.state);
        Ok(())
    }
}

impl Drop for InMemoryConnection {
    fn drop(&mut self) {
        self.server.close_connection(&self.state);
    }
}

struct ChannelState {
    connection: Arc<ConnectionState>,
    open: AtomicBool,
    closed: Notify,
}

impl ChannelState {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.connection.is_open()
    }
}

struct InMemoryChannel {
    server: Arc<Server>,
    state: Arc<ChannelState>,
    prefetch: AtomicU16,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> BusResult<()> {
        if self.state.is_open() {
            Ok(())
        } else {
            Err(BusError::ChannelClosed("channel is closed".to_string()))
        }
    }
}

/// Wait for the next message on `queue`; `None` when the channel closes or the queue goes away
async fn next_message(
    server: &Server,
    channel: &ChannelState,
    queue: &str,
    arrivals: &Notify,
) -> Option<StoredMessage> {
    loop {
        // Register interest before checking, so a publish in between is not missed
        let arrived = arrivals.notified();
        let channel_closed = channel.closed.notified();
        let connection_closed = channel.connection.closed.notified();
        tokio::pin!(arrived, channel_closed, connection_closed);
        arrived.as_mut().enable();
        channel_closed.as_mut().enable();
        connection_closed.as_mut().enable();

        if !channel.is_open() {
            return None;
        }
        match server.pop(queue) {
            Ok(Some(message)) => return Some(message),
            Ok(None) => {}
            Err(_) => return None,
        }

        tokio::select! {
            _ = &mut arrived => {}
            _ = &mut channel_closed => {}
            _ = &mut connection_closed => {}
        }
    }
}

/// Decrements the queue's consumer count when a consumer stream is dropped
struct ConsumerGuard {
    server: Arc<Server>,
    queue: String,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.server.detach_consumer(&self.queue);
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    async fn basic_qos(&self, prefetch_count: u16) -> BusResult<()> {
        self.ensure_open()?;
        self.prefetch.store(prefetch_count, Ordering::SeqCst);
        Ok(())
    }

    async fn exchange_declare(&self, name: &str, kind: ExchangeKind, durable: bool) -> BusResult<()> {
        self.ensure_open()?;
        self.server.declare_exchange(name, kind, durable)
    }

    async fn queue_declare(&self, name: &str, options: &QueueOptions) -> BusResult<QueueInfo> {
        self.ensure_open()?;
        self.server.declare_queue(self.state.connection.id, name, options)
    }

    async fn queue_bind(&self, exchange: &str, queue: &str, routing_key: &str) -> BusResult<()> {
        self.ensure_open()?;
        self.server.bind(exchange, queue, routing_key)
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> BusResult<()> {
        self.ensure_open()
            .map_err(|e| BusError::PublishError(e.to_string()))?;
        self.server.publish(exchange, routing_key, body, properties)
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> BusResult<BoxStream<'static, Delivery>> {
        self.ensure_open()?;

        let arrivals = self.server.attach_consumer(queue)?;
        let guard = ConsumerGuard {
            server: self.server.clone(),
            queue: queue.to_string(),
        };

        // Prefetch is enforced per consumer, as RabbitMQ does for non-global QoS
        let prefetch = self.prefetch.load(Ordering::SeqCst);
        let limiter = (!no_ack && prefetch > 0).then(|| Arc::new(Semaphore::new(prefetch as usize)));

        let server = self.server.clone();
        let channel = self.state.clone();
        let queue = queue.to_string();

        debug!(queue = %queue, consumer_tag = %consumer_tag, prefetch = prefetch, "In-memory consumer attached");

        let stream = async_stream::stream! {
            let _guard = guard;
            loop {
                let permit = match &limiter {
                    Some(limiter) => match limiter.clone().acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                    None => None,
                };

                let Some(message) = next_message(&server, &channel, &queue, &arrivals).await else {
                    break;
                };

                let acker: Box<dyn Acknowledger> = if no_ack {
                    Box::new(AutoAcked)
                } else {
                    Box::new(InMemoryAcker::new(
                        server.clone(),
                        channel.clone(),
                        queue.clone(),
                        message.clone(),
                        permit,
                    ))
                };
                yield message.into_delivery(acker);
            }
        };

        Ok(stream.boxed())
    }

    async fn basic_get(&self, queue: &str) -> BusResult<Option<Delivery>> {
        self.ensure_open()?;
        let message = self.server.pop(queue)?;
        Ok(message.map(|message| {
            let acker = InMemoryAcker::new(
                self.server.clone(),
                self.state.clone(),
                queue.to_string(),
                message.clone(),
                None,
            );
            message.into_delivery(Box::new(acker))
        }))
    }

    fn is_open(&self) -> bool {
        self.state.is_open()
    }

    async fn close(&self) -> BusResult<()> {
        if self.state.open.swap(false, Ordering::SeqCst) {
            self.state.closed.notify_waiters();
        }
        Ok(())
    }
}

/// Settles an in-memory delivery; an unsettled delivery is requeued when dropped.
struct InMemoryAcker {
    server: Arc<Server>,
    channel: Arc<ChannelState>,
    queue: String,
    message: StoredMessage,
    settled: AtomicBool,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl InMemoryAcker {
    fn new(
        server: Arc<Server>,
        channel: Arc<ChannelState>,
        queue: String,
        message: StoredMessage,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            server,
            channel,
            queue,
            message,
            settled: AtomicBool::new(false),
            permit: Mutex::new(permit),
        }
    }

    fn settle(&self) -> BusResult<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(BusError::InternalError(
                "delivery already settled".to_string(),
            ));
        }
        Ok(())
    }

    /// Free the prefetch slot; must run after the message has been placed
    fn release(&self) {
        lock(&self.permit).take();
    }

    fn closed_error(&self) -> BusError {
        BusError::ChannelClosed(format!(
            "channel closed before settlement; message requeued on '{}'",
            self.queue
        ))
    }
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(&self) -> BusResult<()> {
        self.settle()?;
        let result = if self.channel.is_open() {
            Ok(())
        } else {
            self.server.requeue(&self.queue, self.message.clone());
            Err(self.closed_error())
        };
        self.release();
        result
    }

    async fn nack(&self, requeue: bool) -> BusResult<()> {
        self.settle()?;
        let open = self.channel.is_open();
        if requeue || !open {
            self.server.requeue(&self.queue, self.message.clone());
        } else {
            self.server.dead_letter(&self.queue, self.message.clone());
        }
        self.release();

        if open {
            Ok(())
        } else {
            Err(self.closed_error())
        }
    }
}

impl Drop for InMemoryAcker {
    fn drop(&mut self) {
        if !self.settled.load(Ordering::SeqCst) {
            self.server.requeue(&self.queue, self.message.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn open_channel(broker: &InMemoryBroker) -> (Arc<dyn Connection>, Arc<dyn Channel>) {
        let connection = broker.connect().await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        (connection, channel)
    }

    async fn next_delivery(stream: &mut BoxStream<'static, Delivery>) -> Delivery {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timeout")
            .expect("stream ended")
    }

    #[test]
    fn test_topic_matching() {
        // Exact match
        assert!(topic_matches("order.placed", "order.placed"));

        // Single-word wildcard
        assert!(topic_matches("order.placed", "order.*"));
        assert!(topic_matches("order.placed", "*.placed"));
        assert!(!topic_matches("order.line.added", "order.*"));

        // Zero-or-more wildcard
        assert!(topic_matches("order", "order.#"));
        assert!(topic_matches("order.line.added", "order.#"));
        assert!(topic_matches("order.line.added", "#.added"));
        assert!(topic_matches("anything.at.all", "#"));
        assert!(!topic_matches("invoice.created", "order.#"));

        // Edge cases
        assert!(topic_matches("single", "*"));
        assert!(!topic_matches("one.two", "one"));
        assert!(topic_matches("a.b.c", "a.#.c"));
        assert!(topic_matches("a.c", "a.#.c"));
    }

    #[tokio::test]
    async fn test_topic_exchange_routes_to_matching_queues() {
        let broker = InMemoryBroker::new();
        let (_conn, channel) = open_channel(&broker).await;

        channel.exchange_declare("events", ExchangeKind::Topic, true).await.unwrap();
        channel.queue_declare("all", &QueueOptions::durable()).await.unwrap();
        channel.queue_declare("orders", &QueueOptions::durable()).await.unwrap();
        channel.queue_bind("events", "all", "#").await.unwrap();
        channel.queue_bind("events", "orders", "order.*").await.unwrap();

        channel
            .basic_publish("events", "order.placed", b"1".to_vec(), MessageProperties::default())
            .await
            .unwrap();
        channel
            .basic_publish("events", "invoice.issued", b"2".to_vec(), MessageProperties::default())
            .await
            .unwrap();

        assert_eq!(broker.queue_depth("all"), Some(2));
        assert_eq!(broker.queue_depth("orders"), Some(1));
    }

    #[tokio::test]
    async fn test_default_exchange_routes_by_queue_name() {
        let broker = InMemoryBroker::new();
        let (_conn, channel) = open_channel(&broker).await;

        channel.queue_declare("rpc_accounts", &QueueOptions::default()).await.unwrap();
        channel
            .basic_publish("", "rpc_accounts", b"{}".to_vec(), MessageProperties::default())
            .await
            .unwrap();
        channel
            .basic_publish("", "rpc_nobody", b"{}".to_vec(), MessageProperties::default())
            .await
            .unwrap();

        assert_eq!(broker.queue_depth("rpc_accounts"), Some(1));
    }

    #[tokio::test]
    async fn test_publish_to_missing_exchange_fails() {
        let broker = InMemoryBroker::new();
        let (_conn, channel) = open_channel(&broker).await;

        let result = channel
            .basic_publish("nope", "key", b"x".to_vec(), MessageProperties::default())
            .await;
        assert!(matches!(result, Err(BusError::PublishError(_))));
    }

    #[tokio::test]
    async fn test_conflicting_redeclaration() {
        let broker = InMemoryBroker::new();
        let (_conn, channel) = open_channel(&broker).await;

        channel.exchange_declare("events", ExchangeKind::Topic, true).await.unwrap();
        channel.exchange_declare("events", ExchangeKind::Topic, true).await.unwrap();
        let result = channel.exchange_declare("events", ExchangeKind::Fanout, true).await;
        assert!(matches!(result, Err(BusError::TopologyConflict(_))));

        channel.queue_declare("q", &QueueOptions::durable()).await.unwrap();
        channel.queue_declare("q", &QueueOptions::durable()).await.unwrap();
        let result = channel.queue_declare("q", &QueueOptions::default()).await;
        assert!(matches!(result, Err(BusError::TopologyConflict(_))));
    }

    #[tokio::test]
    async fn test_nack_requeues_at_head_with_redelivered_flag() {
        let broker = InMemoryBroker::new();
        let (_conn, channel) = open_channel(&broker).await;
        channel.basic_qos(1).await.unwrap();
        channel.queue_declare("work", &QueueOptions::durable()).await.unwrap();

        for body in [b"first".to_vec(), b"second".to_vec()] {
            channel
                .basic_publish("", "work", body, MessageProperties::default())
                .await
                .unwrap();
        }

        let mut stream = channel.basic_consume("work", "c1", false).await.unwrap();
        let delivery = next_delivery(&mut stream).await;
        assert_eq!(delivery.body, b"first");
        assert!(!delivery.redelivered);
        delivery.nack(true).await.unwrap();

        let delivery = next_delivery(&mut stream).await;
        assert_eq!(delivery.body, b"first");
        assert!(delivery.redelivered);
        delivery.ack().await.unwrap();

        let delivery = next_delivery(&mut stream).await;
        assert_eq!(delivery.body, b"second");
        delivery.ack().await.unwrap();
        assert_eq!(broker.queue_depth("work"), Some(0));
    }

    #[tokio::test]
    async fn test_prefetch_holds_back_until_settled() {
        let broker = InMemoryBroker::new();
        let (_conn, channel) = open_channel(&broker).await;
        channel.basic_qos(1).await.unwrap();
        channel.queue_declare("work", &QueueOptions::durable()).await.unwrap();

        let mut stream = channel.basic_consume("work", "c1", false).await.unwrap();
        for body in [b"a".to_vec(), b"b".to_vec()] {
            channel
                .basic_publish("", "work", body, MessageProperties::default())
                .await
                .unwrap();
        }

        let first = next_delivery(&mut stream).await;
        let blocked = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
        assert!(blocked.is_err(), "second delivery must wait for the first ack");
        assert_eq!(broker.queue_depth("work"), Some(1));

        first.ack().await.unwrap();
        let second = next_delivery(&mut stream).await;
        assert_eq!(second.body, b"b");
    }

    #[tokio::test]
    async fn test_reject_routes_to_dead_letter_exchange() {
        let broker = InMemoryBroker::new();
        let (_conn, channel) = open_channel(&broker).await;

        channel.exchange_declare("dlx", ExchangeKind::Topic, true).await.unwrap();
        channel.queue_declare("dlq", &QueueOptions::durable()).await.unwrap();
        channel.queue_bind("dlx", "dlq", "#").await.unwrap();
        channel
            .queue_declare("work", &QueueOptions::durable().with_dead_letter_exchange("dlx"))
            .await
            .unwrap();
        channel
            .basic_publish("", "work", b"poison".to_vec(), MessageProperties::default())
            .await
            .unwrap();

        let delivery = channel.basic_get("work").await.unwrap().expect("message");
        delivery.nack(false).await.unwrap();

        assert_eq!(broker.queue_depth("work"), Some(0));
        assert_eq!(broker.queue_depth("dlq"), Some(1));

        let dead = channel.basic_get("dlq").await.unwrap().expect("dead letter");
        assert_eq!(dead.routing_key, "work");
        assert_eq!(dead.body, b"poison");
    }

    #[tokio::test]
    async fn test_unsettled_delivery_requeued_on_drop() {
        let broker = InMemoryBroker::new();
        let (_conn, channel) = open_channel(&broker).await;
        channel.queue_declare("work", &QueueOptions::durable()).await.unwrap();
        channel
            .basic_publish("", "work", b"x".to_vec(), MessageProperties::default())
            .await
            .unwrap();

        let delivery = channel.basic_get("work").await.unwrap();
        assert_eq!(broker.queue_depth("work"), Some(0));
        drop(delivery);
        assert_eq!(broker.queue_depth("work"), Some(1));
    }

    #[tokio::test]
    async fn test_exclusive_queue_removed_with_connection() {
        let broker = InMemoryBroker::new();
        let (connection, channel) = open_channel(&broker).await;

        let info = channel
            .queue_declare("", &QueueOptions::exclusive_auto_delete())
            .await
            .unwrap();
        assert!(info.name.starts_with("amq.gen-"));
        assert!(broker.has_queue(&info.name));

        let (_other, other_channel) = open_channel(&broker).await;
        let result = other_channel
            .queue_declare(&info.name, &QueueOptions::exclusive_auto_delete())
            .await;
        assert!(matches!(result, Err(BusError::TopologyConflict(_))));

        connection.close().await.unwrap();
        assert!(!broker.has_queue(&info.name));
    }

    #[tokio::test]
    async fn test_disconnect_ends_consumer_streams() {
        let broker = InMemoryBroker::new();
        let (connection, channel) = open_channel(&broker).await;
        channel.queue_declare("work", &QueueOptions::durable()).await.unwrap();
        let mut stream = channel.basic_consume("work", "c1", false).await.unwrap();

        broker.disconnect_all();

        let next = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("stream should end promptly");
        assert!(next.is_none());
        assert!(!connection.is_open());
        assert!(!channel.is_open());
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_broker_refuses_connections() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);
        assert!(matches!(
            broker.connect().await,
            Err(BusError::ConnectionError(_))
        ));

        broker.set_reachable(true);
        assert!(broker.connect().await.is_ok());
    }
}
