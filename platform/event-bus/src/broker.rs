//! Broker: owns the transport connection and exposes topology, publish and consume.
//!
//! ## Acknowledgement policy
//!
//! Every consumer installed with `auto_ack = false` gets the same three-way contract:
//!
//! | Outcome                              | Settlement              | Effect                      |
//! |--------------------------------------|-------------------------|-----------------------------|
//! | handler returned `Ok`                | `ack`                   | message done                |
//! | body not JSON / [`ConsumeError::Decode`] | `nack`, no requeue  | dead-lettered, never retried |
//! | [`ConsumeError::Handler`]            | `nack`, requeue         | redelivered until it succeeds |
//!
//! Requeue-until-success assumes handlers are idempotent.

use crate::backoff::{reconnect_with_backoff, ReconnectPolicy};
use crate::transport::{
    Channel, Connection, Connector, Delivery, ExchangeKind, MessageProperties, QueueInfo,
    QueueOptions,
};
use crate::{BusError, BusResult};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{BoxStream, SelectAll, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, error, info, warn};

/// In-flight deliveries per consumer; 1 forces one-at-a-time processing
pub const DEFAULT_PREFETCH: u16 = 1;

/// How a consumer handler failed; decides between dead-lettering and redelivery
#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    /// The message can never be processed; it is dead-lettered
    #[error("undecodable message: {0}")]
    Decode(String),

    /// Processing failed this time; the message is requeued
    #[error("handler failed: {0}")]
    Handler(String),
}

impl ConsumeError {
    pub fn decode(reason: impl fmt::Display) -> Self {
        ConsumeError::Decode(reason.to_string())
    }

    pub fn handler(reason: impl fmt::Display) -> Self {
        ConsumeError::Handler(reason.to_string())
    }
}

/// A delivery whose body has been decoded as JSON
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Value,
    pub properties: MessageProperties,
    pub redelivered: bool,
}

pub type MessageHandler =
    Arc<dyn Fn(BusMessage) -> BoxFuture<'static, Result<(), ConsumeError>> + Send + Sync>;

/// Per-message publish flags
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub persistent: bool,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl PublishOptions {
    pub fn persistent() -> Self {
        Self {
            persistent: true,
            ..Default::default()
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

/// One live connection with its two channels
struct Session {
    connection: Arc<dyn Connection>,
    publish_channel: Arc<dyn Channel>,
    consume_channel: Arc<dyn Channel>,
}

impl Session {
    fn is_open(&self) -> bool {
        self.connection.is_open() && self.publish_channel.is_open() && self.consume_channel.is_open()
    }

    async fn close(&self) {
        for channel in [&self.publish_channel, &self.consume_channel] {
            if let Err(e) = channel.close().await {
                debug!(error = %e, "Error closing channel");
            }
        }
        if let Err(e) = self.connection.close().await {
            debug!(error = %e, "Error closing connection");
        }
    }
}

struct Consumer {
    queue: String,
    tag: String,
    handler: MessageHandler,
    auto_ack: bool,
}

enum Settlement {
    Ack,
    Requeue,
    Reject,
}

enum SessionEnd {
    Stopped,
    Lost,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connection owner and raw publish/consume surface
///
/// Construct one per process at startup, share it as `Arc<Broker>`, and call
/// [`Broker::close`] at teardown. The connection is opened lazily on first use
/// and rebuilt transparently whenever it is found closed.
///
/// # Example
/// ```rust
/// use event_bus::{Broker, BusMessage, ConsumeError, InMemoryBroker, QueueOptions};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = Arc::new(Broker::new(Arc::new(InMemoryBroker::new())));
/// broker.declare_queue("audit", &QueueOptions::durable()).await?;
///
/// broker
///     .consume("audit", |msg: BusMessage| async move {
///         tracing::info!(routing_key = %msg.routing_key, "audited");
///         Ok::<(), ConsumeError>(())
///     }, false)
///     .await?;
///
/// let consumer = broker.clone();
/// tokio::spawn(async move { consumer.start_consuming().await });
/// # Ok(())
/// # }
/// ```
pub struct Broker {
    connector: Arc<dyn Connector>,
    prefetch_count: u16,
    reconnect_policy: ReconnectPolicy,
    /// Guarded by the connect lock: at most one (re)connect in flight
    session: Mutex<Option<Arc<Session>>>,
    connected: AtomicBool,
    consumers: StdMutex<Vec<Arc<Consumer>>>,
    consumer_added: Notify,
    consuming: AtomicBool,
    stop: watch::Sender<bool>,
    next_tag: AtomicU64,
}

impl Broker {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            connector,
            prefetch_count: DEFAULT_PREFETCH,
            reconnect_policy: ReconnectPolicy::default(),
            session: Mutex::new(None),
            connected: AtomicBool::new(false),
            consumers: StdMutex::new(Vec::new()),
            consumer_added: Notify::new(),
            consuming: AtomicBool::new(false),
            stop,
            next_tag: AtomicU64::new(1),
        }
    }

    pub fn with_prefetch(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }

    /// Open the connection and both channels; no-op while an open connection exists
    ///
    /// # Errors
    /// [`BusError::ConnectionError`] if the server cannot be reached. Not retried here.
    pub async fn connect(&self) -> BusResult<()> {
        self.session().await.map(|_| ())
    }

    /// Reconnect if the liveness flag is down or the transport reports closed
    pub async fn ensure_connected(&self) -> BusResult<()> {
        self.connect().await
    }

    pub async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
            && self
                .session
                .lock()
                .await
                .as_ref()
                .is_some_and(|session| session.is_open())
    }

    pub fn is_consuming(&self) -> bool {
        self.consuming.load(Ordering::SeqCst)
    }

    async fn session(&self) -> BusResult<Arc<Session>> {
        let mut current = self.session.lock().await;

        if let Some(session) = current.as_ref() {
            if self.connected.load(Ordering::SeqCst) && session.is_open() {
                return Ok(session.clone());
            }
            warn!("Broker connection lost, reconnecting");
            session.close().await;
        }
        *current = None;

        match self.open_session().await {
            Ok(session) => {
                let session = Arc::new(session);
                *current = Some(session.clone());
                self.connected.store(true, Ordering::SeqCst);
                info!(prefetch = self.prefetch_count, "Connected to message broker");
                Ok(session)
            }
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                error!(error = %e, "Failed to connect to message broker");
                Err(match e {
                    BusError::ConnectionError(_) => e,
                    other => BusError::ConnectionError(other.to_string()),
                })
            }
        }
    }

    async fn open_session(&self) -> BusResult<Session> {
        let connection = self.connector.connect().await?;
        let publish_channel = connection.create_channel().await?;
        let consume_channel = connection.create_channel().await?;

        publish_channel.basic_qos(self.prefetch_count).await?;
        consume_channel.basic_qos(self.prefetch_count).await?;

        Ok(Session {
            connection,
            publish_channel,
            consume_channel,
        })
    }

    /// Tear the connection down; the next operation reconnects lazily
    pub async fn close(&self) {
        self.stop_consuming();

        let mut current = self.session.lock().await;
        if let Some(session) = current.take() {
            session.close().await;
            info!("Broker connection closed");
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    pub async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> BusResult<()> {
        let session = self.session().await?;
        session
            .publish_channel
            .exchange_declare(name, kind, durable)
            .await?;
        debug!(exchange = %name, kind = %kind, durable = durable, "Exchange declared");
        Ok(())
    }

    pub async fn declare_queue(&self, name: &str, options: &QueueOptions) -> BusResult<QueueInfo> {
        let session = self.session().await?;
        let info = session.publish_channel.queue_declare(name, options).await?;
        debug!(queue = %info.name, durable = options.durable, "Queue declared");
        Ok(info)
    }

    pub async fn bind_queue(&self, exchange: &str, queue: &str, routing_key: &str) -> BusResult<()> {
        let session = self.session().await?;
        session
            .publish_channel
            .queue_bind(exchange, queue, routing_key)
            .await?;
        debug!(exchange = %exchange, queue = %queue, routing_key = %routing_key, "Queue bound");
        Ok(())
    }

    /// Serialize `body` as JSON and publish it
    ///
    /// # Errors
    /// - [`BusError::SerializationError`] if `body` cannot be encoded
    /// - [`BusError::PublishError`] if the transport rejected the message; when the
    ///   connection is gone it is rebuilt before returning, so a retry starts fresh
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &T,
        options: PublishOptions,
    ) -> BusResult<()> {
        let body =
            serde_json::to_vec(body).map_err(|e| BusError::SerializationError(e.to_string()))?;
        self.publish_bytes(exchange, routing_key, body, options).await
    }

    /// Publish an already-encoded body
    pub async fn publish_bytes(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        options: PublishOptions,
    ) -> BusResult<()> {
        let session = self.session().await?;
        let properties = MessageProperties::json()
            .with_persistent(options.persistent)
            .with_correlation_id(options.correlation_id)
            .with_reply_to(options.reply_to);

        match session
            .publish_channel
            .basic_publish(exchange, routing_key, body, properties)
            .await
        {
            Ok(()) => {
                debug!(exchange = %exchange, routing_key = %routing_key, "Message published");
                Ok(())
            }
            Err(e) => {
                error!(exchange = %exchange, routing_key = %routing_key, error = %e, "Failed to publish message");

                if !session.is_open() {
                    self.connected.store(false, Ordering::SeqCst);
                    if let Err(reconnect) = self.session().await {
                        warn!(error = %reconnect, "Reconnect after failed publish did not succeed");
                    }
                }

                Err(match e {
                    BusError::PublishError(_) => e,
                    other => BusError::PublishError(other.to_string()),
                })
            }
        }
    }

    /// Pull one message from `queue` without a consumer
    pub async fn get(&self, queue: &str) -> BusResult<Option<Delivery>> {
        let session = self.session().await?;
        session.publish_channel.basic_get(queue).await
    }

    /// Install a handler on `queue`; deliveries flow once [`Broker::start_consuming`] runs
    ///
    /// The body is decoded as JSON before `handler` sees it. Settlement follows
    /// the policy in the module docs unless `auto_ack` is set.
    pub async fn consume<F, Fut>(&self, queue: &str, handler: F, auto_ack: bool) -> BusResult<()>
    where
        F: Fn(BusMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ConsumeError>> + Send + 'static,
    {
        self.ensure_connected().await?;

        let handler: MessageHandler = Arc::new(move |message| handler(message).boxed());
        let tag = format!("{}-{}", queue, self.next_tag.fetch_add(1, Ordering::SeqCst));

        info!(queue = %queue, consumer_tag = %tag, auto_ack = auto_ack, "Consumer registered");

        lock(&self.consumers).push(Arc::new(Consumer {
            queue: queue.to_string(),
            tag,
            handler,
            auto_ack,
        }));
        self.consumer_added.notify_one();
        Ok(())
    }

    /// Run the delivery loop until [`Broker::stop_consuming`] is called
    ///
    /// Deliveries are dispatched one at a time; a stop request is honoured
    /// between deliveries, never during a handler. A dropped connection is
    /// re-established with backoff and every consumer re-attached.
    pub async fn start_consuming(&self) -> BusResult<()> {
        if self.consuming.swap(true, Ordering::SeqCst) {
            warn!("Consume loop already running");
            return Ok(());
        }

        self.stop.send_replace(false);
        let mut stop = self.stop.subscribe();

        info!("Starting message consumption");
        let result = self.consume_loop(&mut stop).await;
        self.consuming.store(false, Ordering::SeqCst);

        match &result {
            Ok(()) => info!("Message consumption stopped"),
            Err(e) => error!(error = %e, "Message consumption aborted"),
        }
        result
    }

    pub fn stop_consuming(&self) {
        if self.is_consuming() {
            info!("Stopping message consumption");
        }
        self.stop.send_replace(true);
    }

    async fn consume_loop(&self, stop: &mut watch::Receiver<bool>) -> BusResult<()> {
        loop {
            if *stop.borrow_and_update() {
                return Ok(());
            }

            let Some(session) =
                reconnect_with_backoff(|| self.session(), &self.reconnect_policy, stop).await?
            else {
                return Ok(());
            };

            match self.run_session(&session, stop).await? {
                SessionEnd::Stopped => return Ok(()),
                // A publish may already have rebuilt the session; session() only
                // replaces it if it is still the closed one
                SessionEnd::Lost => warn!("Lost broker connection while consuming, reconnecting"),
            }
        }
    }

    async fn run_session(
        &self,
        session: &Session,
        stop: &mut watch::Receiver<bool>,
    ) -> BusResult<SessionEnd> {
        let mut deliveries: SelectAll<BoxStream<'static, (Arc<Consumer>, Delivery)>> =
            SelectAll::new();
        let mut attached = 0;

        loop {
            // Attach consumers registered since the last pass
            let pending: Vec<Arc<Consumer>> = lock(&self.consumers)[attached..].to_vec();
            for consumer in pending {
                match session
                    .consume_channel
                    .basic_consume(&consumer.queue, &consumer.tag, consumer.auto_ack)
                    .await
                {
                    Ok(stream) => {
                        debug!(queue = %consumer.queue, consumer_tag = %consumer.tag, "Consumer attached");
                        let owner = consumer.clone();
                        deliveries.push(stream.map(move |d| (owner.clone(), d)).boxed());
                        attached += 1;
                    }
                    Err(e) if !session.is_open() => {
                        warn!(queue = %consumer.queue, error = %e, "Connection lost while attaching consumer");
                        return Ok(SessionEnd::Lost);
                    }
                    Err(e) => {
                        return Err(BusError::SubscribeError(format!(
                            "queue '{}': {}",
                            consumer.queue, e
                        )));
                    }
                }
            }

            tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow_and_update() {
                        return Ok(SessionEnd::Stopped);
                    }
                }
                _ = self.consumer_added.notified() => {}
                next = deliveries.next(), if !deliveries.is_empty() => match next {
                    Some((consumer, delivery)) => self.dispatch(&consumer, delivery).await,
                    None => return Ok(SessionEnd::Lost),
                },
            }
        }
    }

    async fn dispatch(&self, consumer: &Consumer, delivery: Delivery) {
        let body = match serde_json::from_slice::<Value>(&delivery.body) {
            Ok(body) => body,
            Err(e) => {
                error!(
                    queue = %consumer.queue,
                    routing_key = %delivery.routing_key,
                    error = %e,
                    "Failed to decode message body, dead-lettering"
                );
                self.settle(consumer, &delivery, Settlement::Reject).await;
                return;
            }
        };

        let message = BusMessage {
            exchange: delivery.exchange.clone(),
            routing_key: delivery.routing_key.clone(),
            body,
            properties: delivery.properties.clone(),
            redelivered: delivery.redelivered,
        };

        let settlement = match (consumer.handler)(message).await {
            Ok(()) => Settlement::Ack,
            Err(ConsumeError::Decode(reason)) => {
                error!(
                    queue = %consumer.queue,
                    routing_key = %delivery.routing_key,
                    reason = %reason,
                    "Message rejected as undecodable, dead-lettering"
                );
                Settlement::Reject
            }
            Err(ConsumeError::Handler(reason)) => {
                warn!(
                    queue = %consumer.queue,
                    routing_key = %delivery.routing_key,
                    redelivered = delivery.redelivered,
                    reason = %reason,
                    "Handler failed, requeueing message"
                );
                Settlement::Requeue
            }
        };

        self.settle(consumer, &delivery, settlement).await;
    }

    async fn settle(&self, consumer: &Consumer, delivery: &Delivery, settlement: Settlement) {
        if consumer.auto_ack {
            return;
        }

        let result = match settlement {
            Settlement::Ack => delivery.ack().await,
            Settlement::Requeue => delivery.nack(true).await,
            Settlement::Reject => delivery.nack(false).await,
        };

        if let Err(e) = result {
            warn!(queue = %consumer.queue, error = %e, "Failed to settle delivery");
        }
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("prefetch_count", &self.prefetch_count)
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .field("consuming", &self.is_consuming())
            .field("consumers", &lock(&self.consumers).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryBroker;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn broker(server: &InMemoryBroker) -> Arc<Broker> {
        Arc::new(Broker::new(Arc::new(server.clone())))
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let server = InMemoryBroker::new();
        let broker = broker(&server);

        broker.connect().await.unwrap();
        broker.connect().await.unwrap();

        assert!(broker.is_connected().await);
        assert_eq!(server.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_connect_fails_when_unreachable() {
        let server = InMemoryBroker::new();
        server.set_reachable(false);
        let broker = broker(&server);

        assert!(matches!(
            broker.connect().await,
            Err(BusError::ConnectionError(_))
        ));
        assert!(!broker.is_connected().await);
    }

    #[tokio::test]
    async fn test_publish_reconnects_after_connection_loss() {
        let server = InMemoryBroker::new();
        let broker = broker(&server);
        broker.declare_queue("work", &QueueOptions::durable()).await.unwrap();

        server.disconnect_all();
        assert!(!broker.is_connected().await);

        broker
            .publish("", "work", &json!({"n": 1}), PublishOptions::persistent())
            .await
            .unwrap();

        assert_eq!(server.queue_depth("work"), Some(1));
        assert!(broker.is_connected().await);
    }

    #[tokio::test]
    async fn test_publish_sets_properties() {
        let server = InMemoryBroker::new();
        let broker = broker(&server);
        broker.declare_queue("work", &QueueOptions::durable()).await.unwrap();

        broker
            .publish(
                "",
                "work",
                &json!({"n": 1}),
                PublishOptions::persistent()
                    .with_correlation_id("corr-1")
                    .with_reply_to("replies"),
            )
            .await
            .unwrap();

        let delivery = broker.get("work").await.unwrap().expect("message");
        assert!(delivery.properties.persistent);
        assert_eq!(delivery.properties.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(delivery.properties.reply_to.as_deref(), Some("replies"));
        assert_eq!(
            delivery.properties.content_type.as_deref(),
            Some(crate::transport::JSON_CONTENT_TYPE)
        );
        delivery.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_topology_conflict_surfaces() {
        let server = InMemoryBroker::new();
        let broker = broker(&server);

        broker.declare_exchange("events", ExchangeKind::Topic, true).await.unwrap();
        let result = broker.declare_exchange("events", ExchangeKind::Direct, true).await;
        assert!(matches!(result, Err(BusError::TopologyConflict(_))));
    }

    #[tokio::test]
    async fn test_consume_acks_on_success() {
        let server = InMemoryBroker::new();
        let broker = broker(&server);
        broker.declare_queue("work", &QueueOptions::durable()).await.unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        broker
            .consume(
                "work",
                move |msg: BusMessage| {
                    let counter = counter.clone();
                    async move {
                        assert_eq!(msg.body["n"], 7);
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                false,
            )
            .await
            .unwrap();

        let runner = broker.clone();
        let handle = tokio::spawn(async move { runner.start_consuming().await });

        broker
            .publish("", "work", &json!({"n": 7}), PublishOptions::persistent())
            .await
            .unwrap();

        wait_for(|| seen.load(Ordering::SeqCst) == 1).await;
        wait_for(|| server.queue_depth("work") == Some(0)).await;

        broker.stop_consuming();
        handle.await.unwrap().unwrap();
        assert!(!broker.is_consuming());
    }

    #[tokio::test]
    async fn test_undecodable_body_is_rejected_without_requeue() {
        let server = InMemoryBroker::new();
        let broker = broker(&server);
        broker.declare_queue("work", &QueueOptions::durable()).await.unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        broker
            .consume(
                "work",
                move |_msg: BusMessage| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                false,
            )
            .await
            .unwrap();

        broker
            .publish_bytes("", "work", b"{not json".to_vec(), PublishOptions::persistent())
            .await
            .unwrap();

        let runner = broker.clone();
        let handle = tokio::spawn(async move { runner.start_consuming().await });

        wait_for(|| server.queue_depth("work") == Some(0)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(server.queue_depth("work"), Some(0));

        broker.stop_consuming();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_start_consuming_twice_is_noop() {
        let server = InMemoryBroker::new();
        let broker = broker(&server);

        let runner = broker.clone();
        let handle = tokio::spawn(async move { runner.start_consuming().await });
        wait_for(|| broker.is_consuming()).await;

        // Second entry returns immediately instead of blocking
        tokio::time::timeout(Duration::from_millis(200), broker.start_consuming())
            .await
            .expect("second start_consuming must not block")
            .unwrap();

        broker.stop_consuming();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_then_lazy_reconnect() {
        let server = InMemoryBroker::new();
        let broker = broker(&server);
        broker.connect().await.unwrap();

        broker.close().await;
        assert!(!broker.is_connected().await);
        assert_eq!(server.open_connections(), 0);

        broker.declare_queue("later", &QueueOptions::durable()).await.unwrap();
        assert!(broker.is_connected().await);
    }
}
