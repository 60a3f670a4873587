//! Domain event bus on the `domain_events` topic exchange.
//!
//! ## Topology
//!
//! ```text
//! domain_events (topic) --<event type, lower-cased>--> subscriber queues
//!                                                          |
//!                                                 nack without requeue
//!                                                          v
//! dlx.domain_events (topic) --#--> dlq.domain_events
//! ```
//!
//! Every subscriber queue is declared with `dlx.domain_events` as its
//! dead-letter exchange, so an undecodable event ends up in
//! `dlq.domain_events` instead of bouncing forever.

use crate::broker::{Broker, BusMessage, ConsumeError, PublishOptions};
use crate::envelope::{DomainEvent, EventEnvelope, Serializable};
use crate::registry::{AnyEvent, EventRegistry};
use crate::subscriber::{Subscriber, Subscription};
use crate::transport::{ExchangeKind, QueueOptions};
use crate::BusResult;
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{error, info, warn};

pub const DOMAIN_EVENTS_EXCHANGE: &str = "domain_events";
pub const DEAD_LETTER_EXCHANGE: &str = "dlx.domain_events";
pub const DEAD_LETTER_QUEUE: &str = "dlq.domain_events";

/// Error type returned by subscriber callbacks
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type EventCallback = Arc<dyn Fn(AnyEvent) -> BoxFuture<'static, Result<(), ConsumeError>> + Send + Sync>;

/// Callbacks installed on one queue, keyed by lower-cased event type
type QueueRoutes = Arc<RwLock<HashMap<String, EventCallback>>>;

/// Routing key an event type is published and bound under
pub fn routing_key_for(event_type: &str) -> String {
    event_type.to_lowercase()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Liveness summary for health endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BusHealth {
    pub running: bool,
    pub broker_connected: bool,
    pub subscriptions: usize,
}

/// Typed publish/subscribe over a shared [`Broker`]
pub struct EventBus {
    broker: Arc<Broker>,
    registry: EventRegistry,
    running: AtomicBool,
    queues: Mutex<HashMap<String, QueueRoutes>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl EventBus {
    /// Declare the event topology and return a bus ready for subscriptions
    ///
    /// # Errors
    /// [`BusError::ConnectionError`](crate::BusError::ConnectionError) if the
    /// broker is unreachable, or
    /// [`BusError::TopologyConflict`](crate::BusError::TopologyConflict) if
    /// the exchanges or dead-letter queue exist with other properties.
    pub async fn new(broker: Arc<Broker>, registry: EventRegistry) -> BusResult<Self> {
        broker
            .declare_exchange(DOMAIN_EVENTS_EXCHANGE, ExchangeKind::Topic, true)
            .await?;
        broker
            .declare_exchange(DEAD_LETTER_EXCHANGE, ExchangeKind::Topic, true)
            .await?;
        broker
            .declare_queue(DEAD_LETTER_QUEUE, &QueueOptions::durable())
            .await?;
        broker
            .bind_queue(DEAD_LETTER_EXCHANGE, DEAD_LETTER_QUEUE, "#")
            .await?;

        info!(
            exchange = DOMAIN_EVENTS_EXCHANGE,
            dead_letter_queue = DEAD_LETTER_QUEUE,
            "Event bus topology declared"
        );

        Ok(Self {
            broker,
            registry,
            running: AtomicBool::new(false),
            queues: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    /// Publish an event; the routing key defaults to its lower-cased type tag
    ///
    /// Never fails: the outcome is the returned flag, and the cause is logged.
    pub async fn publish<S: Serializable + ?Sized>(&self, event: &S, routing_key: Option<&str>) -> bool {
        let routing_key = match routing_key {
            Some(key) => key.to_string(),
            None => routing_key_for(event.event_type()),
        };

        let body = match event.to_wire() {
            Ok(body) => body,
            Err(e) => {
                error!(event_type = %event.event_type(), error = %e, "Failed to encode event");
                return false;
            }
        };

        match self
            .broker
            .publish(DOMAIN_EVENTS_EXCHANGE, &routing_key, &body, PublishOptions::persistent())
            .await
        {
            Ok(()) => {
                info!(event_type = %event.event_type(), routing_key = %routing_key, "Published event");
                true
            }
            Err(e) => {
                error!(
                    event_type = %event.event_type(),
                    routing_key = %routing_key,
                    error = %e,
                    "Failed to publish event"
                );
                false
            }
        }
    }

    /// Bind `queue_name` to `event_type` and run `callback` for each event
    ///
    /// The callback receives the event as resolved through the registry. An
    /// event that cannot be reconstructed is dead-lettered without reaching
    /// the callback; a callback error requeues the event for redelivery.
    pub async fn subscribe<F, Fut>(
        &self,
        queue_name: &str,
        event_type: &str,
        callback: F,
        durable: bool,
    ) -> BusResult<()>
    where
        F: Fn(AnyEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let handler = std::any::type_name::<F>().to_string();
        let callback: EventCallback = Arc::new(move |event| {
            callback(event)
                .map(|result| result.map_err(ConsumeError::handler))
                .boxed()
        });
        self.install(queue_name, event_type, callback, durable, handler)
            .await
    }

    /// Like [`EventBus::subscribe`], but registers `E` and hands the callback
    /// a typed envelope
    pub async fn subscribe_typed<E, F, Fut>(&self, queue_name: &str, callback: F, durable: bool) -> BusResult<()>
    where
        E: DomainEvent,
        F: Fn(EventEnvelope<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.registry.register::<E>();

        let handler = std::any::type_name::<F>().to_string();
        let callback = Arc::new(callback);
        let callback: EventCallback = Arc::new(move |event: AnyEvent| {
            let callback = callback.clone();
            async move {
                let typed = event.downcast::<E>().ok_or_else(|| {
                    ConsumeError::Decode(format!(
                        "event type '{}' is not registered as {}",
                        event.event_type(),
                        std::any::type_name::<E>()
                    ))
                })?;
                callback(typed).await.map_err(ConsumeError::handler)
            }
            .boxed()
        });
        self.install(queue_name, E::EVENT_TYPE, callback, durable, handler)
            .await
    }

    async fn install(
        &self,
        queue_name: &str,
        event_type: &str,
        callback: EventCallback,
        durable: bool,
        handler: String,
    ) -> BusResult<()> {
        let routing_key = routing_key_for(event_type);
        let options = QueueOptions::durable()
            .with_durable(durable)
            .with_dead_letter_exchange(DEAD_LETTER_EXCHANGE);

        self.broker.declare_queue(queue_name, &options).await?;
        self.broker
            .bind_queue(DOMAIN_EVENTS_EXCHANGE, queue_name, &routing_key)
            .await?;

        // One consumer per queue; further event types on it share the dispatch table
        let (routes, first_on_queue) = {
            let mut queues = lock(&self.queues);
            match queues.get(queue_name) {
                Some(routes) => (routes.clone(), false),
                None => {
                    let routes: QueueRoutes = Arc::default();
                    queues.insert(queue_name.to_string(), routes.clone());
                    (routes, true)
                }
            }
        };
        routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(routing_key.clone(), callback);

        if first_on_queue {
            let registry = self.registry.clone();
            let queue = queue_name.to_string();
            let consumed = self
                .broker
                .consume(
                    queue_name,
                    move |message: BusMessage| {
                        dispatch_event(registry.clone(), routes.clone(), queue.clone(), message)
                    },
                    false,
                )
                .await;

            if let Err(e) = consumed {
                lock(&self.queues).remove(queue_name);
                return Err(e);
            }
        }

        lock(&self.subscriptions).push(Subscription {
            queue_name: queue_name.to_string(),
            event_type: event_type.to_string(),
            handler,
        });

        info!(event_type = %event_type, queue = %queue_name, routing_key = %routing_key, "Subscribed to event");
        Ok(())
    }

    /// Run the consume loop until [`EventBus::stop`]; no-op if already running
    pub async fn start(&self) -> BusResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Event bus already running");
            return Ok(());
        }

        info!("Starting event bus");
        let result = self.broker.start_consuming().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping event bus");
        self.broker.stop_consuming();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn health_check(&self) -> BusHealth {
        BusHealth {
            running: self.is_running(),
            broker_connected: self.broker.is_connected().await,
            subscriptions: lock(&self.subscriptions).len(),
        }
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        lock(&self.subscriptions).clone()
    }

    pub async fn register_subscriber(&self, subscriber: &dyn Subscriber) -> BusResult<()> {
        info!(service = %subscriber.service_name(), "Registering subscriber");
        subscriber.subscribe_to_events(self).await
    }

    /// Messages currently waiting in the dead-letter queue
    pub async fn dead_letter_count(&self) -> BusResult<u32> {
        let info = self
            .broker
            .declare_queue(DEAD_LETTER_QUEUE, &QueueOptions::durable())
            .await?;
        Ok(info.message_count)
    }

    /// Move up to `max` dead letters back onto `domain_events` under their
    /// original routing keys; returns how many were replayed
    pub async fn replay_dead_letters(&self, max: usize) -> BusResult<usize> {
        let mut replayed = 0;

        while replayed < max {
            let Some(delivery) = self.broker.get(DEAD_LETTER_QUEUE).await? else {
                break;
            };

            let mut options = PublishOptions::persistent();
            options.correlation_id = delivery.properties.correlation_id.clone();

            if let Err(e) = self
                .broker
                .publish_bytes(
                    DOMAIN_EVENTS_EXCHANGE,
                    &delivery.routing_key,
                    delivery.body.clone(),
                    options,
                )
                .await
            {
                if let Err(nack) = delivery.nack(true).await {
                    warn!(error = %nack, "Failed to return dead letter to queue");
                }
                return Err(e);
            }

            delivery.ack().await?;
            replayed += 1;
        }

        info!(replayed = replayed, "Replayed dead letters");
        Ok(replayed)
    }
}

async fn dispatch_event(
    registry: EventRegistry,
    routes: QueueRoutes,
    queue: String,
    message: BusMessage,
) -> Result<(), ConsumeError> {
    let event = registry.construct_from_wire(&message.body).map_err(|e| {
        error!(queue = %queue, routing_key = %message.routing_key, error = %e, "Failed to reconstruct event");
        ConsumeError::decode(e)
    })?;

    let callback = routes
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&routing_key_for(event.event_type()))
        .cloned()
        .ok_or_else(|| {
            ConsumeError::Decode(format!(
                "no subscription for event type '{}' on queue '{}'",
                event.event_type(),
                queue
            ))
        })?;

    info!(
        event_type = %event.event_type(),
        event_id = %event.raw().event_id(),
        correlation_id = %event.raw().correlation_id(),
        queue = %queue,
        "Processing event"
    );

    callback(event).await
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("running", &self.is_running())
            .field("subscriptions", &lock(&self.subscriptions).len())
            .finish()
    }
}
