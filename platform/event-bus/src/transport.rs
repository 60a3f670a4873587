//! Transport seam between the [`Broker`](crate::Broker) and an AMQP 0-9-1 style server.
//!
//! The broker never touches a socket directly. It drives a [`Connector`] that
//! opens [`Connection`]s, each of which hands out logical [`Channel`]s. Two
//! implementations ship with the crate:
//!
//! - [`AmqpConnector`](crate::AmqpConnector): RabbitMQ via `lapin`
//! - [`InMemoryBroker`](crate::InMemoryBroker): process-local broker for tests and dev

use crate::BusResult;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Exchange routing discipline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Routing key must equal the binding key
    Direct,
    /// Every bound queue receives every message
    Fanout,
    /// Dot-separated words; `*` matches one word, `#` matches zero or more
    Topic,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue declaration parameters
///
/// Two declarations of the same queue are compatible only when every field
/// matches; anything else is a [`BusError::TopologyConflict`](crate::BusError::TopologyConflict).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    /// Owned by the declaring connection and deleted when it closes
    pub exclusive: bool,
    /// Deleted once its last consumer goes away
    pub auto_delete: bool,
    /// `x-dead-letter-exchange` argument
    pub dead_letter_exchange: Option<String>,
    /// `x-dead-letter-routing-key` argument; the original key is kept when unset
    pub dead_letter_routing_key: Option<String>,
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Default::default()
        }
    }

    /// Server-named reply queue: exclusive and auto-deleting
    pub fn exclusive_auto_delete() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
            ..Default::default()
        }
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    pub fn with_dead_letter_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.dead_letter_routing_key = Some(routing_key.into());
        self
    }
}

/// Result of a queue declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    /// Actual queue name (server-chosen when declared with an empty name)
    pub name: String,
    /// Messages ready for delivery at declaration time
    pub message_count: u32,
}

/// Transport metadata attached to a message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Delivery mode 2: survives a broker restart
    pub persistent: bool,
}

impl MessageProperties {
    pub fn json() -> Self {
        Self {
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            ..Default::default()
        }
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_reply_to(mut self, reply_to: Option<String>) -> Self {
        self.reply_to = reply_to;
        self
    }
}

/// Settles a single delivery with the server
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> BusResult<()>;

    async fn nack(&self, requeue: bool) -> BusResult<()>;
}

/// Acknowledger for deliveries consumed with `no_ack`; settling is a no-op.
pub(crate) struct AutoAcked;

#[async_trait]
impl Acknowledger for AutoAcked {
    async fn ack(&self) -> BusResult<()> {
        Ok(())
    }

    async fn nack(&self, _requeue: bool) -> BusResult<()> {
        Ok(())
    }
}

/// A message handed to a consumer, still awaiting settlement
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    /// Set when the server has delivered this message before
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        exchange: String,
        routing_key: String,
        body: Vec<u8>,
        properties: MessageProperties,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            exchange,
            routing_key,
            body,
            properties,
            redelivered,
            acker,
        }
    }

    pub async fn ack(&self) -> BusResult<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> BusResult<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("body_len", &self.body.len())
            .field("properties", &self.properties)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// A logical channel multiplexed over a [`Connection`]
#[async_trait]
pub trait Channel: Send + Sync {
    /// Cap on unacknowledged deliveries per consumer on this channel
    async fn basic_qos(&self, prefetch_count: u16) -> BusResult<()>;

    async fn exchange_declare(&self, name: &str, kind: ExchangeKind, durable: bool)
        -> BusResult<()>;

    /// Declare a queue; an empty `name` asks the server to choose one
    async fn queue_declare(&self, name: &str, options: &QueueOptions) -> BusResult<QueueInfo>;

    async fn queue_bind(&self, exchange: &str, queue: &str, routing_key: &str) -> BusResult<()>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> BusResult<()>;

    /// Start a consumer; the stream ends when the consumer or its channel is gone
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> BusResult<BoxStream<'static, Delivery>>;

    /// Pull a single message, if one is ready
    async fn basic_get(&self, queue: &str) -> BusResult<Option<Delivery>>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> BusResult<()>;
}

/// One transport connection to the server
#[async_trait]
pub trait Connection: Send + Sync {
    async fn create_channel(&self) -> BusResult<Arc<dyn Channel>>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> BusResult<()>;
}

/// Factory for transport connections
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> BusResult<Arc<dyn Connection>>;
}

impl fmt::Debug for dyn Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Connector")
    }
}
