//! # Event Bus
//!
//! Messaging layer for services that talk over an AMQP topic exchange.
//!
//! ## Layers
//!
//! - **Broker**: owns the connection, declares topology, publishes and consumes
//!   JSON messages with a fixed ack/nack policy
//! - **EventBus**: domain events on the `domain_events` topic exchange, with a
//!   dead-letter queue for poison messages
//! - **RpcClient / RpcServer**: request/reply over per-service queues, matched
//!   by correlation id
//! - **EventRegistry**: maps a wire type tag back to its payload type
//!
//! ## Transports
//!
//! - **AmqpConnector**: production transport over a RabbitMQ-compatible server
//! - **InMemoryBroker**: in-process server with the same routing and
//!   settlement semantics, for dev and tests
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{Broker, DomainEvent, EventBus, EventEnvelope, EventRegistry, InMemoryBroker};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct UserRegistered {
//!     user_id: String,
//! }
//!
//! impl DomainEvent for UserRegistered {
//!     const EVENT_TYPE: &'static str = "UserRegistered";
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = Arc::new(Broker::new(Arc::new(InMemoryBroker::new())));
//! let registry = EventRegistry::new();
//! registry.register::<UserRegistered>();
//!
//! let bus = Arc::new(EventBus::new(broker, registry).await?);
//!
//! bus.subscribe_typed::<UserRegistered, _, _>("notifications.users", |event| async move {
//!     tracing::info!(user_id = %event.payload().user_id, "welcome mail queued");
//!     Ok(())
//! }, true)
//! .await?;
//!
//! let runner = bus.clone();
//! tokio::spawn(async move { runner.start().await });
//!
//! let event = EventEnvelope::new(UserRegistered { user_id: "u_1".into() });
//! assert!(bus.publish(&event, None).await);
//! # Ok(())
//! # }
//! ```

mod amqp_transport;
pub mod backoff;
mod broker;
mod bus;
pub mod config;
mod envelope;
mod inmemory_broker;
mod registry;
pub mod rpc;
mod subscriber;
pub mod transport;

pub use amqp_transport::AmqpConnector;
pub use broker::{
    Broker, BusMessage, ConsumeError, MessageHandler, PublishOptions, DEFAULT_PREFETCH,
};
pub use bus::{
    routing_key_for, BoxError, BusHealth, EventBus, DEAD_LETTER_EXCHANGE, DEAD_LETTER_QUEUE,
    DOMAIN_EVENTS_EXCHANGE,
};
pub use config::{BrokerConfig, BusType, ConfigError};
pub use envelope::{
    validate_envelope_fields, DomainEvent, EventEnvelope, EventError, RawEvent, Serializable,
};
pub use inmemory_broker::InMemoryBroker;
pub use registry::{AnyEvent, EventConstructor, EventRegistry};
pub use rpc::{RpcClient, RpcError, RpcServer};
pub use subscriber::{Subscriber, Subscription};
pub use transport::{
    Channel, Connection, Connector, Delivery, ExchangeKind, MessageProperties, QueueInfo,
    QueueOptions,
};

/// Errors that can occur when talking to the broker
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("failed to subscribe: {0}")]
    SubscribeError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// Redeclaration with different properties than the existing entity
    #[error("topology conflict: {0}")]
    TopologyConflict(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

/// Result type for broker operations
pub type BusResult<T> = Result<T, BusError>;
