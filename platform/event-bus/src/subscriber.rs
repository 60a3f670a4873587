use crate::bus::EventBus;
use crate::BusResult;
use async_trait::async_trait;
use serde::Serialize;

/// A subscription recorded by the [`EventBus`], for introspection only
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub queue_name: String,
    pub event_type: String,
    /// Type name of the handler, for health output
    pub handler: String,
}

/// A service-side listener that knows which events it wants
///
/// Implementors call [`EventBus::subscribe`] (or `subscribe_typed`) for each
/// event they handle. Wire one up with [`EventBus::register_subscriber`] at
/// startup, before [`EventBus::start`].
///
/// # Example
/// ```rust
/// use async_trait::async_trait;
/// use event_bus::{BusResult, EventBus, Subscriber};
///
/// struct AuditSubscriber;
///
/// #[async_trait]
/// impl Subscriber for AuditSubscriber {
///     fn service_name(&self) -> &str {
///         "audit"
///     }
///
///     async fn subscribe_to_events(&self, bus: &EventBus) -> BusResult<()> {
///         bus.subscribe("audit.users", "UserRegistered", |event| async move {
///             tracing::info!(event_id = %event.raw().event_id(), "audited");
///             Ok(())
///         }, true)
///         .await
///     }
/// }
/// ```
#[async_trait]
pub trait Subscriber: Send + Sync {
    fn service_name(&self) -> &str;

    async fn subscribe_to_events(&self, bus: &EventBus) -> BusResult<()>;
}
