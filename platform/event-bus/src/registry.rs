//! Event type registry: resolves a wire `event_type` tag to its payload type.

use crate::envelope::{DomainEvent, EventEnvelope, EventError, RawEvent};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Builds a typed event out of a raw envelope
pub type EventConstructor = fn(RawEvent) -> Result<AnyEvent, EventError>;

/// A decoded event whose payload type was resolved through the registry
///
/// Handlers that know what they subscribed to call [`AnyEvent::downcast`];
/// generic consumers can stay on the raw envelope.
#[derive(Clone)]
pub struct AnyEvent {
    raw: RawEvent,
    payload: Arc<dyn Any + Send + Sync>,
}

impl AnyEvent {
    pub fn event_type(&self) -> &str {
        self.raw.event_type()
    }

    pub fn raw(&self) -> &RawEvent {
        &self.raw
    }

    /// Typed view of the event, or `None` if `E` is not the registered payload type
    pub fn downcast<E: DomainEvent>(&self) -> Option<EventEnvelope<E>> {
        let payload = self.payload.downcast_ref::<E>()?;
        Some(self.raw.map_payload(payload.clone()))
    }

    pub fn is<E: DomainEvent>(&self) -> bool {
        self.payload.is::<E>()
    }
}

impl fmt::Debug for AnyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyEvent")
            .field("event_id", &self.raw.event_id())
            .field("event_type", &self.raw.event_type())
            .field("correlation_id", &self.raw.correlation_id())
            .finish()
    }
}

fn construct<E: DomainEvent>(raw: RawEvent) -> Result<AnyEvent, EventError> {
    let typed = raw.clone().decode_payload::<E>()?;
    Ok(AnyEvent {
        raw,
        payload: Arc::new(typed.into_payload()),
    })
}

/// Mapping from type tag to event constructor
///
/// Cheap to clone; clones share the same table. Register every event type
/// once at startup, then hand the registry to the [`EventBus`](crate::EventBus).
/// Re-registering a tag overwrites the previous entry.
#[derive(Clone, Default)]
pub struct EventRegistry {
    constructors: Arc<RwLock<HashMap<String, EventConstructor>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `E` under its [`DomainEvent::EVENT_TYPE`] tag
    pub fn register<E: DomainEvent>(&self) -> &Self {
        self.constructors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(E::EVENT_TYPE.to_string(), construct::<E>);
        self
    }

    pub fn lookup(&self, event_type: &str) -> Option<EventConstructor> {
        self.constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_type)
            .copied()
    }

    pub fn is_registered(&self, event_type: &str) -> bool {
        self.lookup(event_type).is_some()
    }

    /// Registered tags, sorted
    pub fn event_types(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        tags.sort();
        tags
    }

    /// Rebuild a typed event from its wire mapping
    ///
    /// # Errors
    ///
    /// - [`EventError::Decode`] if the header is malformed or the payload does not fit the type
    /// - [`EventError::UnknownEventType`] if the tag was never registered
    pub fn construct_from_wire(&self, value: &Value) -> Result<AnyEvent, EventError> {
        let raw = RawEvent::parse_wire(value)?;
        let constructor = self
            .lookup(raw.event_type())
            .ok_or_else(|| EventError::UnknownEventType(raw.event_type().to_string()))?;
        constructor(raw)
    }
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistry")
            .field("event_types", &self.event_types())
            .finish()
    }
}
