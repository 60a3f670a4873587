//! # Event Envelope
//!
//! Wire contract for every domain event crossing a service boundary.
//!
//! ## Design Principles
//!
//! 1. **Typed payloads**: each event type is a plain struct implementing [`DomainEvent`];
//!    the envelope carries the common header fields around it
//! 2. **Immutability**: header fields are fixed at construction and only readable afterwards
//! 3. **Traceability**: every envelope has a correlation id, generated when the caller has none
//!
//! ## Wire Fields
//!
//! - `event_id`: Unique identifier, generated at construction
//! - `event_type`: Type tag, matched against the [`EventRegistry`](crate::EventRegistry)
//! - `timestamp`: ISO 8601 timestamp when the event was constructed
//! - `version`: Payload schema version
//! - `aggregate_id`: Optional id of the aggregate the event belongs to
//! - `correlation_id`: Links related events and calls across services
//! - `payload`: Event-specific data

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Errors raised while encoding or decoding events
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("failed to decode event: {0}")]
    Decode(String),

    #[error("failed to encode event: {0}")]
    Encode(String),
}

/// Payload of a concrete event type
///
/// # Examples
///
/// ```rust
/// use event_bus::{DomainEvent, EventEnvelope};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// struct UserRegistered {
///     user_id: String,
///     email: String,
/// }
///
/// impl DomainEvent for UserRegistered {
///     const EVENT_TYPE: &'static str = "UserRegistered";
/// }
///
/// let event = EventEnvelope::new(UserRegistered {
///     user_id: "u_1".to_string(),
///     email: "a@example.com".to_string(),
/// })
/// .with_aggregate_id(Some("u_1".to_string()));
///
/// assert_eq!(event.event_type(), "UserRegistered");
/// assert!(!event.correlation_id().is_empty());
/// ```
pub trait DomainEvent: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static {
    /// Type tag written to `event_type`; also the routing key once lower-cased
    const EVENT_TYPE: &'static str;

    /// Payload schema version
    const VERSION: u32 = 1;
}

/// Anything that can be put on the wire as an event
pub trait Serializable {
    fn event_type(&self) -> &str;

    fn to_wire(&self) -> Result<Value, EventError>;
}

/// Standard event envelope following the platform event contract
///
/// # Type Parameter
///
/// * `P` - The event-specific payload type ([`serde_json::Value`] for untyped events)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<P> {
    event_id: Uuid,
    event_type: String,
    timestamp: DateTime<Utc>,
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    aggregate_id: Option<String>,
    #[serde(
        default = "generate_correlation_id",
        deserialize_with = "correlation_id_or_generated"
    )]
    correlation_id: String,
    payload: P,
}

/// Envelope with an untyped payload, as read off the wire before type resolution
pub type RawEvent = EventEnvelope<Value>;

fn default_version() -> u32 {
    1
}

fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// A null, empty or absent correlation id starts a new chain
fn correlation_id_or_generated<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let correlation_id = Option::<String>::deserialize(deserializer)?;
    Ok(correlation_id
        .filter(|c| !c.is_empty())
        .unwrap_or_else(generate_correlation_id))
}

impl<P: DomainEvent> EventEnvelope<P> {
    /// Create a new envelope with generated event_id, timestamp and correlation_id
    pub fn new(payload: P) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: P::EVENT_TYPE.to_string(),
            timestamp: Utc::now(),
            version: P::VERSION,
            aggregate_id: None,
            correlation_id: generate_correlation_id(),
            payload,
        }
    }

    /// Reconstruct a typed envelope from its wire form
    pub fn from_wire(value: &Value) -> Result<Self, EventError> {
        validate_envelope_fields(value).map_err(EventError::Decode)?;

        let tag = value.get("event_type").and_then(Value::as_str).unwrap_or_default();
        if tag != P::EVENT_TYPE {
            return Err(EventError::Decode(format!(
                "expected event_type {}, found {}",
                P::EVENT_TYPE,
                tag
            )));
        }

        serde_json::from_value(value.clone()).map_err(|e| EventError::Decode(e.to_string()))
    }
}

impl RawEvent {
    /// Create an untyped event, e.g. when relaying from outside the type system
    pub fn raw(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            version: default_version(),
            aggregate_id: None,
            correlation_id: generate_correlation_id(),
            payload,
        }
    }

    /// Parse the wire form without resolving the payload type
    pub fn parse_wire(value: &Value) -> Result<Self, EventError> {
        validate_envelope_fields(value).map_err(EventError::Decode)?;
        serde_json::from_value(value.clone()).map_err(|e| EventError::Decode(e.to_string()))
    }

    /// Deserialize the payload into `P`, keeping every header field
    pub fn decode_payload<P: DeserializeOwned>(self) -> Result<EventEnvelope<P>, EventError> {
        let payload = serde_json::from_value(self.payload).map_err(|e| {
            EventError::Decode(format!("invalid {} payload: {}", self.event_type, e))
        })?;
        Ok(EventEnvelope {
            event_id: self.event_id,
            event_type: self.event_type,
            timestamp: self.timestamp,
            version: self.version,
            aggregate_id: self.aggregate_id,
            correlation_id: self.correlation_id,
            payload,
        })
    }
}

impl<P> EventEnvelope<P> {
    /// Set the aggregate the event belongs to
    pub fn with_aggregate_id(mut self, aggregate_id: Option<String>) -> Self {
        self.aggregate_id = aggregate_id;
        self
    }

    /// Continue an existing causal chain; `None` keeps the generated id
    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        if let Some(correlation_id) = correlation_id.filter(|c| !c.is_empty()) {
            self.correlation_id = correlation_id;
        }
        self
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn aggregate_id(&self) -> Option<&str> {
        self.aggregate_id.as_deref()
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }

    /// Same header, different payload
    pub(crate) fn map_payload<Q>(&self, payload: Q) -> EventEnvelope<Q> {
        EventEnvelope {
            event_id: self.event_id,
            event_type: self.event_type.clone(),
            timestamp: self.timestamp,
            version: self.version,
            aggregate_id: self.aggregate_id.clone(),
            correlation_id: self.correlation_id.clone(),
            payload,
        }
    }
}

impl<P: Serialize> Serializable for EventEnvelope<P> {
    fn event_type(&self) -> &str {
        &self.event_type
    }

    fn to_wire(&self) -> Result<Value, EventError> {
        serde_json::to_value(self).map_err(|e| EventError::Encode(e.to_string()))
    }
}

/// Validate the header fields of a wire envelope
///
/// # Validation Rules
///
/// - `event_id`: Must be a valid UUID
/// - `event_type`: Must be a non-empty string
/// - `timestamp`: Must be present
/// - `correlation_id`: Optional; null or empty means a new chain
/// - `payload`: Must be present
///
/// # Errors
///
/// Returns a descriptive error string if validation fails
pub fn validate_envelope_fields(envelope: &Value) -> Result<(), String> {
    if !envelope.is_object() {
        return Err("Envelope must be a JSON object".to_string());
    }

    // Validate event_id
    let event_id = envelope
        .get("event_id")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid event_id")?;

    Uuid::parse_str(event_id).map_err(|e| format!("event_id is not a UUID: {}", e))?;

    // Validate event_type
    let event_type = envelope
        .get("event_type")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid event_type")?;

    if event_type.is_empty() {
        return Err("event_type cannot be empty".to_string());
    }

    // Validate timestamp
    envelope
        .get("timestamp")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid timestamp")?;

    // correlation_id is optional on the wire
    if let Some(correlation_id) = envelope.get("correlation_id") {
        match correlation_id.as_str() {
            Some(_) => {}
            None if correlation_id.is_null() => {}
            None => return Err("correlation_id must be a string".to_string()),
        }
    }

    if envelope.get("payload").is_none() {
        return Err("Missing payload".to_string());
    }

    Ok(())
}
