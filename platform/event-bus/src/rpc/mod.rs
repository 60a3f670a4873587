//! Request/reply over the broker.
//!
//! A request is published to the default exchange under `rpc_{service}`
//! with `reply_to` naming the caller's private reply queue. The responder
//! answers on that queue with the same correlation id.
//!
//! ## Wire format
//!
//! - request: `{service, method, params, correlation_id}`
//! - response: `{result, error}`, exactly one of the two populated

mod client;
mod server;

pub use client::RpcClient;
pub use server::{RpcHandler, RpcServer};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Routing key (and queue name) a service listens on
pub fn request_routing_key(service: &str) -> String {
    format!("rpc_{}", service)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub service: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl RpcResponse {
    pub fn ok(result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(Value::String(message.into())),
        }
    }

    /// The `result` field, or the `error` field as [`RpcError::Application`]
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(Value::String(message)) => Err(RpcError::Application(message)),
            Some(other) => Err(RpcError::Application(other.to_string())),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("RPC call to {service}.{method} timed out")]
    Timeout { service: String, method: String },

    /// The remote method ran and reported an error
    #[error("{0}")]
    Application(String),

    #[error("RPC connection error: {0}")]
    Connection(String),

    #[error("failed to publish RPC request: {0}")]
    Publish(String),

    #[error("failed to decode RPC message: {0}")]
    Decode(String),

    /// The reply stream ended before an answer arrived
    #[error("RPC client disconnected")]
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_routing_key() {
        assert_eq!(request_routing_key("users"), "rpc_users");
    }

    #[test]
    fn test_response_result() {
        let response: RpcResponse = serde_json::from_value(json!({"result": 42, "error": null})).unwrap();
        assert_eq!(response.into_result().unwrap(), json!(42));
    }

    #[test]
    fn test_response_error_string() {
        let response: RpcResponse = serde_json::from_value(json!({"error": "X"})).unwrap();
        match response.into_result() {
            Err(RpcError::Application(message)) => assert_eq!(message, "X"),
            other => panic!("expected application error, got {:?}", other),
        }
    }

    #[test]
    fn test_response_structured_error() {
        let response: RpcResponse =
            serde_json::from_value(json!({"result": null, "error": {"code": 404}})).unwrap();
        match response.into_result() {
            Err(RpcError::Application(message)) => assert_eq!(message, r#"{"code":404}"#),
            other => panic!("expected application error, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_response_is_null_result() {
        let response: RpcResponse = serde_json::from_value(json!({})).unwrap();
        assert_eq!(response.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn test_timeout_names_service_and_method() {
        let error = RpcError::Timeout {
            service: "users".to_string(),
            method: "get_user".to_string(),
        };
        assert_eq!(error.to_string(), "RPC call to users.get_user timed out");
    }
}
