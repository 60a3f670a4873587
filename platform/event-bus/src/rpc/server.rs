use super::{request_routing_key, RpcRequest, RpcResponse};
use crate::broker::{Broker, BusMessage, ConsumeError, PublishOptions};
use crate::bus::BoxError;
use crate::transport::QueueOptions;
use crate::BusResult;
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tracing::{debug, info, warn};

pub type RpcHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, BoxError>> + Send + Sync>;

type MethodTable = Arc<RwLock<HashMap<String, RpcHandler>>>;

/// Responder side of request/reply for one service
///
/// Consumes `rpc_{service}` on a shared [`Broker`]; deliveries flow once the
/// broker's consume loop runs (see [`RpcServer::run`]).
///
/// # Example
/// ```rust
/// use event_bus::{Broker, InMemoryBroker, RpcServer};
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), event_bus::BusError> {
/// let broker = Arc::new(Broker::new(Arc::new(InMemoryBroker::new())));
/// let server = RpcServer::new(broker, "users");
/// server.register("get_user", |params| async move {
///     Ok(json!({"user_id": params["user_id"], "active": true}))
/// });
/// server.listen().await?;
/// # Ok(())
/// # }
/// ```
pub struct RpcServer {
    broker: Arc<Broker>,
    service: String,
    methods: MethodTable,
}

impl RpcServer {
    pub fn new(broker: Arc<Broker>, service: impl Into<String>) -> Self {
        Self {
            broker,
            service: service.into(),
            methods: Arc::default(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Register (or replace) the handler for `method`
    pub fn register<F, Fut>(&self, method: &str, handler: F) -> &Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        let handler: RpcHandler = Arc::new(move |params| handler(params).boxed());
        self.methods
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method.to_string(), handler);
        self
    }

    /// Declare the request queue and install the consumer
    pub async fn listen(&self) -> BusResult<()> {
        let queue = request_routing_key(&self.service);
        self.broker.declare_queue(&queue, &QueueOptions::durable()).await?;

        // Weak: the broker owns this handler
        let broker = Arc::downgrade(&self.broker);
        let methods = self.methods.clone();
        let service = self.service.clone();

        self.broker
            .consume(
                &queue,
                move |message: BusMessage| serve(broker.clone(), methods.clone(), service.clone(), message),
                false,
            )
            .await?;

        info!(service = %self.service, queue = %queue, "RPC server listening");
        Ok(())
    }

    /// Listen and drive the broker's consume loop until it is stopped
    pub async fn run(&self) -> BusResult<()> {
        self.listen().await?;
        self.broker.start_consuming().await
    }
}

async fn serve(
    broker: Weak<Broker>,
    methods: MethodTable,
    service: String,
    message: BusMessage,
) -> Result<(), ConsumeError> {
    let request: RpcRequest = serde_json::from_value(message.body).map_err(|e| {
        warn!(service = %service, error = %e, "Rejecting malformed RPC request");
        ConsumeError::decode(e)
    })?;

    let reply_to = message.properties.reply_to.ok_or_else(|| {
        ConsumeError::Decode(format!(
            "request {} for {}.{} has no reply_to",
            request.correlation_id, service, request.method
        ))
    })?;
    let correlation_id = message
        .properties
        .correlation_id
        .unwrap_or_else(|| request.correlation_id.clone());

    let handler = methods
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&request.method)
        .cloned();

    let response = match handler {
        Some(handler) => match handler(request.params).await {
            Ok(result) => RpcResponse::ok(result),
            Err(e) => {
                warn!(service = %service, method = %request.method, error = %e, "RPC method failed");
                RpcResponse::err(e.to_string())
            }
        },
        None => {
            warn!(service = %service, method = %request.method, "Unknown RPC method");
            RpcResponse::err(format!("unknown method '{}' on service '{}'", request.method, service))
        }
    };

    let broker = broker
        .upgrade()
        .ok_or_else(|| ConsumeError::Handler("broker dropped".to_string()))?;
    broker
        .publish(
            "",
            &reply_to,
            &response,
            PublishOptions::persistent().with_correlation_id(correlation_id.clone()),
        )
        .await
        .map_err(ConsumeError::handler)?;

    debug!(service = %service, method = %request.method, correlation_id = %correlation_id, "RPC reply sent");
    Ok(())
}

impl fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<String> = self
            .methods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        methods.sort();
        f.debug_struct("RpcServer")
            .field("service", &self.service)
            .field("methods", &methods)
            .finish()
    }
}
