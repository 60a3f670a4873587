use super::{request_routing_key, RpcError, RpcRequest, RpcResponse};
use crate::transport::{Channel, Connection, Connector, Delivery, MessageProperties, QueueOptions};
use dashmap::DashMap;
use futures::stream::{BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const REPLY_CONSUMER_TAG: &str = "rpc-reply";

/// An outstanding call waiting for its reply
struct PendingCall {
    result_slot: oneshot::Sender<Vec<u8>>,
    /// Reply session the request went out on
    generation: u64,
    /// `None` when the timeout reaches past what `Instant` can represent
    deadline: Option<Instant>,
    service: String,
    method: String,
}

type PendingCalls = Arc<DashMap<String, PendingCall>>;

/// Removes the call's slot however the call ends
struct SlotGuard<'a> {
    pending: &'a PendingCalls,
    correlation_id: &'a str,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.correlation_id);
    }
}

/// One connection's worth of reply plumbing: channel, private reply queue and its pump
struct ReplySession {
    generation: u64,
    connection: Arc<dyn Connection>,
    channel: Arc<dyn Channel>,
    reply_queue: String,
    pump: JoinHandle<()>,
}

impl ReplySession {
    async fn open(connector: &dyn Connector, generation: u64, pending: PendingCalls) -> Result<Self, RpcError> {
        let connection = connector
            .connect()
            .await
            .map_err(|e| RpcError::Connection(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| RpcError::Connection(e.to_string()))?;

        let reply = channel
            .queue_declare("", &QueueOptions::exclusive_auto_delete())
            .await
            .map_err(|e| RpcError::Connection(e.to_string()))?;
        let replies = channel
            .basic_consume(&reply.name, REPLY_CONSUMER_TAG, true)
            .await
            .map_err(|e| RpcError::Connection(e.to_string()))?;

        let pump = tokio::spawn(reply_pump(replies, pending, generation, reply.name.clone()));

        Ok(Self {
            generation,
            connection,
            channel,
            reply_queue: reply.name,
            pump,
        })
    }

    fn is_open(&self) -> bool {
        !self.pump.is_finished() && self.connection.is_open() && self.channel.is_open()
    }

    async fn close(&self) {
        if let Err(e) = self.channel.close().await {
            debug!(error = %e, "Error closing RPC channel");
        }
        if let Err(e) = self.connection.close().await {
            debug!(error = %e, "Error closing RPC connection");
        }
    }
}

impl Drop for ReplySession {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Caller side of request/reply
///
/// Owns its own connection and a server-named, exclusive reply queue. A
/// background task drains the reply queue and completes each call by
/// correlation id, so any number of calls may be outstanding at once on
/// one client.
///
/// If the connection drops, calls in flight fail with
/// [`RpcError::Disconnected`] and the next call reconnects with a fresh reply
/// queue. Only [`RpcClient::close`] retires the client for good.
///
/// # Example
/// ```rust,no_run
/// use event_bus::{InMemoryBroker, RpcClient, RpcError};
/// use serde_json::json;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), RpcError> {
/// let client = RpcClient::connect(Arc::new(InMemoryBroker::new()), Duration::from_secs(30)).await?;
///
/// match client.call("users", "get_user", json!({"user_id": "u_1"}), None).await {
///     Ok(user) => println!("{}", user),
///     Err(RpcError::Timeout { service, method }) => eprintln!("{}.{} did not answer", service, method),
///     Err(e) => return Err(e),
/// }
/// # Ok(())
/// # }
/// ```
pub struct RpcClient {
    connector: Arc<dyn Connector>,
    default_timeout: Duration,
    /// Guarded by the connect lock: at most one (re)connect in flight
    session: Mutex<Option<Arc<ReplySession>>>,
    pending: PendingCalls,
    next_generation: AtomicU64,
    closed: AtomicBool,
}

impl RpcClient {
    /// Connect eagerly, so a bad address fails here rather than on the first call
    pub async fn connect(connector: Arc<dyn Connector>, default_timeout: Duration) -> Result<Self, RpcError> {
        let client = Self {
            connector,
            default_timeout,
            session: Mutex::new(None),
            pending: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        };
        client.session().await?;
        Ok(client)
    }

    /// Current session, rebuilt if the previous one was lost
    async fn session(&self) -> Result<Arc<ReplySession>, RpcError> {
        let mut current = self.session.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Disconnected);
        }

        if let Some(session) = current.as_ref() {
            if session.is_open() {
                return Ok(session.clone());
            }
            warn!(reply_queue = %session.reply_queue, "RPC connection lost, reconnecting");
            session.close().await;
        }
        *current = None;

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        match ReplySession::open(self.connector.as_ref(), generation, self.pending.clone()).await {
            Ok(session) => {
                info!(reply_queue = %session.reply_queue, "RPC client connected");
                let session = Arc::new(session);
                *current = Some(session.clone());
                Ok(session)
            }
            Err(e) => {
                error!(error = %e, "RPC client failed to connect");
                Err(e)
            }
        }
    }

    /// Reply queue of the live session, if any
    pub async fn reply_queue(&self) -> Option<String> {
        self.session
            .lock()
            .await
            .as_ref()
            .filter(|session| session.is_open())
            .map(|session| session.reply_queue.clone())
    }

    /// Calls currently waiting for a reply
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    pub async fn is_connected(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(|session| session.is_open())
    }

    /// Call `service.method` and wait up to `timeout` (or the client default) for the result
    ///
    /// # Errors
    /// - [`RpcError::Timeout`] if no reply arrived in time
    /// - [`RpcError::Application`] if the remote method reported an error
    /// - [`RpcError::Connection`] if a lost connection could not be re-established
    /// - [`RpcError::Publish`] if the request could not be sent
    /// - [`RpcError::Disconnected`] if the client is closed or the connection dropped mid-call
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        let session = self.session().await?;

        let timeout = timeout.unwrap_or(self.default_timeout);
        let correlation_id = Uuid::new_v4().to_string();

        // The slot must exist before the request leaves, or a fast reply is lost
        let (result_slot, result) = oneshot::channel();
        self.pending.insert(
            correlation_id.clone(),
            PendingCall {
                result_slot,
                generation: session.generation,
                deadline: Instant::now().checked_add(timeout),
                service: service.to_string(),
                method: method.to_string(),
            },
        );
        let _slot = SlotGuard {
            pending: &self.pending,
            correlation_id: &correlation_id,
        };

        let request = RpcRequest {
            service: service.to_string(),
            method: method.to_string(),
            params,
            correlation_id: correlation_id.clone(),
        };
        let body = serde_json::to_vec(&request).map_err(|e| RpcError::Publish(e.to_string()))?;
        let properties = MessageProperties::json()
            .with_persistent(true)
            .with_correlation_id(Some(correlation_id.clone()))
            .with_reply_to(Some(session.reply_queue.clone()));

        session
            .channel
            .basic_publish("", &request_routing_key(service), body, properties)
            .await
            .map_err(|e| RpcError::Publish(e.to_string()))?;

        debug!(service = %service, method = %method, correlation_id = %correlation_id, "RPC request sent");

        let body = match tokio::time::timeout(timeout, result).await {
            Ok(Ok(body)) => body,
            Ok(Err(_)) => return Err(RpcError::Disconnected),
            Err(_) => {
                warn!(
                    service = %service,
                    method = %method,
                    correlation_id = %correlation_id,
                    timeout_ms = timeout.as_millis(),
                    "RPC call timed out"
                );
                return Err(RpcError::Timeout {
                    service: service.to_string(),
                    method: method.to_string(),
                });
            }
        };

        let response: RpcResponse =
            serde_json::from_slice(&body).map_err(|e| RpcError::Decode(e.to_string()))?;
        response.into_result()
    }

    /// [`RpcClient::call`] with typed params and result
    pub async fn call_typed<P, R>(
        &self,
        service: &str,
        method: &str,
        params: &P,
        timeout: Option<Duration>,
    ) -> Result<R, RpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params).map_err(|e| RpcError::Publish(e.to_string()))?;
        let result = self.call(service, method, params, timeout).await?;
        serde_json::from_value(result).map_err(|e| RpcError::Decode(e.to_string()))
    }

    /// Close the connection for good; outstanding and later calls fail with [`RpcError::Disconnected`]
    pub async fn close(&self) {
        let mut current = self.session.lock().await;
        self.closed.store(true, Ordering::SeqCst);
        if let Some(session) = current.take() {
            session.close().await;
            info!(reply_queue = %session.reply_queue, "RPC client closed");
        }
    }
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("pending_calls", &self.pending.len())
            .field("default_timeout", &self.default_timeout)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

/// Route each reply to the call waiting on its correlation id
async fn reply_pump(
    mut replies: BoxStream<'static, Delivery>,
    pending: PendingCalls,
    generation: u64,
    reply_queue: String,
) {
    while let Some(delivery) = replies.next().await {
        let Some(correlation_id) = delivery.properties.correlation_id.as_deref() else {
            warn!(reply_queue = %reply_queue, "Dropping reply without correlation id");
            continue;
        };

        match pending.remove(correlation_id) {
            Some((_, call)) => {
                if call.deadline.is_some_and(|deadline| Instant::now() > deadline) {
                    warn!(
                        service = %call.service,
                        method = %call.method,
                        correlation_id = %correlation_id,
                        "Reply arrived after its deadline"
                    );
                }
                if call.result_slot.send(delivery.body).is_err() {
                    debug!(correlation_id = %correlation_id, "Caller went away before its reply");
                }
            }
            None => {
                warn!(correlation_id = %correlation_id, "Dropping late or unknown reply");
            }
        }
    }

    // Dropping the senders wakes this session's waiters with Disconnected
    let before = pending.len();
    pending.retain(|_, call| call.generation != generation);
    warn!(
        reply_queue = %reply_queue,
        outstanding = before.saturating_sub(pending.len()),
        "Reply stream ended, failing outstanding calls"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryBroker;
    use serde_json::json;

    async fn connected(server: &InMemoryBroker) -> RpcClient {
        RpcClient::connect(Arc::new(server.clone()), Duration::from_secs(5))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_declares_private_reply_queue() {
        let server = InMemoryBroker::new();
        let client = connected(&server).await;

        let reply_queue = client.reply_queue().await.unwrap();
        assert!(reply_queue.starts_with("amq.gen-"));
        assert!(server.has_queue(&reply_queue));
        assert!(client.is_connected().await);
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_connect_fails_when_unreachable() {
        let server = InMemoryBroker::new();
        server.set_reachable(false);

        let result = RpcClient::connect(Arc::new(server), Duration::from_secs(5)).await;
        assert!(matches!(result, Err(RpcError::Connection(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_clears_slot() {
        let server = InMemoryBroker::new();
        let client = connected(&server).await;

        let result = client
            .call("nobody", "ping", json!({}), Some(Duration::from_secs(1)))
            .await;

        assert!(matches!(
            result,
            Err(RpcError::Timeout { ref service, ref method }) if service == "nobody" && method == "ping"
        ));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_unbounded_timeout_waits_instead_of_failing() {
        let server = InMemoryBroker::new();
        let client = connected(&server).await;

        let outcome = tokio::time::timeout(
            Duration::from_millis(100),
            client.call("nobody", "ping", json!({}), Some(Duration::MAX)),
        )
        .await;

        assert!(outcome.is_err(), "call should still be waiting, got {:?}", outcome);
        assert_eq!(client.pending_calls(), 0);
        assert!(client.is_connected().await);
    }

    #[tokio::test]
    async fn test_disconnect_fails_outstanding_call_then_reconnects() {
        let server = InMemoryBroker::new();
        let client = Arc::new(connected(&server).await);
        let first_queue = client.reply_queue().await.unwrap();

        let caller = client.clone();
        let call = tokio::spawn(async move { caller.call("slow", "work", json!({}), None).await });

        // Wait for the request to be registered before cutting the connection
        tokio::time::timeout(Duration::from_secs(2), async {
            while client.pending_calls() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        server.disconnect_all();

        let result = call.await.unwrap();
        assert!(matches!(result, Err(RpcError::Disconnected)));
        assert!(!client.is_connected().await);
        assert!(!server.has_queue(&first_queue));

        // Next call rebuilds the connection and a fresh reply queue
        let result = client
            .call("slow", "work", json!({}), Some(Duration::from_millis(50)))
            .await;
        assert!(matches!(result, Err(RpcError::Timeout { .. })));
        assert!(client.is_connected().await);

        let second_queue = client.reply_queue().await.unwrap();
        assert_ne!(second_queue, first_queue);
        assert!(server.has_queue(&second_queue));
        assert_eq!(server.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_fails_while_unreachable() {
        let server = InMemoryBroker::new();
        let client = connected(&server).await;

        server.set_reachable(false);
        server.disconnect_all();

        assert!(matches!(
            client.call("math", "answer", json!({}), None).await,
            Err(RpcError::Connection(_))
        ));

        server.set_reachable(true);
        let result = client
            .call("math", "answer", json!({}), Some(Duration::from_millis(50)))
            .await;
        assert!(matches!(result, Err(RpcError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_close_is_final() {
        let server = InMemoryBroker::new();
        let client = connected(&server).await;

        client.close().await;

        assert!(!client.is_connected().await);
        assert!(matches!(
            client.call("math", "answer", json!({}), None).await,
            Err(RpcError::Disconnected)
        ));
        assert_eq!(server.open_connections(), 0);
    }
}
