//! # Request/Reply
//!
//! Request/reply is a composition over plain publish/subscribe; it has no
//! dispatch path of its own.
//!
//! ## Caller (`request`)
//!
//! 1. Generate a correlation id and the private reply topic `<prefix>.<id>`
//! 2. Register a pending call and subscribe to the reply topic
//! 3. Publish the request with `correlation_id` and `reply_to` set
//! 4. Settle on the first reply or on timeout, whichever comes first
//!
//! Whatever the outcome (including the caller dropping the future), the
//! pending entry and the reply subscription are removed.
//!
//! ## Callee (`create_rpc_handler`)
//!
//! Runs the handler for every request carrying `reply_to` and publishes an
//! [`RpcReply`] back, even when the handler fails, so callers never wait on
//! silence.

use crate::bus::{lock, MessageBus, Shared};
use crate::message::{Message, Priority, PublishOptions};
use crate::registry::{Handler, HandlerResult, SubscriptionId};
use crate::BusError;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("no reply on '{topic}' within {timeout_ms}ms")]
    Timeout { topic: String, timeout_ms: u64 },

    #[error("remote handler failed: {0}")]
    Remote(String),

    #[error("malformed reply: {0}")]
    InvalidReply(String),

    #[error("message bus shut down before a reply arrived")]
    ShutDown,

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Payload published on a reply topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcReply {
    Ok(Value),
    Error(String),
}

impl RpcReply {
    fn into_result(self) -> Result<Value, RpcError> {
        match self {
            RpcReply::Ok(value) => Ok(value),
            RpcReply::Error(reason) => Err(RpcError::Remote(reason)),
        }
    }
}

/// Options for [`MessageBus::request_with`]
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Falls back to the bus-wide default
    pub timeout: Option<Duration>,
    pub priority: Priority,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

type Resolver = oneshot::Sender<Result<Value, RpcError>>;

/// Calls waiting for a reply, keyed by correlation id
#[derive(Default)]
pub(crate) struct PendingCalls {
    calls: Mutex<HashMap<String, Resolver>>,
}

impl PendingCalls {
    fn register(&self, correlation_id: &str) -> oneshot::Receiver<Result<Value, RpcError>> {
        let (tx, rx) = oneshot::channel();
        lock(&self.calls).insert(correlation_id.to_string(), tx);
        rx
    }

    /// Resolve a waiting call. Returns false when nobody is waiting any more.
    fn complete(&self, correlation_id: &str, result: Result<Value, RpcError>) -> bool {
        let Some(resolver) = lock(&self.calls).remove(correlation_id) else {
            return false;
        };
        resolver.send(result).is_ok()
    }

    fn remove(&self, correlation_id: &str) {
        lock(&self.calls).remove(correlation_id);
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Fail every waiting call with `RpcError::ShutDown`
    pub(crate) fn reject_all(&self) -> usize {
        let calls: Vec<Resolver> = lock(&self.calls).drain().map(|(_, tx)| tx).collect();
        let rejected = calls.len();
        for resolver in calls {
            let _ = resolver.send(Err(RpcError::ShutDown));
        }
        rejected
    }
}

/// Tears down a call's pending entry and reply subscription on every exit path
struct CallGuard {
    shared: Weak<Shared>,
    correlation_id: String,
    subscription: Option<SubscriptionId>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.pending.remove(&self.correlation_id);
        if let Some(id) = self.subscription.take() {
            shared.registry().unsubscribe(id);
        }
    }
}

impl MessageBus {
    /// Send a request on `topic` and wait for the reply payload.
    ///
    /// Uses the bus default timeout when `timeout` is `None`.
    ///
    /// Calling this from inside a handler on the same bus always times out:
    /// the dispatcher is busy awaiting that handler and cannot deliver the
    /// request. Spawn a task for nested calls.
    ///
    /// # Example
    /// ```rust
    /// use message_bus::MessageBus;
    /// use serde_json::json;
    ///
    /// # async fn example() -> Result<(), message_bus::RpcError> {
    /// let bus = MessageBus::new();
    /// bus.create_rpc_handler("math.double", |payload| async move {
    ///     let n = payload.as_i64().unwrap_or_default();
    ///     Ok(json!(n * 2))
    /// })?;
    ///
    /// let reply = bus.request("math.double", json!(21), None).await?;
    /// assert_eq!(reply, json!(42));
    /// # Ok(())
    /// # }
    /// ```
    pub async fn request(
        &self,
        topic: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        let options = RequestOptions {
            timeout,
            ..RequestOptions::default()
        };
        self.request_with(topic, payload, options).await
    }

    pub async fn request_with(
        &self,
        topic: &str,
        payload: Value,
        options: RequestOptions,
    ) -> Result<Value, RpcError> {
        let timeout = options.timeout.unwrap_or(self.shared.config.default_rpc_timeout);
        let correlation_id = Uuid::new_v4().to_string();
        let reply_topic = format!("{}.{}", self.shared.config.rpc_reply_prefix, correlation_id);

        let mut guard = CallGuard {
            shared: self.downgrade(),
            correlation_id: correlation_id.clone(),
            subscription: None,
        };
        let reply = self.shared.pending.register(&correlation_id);
        guard.subscription = Some(self.subscribe_handler(
            &reply_topic,
            reply_handler(self.downgrade(), correlation_id.clone()),
            None,
        )?);

        let publish = PublishOptions::new()
            .with_priority(options.priority)
            .with_correlation_id(correlation_id.clone())
            .with_reply_to(reply_topic)
            .with_expiry(timeout);
        let message_id = self.publish_with(topic, payload, publish)?;
        debug!(
            message_id = %message_id,
            topic = %topic,
            correlation_id = %correlation_id,
            timeout_ms = timeout.as_millis() as u64,
            "RPC request sent"
        );

        let result = match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(result)) => result,
            // Resolver dropped without an answer: the pending table was cleared
            Ok(Err(_)) => Err(RpcError::ShutDown),
            Err(_) => {
                warn!(topic = %topic, correlation_id = %correlation_id, "RPC request timed out");
                Err(RpcError::Timeout {
                    topic: topic.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        };

        drop(guard);
        result
    }

    /// Serve requests on `topic`, replying with the handler's result or error
    pub fn create_rpc_handler<F, Fut>(&self, topic: &str, handler: F) -> Result<SubscriptionId, BusError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.subscribe_handler(topic, responder(self.downgrade(), handler), None)
    }

    /// Like [`MessageBus::create_rpc_handler`], owned by a plugin
    pub fn create_rpc_handler_with_plugin<F, Fut>(
        &self,
        topic: &str,
        owner: &str,
        handler: F,
    ) -> Result<SubscriptionId, BusError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.subscribe_handler(topic, responder(self.downgrade(), handler), Some(owner))
    }
}

/// Caller side: resolves the pending call when its reply arrives
fn reply_handler(shared: Weak<Shared>, correlation_id: String) -> Arc<dyn Handler> {
    Arc::new(move |message: Message| on_reply(shared.clone(), correlation_id.clone(), message))
}

async fn on_reply(shared: Weak<Shared>, correlation_id: String, message: Message) -> HandlerResult {
    let Some(shared) = shared.upgrade() else {
        return Ok(());
    };

    if message.correlation_id.as_deref() != Some(correlation_id.as_str()) {
        warn!(
            expected = %correlation_id,
            received = ?message.correlation_id,
            "Ignoring reply with mismatched correlation id"
        );
        return Ok(());
    }

    let result = serde_json::from_value::<RpcReply>(message.payload)
        .map_err(|e| RpcError::InvalidReply(e.to_string()))
        .and_then(RpcReply::into_result);

    if !shared.pending.complete(&correlation_id, result) {
        debug!(correlation_id = %correlation_id, "Late RPC reply ignored");
    }
    Ok(())
}

/// Callee side: runs the user handler and publishes its outcome to `reply_to`
fn responder<F, Fut>(shared: Weak<Shared>, handler: F) -> Arc<dyn Handler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |message: Message| respond(shared.clone(), handler.clone(), message))
}

async fn respond<F, Fut>(shared: Weak<Shared>, handler: Arc<F>, message: Message) -> HandlerResult
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    let Some(reply_to) = message.reply_to.clone() else {
        debug!(topic = %message.topic, "Message without reply_to ignored by RPC handler");
        return Ok(());
    };

    let reply = match AssertUnwindSafe(handler(message.payload.clone()))
        .catch_unwind()
        .await
    {
        Ok(Ok(value)) => RpcReply::Ok(value),
        Ok(Err(e)) => RpcReply::Error(format!("{e:#}")),
        Err(_) => RpcReply::Error("rpc handler panicked".to_string()),
    };

    let Some(shared) = shared.upgrade() else {
        return Ok(());
    };

    let mut options = PublishOptions::new().with_priority(message.priority);
    if let Some(correlation_id) = &message.correlation_id {
        options = options.with_correlation_id(correlation_id.clone());
    }
    if let Some(expires_at) = message.expires_at {
        options = options.with_expires_at(expires_at);
    }

    // The handler already ran; a failed reply is left to the caller's timeout
    // rather than retrying the request.
    if let Err(e) = shared.publish(&reply_to, serde_json::to_value(&reply)?, options) {
        warn!(
            reply_to = %reply_to,
            correlation_id = ?message.correlation_id,
            error = %e,
            "Failed to publish RPC reply"
        );
    }
    Ok(())
}
