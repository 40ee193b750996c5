//! # Message Bus
//!
//! An in-process, topic-based publish/subscribe broker shared by every module
//! in the process. Producers publish domain events onto dot-segmented topics;
//! consumers register handlers for exact topics or `prefix.*` patterns.
//!
//! ## Delivery Model
//!
//! - `publish` only enqueues and returns the message id. It never runs a handler.
//! - A single dispatcher task drains the queue `high > normal > low`, FIFO
//!   within a class, and runs the matching handlers one after another in
//!   registration order.
//! - A failing handler stops the cycle; the message is requeued until
//!   `max_retries` attempts are used or its deadline passes. Handlers must be
//!   idempotent: a retry notifies every matching handler again.
//! - Delivery is at-most-once with bounded automatic retry. Nothing is persisted.
//!
//! ## Request/Reply
//!
//! [`MessageBus::request`] and [`MessageBus::create_rpc_handler`] are built on
//! plain publish/subscribe: a correlation id plus a private reply topic.
//! A request always settles, with the reply or with [`RpcError::Timeout`].
//!
//! ## Plugins
//!
//! Subscriptions may carry an owner. [`MessageBus::unsubscribe_by_plugin`]
//! removes all of them at once when a plugin unloads; queued messages are not
//! delivered to removed handlers.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use message_bus::{Message, MessageBus, Priority, PublishOptions};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = MessageBus::new();
//!
//! bus.subscribe_pattern_with_plugin("invoice.*", "billing", |msg: Message| async move {
//!     tracing::info!(topic = %msg.topic, "invoice event");
//!     Ok(())
//! })?;
//!
//! bus.publish_with(
//!     "invoice.created",
//!     json!({"invoice_id": "inv_123"}),
//!     PublishOptions::new().with_priority(Priority::High),
//! )?;
//!
//! bus.create_rpc_handler("echo", |payload| async move { Ok(payload) })?;
//! let reply = bus.request("echo", json!({"a": 1}), None).await?;
//! assert_eq!(reply, json!({"a": 1}));
//! # Ok(())
//! # }
//! ```

mod bus;
mod config;
mod dispatch;
mod message;
mod pattern;
mod queue;
mod registry;
mod retry;
mod rpc;
mod stats;
mod stream;

pub use bus::MessageBus;
pub use config::{BusConfig, ConfigError};
pub use dispatch::HandlerFailure;
pub use message::{Message, PublishOptions, Priority};
pub use pattern::{PatternError, TopicPattern};
pub use registry::{Handler, HandlerResult, Subscription, SubscriptionId, SubscriptionRegistry};
pub use rpc::{RequestOptions, RpcError, RpcReply};
pub use stats::{BusStats, DeliveryEvent, DeliveryOutcome};

/// Retry ceiling applied when a publisher does not set one
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default wait for an RPC reply
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 5000;

/// Buffered delivery events per outcome subscriber before the oldest are dropped
pub const DEFAULT_OUTCOME_CHANNEL_CAPACITY: usize = 1000;

pub const DEFAULT_RPC_REPLY_PREFIX: &str = "rpc.reply";

/// Errors raised at the publish/subscribe boundary
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("topic must not be empty")]
    EmptyTopic,

    #[error("invalid subject pattern: {0}")]
    InvalidPattern(#[from] PatternError),

    #[error("queue is full ({0} pending messages)")]
    QueueFull(usize),

    #[error("message bus has been shut down")]
    ShutDown,

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Result type for bus operations
pub type BusResult<T> = Result<T, BusError>;
