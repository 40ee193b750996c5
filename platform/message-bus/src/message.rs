//! # Message
//!
//! The unit of transport on the bus, plus the options a producer can attach
//! at publish time.
//!
//! ## Fields
//!
//! - `id`: generated at publish time
//! - `topic`: dot-segmented channel name (e.g. `order.created`)
//! - `payload`: opaque JSON value
//! - `priority`: queue drain class (`high > normal > low`)
//! - `attempts` / `max_retries`: delivery attempt counter and its ceiling
//! - `correlation_id` / `reply_to`: set by the request/reply layer
//! - `source`: informational origin marker (e.g. owning plugin)
//! - `created_at` / `expires_at`: construction time and optional deadline
//! - `timeout`: optional bound on each handler invocation for this message

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Queue drain class. Ordering follows drain order, so `High > Normal > Low`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message flowing through the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub topic: String,
    pub payload: serde_json::Value,
    pub priority: Priority,

    /// Incremented once per handler invocation
    pub attempts: u32,
    pub max_retries: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl Message {
    /// Build a message from publish options.
    ///
    /// `default_max_retries` fills in `max_retries` when the options leave it
    /// unset. The relative `expiry` is resolved against `created_at`; when both
    /// a relative and an absolute deadline are given the earlier one wins.
    pub fn new(
        topic: impl Into<String>,
        payload: serde_json::Value,
        options: PublishOptions,
        default_max_retries: u32,
    ) -> Self {
        let created_at = Utc::now();
        let relative = options
            .expiry
            .and_then(|expiry| chrono::Duration::from_std(expiry).ok())
            .map(|expiry| created_at + expiry);
        let expires_at = match (relative, options.expires_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            payload,
            priority: options.priority,
            attempts: 0,
            max_retries: options.max_retries.unwrap_or(default_max_retries),
            correlation_id: options.correlation_id,
            reply_to: options.reply_to,
            source: options.source,
            created_at,
            expires_at,
            timeout: options.timeout,
        }
    }

    /// Whether the deadline has passed at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Deserialize the payload into a concrete type
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Options accepted by `publish`
///
/// # Example
/// ```rust
/// use message_bus::{Priority, PublishOptions};
/// use std::time::Duration;
///
/// let options = PublishOptions::new()
///     .with_priority(Priority::High)
///     .with_max_retries(2)
///     .with_expiry(Duration::from_secs(30));
/// assert_eq!(options.priority, Priority::High);
/// ```
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub priority: Priority,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub max_retries: Option<u32>,
    /// Per-handler invocation bound
    pub timeout: Option<Duration>,
    /// Deadline relative to publish time
    pub expiry: Option<Duration>,
    pub expires_at: Option<DateTime<Utc>>,
    pub source: Option<String>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_defaults() {
        let msg = Message::new("order.created", json!({"id": 1}), PublishOptions::new(), 3);

        assert_eq!(msg.topic, "order.created");
        assert_eq!(msg.priority, Priority::Normal);
        assert_eq!(msg.attempts, 0);
        assert_eq!(msg.max_retries, 3);
        assert!(msg.correlation_id.is_none());
        assert!(msg.reply_to.is_none());
        assert!(msg.expires_at.is_none());
        assert!(!msg.is_expired());
    }

    #[test]
    fn test_message_with_options() {
        let options = PublishOptions::new()
            .with_priority(Priority::Low)
            .with_max_retries(7)
            .with_correlation_id("corr-1")
            .with_reply_to("rpc.reply.corr-1")
            .with_source("billing");
        let msg = Message::new("invoice.created", json!(null), options, 3);

        assert_eq!(msg.priority, Priority::Low);
        assert_eq!(msg.max_retries, 7);
        assert_eq!(msg.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(msg.reply_to.as_deref(), Some("rpc.reply.corr-1"));
        assert_eq!(msg.source.as_deref(), Some("billing"));
    }

    #[test]
    fn test_relative_expiry_resolves_against_creation() {
        let msg = Message::new(
            "t",
            json!(null),
            PublishOptions::new().with_expiry(Duration::from_secs(60)),
            3,
        );
        let deadline = msg.expires_at.expect("deadline");
        assert_eq!(deadline - msg.created_at, chrono::Duration::seconds(60));
        assert!(!msg.is_expired());
        assert!(msg.is_expired_at(msg.created_at + chrono::Duration::seconds(61)));
    }

    #[test]
    fn test_earlier_deadline_wins() {
        let soon = Utc::now() + chrono::Duration::seconds(5);
        let msg = Message::new(
            "t",
            json!(null),
            PublishOptions::new()
                .with_expiry(Duration::from_secs(3600))
                .with_expires_at(soon),
            3,
        );
        assert_eq!(msg.expires_at, Some(soon));
    }

    #[test]
    fn test_past_deadline_is_expired() {
        let msg = Message::new(
            "t",
            json!(null),
            PublishOptions::new().with_expires_at(Utc::now() - chrono::Duration::seconds(1)),
            3,
        );
        assert!(msg.is_expired());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(serde_json::to_value(Priority::High).unwrap(), json!("high"));
    }

    #[test]
    fn test_decode_payload() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Created {
            id: u32,
        }

        let msg = Message::new("order.created", json!({"id": 9}), PublishOptions::new(), 3);
        assert_eq!(msg.decode::<Created>().unwrap(), Created { id: 9 });
    }
}
