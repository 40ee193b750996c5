//! Delivery outcomes and bus counters
//!
//! Terminal drops (expired, exhausted) are never surfaced to publishers, so
//! they are reported here instead: as a broadcast feed of [`DeliveryEvent`]s
//! and as monotonic counters readable through [`BusStats`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// What happened to a message at the end of one dispatch cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// Every matching handler succeeded
    Delivered,
    /// A handler failed and the message was requeued
    Retrying,
    /// Deadline passed, before or after an attempt
    Expired,
    /// Retry ceiling reached
    Exhausted,
    /// No subscription matched the topic
    NoSubscribers,
}

impl DeliveryOutcome {
    /// Whether the message has left the bus for good
    pub fn is_final(&self) -> bool {
        !matches!(self, DeliveryOutcome::Retrying)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryEvent {
    pub message_id: Uuid,
    pub topic: String,
    pub attempts: u32,
    pub outcome: DeliveryOutcome,
    pub at: DateTime<Utc>,
}

/// Point-in-time copy of the bus counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub rejected: u64,
    pub delivered: u64,
    pub retried: u64,
    pub expired: u64,
    pub exhausted: u64,
    pub unrouted: u64,
    pub handler_failures: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    published: AtomicU64,
    rejected: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    expired: AtomicU64,
    exhausted: AtomicU64,
    unrouted: AtomicU64,
    handler_failures: AtomicU64,
}

impl Counters {
    pub(crate) fn published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn handler_failed(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record(&self, outcome: DeliveryOutcome) {
        let counter = match outcome {
            DeliveryOutcome::Delivered => &self.delivered,
            DeliveryOutcome::Retrying => &self.retried,
            DeliveryOutcome::Expired => &self.expired,
            DeliveryOutcome::Exhausted => &self.exhausted,
            DeliveryOutcome::NoSubscribers => &self.unrouted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> BusStats {
        BusStats {
            published: self.published.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            unrouted: self.unrouted.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }
}
