//! Retry/expiry policy for failed deliveries
//!
//! Decides what happens to a message after one of its handlers fails:
//!
//! 1. Deadline passed: drop as expired
//! 2. `attempts < max_retries`: requeue at the back of its priority class
//! 3. Otherwise: drop as exhausted
//!
//! There is no backoff delay. A retried message is eligible again as soon
//! as it reaches the front of its class.

use crate::message::Message;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Requeue,
    Expired,
    Exhausted,
}

/// Decide the fate of `message` after a failed delivery at `now`
pub fn decide(message: &Message, now: DateTime<Utc>) -> RetryDecision {
    if message.is_expired_at(now) {
        RetryDecision::Expired
    } else if message.attempts < message.max_retries {
        RetryDecision::Requeue
    } else {
        RetryDecision::Exhausted
    }
}
