//! Dispatch loop
//!
//! A single task drains the queue one message at a time. For each message:
//!
//! 1. Drop it if its deadline already passed (no handler runs)
//! 2. Resolve matching subscriptions in registration order
//! 3. Bump `attempts` once for the cycle
//! 4. For each handler: invoke, await the outcome
//! 5. On the first failure, hand the message to the retry policy and stop
//!
//! Handlers never run concurrently with each other. A handler that panics
//! or exceeds the message's `timeout` counts as a failure.

use crate::bus::Shared;
use crate::message::Message;
use crate::registry::Handler;
use crate::registry::SubscriptionId;
use crate::retry::{self, RetryDecision};
use crate::stats::DeliveryOutcome;
use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn, Instrument};

/// A handler failed during dispatch. Never reaches the publisher.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("handler {subscription} failed: {reason}")]
pub struct HandlerFailure {
    pub subscription: SubscriptionId,
    pub reason: String,
}

/// Dispatcher task body. Exits on shutdown or once every bus handle is gone.
pub(crate) async fn run(shared: Weak<Shared>, wake: Arc<Notify>) {
    info!("Message bus dispatcher started");

    loop {
        let Some(bus) = shared.upgrade() else {
            break;
        };
        if bus.is_shut_down() {
            let discarded = bus.discard_pending();
            if discarded > 0 {
                warn!(discarded, "Discarded queued messages on shutdown");
            }
            break;
        }

        if let Some(message) = bus.begin_dispatch() {
            let span = tracing::info_span!(
                "dispatch",
                message_id = %message.id,
                topic = %message.topic,
                priority = %message.priority,
            );
            dispatch_one(&bus, message).instrument(span).await;
            bus.end_dispatch();
            drop(bus);
            // Let publishers and RPC callers run between messages
            tokio::task::yield_now().await;
            continue;
        }

        bus.end_dispatch();
        drop(bus);
        wake.notified().await;
    }

    info!("Message bus dispatcher stopped");
}

/// Run one full dispatch cycle for `message` and settle it
pub(crate) async fn dispatch_one(shared: &Shared, mut message: Message) -> DeliveryOutcome {
    if message.is_expired() {
        warn!(attempts = message.attempts, "Message expired before delivery, dropping");
        shared.record(&message, DeliveryOutcome::Expired);
        return DeliveryOutcome::Expired;
    }

    let result = deliver(shared, &mut message).await;
    settle(shared, message, result)
}

/// Invoke every matching handler once, in registration order.
///
/// One call is one delivery attempt, however many handlers match. Returns how
/// many handlers ran, or the first failure. Subscriptions removed while the
/// cycle is running are skipped.
pub(crate) async fn deliver(shared: &Shared, message: &mut Message) -> Result<usize, HandlerFailure> {
    let subscriptions = shared.registry().matching(&message.topic);
    if subscriptions.is_empty() {
        return Ok(0);
    }

    message.attempts += 1;
    let mut invoked = 0;

    for subscription in subscriptions {
        if !shared.registry().contains(subscription.id) {
            continue;
        }

        invoked += 1;

        if let Err(reason) = invoke(subscription.handler.clone(), message.clone(), message.timeout).await {
            shared.counters.handler_failed();
            return Err(HandlerFailure {
                subscription: subscription.id,
                reason,
            });
        }
    }

    Ok(invoked)
}

/// Apply the outcome of one delivery: complete, requeue or drop
pub(crate) fn settle(
    shared: &Shared,
    message: Message,
    result: Result<usize, HandlerFailure>,
) -> DeliveryOutcome {
    let outcome = match result {
        Ok(0) => {
            debug!("No subscribers matched, message discarded");
            DeliveryOutcome::NoSubscribers
        }
        Ok(handlers) => {
            debug!(handlers, attempts = message.attempts, "Message delivered");
            DeliveryOutcome::Delivered
        }
        Err(failure) => {
            warn!(
                subscription = %failure.subscription,
                attempts = message.attempts,
                max_retries = message.max_retries,
                error = %failure.reason,
                "Handler failed"
            );

            match retry::decide(&message, Utc::now()) {
                RetryDecision::Requeue => DeliveryOutcome::Retrying,
                RetryDecision::Expired => {
                    warn!(attempts = message.attempts, "Message expired after failure, dropping");
                    DeliveryOutcome::Expired
                }
                RetryDecision::Exhausted => {
                    warn!(
                        attempts = message.attempts,
                        max_retries = message.max_retries,
                        "Retries exhausted, dropping message"
                    );
                    DeliveryOutcome::Exhausted
                }
            }
        }
    };

    shared.record(&message, outcome);
    if outcome == DeliveryOutcome::Retrying {
        shared.requeue(message);
    }
    outcome
}

async fn invoke(handler: Arc<dyn Handler>, message: Message, timeout: Option<Duration>) -> Result<(), String> {
    let call = AssertUnwindSafe(handler.handle(message)).catch_unwind();

    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(outcome) => outcome,
            Err(_) => return Err(format!("handler timed out after {}ms", limit.as_millis())),
        },
        None => call.await,
    };

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(panic) => Err(format!("handler panicked: {}", panic_message(&*panic))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
