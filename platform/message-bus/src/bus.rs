//! Public façade over the registry, queue and dispatcher

use crate::config::BusConfig;
use crate::dispatch;
use crate::message::{Message, PublishOptions};
use crate::pattern::TopicPattern;
use crate::queue::PriorityQueue;
use crate::registry::{Handler, HandlerResult, SubscriptionId, SubscriptionRegistry};
use crate::rpc::PendingCalls;
use crate::stats::{BusStats, Counters, DeliveryEvent, DeliveryOutcome};
use crate::{BusError, BusResult};
use chrono::Utc;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info};
use uuid::Uuid;

/// Locks never stay poisoned: every guarded section leaves state consistent
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct DispatchState {
    queue: PriorityQueue,
    in_flight: bool,
}

/// State shared by every handle, the dispatcher task and internal handlers
pub(crate) struct Shared {
    pub(crate) config: BusConfig,
    registry: Mutex<SubscriptionRegistry>,
    state: Mutex<DispatchState>,
    pub(crate) pending: PendingCalls,
    pub(crate) counters: Counters,
    outcomes: broadcast::Sender<DeliveryEvent>,
    /// New work or shutdown
    pub(crate) wake: Arc<Notify>,
    /// Queue drained and nothing in flight
    idle: Notify,
    shut_down: AtomicBool,
}

impl Shared {
    pub(crate) fn new(config: BusConfig) -> Self {
        let (outcomes, _) = broadcast::channel(config.outcome_channel_capacity.max(1));
        Self {
            state: Mutex::new(DispatchState {
                queue: PriorityQueue::new(config.max_queue_depth),
                in_flight: false,
            }),
            config,
            registry: Mutex::new(SubscriptionRegistry::new()),
            pending: PendingCalls::default(),
            counters: Counters::default(),
            outcomes,
            wake: Arc::new(Notify::new()),
            idle: Notify::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    pub(crate) fn registry(&self) -> MutexGuard<'_, SubscriptionRegistry> {
        lock(&self.registry)
    }

    pub(crate) fn publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
        options: PublishOptions,
    ) -> BusResult<Uuid> {
        if topic.is_empty() {
            self.counters.rejected();
            return Err(BusError::EmptyTopic);
        }
        if self.is_shut_down() {
            self.counters.rejected();
            return Err(BusError::ShutDown);
        }

        let message = Message::new(topic, payload, options, self.config.default_max_retries);
        let id = message.id;
        let priority = message.priority;

        {
            let mut state = lock(&self.state);
            if state.queue.push(message).is_err() {
                let depth = state.queue.len();
                drop(state);
                self.counters.rejected();
                tracing::warn!(topic = %topic, depth, "Publish rejected, queue is full");
                return Err(BusError::QueueFull(depth));
            }
        }

        self.counters.published();
        debug!(message_id = %id, topic = %topic, priority = %priority, "Message published");
        self.wake.notify_one();
        Ok(id)
    }

    pub(crate) fn requeue(&self, message: Message) {
        lock(&self.state).queue.requeue(message);
        self.wake.notify_one();
    }

    /// Pop the next message and mark the dispatcher busy
    pub(crate) fn begin_dispatch(&self) -> Option<Message> {
        let mut state = lock(&self.state);
        let next = state.queue.pop();
        state.in_flight = next.is_some();
        next
    }

    pub(crate) fn end_dispatch(&self) {
        let idle = {
            let mut state = lock(&self.state);
            state.in_flight = false;
            state.queue.is_empty()
        };
        if idle {
            self.idle.notify_waiters();
        }
    }

    fn is_idle(&self) -> bool {
        let state = lock(&self.state);
        state.queue.is_empty() && !state.in_flight
    }

    pub(crate) fn queue_depth(&self) -> usize {
        lock(&self.state).queue.len()
    }

    pub(crate) fn record(&self, message: &Message, outcome: DeliveryOutcome) {
        self.counters.record(outcome);
        // No receivers is fine
        let _ = self.outcomes.send(DeliveryEvent {
            message_id: message.id,
            topic: message.topic.clone(),
            attempts: message.attempts,
            outcome,
            at: Utc::now(),
        });
    }

    pub(crate) fn subscribe_outcomes(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.outcomes.subscribe()
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub(crate) fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let rejected = self.pending.reject_all();
        // Dropped outside the registry lock; this also ends open streams
        let removed = self.registry().drain();
        info!(
            rejected_calls = rejected,
            subscriptions = removed.len(),
            "Message bus shutting down"
        );
        drop(removed);
        self.wake.notify_one();
        self.idle.notify_waiters();
    }

    /// Discard whatever is still queued once the dispatcher stops
    pub(crate) fn discard_pending(&self) -> usize {
        let discarded = lock(&self.state).queue.clear();
        self.idle.notify_waiters();
        discarded
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Lets the dispatcher observe that every handle is gone
        self.wake.notify_one();
    }
}

/// Handle to an in-process message bus
///
/// Cheap to clone; all clones share one registry, queue and dispatcher.
/// The dispatcher stops on [`MessageBus::shutdown`] or when the last handle
/// is dropped. Handlers that capture a `MessageBus` clone keep the bus alive,
/// so call `shutdown` explicitly in that case.
///
/// # Example
/// ```rust
/// use message_bus::{Message, MessageBus};
/// use serde_json::json;
///
/// # async fn example() -> Result<(), message_bus::BusError> {
/// let bus = MessageBus::new();
/// bus.subscribe("user.created", |msg: Message| async move {
///     assert_eq!(msg.payload["user_id"], "123");
///     Ok(())
/// })?;
///
/// bus.publish("user.created", json!({"user_id": "123"}))?;
/// bus.flush().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MessageBus {
    pub(crate) shared: Arc<Shared>,
}

impl MessageBus {
    /// Create a bus with default settings and start its dispatcher
    ///
    /// # Panics
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Self {
        Self::start(BusConfig::default())
    }

    /// Validate `config`, then create a bus and start its dispatcher
    ///
    /// # Panics
    /// Must be called from within a Tokio runtime.
    pub fn with_config(config: BusConfig) -> BusResult<Self> {
        config.validate()?;
        Ok(Self::start(config))
    }

    fn start(config: BusConfig) -> Self {
        let shared = Arc::new(Shared::new(config));
        tokio::spawn(dispatch::run(Arc::downgrade(&shared), shared.wake.clone()));
        Self { shared }
    }

    pub(crate) fn downgrade(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }

    pub fn config(&self) -> &BusConfig {
        &self.shared.config
    }

    /// Enqueue a message with default options and return its id
    pub fn publish(&self, topic: &str, payload: serde_json::Value) -> BusResult<Uuid> {
        self.shared.publish(topic, payload, PublishOptions::default())
    }

    /// Enqueue a message and return its id. Delivery happens later on the dispatcher.
    pub fn publish_with(
        &self,
        topic: &str,
        payload: serde_json::Value,
        options: PublishOptions,
    ) -> BusResult<Uuid> {
        self.shared.publish(topic, payload, options)
    }

    /// Subscribe a handler to an exact topic
    pub fn subscribe<F, Fut>(&self, topic: &str, handler: F) -> BusResult<SubscriptionId>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.subscribe_handler(topic, Arc::new(handler), None)
    }

    /// Subscribe a handler to an exact topic on behalf of a plugin
    pub fn subscribe_with_plugin<F, Fut>(
        &self,
        topic: &str,
        owner: &str,
        handler: F,
    ) -> BusResult<SubscriptionId>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.subscribe_handler(topic, Arc::new(handler), Some(owner))
    }

    /// Subscribe an already boxed handler to an exact topic
    pub fn subscribe_handler(
        &self,
        topic: &str,
        handler: Arc<dyn Handler>,
        owner: Option<&str>,
    ) -> BusResult<SubscriptionId> {
        let id = self.shared.registry().subscribe(topic, handler, owner)?;
        debug!(subscription = %id, topic = %topic, owner = ?owner, "Subscribed");
        Ok(id)
    }

    /// Subscribe a handler to every topic matching `pattern` (`prefix.*`)
    pub fn subscribe_pattern<F, Fut>(&self, pattern: &str, handler: F) -> BusResult<SubscriptionId>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.subscribe_pattern_handler(pattern, Arc::new(handler), None)
    }

    pub fn subscribe_pattern_with_plugin<F, Fut>(
        &self,
        pattern: &str,
        owner: &str,
        handler: F,
    ) -> BusResult<SubscriptionId>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.subscribe_pattern_handler(pattern, Arc::new(handler), Some(owner))
    }

    pub fn subscribe_pattern_handler(
        &self,
        pattern: &str,
        handler: Arc<dyn Handler>,
        owner: Option<&str>,
    ) -> BusResult<SubscriptionId> {
        let id = self
            .shared
            .registry()
            .subscribe_pattern(pattern, handler, owner)
            .inspect_err(|e| tracing::warn!(pattern = %pattern, error = %e, "Pattern rejected"))?;
        debug!(subscription = %id, pattern = %pattern, owner = ?owner, "Subscribed to pattern");
        Ok(id)
    }

    /// Subscribe a handler that runs at most once, then removes itself.
    ///
    /// `topic` may be an exact topic or a `prefix.*` pattern.
    pub fn subscribe_once<F, Fut>(&self, topic: &str, handler: F) -> BusResult<SubscriptionId>
    where
        F: FnOnce(Message) -> Fut + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_once(topic, None, handler)
    }

    pub fn subscribe_once_with_plugin<F, Fut>(
        &self,
        topic: &str,
        owner: &str,
        handler: F,
    ) -> BusResult<SubscriptionId>
    where
        F: FnOnce(Message) -> Fut + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_once(topic, Some(owner), handler)
    }

    fn register_once<F, Fut>(&self, topic: &str, owner: Option<&str>, handler: F) -> BusResult<SubscriptionId>
    where
        F: FnOnce(Message) -> Fut + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let matcher = match TopicPattern::parse(topic) {
            Err(crate::PatternError::Empty) => return Err(BusError::EmptyTopic),
            other => other?,
        };
        let bus = self.downgrade();
        let slot = Arc::new(Mutex::new(Some(handler)));

        let id = self.shared.registry().insert(matcher, owner, move |id| {
            Arc::new(move |message: Message| {
                let taken = lock(&slot).take();
                let bus = bus.clone();
                async move {
                    let Some(handler) = taken else {
                        return Ok(());
                    };
                    if let Some(shared) = bus.upgrade() {
                        shared.registry().unsubscribe(id);
                    }
                    handler(message).await
                }
            })
        });
        debug!(subscription = %id, topic = %topic, owner = ?owner, "Subscribed once");
        Ok(id)
    }

    /// Remove one subscription. Returns whether anything was removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.shared.registry().unsubscribe(id);
        debug!(subscription = %id, removed, "Unsubscribed");
        removed
    }

    /// Remove every subscription owned by `owner`, exact and pattern alike
    pub fn unsubscribe_by_plugin(&self, owner: &str) -> usize {
        let removed = self.shared.registry().unsubscribe_by_owner(owner);
        info!(owner = %owner, removed, "Plugin subscriptions removed");
        removed
    }

    /// Receive a [`DeliveryEvent`] for every dispatch outcome from now on
    pub fn outcomes(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.shared.subscribe_outcomes()
    }

    pub fn stats(&self) -> BusStats {
        self.shared.counters.snapshot()
    }

    pub fn queue_depth(&self) -> usize {
        self.shared.queue_depth()
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.registry().len()
    }

    pub fn pending_rpc_count(&self) -> usize {
        self.shared.pending.len()
    }

    /// Wait until the queue is empty and no message is being dispatched.
    ///
    /// Calling this from inside a handler never returns, since that handler
    /// is itself the in-flight dispatch.
    pub async fn flush(&self) {
        loop {
            let idle = self.shared.idle.notified();
            if self.shared.is_idle() || self.shared.is_shut_down() {
                return;
            }
            idle.await;
        }
    }

    /// Stop the dispatcher after the in-flight message finishes.
    ///
    /// Later publishes fail with [`BusError::ShutDown`], queued messages are
    /// discarded and waiting requests fail with `RpcError::ShutDown`.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.is_shut_down()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("queue_depth", &self.queue_depth())
            .field("subscriptions", &self.subscription_count())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
