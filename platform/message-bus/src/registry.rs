//! Subscription registry
//!
//! Holds exact-topic subscriptions in a lookup table and pattern
//! subscriptions in an ordered list. Identifiers are handed out from a
//! monotonic counter, so sorting by id reproduces registration order across
//! both collections.

use crate::message::Message;
use crate::pattern::TopicPattern;
use crate::BusError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Outcome of one handler invocation. Any error drives the retry policy.
pub type HandlerResult = anyhow::Result<()>;

/// A message handler
///
/// Implemented for every `Fn(Message) -> impl Future<Output = HandlerResult>`
/// closure, so most callers never name this trait. Implement it directly for
/// stateful handlers and register them with `MessageBus::subscribe_handler`.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, message: Message) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, message: Message) -> HandlerResult {
        (self)(message).await
    }
}

/// Opaque subscription identifier returned to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A registered (matcher, handler, owner) triple
pub struct Subscription {
    pub id: SubscriptionId,
    pub matcher: TopicPattern,
    pub owner: Option<String>,
    pub(crate) handler: Arc<dyn Handler>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("matcher", &self.matcher)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    next_id: u64,
    exact: HashMap<String, Vec<Arc<Subscription>>>,
    patterns: Vec<Arc<Subscription>>,
    /// id -> exact topic, or None for pattern subscriptions
    index: HashMap<SubscriptionId, Option<String>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an exact-topic subscription
    pub fn subscribe(
        &mut self,
        topic: &str,
        handler: Arc<dyn Handler>,
        owner: Option<&str>,
    ) -> Result<SubscriptionId, BusError> {
        if topic.is_empty() {
            return Err(BusError::EmptyTopic);
        }
        Ok(self.insert(TopicPattern::Exact(topic.to_string()), owner, |_| handler))
    }

    /// Validate and register a pattern subscription. Nothing is registered on error.
    pub fn subscribe_pattern(
        &mut self,
        pattern: &str,
        handler: Arc<dyn Handler>,
        owner: Option<&str>,
    ) -> Result<SubscriptionId, BusError> {
        let matcher = TopicPattern::parse(pattern)?;
        Ok(self.insert(matcher, owner, |_| handler))
    }

    /// Register a handler built from its own subscription id.
    ///
    /// Lets self-removing handlers know their id before they can be invoked.
    pub fn insert<M>(&mut self, matcher: TopicPattern, owner: Option<&str>, make_handler: M) -> SubscriptionId
    where
        M: FnOnce(SubscriptionId) -> Arc<dyn Handler>,
    {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        let subscription = Arc::new(Subscription {
            id,
            matcher: matcher.clone(),
            owner: owner.map(str::to_string),
            handler: make_handler(id),
        });

        match matcher {
            TopicPattern::Exact(topic) => {
                self.exact.entry(topic.clone()).or_default().push(subscription);
                self.index.insert(id, Some(topic));
            }
            TopicPattern::Prefix(_) => {
                self.patterns.push(subscription);
                self.index.insert(id, None);
            }
        }
        id
    }

    /// Remove one subscription. Returns whether anything was removed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let Some(slot) = self.index.remove(&id) else {
            return false;
        };

        match slot {
            Some(topic) => {
                if let Some(subs) = self.exact.get_mut(&topic) {
                    subs.retain(|s| s.id != id);
                    if subs.is_empty() {
                        self.exact.remove(&topic);
                    }
                }
            }
            None => self.patterns.retain(|s| s.id != id),
        }
        true
    }

    /// Remove every subscription tagged with `owner`, returning the count
    pub fn unsubscribe_by_owner(&mut self, owner: &str) -> usize {
        let owned: Vec<SubscriptionId> = self
            .exact
            .values()
            .flatten()
            .chain(self.patterns.iter())
            .filter(|s| s.owner.as_deref() == Some(owner))
            .map(|s| s.id)
            .collect();

        owned.into_iter().filter(|id| self.unsubscribe(*id)).count()
    }

    /// Remove every subscription and hand them back for dropping outside the lock
    pub fn drain(&mut self) -> Vec<Arc<Subscription>> {
        self.index.clear();
        let mut drained: Vec<Arc<Subscription>> = self
            .exact
            .drain()
            .flat_map(|(_, subs)| subs)
            .chain(self.patterns.drain(..))
            .collect();
        drained.sort_by_key(|s| s.id);
        drained
    }

    /// All subscriptions matching `topic`, in registration order
    pub fn matching(&self, topic: &str) -> Vec<Arc<Subscription>> {
        let mut matched: Vec<Arc<Subscription>> = self
            .exact
            .get(topic)
            .into_iter()
            .flatten()
            .chain(self.patterns.iter().filter(|s| s.matcher.matches(topic)))
            .cloned()
            .collect();
        matched.sort_by_key(|s| s.id);
        matched
    }

    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
