//! Stream-style consumption: a subscription whose messages are pulled
//! instead of pushed into a callback.

use crate::bus::{MessageBus, Shared};
use crate::message::Message;
use crate::pattern::looks_like_pattern;
use crate::registry::{Handler, HandlerResult, SubscriptionId};
use crate::BusResult;
use futures::stream::{BoxStream, StreamExt};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::debug;

/// Unsubscribes when the stream is dropped
struct StreamGuard {
    shared: Weak<Shared>,
    id: SubscriptionId,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.registry().unsubscribe(self.id);
            debug!(subscription = %self.id, "Stream subscription dropped");
        }
    }
}

impl MessageBus {
    /// Subscribe to a topic or `prefix.*` pattern and consume matches as a stream.
    ///
    /// Messages are accepted by the dispatcher as soon as they are buffered,
    /// so a stream never triggers retries. The stream ends on shutdown.
    pub fn subscribe_stream(
        &self,
        topic_or_pattern: &str,
        owner: Option<&str>,
    ) -> BusResult<BoxStream<'static, Message>> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let handler: Arc<dyn Handler> = Arc::new(move |message: Message| {
            // Receiver gone means the stream is being torn down
            let _ = tx.send(message);
            std::future::ready(HandlerResult::Ok(()))
        });

        let id = if looks_like_pattern(topic_or_pattern) {
            self.subscribe_pattern_handler(topic_or_pattern, handler, owner)?
        } else {
            self.subscribe_handler(topic_or_pattern, handler, owner)?
        };

        let guard = StreamGuard {
            shared: self.downgrade(),
            id,
        };
        let shared = self.downgrade();

        let stream = async_stream::stream! {
            let _guard = guard;
            loop {
                if shared.upgrade().map_or(true, |bus| bus.is_shut_down()) {
                    break;
                }
                match rx.recv().await {
                    Some(message) => yield message,
                    None => break,
                }
            }
        };

        Ok(stream.boxed())
    }
}
