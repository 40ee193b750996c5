//! Pending-message buffer drained by the dispatcher
//!
//! One FIFO per priority class; `pop` always serves the highest non-empty
//! class first. Retries go to the back of their own class.

use crate::message::{Message, Priority};
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct PriorityQueue {
    high: VecDeque<Message>,
    normal: VecDeque<Message>,
    low: VecDeque<Message>,
    /// None = unbounded
    max_depth: Option<usize>,
}

impl PriorityQueue {
    pub fn new(max_depth: Option<usize>) -> Self {
        Self {
            max_depth,
            ..Self::default()
        }
    }

    /// Admit a freshly published message, handing it back when the queue is full
    pub fn push(&mut self, message: Message) -> Result<(), Message> {
        if self.max_depth.is_some_and(|max| self.len() >= max) {
            return Err(message);
        }
        self.class_mut(message.priority).push_back(message);
        Ok(())
    }

    /// Re-admit a message after a failed delivery. Ignores the depth bound.
    pub fn requeue(&mut self, message: Message) {
        self.class_mut(message.priority).push_back(message);
    }

    pub fn pop(&mut self) -> Option<Message> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    pub fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_depth(&self) -> Option<usize> {
        self.max_depth
    }

    /// Drop everything still pending, returning how many messages were discarded
    pub fn clear(&mut self) -> usize {
        let discarded = self.len();
        self.high.clear();
        self.normal.clear();
        self.low.clear();
        discarded
    }

    fn class_mut(&mut self, priority: Priority) -> &mut VecDeque<Message> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }
}
