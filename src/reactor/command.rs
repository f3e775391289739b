//! Deferred session commands
//!
//! Any thread may enqueue a [`Command`] on a session through its
//! [`SessionHandle`](super::SessionHandle). The owning worker drains them in
//! priority order, FIFO within a priority tier.

use crate::http::exchange::ClientExchangeHandler;
use crate::http::Error;
use std::collections::VecDeque;
use std::fmt;

/// Command priority tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Drained before any normal command
    Immediate,
    /// Default tier
    Normal,
}

/// How a session or connection is shut down
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CloseMode {
    /// Finish in-flight exchanges, then close
    Graceful,
    /// Tear down now, failing anything in flight
    Immediate,
}

/// A unit of work targeting one session
pub enum Command {
    /// Start a new request/response exchange
    Execute(Box<dyn ClientExchangeHandler>),
    /// Shut the connection down
    Shutdown(CloseMode),
}

impl Command {
    /// Cancel a command that will never run.
    ///
    /// Execute commands report `Error::Cancelled` to their handler and
    /// release its resources.
    pub fn cancel(self) {
        if let Command::Execute(mut handler) = self {
            handler.failed(&Error::Cancelled);
            handler.release_resources();
        }
    }

    /// Fail a command that was pulled but could not be started.
    pub fn fail(self, cause: &Error) {
        if let Command::Execute(mut handler) = self {
            handler.failed(cause);
            handler.release_resources();
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Execute(_) => write!(f, "Execute"),
            Command::Shutdown(mode) => write!(f, "Shutdown({:?})", mode),
        }
    }
}

/// Two-tier priority queue
///
/// `Immediate` items always pop before `Normal` ones; items of the same tier
/// pop in the order they were pushed.
#[derive(Debug)]
pub struct CommandQueue<T> {
    immediate: VecDeque<T>,
    normal: VecDeque<T>,
}

impl<T> CommandQueue<T> {
    pub fn new() -> Self {
        CommandQueue {
            immediate: VecDeque::new(),
            normal: VecDeque::new(),
        }
    }

    pub fn push(&mut self, item: T, priority: Priority) {
        match priority {
            Priority::Immediate => self.immediate.push_back(item),
            Priority::Normal => self.normal.push_back(item),
        }
    }

    pub fn pop(&mut self) -> Option<T> {
        self.immediate.pop_front().or_else(|| self.normal.pop_front())
    }

    /// Tier of the next item to pop
    pub fn peek_priority(&self) -> Option<Priority> {
        if !self.immediate.is_empty() {
            Some(Priority::Immediate)
        } else if !self.normal.is_empty() {
            Some(Priority::Normal)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.immediate.len() + self.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.immediate.is_empty() && self.normal.is_empty()
    }

    /// Remove every item in pop order
    pub fn drain(&mut self) -> Vec<T> {
        let mut items = Vec::with_capacity(self.len());
        items.extend(self.immediate.drain(..));
        items.extend(self.normal.drain(..));
        items
    }
}

impl<T> Default for CommandQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_within_tier() {
        let mut queue = CommandQueue::new();
        for i in 0..5 {
            queue.push(i, Priority::Normal);
        }
        let popped: Vec<_> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(popped, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_immediate_before_normal() {
        let mut queue = CommandQueue::new();
        queue.push("n1", Priority::Normal);
        queue.push("i1", Priority::Immediate);
        queue.push("n2", Priority::Normal);
        queue.push("i2", Priority::Immediate);

        assert_eq!(queue.peek_priority(), Some(Priority::Immediate));
        let popped: Vec<_> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(popped, vec!["i1", "i2", "n1", "n2"]);
        assert!(queue.is_empty());
        assert_eq!(queue.peek_priority(), None);
    }

    #[test]
    fn test_priority_order_is_non_decreasing() {
        // Interleave tiers with a deterministic pattern and check the popped
        // sequence never goes from Normal back to Immediate, and stays FIFO.
        let mut queue = CommandQueue::new();
        let mut expected_immediate = Vec::new();
        let mut expected_normal = Vec::new();
        for i in 0..100u32 {
            let priority = if (i * 7 + 3) % 5 < 2 {
                expected_immediate.push(i);
                Priority::Immediate
            } else {
                expected_normal.push(i);
                Priority::Normal
            };
            queue.push((priority, i), priority);
        }

        let popped: Vec<_> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(popped.len(), 100);
        assert!(popped.windows(2).all(|w| w[0].0 <= w[1].0));

        let immediate: Vec<_> = popped
            .iter()
            .filter(|(p, _)| *p == Priority::Immediate)
            .map(|(_, i)| *i)
            .collect();
        let normal: Vec<_> = popped
            .iter()
            .filter(|(p, _)| *p == Priority::Normal)
            .map(|(_, i)| *i)
            .collect();
        assert_eq!(immediate, expected_immediate);
        assert_eq!(normal, expected_normal);
    }

    #[test]
    fn test_drain_preserves_pop_order() {
        let mut queue = CommandQueue::new();
        queue.push(1, Priority::Normal);
        queue.push(2, Priority::Immediate);
        queue.push(3, Priority::Normal);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.drain(), vec![2, 1, 3]);
        assert!(queue.is_empty());
    }
}
