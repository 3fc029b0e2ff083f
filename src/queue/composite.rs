//! Per-connection aggregate of the eight outbound classes.

use std::time::{Duration, Instant};

use super::{BucketRule, MessageQueue, Order, PriorityMessageQueue, QueueClass, SimpleMessageQueue};
use crate::config::QueueConfig;
use crate::message::Message;

/// Biased round-robin over one queue per [`QueueClass`].
pub struct CompositeQueue {
    queues: [Box<dyn MessageQueue>; 8],
    cursor: usize,
    hint: Option<usize>,
    fresh_cycle: bool,
    size: usize,
}

impl CompositeQueue {
    /// Build the class queues from `config`.
    pub fn new(config: &QueueConfig) -> Self {
        let short = Some(config.short_timeout());
        let normal = Some(config.normal_timeout());
        let big = config.big_capacity;
        let small = config.normal_capacity;

        let queues: [Box<dyn MessageQueue>; 8] = [
            Box::new(SimpleMessageQueue::new(1, None, 1, Order::Lifo)),
            Box::new(PriorityMessageQueue::new(6, short, big, BucketRule::FewerHops)),
            Box::new(PriorityMessageQueue::new(6, short, big, BucketRule::ReplyVolume)),
            Box::new(PriorityMessageQueue::new(3, normal, big, BucketRule::FewerHops)),
            Box::new(PriorityMessageQueue::new(1, normal, small, BucketRule::MoreHops)),
            Box::new(PriorityMessageQueue::new(1, normal, small, BucketRule::FewerHops)),
            Box::new(PriorityMessageQueue::new(10, short, big, BucketRule::Fixed(7))),
            Box::new(SimpleMessageQueue::new(1, None, big, Order::Fifo)),
        ];

        Self {
            queues,
            cursor: 0,
            hint: None,
            fresh_cycle: true,
            size: 0,
        }
    }

    /// Stored messages in one class.
    pub fn class_len(&self, class: QueueClass) -> usize {
        self.queues[class.index()].len()
    }

    /// Maximum age of messages in one class.
    pub fn timeout_for(&self, class: QueueClass) -> Option<Duration> {
        self.queues[class.index()].timeout()
    }

    fn check_size(&self) {
        debug_assert_eq!(
            self.size,
            self.queues.iter().map(|q| q.len()).sum::<usize>(),
            "composite size out of sync with class queues"
        );
    }
}

impl Default for CompositeQueue {
    fn default() -> Self {
        Self::new(&QueueConfig::default())
    }
}

impl std::fmt::Debug for CompositeQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lens: Vec<usize> = self.queues.iter().map(|q| q.len()).collect();
        f.debug_struct("CompositeQueue")
            .field("cursor", &self.cursor)
            .field("size", &self.size)
            .field("class_lens", &lens)
            .finish()
    }
}

impl MessageQueue for CompositeQueue {
    fn add(&mut self, message: Message) {
        let index = QueueClass::classify(&message).index();
        let queue = &mut self.queues[index];
        let before = queue.len();
        queue.add(message);
        let after = queue.len();
        self.size = self.size + after - before;
        self.hint = Some(index);
        self.check_size();
    }

    fn remove_next_at(&mut self, now: Instant) -> Option<Message> {
        if self.fresh_cycle {
            self.fresh_cycle = false;
            if let Some(hint) = self.hint {
                self.cursor = hint;
            }
            self.queues[self.cursor].reset_cycle();
        }

        while self.size > 0 {
            let queue = &mut self.queues[self.cursor];
            let before = queue.len();
            let next = queue.remove_next_at(now);
            let after = queue.len();
            self.size = self.size - before + after;
            if next.is_some() {
                self.check_size();
                return next;
            }
            self.cursor = (self.cursor + 1) % self.queues.len();
            self.queues[self.cursor].reset_cycle();
        }

        self.check_size();
        self.fresh_cycle = true;
        None
    }

    fn reset_cycle(&mut self) {
        self.fresh_cycle = true;
    }

    fn reset_dropped(&mut self) -> usize {
        self.queues.iter_mut().map(|q| q.reset_dropped()).sum()
    }

    fn len(&self) -> usize {
        self.size
    }

    fn timeout(&self) -> Option<Duration> {
        None
    }
}
