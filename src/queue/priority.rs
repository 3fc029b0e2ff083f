//! Bucketed message queue.

use std::time::{Duration, Instant};

use super::{BucketQueue, Bookkeeping, MessageQueue, BUCKETS};
use crate::message::Message;

/// How a message is mapped to a bucket (higher is sent first).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketRule {
    /// Fewer hops first.
    FewerHops,
    /// More hops first.
    MoreHops,
    /// Replies to queries with few results routed so far first; the volume
    /// is read from [`Message::priority`].
    ReplyVolume,
    /// Always the same bucket.
    Fixed(usize),
}

impl BucketRule {
    /// Bucket for `message`.
    pub fn bucket(self, message: &Message) -> usize {
        let top = BUCKETS - 1;
        let hops = usize::from(message.hops()).min(top);
        match self {
            BucketRule::FewerHops => top - hops,
            BucketRule::MoreHops => hops,
            BucketRule::ReplyVolume => {
                let volume = u64::from(message.priority()) + 1;
                let magnitude = (63 - volume.leading_zeros()) as usize;
                top - magnitude.min(top)
            },
            BucketRule::Fixed(bucket) => bucket.min(top),
        }
    }
}

/// Bounded bucket queue with LIFO order inside each bucket.
#[derive(Debug)]
pub struct PriorityMessageQueue {
    book: Bookkeeping,
    rule: BucketRule,
    queue: BucketQueue<Message>,
}

impl PriorityMessageQueue {
    /// Create a queue.
    pub fn new(cycle: usize, timeout: Option<Duration>, capacity: usize, rule: BucketRule) -> Self {
        Self {
            book: Bookkeeping::new(cycle, timeout),
            rule,
            queue: BucketQueue::new(BUCKETS, capacity),
        }
    }
}

impl MessageQueue for PriorityMessageQueue {
    fn add(&mut self, message: Message) {
        let bucket = self.rule.bucket(&message);
        if self.queue.insert(message, bucket).is_some() {
            self.book.record_drops(1);
        }
    }

    fn remove_next_at(&mut self, now: Instant) -> Option<Message> {
        let queue = &mut self.queue;
        self.book.take_fresh(now, || queue.extract_max())
    }

    fn reset_cycle(&mut self) {
        self.book.reset_cycle();
    }

    fn reset_dropped(&mut self) -> usize {
        self.book.reset_dropped()
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn timeout(&self) -> Option<Duration> {
        self.book.timeout()
    }
}
