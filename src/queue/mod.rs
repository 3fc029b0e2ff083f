//! Outbound flow control (SACHRIFC).
//!
//! Every connection owns one [`CompositeQueue`]. Messages handed to
//! [`crate::connection::Connection::send`] are classified into one of eight
//! fixed classes, each an independently bounded and timed [`MessageQueue`].
//! The writer pulls with biased round-robin: each class may yield up to its
//! cycle allowance before the cursor moves on.
//!
//! ```text
//!  send() ──classify──┬─> [0 watchdog   ] simple, LIFO, 1 slot
//!                     ├─> [1 push       ] buckets by hops
//!                     ├─> [2 query-reply] buckets by reply volume
//!                     ├─> [3 query      ] buckets by hops
//!                     ├─> [4 ping-reply ] buckets, high hops first
//!                     ├─> [5 ping       ] buckets by hops
//!                     ├─> [6 our-query  ] top bucket only
//!                     └─> [7 other      ] simple, FIFO
//!                                 │
//!                      remove_next() round-robin ──> writer
//! ```
//!
//! Messages older than their class timeout are discarded on removal, and
//! capacity overflow evicts the lowest-priority oldest entry. Both count as
//! drops, reported once through `reset_dropped`.

mod bucket;
mod composite;
mod priority;
mod simple;

use std::time::{Duration, Instant};

use crate::message::{Message, MessageKind};

pub use bucket::BucketQueue;
pub use composite::CompositeQueue;
pub use priority::{BucketRule, PriorityMessageQueue};
pub use simple::{Order, SimpleMessageQueue};

/// Number of buckets in every priority class.
pub const BUCKETS: usize = 8;

/// A bounded, timed queue of outbound messages.
pub trait MessageQueue: Send {
    /// Add a message, evicting an older one if the class is full.
    fn add(&mut self, message: Message);

    /// Next fresh message as of `now`, or `None` when empty or the cycle
    /// allowance is spent.
    fn remove_next_at(&mut self, now: Instant) -> Option<Message>;

    /// [`MessageQueue::remove_next_at`] with the current time.
    fn remove_next(&mut self) -> Option<Message> {
        self.remove_next_at(Instant::now())
    }

    /// Restore the cycle allowance.
    fn reset_cycle(&mut self);

    /// Drops since the previous call.
    fn reset_dropped(&mut self) -> usize;

    /// Messages currently stored, including ones that may have expired.
    fn len(&self) -> usize;

    /// Whether nothing is stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum age, if any.
    fn timeout(&self) -> Option<Duration>;
}

/// Outbound priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueClass {
    /// Keep-alive probes and their replies.
    Watchdog = 0,
    /// Push requests.
    Push = 1,
    /// Query replies.
    QueryReply = 2,
    /// Relayed queries.
    Query = 3,
    /// Ping replies.
    PingReply = 4,
    /// Relayed pings.
    Ping = 5,
    /// Queries this node originated.
    OurQuery = 6,
    /// Everything else; strict FIFO.
    Other = 7,
}

impl QueueClass {
    /// All classes in round-robin order.
    pub const ALL: [QueueClass; 8] = [
        QueueClass::Watchdog,
        QueueClass::Push,
        QueueClass::QueryReply,
        QueueClass::Query,
        QueueClass::PingReply,
        QueueClass::Ping,
        QueueClass::OurQuery,
        QueueClass::Other,
    ];

    /// Position in round-robin order.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Class of an outbound message.
    pub fn classify(message: &Message) -> Self {
        classify(message.kind(), message.hops(), message.ttl(), message.is_originated())
    }
}

/// Pure classification over the routing fields of a message.
pub fn classify(kind: &MessageKind, hops: u8, ttl: u8, originated: bool) -> QueueClass {
    match kind {
        MessageKind::Query if originated => QueueClass::OurQuery,
        MessageKind::Query => QueueClass::Query,
        MessageKind::QueryReply => QueueClass::QueryReply,
        MessageKind::PingReply if hops == 0 && ttl <= 2 => QueueClass::Watchdog,
        MessageKind::PingReply => QueueClass::PingReply,
        MessageKind::Ping if hops == 0 && ttl == 1 => QueueClass::Watchdog,
        MessageKind::Ping => QueueClass::Ping,
        MessageKind::Push => QueueClass::Push,
        MessageKind::RouteTableUpdate | MessageKind::Vendor { .. } => QueueClass::Other,
    }
}

/// Cycle and drop accounting shared by every queue kind.
#[derive(Debug, Clone)]
pub struct Bookkeeping {
    cycle_size: usize,
    left_in_cycle: usize,
    timeout: Option<Duration>,
    dropped: usize,
}

impl Bookkeeping {
    /// Accounting for a queue yielding `cycle_size` messages per cycle.
    pub fn new(cycle_size: usize, timeout: Option<Duration>) -> Self {
        Self {
            cycle_size,
            left_in_cycle: cycle_size,
            timeout,
            dropped: 0,
        }
    }

    /// Restore the cycle allowance.
    pub fn reset_cycle(&mut self) {
        self.left_in_cycle = self.cycle_size;
    }

    /// Count `n` evicted or expired messages.
    pub fn record_drops(&mut self, n: usize) {
        self.dropped += n;
    }

    /// Drops since the previous call.
    pub fn reset_dropped(&mut self) -> usize {
        std::mem::take(&mut self.dropped)
    }

    /// Maximum age.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Whether `message` is older than the timeout at `now`.
    pub fn is_expired(&self, message: &Message, now: Instant) -> bool {
        self.timeout
            .is_some_and(|t| now.saturating_duration_since(message.created_at()) > t)
    }

    /// Pop until a fresh message turns up, dropping expired ones, and charge
    /// it against the cycle allowance.
    pub fn take_fresh(
        &mut self,
        now: Instant,
        mut pop: impl FnMut() -> Option<Message>,
    ) -> Option<Message> {
        if self.left_in_cycle == 0 {
            return None;
        }
        while let Some(message) = pop() {
            if self.is_expired(&message, now) {
                self.dropped += 1;
                continue;
            }
            self.left_in_cycle -= 1;
            return Some(message);
        }
        None
    }
}
