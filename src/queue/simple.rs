//! Single-list message queue.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::{Bookkeeping, MessageQueue};
use crate::message::Message;

/// Removal order of a [`SimpleMessageQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// Oldest first.
    Fifo,
    /// Newest first.
    Lifo,
}

/// Bounded list; overflow evicts the oldest message.
#[derive(Debug)]
pub struct SimpleMessageQueue {
    book: Bookkeeping,
    order: Order,
    capacity: usize,
    items: VecDeque<Message>,
}

impl SimpleMessageQueue {
    /// Create a queue.
    pub fn new(cycle: usize, timeout: Option<Duration>, capacity: usize, order: Order) -> Self {
        Self {
            book: Bookkeeping::new(cycle, timeout),
            order,
            capacity: capacity.max(1),
            items: VecDeque::new(),
        }
    }
}

impl MessageQueue for SimpleMessageQueue {
    fn add(&mut self, message: Message) {
        if self.items.len() >= self.capacity {
            self.items.pop_front();
            self.book.record_drops(1);
        }
        self.items.push_back(message);
    }

    fn remove_next_at(&mut self, now: Instant) -> Option<Message> {
        let items = &mut self.items;
        match self.order {
            Order::Fifo => self.book.take_fresh(now, || items.pop_front()),
            Order::Lifo => self.book.take_fresh(now, || items.pop_back()),
        }
    }

    fn reset_cycle(&mut self) {
        self.book.reset_cycle();
    }

    fn reset_dropped(&mut self) -> usize {
        self.book.reset_dropped()
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn timeout(&self) -> Option<Duration> {
        self.book.timeout()
    }
}
