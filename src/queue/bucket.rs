//! Fixed-bucket priority queue.

use std::collections::VecDeque;

/// Bounded priority queue with a fixed number of buckets.
///
/// Higher bucket index means higher priority. Within a bucket the newest
/// item comes out first. When full, an insert evicts the oldest item of the
/// lowest non-empty bucket and returns it.
#[derive(Debug, Clone)]
pub struct BucketQueue<T> {
    buckets: Vec<VecDeque<T>>,
    capacity: usize,
    len: usize,
}

impl<T> BucketQueue<T> {
    /// Queue with `buckets` priorities holding at most `capacity` items.
    pub fn new(buckets: usize, capacity: usize) -> Self {
        Self {
            buckets: (0..buckets.max(1)).map(|_| VecDeque::new()).collect(),
            capacity: capacity.max(1),
            len: 0,
        }
    }

    /// Insert at `priority` (clamped to the top bucket). Returns the evicted
    /// item when the queue was full.
    pub fn insert(&mut self, item: T, priority: usize) -> Option<T> {
        let evicted = if self.len >= self.capacity {
            self.evict_lowest()
        } else {
            None
        };
        let top = self.buckets.len() - 1;
        self.buckets[priority.min(top)].push_front(item);
        self.len += 1;
        evicted
    }

    /// Remove the newest item of the highest non-empty bucket.
    pub fn extract_max(&mut self) -> Option<T> {
        let item = self
            .buckets
            .iter_mut()
            .rev()
            .find_map(|bucket| bucket.pop_front())?;
        self.len -= 1;
        Some(item)
    }

    fn evict_lowest(&mut self) -> Option<T> {
        let item = self
            .buckets
            .iter_mut()
            .find_map(|bucket| bucket.pop_back())?;
        self.len -= 1;
        Some(item)
    }

    /// Items stored.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum items stored.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items in one bucket.
    pub fn bucket_len(&self, priority: usize) -> usize {
        self.buckets.get(priority).map_or(0, VecDeque::len)
    }
}
