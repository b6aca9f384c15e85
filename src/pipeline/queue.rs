//! Bounded async queue with backpressure and an optional priority order.
//!
//! Two semaphores track free slots and filled slots, so `push` suspends while
//! the queue is full and `pop` suspends while it is empty. The queue never
//! holds more than `capacity` messages.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Semaphore;

use crate::data_model::WorkItem;
use crate::error::{ExecutorError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Message<T> {
    Item(WorkItem<T>),
    /// One per consumer; a consumer exits when it dequeues one.
    Stop,
}

struct Entry<T> {
    message: Message<T>,
    seq: u64,
}

impl<T> Entry<T> {
    fn rank(&self) -> (bool, i64) {
        match &self.message {
            Message::Item(item) => (true, item.priority),
            Message::Stop => (false, i64::MIN),
        }
    }
}

// Max-heap order: items before sentinels, then higher priority, then
// earlier insertion.
impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.rank()
            .cmp(&other.rank())
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl<T> Eq for Entry<T> {}

enum Storage<T> {
    Fifo(VecDeque<Entry<T>>),
    Priority(BinaryHeap<Entry<T>>),
}

impl<T> Storage<T> {
    fn push(&mut self, entry: Entry<T>) {
        match self {
            Storage::Fifo(queue) => queue.push_back(entry),
            Storage::Priority(heap) => heap.push(entry),
        }
    }

    fn pop(&mut self) -> Option<Entry<T>> {
        match self {
            Storage::Fifo(queue) => queue.pop_front(),
            Storage::Priority(heap) => heap.pop(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Storage::Fifo(queue) => queue.len(),
            Storage::Priority(heap) => heap.len(),
        }
    }
}

struct Inner<T> {
    storage: Storage<T>,
    next_seq: u64,
    dequeued: u64,
}

pub struct BoundedQueue<T> {
    capacity: usize,
    inner: Mutex<Inner<T>>,
    slots: Semaphore,
    filled: Semaphore,
    high_water: AtomicUsize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize, priority: bool) -> Result<Self> {
        if capacity == 0 {
            return Err(ExecutorError::ConfigError(
                "BoundedQueue: capacity must be greater than 0".to_string(),
            ));
        }
        let storage = if priority {
            Storage::Priority(BinaryHeap::with_capacity(capacity))
        } else {
            Storage::Fifo(VecDeque::with_capacity(capacity))
        };
        Ok(BoundedQueue {
            capacity,
            inner: Mutex::new(Inner {
                storage,
                next_seq: 0,
                dequeued: 0,
            }),
            slots: Semaphore::new(capacity),
            filled: Semaphore::new(0),
            high_water: AtomicUsize::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_priority(&self) -> bool {
        matches!(self.lock().storage, Storage::Priority(_))
    }

    pub fn len(&self) -> usize {
        self.lock().storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Largest occupancy observed so far.
    pub fn high_water_mark(&self) -> usize {
        self.high_water.load(Ordering::SeqCst)
    }

    /// Waits for a free slot, then enqueues.
    pub async fn push(&self, message: Message<T>) -> Result<()> {
        let permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| ExecutorError::Unexpected("queue closed".to_string()))?;
        permit.forget();
        {
            let mut inner = self.lock();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.storage.push(Entry { message, seq });
            self.high_water
                .fetch_max(inner.storage.len(), Ordering::SeqCst);
        }
        self.filled.add_permits(1);
        Ok(())
    }

    /// Waits for a message and returns it with its dequeue position
    /// (0, 1, 2, ... across all consumers).
    pub async fn pop(&self) -> Option<(u64, Message<T>)> {
        let permit = self.filled.acquire().await.ok()?;
        permit.forget();
        let popped = {
            let mut inner = self.lock();
            let entry = inner.storage.pop()?;
            let order = inner.dequeued;
            inner.dequeued += 1;
            (order, entry.message)
        };
        self.slots.add_permits(1);
        Some(popped)
    }
}
