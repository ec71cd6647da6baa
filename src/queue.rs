use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use crate::types::QueueSnapshot;

/// Thread-safe priority queue with FIFO tie-breaking.
///
/// Higher `priority` dequeues first. Items with equal priority come out in the
/// order they went in. Every operation takes the internal lock once, so two
/// concurrent `dequeue()` calls can never receive the same item.
///
/// Dequeued items count as *processing* until [`complete()`](Self::complete)
/// is called for them.
pub struct PriorityQueue<T> {
    state: Mutex<QueueState<T>>,
}

struct QueueState<T> {
    heap: BinaryHeap<Entry<T>>,
    next_seq: u64,
    processing: usize,
    dequeued: u64,
    total_wait_ms: f64,
}

struct Entry<T> {
    priority: i32,
    seq: u64,
    enqueued_at: Instant,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    // Max-heap: greater priority wins, then the smaller sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PriorityQueue<T> {
    /// Create a new empty queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                processing: 0,
                dequeued: 0,
                total_wait_ms: 0.0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        // No operation leaves the state half-updated, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add an item at the given priority.
    pub fn enqueue(&self, item: T, priority: i32) {
        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Entry {
            priority,
            seq,
            enqueued_at: Instant::now(),
            item,
        });
    }

    /// Remove and return the next item, or `None` when nothing is waiting.
    pub fn dequeue(&self) -> Option<T> {
        let mut state = self.lock();
        let entry = state.heap.pop()?;
        state.processing += 1;
        state.dequeued += 1;
        state.total_wait_ms += entry.enqueued_at.elapsed().as_secs_f64() * 1000.0;
        Some(entry.item)
    }

    /// Mark one previously dequeued item as finished.
    pub fn complete(&self) {
        let mut state = self.lock();
        state.processing = state.processing.saturating_sub(1);
    }

    /// Inspect the next item without removing it.
    pub fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        self.lock().heap.peek().map(|e| e.item.clone())
    }

    /// Number of items waiting to be dequeued.
    pub fn size(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }

    /// Discard waiting items and return how many were dropped.
    ///
    /// With `drain_running`, the processing counter is reset as well and those
    /// items are included in the returned count. Items already handed to a
    /// caller are never recalled either way.
    pub fn clear(&self, drain_running: bool) -> usize {
        let mut state = self.lock();
        let mut cleared = state.heap.len();
        state.heap.clear();
        if drain_running {
            cleared += state.processing;
            state.processing = 0;
        }
        cleared
    }

    /// Snapshot the queue's liveness statistics.
    pub fn stats(&self) -> QueueSnapshot {
        let state = self.lock();
        let waiting = state.heap.len();
        let avg_wait_time_ms = if state.dequeued > 0 {
            state.total_wait_ms / state.dequeued as f64
        } else {
            0.0
        };
        QueueSnapshot {
            size: waiting + state.processing,
            waiting,
            processing: state.processing,
            avg_wait_time_ms,
        }
    }
}
