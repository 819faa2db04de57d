//! Delay queue feeding the retry worker pool.
//!
//! A sequence waiting for its next attempt sits here instead of sleeping on
//! a worker thread, so backoff waits never pin a worker.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

struct Entry<T> {
    due: Instant,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    // Reversed: `BinaryHeap` is a max-heap, the earliest due entry must win.
    // `seq` keeps FIFO order among entries due at the same instant.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState<T> {
    heap: BinaryHeap<Entry<T>>,
    next_seq: u64,
    closed: bool,
}

/// Blocking min-heap of items keyed by the instant they become ready.
pub struct DelayQueue<T> {
    state: Mutex<QueueState<T>>,
    ready: Condvar,
}

impl<T> DelayQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Make `item` available after `delay`.
    ///
    /// Hands the item back once the queue is closed.
    pub fn schedule(&self, item: T, delay: Duration) -> Result<(), T> {
        let mut state = self.lock();
        if state.closed {
            return Err(item);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Entry {
            due: due_after(delay),
            seq,
            item,
        });
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    /// Block until an item is due and return it; `None` once closed.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return None;
            }
            let now = Instant::now();
            let next_due = state.heap.peek().map(|e| e.due);
            match next_due {
                Some(due) if due <= now => return state.heap.pop().map(|e| e.item),
                Some(due) => {
                    state = self
                        .ready
                        .wait_timeout(state, due - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                None => {
                    state = self.ready.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Pull out every waiting item matching `pred`, regardless of due time.
    pub fn remove_where(&self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut state = self.lock();
        let (removed, kept): (Vec<_>, Vec<_>) =
            state.heap.drain().partition(|e| pred(&e.item));
        state.heap = kept.into_iter().collect();
        removed.into_iter().map(|e| e.item).collect()
    }

    /// Refuse further items, wake every waiter, and return what was still queued.
    pub fn close(&self) -> Vec<T> {
        let mut state = self.lock();
        state.closed = true;
        let mut drained: Vec<_> = state.heap.drain().collect();
        drop(state);
        self.ready.notify_all();

        drained.sort_by(|a, b| b.cmp(a));
        drained.into_iter().map(|e| e.item).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for DelayQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Delays past what `Instant` can represent park the item far in the future;
/// it stays reachable through `remove_where` and `close`.
fn due_after(delay: Duration) -> Instant {
    const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);
    let now = Instant::now();
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}
