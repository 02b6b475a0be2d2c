//! Blocking deque of idle instances with arrival-order waiter service

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::object::PooledObject;

/// Outcome of a blocking take.
pub(crate) enum Taken<T> {
    Item(Arc<PooledObject<T>>),
    TimedOut,
    Closed,
}

enum Slot<T> {
    Waiting,
    Handed(Arc<PooledObject<T>>),
    Closed,
    Cancelled,
}

impl<T> Slot<T> {
    fn take_item(&mut self) -> Option<Arc<PooledObject<T>>> {
        if matches!(self, Slot::Handed(_)) {
            if let Slot::Handed(p) = std::mem::replace(self, Slot::Cancelled) {
                return Some(p);
            }
        }
        None
    }
}

struct Waiter<T> {
    slot: Mutex<Slot<T>>,
    cond: Condvar,
}

struct Inner<T> {
    items: VecDeque<Arc<PooledObject<T>>>,
    waiters: VecDeque<Arc<Waiter<T>>>,
    closed: bool,
}

/// Double-ended queue of idle instances.
///
/// Blocked takers form a FIFO queue and are served in arrival order: a push
/// hands the instance directly to the longest-waiting taker instead of
/// inserting it. Non-blocking polls never queue, so a concurrent poll can
/// still win an instance over a thread that has not yet started waiting.
pub(crate) struct IdleDeque<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> IdleDeque<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                waiters: VecDeque::new(),
                closed: false,
            }),
        }
    }

    /// Hands `p` to the first live waiter, or gives it back for insertion.
    fn hand_off(inner: &mut Inner<T>, p: Arc<PooledObject<T>>) -> Option<Arc<PooledObject<T>>> {
        while let Some(w) = inner.waiters.pop_front() {
            let mut slot = w.slot.lock();
            match *slot {
                Slot::Waiting => {
                    *slot = Slot::Handed(p);
                    w.cond.notify_one();
                    return None;
                }
                _ => continue,
            }
        }
        Some(p)
    }

    pub(crate) fn push_front(&self, p: Arc<PooledObject<T>>) {
        let mut inner = self.inner.lock();
        if let Some(p) = Self::hand_off(&mut inner, p) {
            inner.items.push_front(p);
        }
    }

    pub(crate) fn push_back(&self, p: Arc<PooledObject<T>>) {
        let mut inner = self.inner.lock();
        if let Some(p) = Self::hand_off(&mut inner, p) {
            inner.items.push_back(p);
        }
    }

    pub(crate) fn poll_front(&self) -> Option<Arc<PooledObject<T>>> {
        self.inner.lock().items.pop_front()
    }

    #[allow(dead_code)]
    pub(crate) fn poll_back(&self) -> Option<Arc<PooledObject<T>>> {
        self.inner.lock().items.pop_back()
    }

    /// Blocks until an instance is available, the timeout elapses, or the
    /// deque is closed. `None` waits without bound. A hand-off racing the
    /// timeout resolves in favor of the instance.
    pub(crate) fn take_first(&self, timeout: Option<Duration>) -> Taken<T> {
        let waiter = {
            let mut inner = self.inner.lock();
            if let Some(p) = inner.items.pop_front() {
                return Taken::Item(p);
            }
            if inner.closed {
                return Taken::Closed;
            }
            let w = Arc::new(Waiter {
                slot: Mutex::new(Slot::Waiting),
                cond: Condvar::new(),
            });
            inner.waiters.push_back(Arc::clone(&w));
            w
        };

        let deadline = timeout.map(|d| Instant::now() + d);
        let mut slot = waiter.slot.lock();
        loop {
            if let Some(p) = slot.take_item() {
                return Taken::Item(p);
            }
            if matches!(*slot, Slot::Closed) {
                return Taken::Closed;
            }
            match deadline {
                Some(d) => {
                    if waiter.cond.wait_until(&mut slot, d).timed_out() {
                        if let Some(p) = slot.take_item() {
                            return Taken::Item(p);
                        }
                        if matches!(*slot, Slot::Closed) {
                            return Taken::Closed;
                        }
                        *slot = Slot::Cancelled;
                        return Taken::TimedOut;
                    }
                }
                None => waiter.cond.wait(&mut slot),
            }
        }
    }

    /// Removes a specific instance by identity. Used by the destroy path;
    /// absence is not an error.
    pub(crate) fn remove(&self, p: &Arc<PooledObject<T>>) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.items.len();
        inner.items.retain(|x| !Arc::ptr_eq(x, p));
        inner.items.len() != before
    }

    /// Wakes every blocked taker with a closed result and causes future
    /// blocking takes to fail immediately.
    pub(crate) fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        while let Some(w) = inner.waiters.pop_front() {
            let mut slot = w.slot.lock();
            if matches!(*slot, Slot::Waiting) {
                *slot = Slot::Closed;
                w.cond.notify_one();
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub(crate) fn has_waiters(&self) -> bool {
        self.waiter_count() > 0
    }

    /// Number of threads currently blocked in [`take_first`](Self::take_first).
    pub(crate) fn waiter_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner
            .waiters
            .retain(|w| matches!(*w.slot.lock(), Slot::Waiting));
        inner.waiters.len()
    }

    /// Weakly consistent snapshot in queue order. Entries may have been
    /// borrowed since; a failed eviction-test start is the skip signal.
    pub(crate) fn snapshot(&self) -> Vec<Arc<PooledObject<T>>> {
        self.inner.lock().items.iter().cloned().collect()
    }

    /// Weakly consistent snapshot in reverse queue order.
    pub(crate) fn snapshot_reversed(&self) -> Vec<Arc<PooledObject<T>>> {
        self.inner.lock().items.iter().rev().cloned().collect()
    }
}
