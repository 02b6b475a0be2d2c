//! Per-instance wrapper: lifecycle state machine and timestamps

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::deque::IdleDeque;

/// The lifecycle states a pooled instance moves through.
///
/// The extra eviction/validation states encode races between a borrower and
/// the maintenance task: an instance pulled out of the idle deque mid-test
/// must be put back in its original position once the test completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PooledState {
    /// In the idle deque, not in use.
    Idle,
    /// Lent out to a borrower.
    Allocated,
    /// In the idle deque, under eviction test.
    Eviction,
    /// Removed from the deque by a borrower while under eviction test; goes
    /// back to the head of the deque when the test completes.
    EvictionReturnToHead,
    /// In the idle deque, under idle validation.
    Validation,
    /// Removed from the deque by a borrower while under idle validation; the
    /// borrower inherits ownership when validation succeeds.
    ValidationPreallocated,
    /// Removed from the deque by a borrower who then walked away while the
    /// instance was under idle validation; goes back to the head afterwards.
    ValidationReturnToHead,
    /// Failed maintenance or explicitly invalidated; being destroyed.
    Invalid,
    /// Held past the abandonment timeout without use; to be reclaimed.
    Abandoned,
    /// In transit from a borrower back to the idle deque.
    Returning,
}

/// Outcome of [`PooledObject::allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Allocate {
    /// The caller now owns the instance.
    Owned,
    /// The instance is not available; try another.
    Busy,
    /// The instance is under idle validation and has been reserved for the
    /// caller; wait with [`PooledObject::await_preallocated`].
    Pending,
}

/// Outcome of [`PooledObject::end_idle_validation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EndValidation {
    /// Back to idle, still in the deque.
    Kept,
    /// Back to idle, re-inserted at the head of the deque.
    ReturnedToHead,
    /// Ownership passed to the borrower that reserved it mid-validation.
    Preallocated,
    /// The instance was not under validation.
    NotValidating,
}

struct Lifecycle {
    state: PooledState,
    last_borrow: Instant,
    last_return: Instant,
    last_use: Instant,
    borrowed_count: u64,
}

/// Wrapper tracking the lifecycle of one managed instance.
///
/// The wrapper is shared between the pool, the idle deque and any borrower
/// through `Arc`; a small mutex guards state transitions and the mutable
/// timestamps. Factory callbacks receive `&PooledObject<T>` so they can read
/// the value and the timing accessors, and are never invoked while the state
/// mutex is held.
pub struct PooledObject<T> {
    value: T,
    id: u64,
    created_at: Instant,
    lifecycle: Mutex<Lifecycle>,
    cond: Condvar,
}

impl<T> PooledObject<T> {
    pub(crate) fn new(id: u64, value: T) -> Self {
        let now = Instant::now();
        Self {
            value,
            id,
            created_at: now,
            lifecycle: Mutex::new(Lifecycle {
                state: PooledState::Idle,
                last_borrow: now,
                last_return: now,
                last_use: now,
                borrowed_count: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// The managed instance.
    pub fn value(&self) -> &T {
        &self.value
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// When the instance was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PooledState {
        self.lifecycle.lock().state
    }

    /// How long the instance has been sitting idle. For an instance that has
    /// never been borrowed this is the time since creation.
    pub fn idle_duration(&self) -> Duration {
        self.lifecycle.lock().last_return.elapsed()
    }

    /// How long the instance was (or has been) lent out.
    pub fn active_duration(&self) -> Duration {
        let lc = self.lifecycle.lock();
        if lc.last_return > lc.last_borrow {
            lc.last_return - lc.last_borrow
        } else {
            lc.last_borrow.elapsed()
        }
    }

    /// Time since the instance was last used by a borrower, as observed by
    /// [`touch`](Self::touch) or the borrow itself.
    pub fn since_last_use(&self) -> Duration {
        self.lifecycle.lock().last_use.elapsed()
    }

    /// How many times the instance has been borrowed.
    pub fn borrowed_count(&self) -> u64 {
        self.lifecycle.lock().borrowed_count
    }

    /// Records client-observable use, deferring abandonment reclaim.
    pub fn touch(&self) {
        self.lifecycle.lock().last_use = Instant::now();
    }

    /// Attempts to claim the instance for a borrower.
    pub(crate) fn allocate(&self) -> Allocate {
        let mut lc = self.lifecycle.lock();
        match lc.state {
            PooledState::Idle => {
                lc.state = PooledState::Allocated;
                let now = Instant::now();
                lc.last_borrow = now;
                lc.last_use = now;
                lc.borrowed_count += 1;
                Allocate::Owned
            }
            PooledState::Eviction => {
                lc.state = PooledState::EvictionReturnToHead;
                Allocate::Busy
            }
            PooledState::Validation => {
                lc.state = PooledState::ValidationPreallocated;
                Allocate::Pending
            }
            _ => Allocate::Busy,
        }
    }

    /// Waits for a pending pre-allocation to resolve. Returns `true` when the
    /// caller now owns the instance. On timeout the reservation is released
    /// and the instance goes back to the head of the deque once validation
    /// completes.
    pub(crate) fn await_preallocated(&self, deadline: Option<Instant>) -> bool {
        let mut lc = self.lifecycle.lock();
        loop {
            match lc.state {
                PooledState::Allocated => return true,
                PooledState::ValidationPreallocated => match deadline {
                    Some(d) => {
                        if self.cond.wait_until(&mut lc, d).timed_out()
                            && lc.state == PooledState::ValidationPreallocated
                        {
                            lc.state = PooledState::ValidationReturnToHead;
                            return false;
                        }
                    }
                    None => self.cond.wait(&mut lc),
                },
                _ => return false,
            }
        }
    }

    /// Marks the start of a return. Fails unless the instance is allocated.
    pub(crate) fn mark_returning(&self) -> bool {
        let mut lc = self.lifecycle.lock();
        if lc.state == PooledState::Allocated {
            lc.state = PooledState::Returning;
            true
        } else {
            false
        }
    }

    /// Completes a return, making the instance idle again.
    pub(crate) fn deallocate(&self) -> bool {
        let mut lc = self.lifecycle.lock();
        match lc.state {
            PooledState::Allocated | PooledState::Returning => {
                lc.state = PooledState::Idle;
                lc.last_return = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Begins an eviction test. Succeeds only from idle.
    pub(crate) fn start_eviction_test(&self) -> bool {
        let mut lc = self.lifecycle.lock();
        if lc.state == PooledState::Idle {
            lc.state = PooledState::Eviction;
            true
        } else {
            false
        }
    }

    /// Completes an eviction test, restoring the instance's queue position.
    pub(crate) fn end_eviction_test(p: &Arc<Self>, deque: &IdleDeque<T>) -> bool {
        let return_to_head = {
            let mut lc = p.lifecycle.lock();
            match lc.state {
                PooledState::Eviction => {
                    lc.state = PooledState::Idle;
                    false
                }
                PooledState::EvictionReturnToHead => {
                    lc.state = PooledState::Idle;
                    true
                }
                _ => return false,
            }
        };
        if return_to_head {
            deque.push_front(Arc::clone(p));
        }
        true
    }

    /// Moves an instance under eviction test into idle validation.
    pub(crate) fn begin_idle_validation(&self) -> bool {
        let mut lc = self.lifecycle.lock();
        match lc.state {
            PooledState::Eviction => {
                lc.state = PooledState::Validation;
                true
            }
            PooledState::EvictionReturnToHead => {
                lc.state = PooledState::ValidationReturnToHead;
                true
            }
            _ => false,
        }
    }

    /// Completes idle validation: the instance either stays where it is,
    /// goes back to the head of the deque, or is handed to the borrower
    /// that reserved it mid-validation.
    pub(crate) fn end_idle_validation(p: &Arc<Self>, deque: &IdleDeque<T>) -> EndValidation {
        let outcome = {
            let mut lc = p.lifecycle.lock();
            match lc.state {
                PooledState::Validation => {
                    lc.state = PooledState::Idle;
                    EndValidation::Kept
                }
                PooledState::ValidationReturnToHead => {
                    lc.state = PooledState::Idle;
                    EndValidation::ReturnedToHead
                }
                PooledState::ValidationPreallocated => {
                    lc.state = PooledState::Allocated;
                    let now = Instant::now();
                    lc.last_borrow = now;
                    lc.last_use = now;
                    lc.borrowed_count += 1;
                    p.cond.notify_all();
                    EndValidation::Preallocated
                }
                _ => EndValidation::NotValidating,
            }
        };
        if outcome == EndValidation::ReturnedToHead {
            deque.push_front(Arc::clone(p));
        }
        outcome
    }

    /// Marks an allocated instance abandoned when it has not been used for
    /// `timeout`. The check and the transition are atomic.
    pub(crate) fn try_mark_abandoned(&self, timeout: Duration) -> bool {
        let mut lc = self.lifecycle.lock();
        if lc.state == PooledState::Allocated && lc.last_use.elapsed() >= timeout {
            lc.state = PooledState::Abandoned;
            true
        } else {
            false
        }
    }

    /// Moves the instance to its terminal state. Returns `false` when it was
    /// already invalid, making destruction idempotent. Wakes any borrower
    /// parked on a pre-allocation.
    pub(crate) fn invalidate(&self) -> bool {
        let mut lc = self.lifecycle.lock();
        if lc.state == PooledState::Invalid {
            false
        } else {
            lc.state = PooledState::Invalid;
            self.cond.notify_all();
            true
        }
    }
}
