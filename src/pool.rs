//! Pool core: borrow/return protocol, maintenance and abandonment reclaim

use std::ops::Deref;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::{AbandonedConfig, PoolConfig};
use crate::deque::{IdleDeque, Taken};
use crate::errors::{FactoryError, PoolError, PoolResult};
use crate::eviction::EvictionConfig;
use crate::factory::PooledObjectFactory;
use crate::metrics::{PoolMetrics, StatsTracker};
use crate::object::{Allocate, PooledObject, PooledState};
use crate::timer::{self, TimerHandle};

/// Which path destroyed an instance, for the lifetime counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DestroyReason {
    Normal,
    Evictor,
    BorrowValidation,
}

/// Persistent position of the maintenance scan across runs.
struct EvictionCursor<T> {
    snapshot: Vec<Arc<PooledObject<T>>>,
    pos: usize,
}

struct PoolInner<T> {
    factory: Box<dyn PooledObjectFactory<T>>,
    config: PoolConfig<T>,
    /// Every live instance, keyed by wrapper identity. Entries are removed
    /// atomically with the transition to the terminal state.
    all: DashMap<u64, Arc<PooledObject<T>>>,
    idle: IdleDeque<T>,
    /// Instances alive or in flight through `factory.make`. May briefly
    /// exceed the map size because `make` runs outside all locks.
    create_count: AtomicI64,
    next_id: AtomicU64,
    closed: AtomicBool,
    close_lock: Mutex<()>,
    eviction: Mutex<EvictionCursor<T>>,
    stats: StatsTracker,
    evictor: Mutex<Option<TimerHandle>>,
}

/// A thread-safe pool lending reusable instances built by a
/// [`PooledObjectFactory`].
///
/// Borrowed instances are wrapped in a [`Pooled`] guard that returns them to
/// the pool when dropped. The pool can cap live and idle instance counts,
/// validate instances at each lifecycle step, evict stale idle instances on
/// a shared maintenance timer and reclaim instances that borrowers abandoned.
///
/// # Examples
///
/// ```
/// use lendpool::{FactoryError, Pool, PoolConfig, PooledObjectFactory};
///
/// struct BufferFactory;
///
/// impl PooledObjectFactory<Vec<u8>> for BufferFactory {
///     fn make(&self) -> Result<Vec<u8>, FactoryError> {
///         Ok(Vec::with_capacity(4096))
///     }
/// }
///
/// let pool = Pool::new(BufferFactory, PoolConfig::default().with_max_total(8));
/// let buffer = pool.borrow().unwrap();
/// assert_eq!(buffer.capacity(), 4096);
/// drop(buffer); // back in the pool
/// assert_eq!(pool.num_idle(), 1);
/// ```
pub struct Pool<T: Send + Sync + 'static> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Send + Sync + 'static> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> Pool<T> {
    /// Creates a pool around `factory`. When the configuration enables
    /// maintenance, the pool registers itself with the process-wide timer.
    pub fn new<F>(factory: F, config: PoolConfig<T>) -> Self
    where
        F: PooledObjectFactory<T> + 'static,
    {
        let inner = Arc::new(PoolInner {
            factory: Box::new(factory),
            config,
            all: DashMap::new(),
            idle: IdleDeque::new(),
            create_count: AtomicI64::new(0),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            close_lock: Mutex::new(()),
            eviction: Mutex::new(EvictionCursor {
                snapshot: Vec::new(),
                pos: 0,
            }),
            stats: StatsTracker::new(),
            evictor: Mutex::new(None),
        });

        if let Some(period) = inner.config.time_between_eviction_runs {
            if period > Duration::ZERO {
                let weak: Weak<PoolInner<T>> = Arc::downgrade(&inner);
                let handle = timer::schedule(
                    period,
                    period,
                    Box::new(move || match weak.upgrade() {
                        Some(pool) => {
                            pool.run_maintenance();
                            true
                        }
                        None => false,
                    }),
                );
                *inner.evictor.lock() = Some(handle);
            }
        }

        Self { inner }
    }

    /// Borrows an instance, waiting up to the configured `max_wait` when the
    /// pool is exhausted and blocking is enabled.
    pub fn borrow(&self) -> PoolResult<Pooled<T>> {
        self.borrow_for(self.inner.config.max_wait)
    }

    /// Borrows an instance with an explicit wait bound; `None` waits forever.
    pub fn borrow_for(&self, max_wait: Option<Duration>) -> PoolResult<Pooled<T>> {
        let obj = self.inner.borrow_internal(max_wait)?;
        Ok(Pooled {
            obj: Some(obj),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Returns an instance explicitly, surfacing misuse errors that the
    /// drop-based return cannot. Returning a guard from another pool fails
    /// with [`PoolError::NotOwned`]; the guard then falls back to its own
    /// pool.
    pub fn return_object(&self, mut obj: Pooled<T>) -> PoolResult<()> {
        if !Arc::ptr_eq(&self.inner, &obj.pool) {
            return Err(PoolError::NotOwned);
        }
        let p = obj.take_arc();
        self.inner.return_internal(&p)
    }

    /// Destroys a borrowed instance instead of returning it, for example
    /// after the caller observed it misbehave.
    pub fn invalidate_object(&self, mut obj: Pooled<T>) -> PoolResult<()> {
        if !Arc::ptr_eq(&self.inner, &obj.pool) {
            return Err(PoolError::NotOwned);
        }
        let p = obj.take_arc();
        self.inner.invalidate_internal(&p)
    }

    /// Creates an instance and places it in the idle deque, pre-loading the
    /// pool. A pool already at capacity is left unchanged.
    pub fn add_object(&self) -> PoolResult<()> {
        self.inner.add_object()
    }

    /// Destroys every idle instance. Instances currently lent out are not
    /// affected and may be returned while the drain is in progress.
    pub fn clear(&self) {
        self.inner.clear();
    }

    /// Closes the pool: stops maintenance, destroys idle instances and wakes
    /// every waiting borrower with [`PoolError::Closed`]. Instances still
    /// lent out are destroyed as they come back. Closing twice is a no-op.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Number of idle instances.
    pub fn num_idle(&self) -> usize {
        self.inner.num_idle()
    }

    /// Number of instances currently lent out.
    pub fn num_active(&self) -> usize {
        self.inner.num_active()
    }

    /// Estimate of the threads blocked waiting to borrow. Monitoring only.
    pub fn num_waiters(&self) -> usize {
        if self.inner.config.block_when_exhausted {
            self.inner.idle.waiter_count()
        } else {
            0
        }
    }

    /// Statistics snapshot.
    pub fn metrics(&self) -> PoolMetrics {
        self.inner.stats.snapshot(
            self.inner.num_active(),
            self.inner.num_idle(),
            self.num_waiters(),
        )
    }
}

/// RAII guard for a borrowed instance; dereferences to the instance and
/// returns it to the pool on drop.
///
/// The guard only grants shared access: the pool, its maintenance task and
/// the factory all observe the same instance, so per-instance mutability
/// belongs inside `T` (a connection guarded by its own lock, an atomic
/// cursor, and so on).
pub struct Pooled<T: Send + Sync + 'static> {
    obj: Option<Arc<PooledObject<T>>>,
    pool: Arc<PoolInner<T>>,
}

impl<T: Send + Sync + 'static> Pooled<T> {
    /// Records client-observable use, deferring abandonment reclaim for
    /// long-running borrowers.
    pub fn touch(&self) {
        if let Some(obj) = &self.obj {
            obj.touch();
        }
    }

    fn take_arc(&mut self) -> Arc<PooledObject<T>> {
        self.obj.take().expect("pooled instance already taken")
    }
}

impl<T: Send + Sync + 'static> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.obj
            .as_ref()
            .expect("pooled instance already taken")
            .value()
    }
}

impl<T: Send + Sync + 'static> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(p) = self.obj.take() {
            if let Err(err) = self.pool.return_internal(&p) {
                warn!(id = p.id(), error = %err, "dropped instance failed to return cleanly");
            }
        }
    }
}

impl<T> PoolInner<T> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn assert_open(&self) -> PoolResult<()> {
        if self.is_closed() {
            Err(PoolError::Closed)
        } else {
            Ok(())
        }
    }

    fn num_idle(&self) -> usize {
        self.idle.len()
    }

    fn num_active(&self) -> usize {
        self.all.len().saturating_sub(self.idle.len())
    }

    /// The refill target; a `min_idle` above `max_idle` is capped by it.
    fn effective_min_idle(&self) -> usize {
        match self.config.max_idle {
            Some(max_idle) => self.config.min_idle.min(max_idle),
            None => self.config.min_idle,
        }
    }

    fn swallow(&self, err: &FactoryError) {
        warn!(error = %err, "swallowed factory error");
        if let Some(listener) = &self.config.swallowed_exception_listener {
            // a faulty listener must not take the pool down with it
            let _ = catch_unwind(AssertUnwindSafe(|| listener.on_swallowed(err.as_ref())));
        }
    }

    fn borrow_internal(&self, max_wait: Option<Duration>) -> PoolResult<Arc<PooledObject<T>>> {
        self.assert_open()?;

        if let Some(ac) = &self.config.abandoned {
            if ac.remove_on_borrow && self.num_idle() < 2 {
                let near_starvation = match self.config.max_total {
                    Some(max_total) => self.num_active() + 3 > max_total,
                    None => true,
                };
                if near_starvation {
                    self.remove_abandoned(ac);
                }
            }
        }

        let deadline = max_wait.map(|d| Instant::now() + d);
        let mut wait_time = Duration::ZERO;

        loop {
            let mut created = false;
            let mut candidate = self.idle.poll_front();
            if candidate.is_none() {
                if let Some(fresh) = self.create()? {
                    created = true;
                    candidate = Some(fresh);
                }
            }
            if candidate.is_none() {
                if !self.config.block_when_exhausted {
                    return Err(PoolError::Exhausted);
                }
                let remaining = match deadline {
                    None => None,
                    Some(d) => {
                        let now = Instant::now();
                        if now >= d {
                            return Err(PoolError::Timeout(max_wait.unwrap_or_default()));
                        }
                        Some(d - now)
                    }
                };
                let wait_start = Instant::now();
                match self.idle.take_first(remaining) {
                    Taken::Item(p) => {
                        wait_time += wait_start.elapsed();
                        candidate = Some(p);
                    }
                    Taken::TimedOut => {
                        return Err(PoolError::Timeout(max_wait.unwrap_or_default()))
                    }
                    Taken::Closed => return Err(PoolError::Closed),
                }
            }
            let p = match candidate {
                Some(p) => p,
                None => continue,
            };

            match p.allocate() {
                Allocate::Owned => {}
                Allocate::Pending => {
                    // reserved while under idle validation; inherit ownership
                    // when validation succeeds
                    if !p.await_preallocated(deadline) {
                        continue;
                    }
                }
                Allocate::Busy => continue,
            }

            if let Err(err) = self.factory.activate(&p) {
                self.destroy(&p, DestroyReason::Normal);
                if created {
                    return Err(PoolError::UnableToActivate(err));
                }
                continue;
            }

            if self.config.test_on_borrow || (created && self.config.test_on_create) {
                if !self.factory.validate(&p) {
                    self.destroy(&p, DestroyReason::BorrowValidation);
                    if created {
                        return Err(PoolError::UnableToValidate);
                    }
                    continue;
                }
            }

            self.stats.record_borrow(p.idle_duration(), wait_time);
            trace!(id = p.id(), "borrowed instance");
            return Ok(p);
        }
    }

    /// Reserves capacity, then builds an instance outside all locks. `None`
    /// means the pool is at capacity.
    fn create(&self) -> PoolResult<Option<Arc<PooledObject<T>>>> {
        let new_count = self.create_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(max_total) = self.config.max_total {
            if new_count > max_total as i64 {
                self.create_count.fetch_sub(1, Ordering::SeqCst);
                return Ok(None);
            }
        }

        let value = match self.factory.make() {
            Ok(value) => value,
            Err(err) => {
                self.create_count.fetch_sub(1, Ordering::SeqCst);
                return Err(PoolError::CreateFailed(err));
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let p = Arc::new(PooledObject::new(id, value));
        self.stats.record_created();
        self.all.insert(id, Arc::clone(&p));
        debug!(id, "created instance");
        Ok(Some(p))
    }

    /// Destroys an instance: terminal state, removal from deque and index,
    /// factory teardown, counter reconciliation. Idempotent.
    fn destroy(&self, p: &Arc<PooledObject<T>>, reason: DestroyReason) {
        if !p.invalidate() {
            return;
        }
        self.idle.remove(p);
        self.all.remove(&p.id());
        debug!(id = p.id(), "destroying instance");
        if let Err(err) = self.factory.destroy(p) {
            self.swallow(&err);
        }
        self.stats.record_destroyed();
        match reason {
            DestroyReason::Evictor => self.stats.record_destroyed_by_evictor(),
            DestroyReason::BorrowValidation => self.stats.record_destroyed_by_borrow_validation(),
            DestroyReason::Normal => {}
        }
        self.create_count.fetch_sub(1, Ordering::SeqCst);
    }

    fn return_internal(&self, p: &Arc<PooledObject<T>>) -> PoolResult<()> {
        let abandonment = self.config.abandoned.is_some();
        if !self.all.contains_key(&p.id()) {
            if abandonment {
                // already reclaimed as abandoned; drop the late return
                trace!(id = p.id(), "dropping return of reclaimed instance");
                return Ok(());
            }
            return Err(PoolError::NotOwned);
        }

        if !p.mark_returning() {
            // an abandoned instance may still be in the map while its reclaim
            // is in flight; with abandonment configured that return is dropped
            if abandonment
                && matches!(
                    p.state(),
                    PooledState::Abandoned | PooledState::Invalid
                )
            {
                trace!(id = p.id(), "dropping return of abandoned instance");
                return Ok(());
            }
            return Err(PoolError::AlreadyReturned);
        }
        let active_time = p.active_duration();

        if self.config.test_on_return && !self.factory.validate(p) {
            self.destroy(p, DestroyReason::Normal);
            self.ensure_idle_swallowing(1, false);
            self.stats.record_return(active_time);
            return Ok(());
        }

        if let Err(err) = self.factory.passivate(p) {
            self.swallow(&err);
            self.destroy(p, DestroyReason::Normal);
            self.ensure_idle_swallowing(1, false);
            self.stats.record_return(active_time);
            return Ok(());
        }

        if !p.deallocate() {
            return Err(PoolError::AlreadyReturned);
        }

        let idle_full = match self.config.max_idle {
            Some(max_idle) => self.idle.len() >= max_idle,
            None => false,
        };
        if self.is_closed() || idle_full {
            self.destroy(p, DestroyReason::Normal);
        } else if self.config.lifo {
            self.idle.push_front(Arc::clone(p));
        } else {
            self.idle.push_back(Arc::clone(p));
        }
        self.stats.record_return(active_time);
        trace!(id = p.id(), "returned instance");
        Ok(())
    }

    fn invalidate_internal(&self, p: &Arc<PooledObject<T>>) -> PoolResult<()> {
        if !self.all.contains_key(&p.id()) {
            if self.config.abandoned.is_some() {
                return Ok(());
            }
            return Err(PoolError::NotOwned);
        }
        self.destroy(p, DestroyReason::Normal);
        self.ensure_idle(1, false)?;
        Ok(())
    }

    fn add_object(&self) -> PoolResult<()> {
        self.assert_open()?;
        let p = match self.create()? {
            Some(p) => p,
            None => return Ok(()),
        };
        if let Err(err) = self.factory.passivate(&p) {
            self.destroy(&p, DestroyReason::Normal);
            return Err(PoolError::PassivateFailed(err));
        }
        if self.config.lifo {
            self.idle.push_front(p);
        } else {
            self.idle.push_back(p);
        }
        Ok(())
    }

    fn clear(&self) {
        while let Some(p) = self.idle.poll_front() {
            self.destroy(&p, DestroyReason::Normal);
        }
    }

    fn close(&self) {
        if self.is_closed() {
            return;
        }
        let _guard = self.close_lock.lock();
        if self.is_closed() {
            return;
        }
        // stop maintenance before flagging closed; a mid-flight run still
        // sees an open pool
        *self.evictor.lock() = None;
        self.closed.store(true, Ordering::SeqCst);
        self.clear();
        self.idle.close();
        debug!("pool closed");
    }

    /// Creates idle instances until `target` are idle or capacity is
    /// reached. Unless `always`, only runs while a borrower is waiting.
    fn ensure_idle(&self, target: usize, always: bool) -> PoolResult<()> {
        if target < 1 || self.is_closed() || (!always && !self.idle.has_waiters()) {
            return Ok(());
        }
        while self.idle.len() < target {
            let p = match self.create()? {
                Some(p) => p,
                None => break,
            };
            if self.config.lifo {
                self.idle.push_front(p);
            } else {
                self.idle.push_back(p);
            }
        }
        Ok(())
    }

    fn ensure_idle_swallowing(&self, target: usize, always: bool) {
        if let Err(PoolError::CreateFailed(err)) = self.ensure_idle(target, always) {
            self.swallow(&err);
        }
    }

    fn run_maintenance(&self) {
        if self.evict().is_err() {
            // the pool closed under the timer; the task is being cancelled
            return;
        }
        if let Err(PoolError::CreateFailed(err)) = self.ensure_idle(self.effective_min_idle(), true)
        {
            self.swallow(&err);
        }
    }

    /// One maintenance run: test a bounded slice of idle instances for
    /// eviction and idle validity, then scan for abandoned instances.
    fn evict(&self) -> PoolResult<()> {
        self.assert_open()?;
        if self.idle.len() > 0 {
            self.run_eviction_tests();
        }
        if let Some(ac) = &self.config.abandoned {
            if ac.remove_on_maintenance {
                self.remove_abandoned(ac);
            }
        }
        Ok(())
    }

    fn run_eviction_tests(&self) {
        let ec = EvictionConfig::new(
            self.config.min_evictable_idle_time,
            self.config.soft_min_evictable_idle_time,
            self.effective_min_idle(),
        );
        let num_tests = self.num_tests();
        let mut tested = 0;
        while tested < num_tests {
            let under_test = {
                let mut cursor = self.eviction.lock();
                match self.next_candidate(&mut cursor) {
                    Some(p) => p,
                    None => return,
                }
            };
            if !under_test.start_eviction_test() {
                // borrowed since the snapshot; not counted as a test
                continue;
            }
            tested += 1;

            if self
                .config
                .eviction_policy
                .evict(&ec, &under_test, self.idle.len())
            {
                debug!(id = under_test.id(), "evicting idle instance");
                self.destroy(&under_test, DestroyReason::Evictor);
            } else if self.config.test_while_idle {
                self.idle_validate(&under_test);
            } else {
                PooledObject::end_eviction_test(&under_test, &self.idle);
            }
        }
    }

    /// Advances the persistent scan, refreshing the snapshot when the
    /// previous one is exhausted. Scans oldest-first under LIFO.
    fn next_candidate(&self, cursor: &mut EvictionCursor<T>) -> Option<Arc<PooledObject<T>>> {
        if cursor.pos >= cursor.snapshot.len() {
            cursor.snapshot = if self.config.lifo {
                self.idle.snapshot_reversed()
            } else {
                self.idle.snapshot()
            };
            cursor.pos = 0;
            if cursor.snapshot.is_empty() {
                return None;
            }
        }
        let p = Arc::clone(&cursor.snapshot[cursor.pos]);
        cursor.pos += 1;
        Some(p)
    }

    fn idle_validate(&self, p: &Arc<PooledObject<T>>) {
        if !p.begin_idle_validation() {
            PooledObject::end_eviction_test(p, &self.idle);
            return;
        }
        let healthy = match self.factory.activate(p) {
            Ok(()) => self.factory.validate(p) && self.factory.passivate(p).is_ok(),
            Err(_) => false,
        };
        if healthy {
            PooledObject::end_idle_validation(p, &self.idle);
        } else {
            debug!(id = p.id(), "destroying instance that failed idle validation");
            self.destroy(p, DestroyReason::Evictor);
        }
    }

    fn num_tests(&self) -> usize {
        let configured = self.config.num_tests_per_eviction_run;
        let idle_len = self.idle.len();
        if configured >= 0 {
            (configured as usize).min(idle_len)
        } else {
            let k = configured.unsigned_abs() as usize;
            (idle_len + k - 1) / k
        }
    }

    fn remove_abandoned(&self, ac: &AbandonedConfig) {
        let mut reclaim = Vec::new();
        for entry in self.all.iter() {
            let p = entry.value();
            if p.try_mark_abandoned(ac.timeout) {
                reclaim.push(Arc::clone(p));
            }
        }
        for p in reclaim {
            warn!(
                id = p.id(),
                timeout_ms = ac.timeout.as_millis() as u64,
                "reclaiming abandoned instance"
            );
            self.destroy(&p, DestroyReason::Normal);
            self.ensure_idle_swallowing(1, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;

    #[derive(Default)]
    struct FactoryState {
        serial: AtomicUsize,
        events: Mutex<Vec<String>>,
        validate_failures: AtomicUsize,
        activate_failures: AtomicUsize,
        fail_make: AtomicBool,
        destroyed: AtomicUsize,
    }

    impl FactoryState {
        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }

        fn destroyed(&self) -> usize {
            self.destroyed.load(Ordering::SeqCst)
        }

        fn consume_failure(counter: &AtomicUsize) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[derive(Clone)]
    struct TestFactory {
        state: Arc<FactoryState>,
    }

    impl PooledObjectFactory<usize> for TestFactory {
        fn make(&self) -> Result<usize, FactoryError> {
            if self.state.fail_make.load(Ordering::SeqCst) {
                return Err("make failed".into());
            }
            let n = self.state.serial.fetch_add(1, Ordering::SeqCst);
            self.state.events.lock().push(format!("make#{n}"));
            Ok(n)
        }

        fn destroy(&self, obj: &PooledObject<usize>) -> Result<(), FactoryError> {
            self.state
                .events
                .lock()
                .push(format!("destroy#{}", obj.value()));
            self.state.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn validate(&self, obj: &PooledObject<usize>) -> bool {
            self.state
                .events
                .lock()
                .push(format!("validate#{}", obj.value()));
            !FactoryState::consume_failure(&self.state.validate_failures)
        }

        fn activate(&self, obj: &PooledObject<usize>) -> Result<(), FactoryError> {
            self.state
                .events
                .lock()
                .push(format!("activate#{}", obj.value()));
            if FactoryState::consume_failure(&self.state.activate_failures) {
                return Err("activate failed".into());
            }
            Ok(())
        }

        fn passivate(&self, obj: &PooledObject<usize>) -> Result<(), FactoryError> {
            self.state
                .events
                .lock()
                .push(format!("passivate#{}", obj.value()));
            Ok(())
        }
    }

    fn pool_with(config: PoolConfig<usize>) -> (Pool<usize>, Arc<FactoryState>) {
        let state = Arc::new(FactoryState::default());
        let pool = Pool::new(
            TestFactory {
                state: Arc::clone(&state),
            },
            config,
        );
        (pool, state)
    }

    #[test]
    fn lifo_reuse_prefers_most_recent_return() {
        let (pool, _) = pool_with(PoolConfig::new().with_max_total(2).with_lifo(true));

        let b1 = pool.borrow().unwrap();
        let v1 = *b1;
        let b2 = pool.borrow().unwrap();
        drop(b1);
        let b3 = pool.borrow().unwrap();
        assert_eq!(*b3, v1);
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(pool.num_active(), 2);
        drop(b2);
        drop(b3);
    }

    #[test]
    fn fifo_cycles_through_returns() {
        let (pool, _) = pool_with(PoolConfig::new().with_max_total(2).with_lifo(false));

        let b1 = pool.borrow().unwrap();
        let v1 = *b1;
        let b2 = pool.borrow().unwrap();
        let v2 = *b2;
        drop(b1);
        drop(b2);
        // FIFO pops the oldest return first
        assert_eq!(*pool.borrow().unwrap(), v1);
        assert_eq!(*pool.borrow().unwrap(), v2);
    }

    #[test]
    fn waiters_are_served_in_arrival_order() {
        let (pool, _) = pool_with(PoolConfig::new().with_max_total(1));
        let held = pool.borrow().unwrap();

        let (tx, rx) = mpsc::channel();
        let mut handles = Vec::new();
        for label in ["B", "C"] {
            let pool_thread = pool.clone();
            let tx = tx.clone();
            handles.push(thread::spawn(move || {
                let guard = pool_thread.borrow().unwrap();
                tx.send((label, guard)).unwrap();
            }));
            // wait until this thread has entered the wait queue before
            // starting the next one
            let expected = if label == "B" { 1 } else { 2 };
            while pool.num_waiters() < expected {
                thread::yield_now();
            }
        }

        drop(held);
        let (label, guard_b) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(label, "B");
        assert!(rx.try_recv().is_err(), "C should still be waiting");
        assert_eq!(pool.num_waiters(), 1);

        drop(guard_b);
        let (label, guard_c) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(label, "C");
        drop(guard_c);
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn hard_eviction_destroys_stale_idle_instance() {
        let (pool, state) = pool_with(
            PoolConfig::new()
                .with_min_evictable_idle_time(Duration::from_millis(100))
                .with_time_between_eviction_runs(Duration::from_millis(50)),
        );
        pool.add_object().unwrap();
        assert_eq!(pool.num_idle(), 1);

        thread::sleep(Duration::from_millis(300));
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(state.destroyed(), 1);
        assert_eq!(pool.metrics().destroyed_by_evictor_count, 1);
    }

    #[test]
    fn soft_eviction_respects_min_idle() {
        let (pool, state) = pool_with(
            PoolConfig::new()
                .without_min_evictable_idle_time()
                .with_soft_min_evictable_idle_time(Duration::from_millis(50))
                .with_min_idle(2)
                .with_time_between_eviction_runs(Duration::from_millis(25)),
        );
        for _ in 0..3 {
            pool.add_object().unwrap();
        }

        thread::sleep(Duration::from_millis(250));
        assert_eq!(pool.num_idle(), 2);
        assert_eq!(state.destroyed(), 1);
    }

    #[test]
    fn borrow_validation_failure_replaces_instance() {
        let (pool, state) = pool_with(
            PoolConfig::new()
                .with_max_total(2)
                .with_test_on_borrow(true)
                .with_block_when_exhausted(false),
        );
        pool.add_object().unwrap();
        state.validate_failures.store(1, Ordering::SeqCst);

        let b = pool.borrow().unwrap();
        assert_eq!(*b, 1, "the invalid idle instance was replaced");
        assert_eq!(state.destroyed(), 1);
        assert_eq!(pool.metrics().destroyed_by_borrow_validation_count, 1);
    }

    #[test]
    fn abandoned_instance_is_reclaimed_by_maintenance() {
        let (pool, state) = pool_with(
            PoolConfig::new()
                .with_max_total(1)
                .with_time_between_eviction_runs(Duration::from_millis(50))
                .with_abandoned(
                    AbandonedConfig::new()
                        .with_remove_on_maintenance(true)
                        .with_timeout(Duration::from_millis(200)),
                ),
        );

        let held = pool.borrow().unwrap();
        thread::sleep(Duration::from_millis(600));
        assert_eq!(pool.num_active(), 0);
        assert_eq!(state.destroyed(), 1);

        // the late return of the reclaimed instance is a silent no-op
        drop(held);
        assert_eq!(state.destroyed(), 1);
        assert_eq!(pool.num_idle(), 0);

        // capacity was released, so a fresh borrow succeeds
        let fresh = pool.borrow().unwrap();
        assert_eq!(*fresh, 1);
    }

    #[test]
    fn abandonment_scan_on_starved_borrow() {
        let (pool, state) = pool_with(
            PoolConfig::new()
                .with_max_total(1)
                .with_block_when_exhausted(false)
                .with_abandoned(
                    AbandonedConfig::new()
                        .with_remove_on_borrow(true)
                        .with_timeout(Duration::from_millis(50)),
                ),
        );

        let held = pool.borrow().unwrap();
        thread::sleep(Duration::from_millis(100));
        let fresh = pool.borrow().unwrap();
        assert_eq!(*fresh, 1);
        assert_eq!(state.destroyed(), 1);
        drop(held); // silent no-op
        assert_eq!(pool.num_active(), 1);
    }

    #[test]
    fn touch_defers_abandonment() {
        let (pool, state) = pool_with(
            PoolConfig::new()
                .with_max_total(1)
                .with_time_between_eviction_runs(Duration::from_millis(25))
                .with_abandoned(
                    AbandonedConfig::new()
                        .with_remove_on_maintenance(true)
                        .with_timeout(Duration::from_millis(400)),
                ),
        );

        let held = pool.borrow().unwrap();
        for _ in 0..6 {
            thread::sleep(Duration::from_millis(50));
            held.touch();
        }
        assert_eq!(pool.num_active(), 1);
        assert_eq!(state.destroyed(), 0);
    }

    #[test]
    fn close_is_idempotent_and_fails_borrowers() {
        let (pool, _) = pool_with(PoolConfig::new().with_max_total(1));
        pool.add_object().unwrap();
        pool.close();
        pool.close();
        assert!(pool.is_closed());
        assert_eq!(pool.num_idle(), 0);
        assert!(matches!(pool.borrow(), Err(PoolError::Closed)));
        assert!(matches!(pool.add_object(), Err(PoolError::Closed)));
    }

    #[test]
    fn close_wakes_blocked_borrowers() {
        let (pool, _) = pool_with(PoolConfig::new().with_max_total(1));
        let held = pool.borrow().unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.borrow())
        };
        while pool.num_waiters() < 1 {
            thread::yield_now();
        }
        pool.close();
        assert!(matches!(waiter.join().unwrap(), Err(PoolError::Closed)));
        drop(held);
    }

    #[test]
    fn return_after_close_destroys() {
        let (pool, state) = pool_with(PoolConfig::new().with_max_total(1));
        let held = pool.borrow().unwrap();
        pool.close();
        drop(held);
        assert_eq!(state.destroyed(), 1);
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(pool.num_active(), 0);
    }

    #[test]
    fn preload_then_borrow_orders_factory_calls() {
        let (pool, state) = pool_with(PoolConfig::new().with_max_total(1));
        pool.add_object().unwrap();
        let b = pool.borrow().unwrap();
        assert_eq!(
            state.events(),
            vec!["make#0", "passivate#0", "activate#0"],
            "passivation before idle storage, activation on borrow"
        );
        drop(b);
    }

    #[test]
    fn explicit_return_and_double_return() {
        let (pool, _) = pool_with(PoolConfig::new().with_max_total(1));
        let guard = pool.borrow().unwrap();
        let p = Arc::clone(guard.obj.as_ref().unwrap());
        pool.return_object(guard).unwrap();
        assert_eq!(pool.num_idle(), 1);

        // a second return of the same instance is a misuse error
        assert!(matches!(
            pool.inner.return_internal(&p),
            Err(PoolError::AlreadyReturned)
        ));
    }

    #[test]
    fn returning_to_a_foreign_pool_is_rejected() {
        let (pool_a, _) = pool_with(PoolConfig::new().with_max_total(1));
        let (pool_b, _) = pool_with(PoolConfig::new().with_max_total(1));

        let guard = pool_a.borrow().unwrap();
        assert!(matches!(
            pool_b.return_object(guard),
            Err(PoolError::NotOwned)
        ));
        // the guard fell back to its own pool
        assert_eq!(pool_a.num_idle(), 1);
        assert_eq!(pool_b.num_idle(), 0);
    }

    #[test]
    fn invalidate_destroys_and_frees_capacity() {
        let (pool, state) = pool_with(
            PoolConfig::new()
                .with_max_total(1)
                .with_block_when_exhausted(false),
        );
        let guard = pool.borrow().unwrap();
        pool.invalidate_object(guard).unwrap();
        assert_eq!(state.destroyed(), 1);
        assert_eq!(pool.num_active(), 0);
        // capacity is available again
        let next = pool.borrow().unwrap();
        assert_eq!(*next, 1);
    }

    #[test]
    fn max_idle_overflow_is_destroyed_on_return() {
        let (pool, state) = pool_with(PoolConfig::new().with_max_total(2).with_max_idle(1));
        let b1 = pool.borrow().unwrap();
        let b2 = pool.borrow().unwrap();
        drop(b1);
        drop(b2);
        assert_eq!(pool.num_idle(), 1);
        assert_eq!(state.destroyed(), 1);
    }

    #[test]
    fn exhausted_pool_fails_fast_when_not_blocking() {
        let (pool, _) = pool_with(
            PoolConfig::new()
                .with_max_total(1)
                .with_block_when_exhausted(false),
        );
        let held = pool.borrow().unwrap();
        assert!(matches!(pool.borrow(), Err(PoolError::Exhausted)));
        drop(held);
    }

    #[test]
    fn blocking_borrow_times_out() {
        let (pool, _) = pool_with(PoolConfig::new().with_max_total(1));
        let held = pool.borrow().unwrap();
        let start = Instant::now();
        let result = pool.borrow_for(Some(Duration::from_millis(60)));
        assert!(matches!(result, Err(PoolError::Timeout(_))));
        assert!(start.elapsed() >= Duration::from_millis(60));
        drop(held);
    }

    #[test]
    fn create_failure_rolls_back_capacity() {
        let (pool, state) = pool_with(
            PoolConfig::new()
                .with_max_total(1)
                .with_block_when_exhausted(false),
        );
        state.fail_make.store(true, Ordering::SeqCst);
        assert!(matches!(pool.borrow(), Err(PoolError::CreateFailed(_))));

        // the reservation was rolled back, so the next attempt can create
        state.fail_make.store(false, Ordering::SeqCst);
        let b = pool.borrow().unwrap();
        assert_eq!(*b, 0);
    }

    #[test]
    fn activation_failure_on_fresh_instance_surfaces() {
        let (pool, state) = pool_with(
            PoolConfig::new()
                .with_max_total(1)
                .with_block_when_exhausted(false),
        );
        state.activate_failures.store(1, Ordering::SeqCst);
        assert!(matches!(pool.borrow(), Err(PoolError::UnableToActivate(_))));
        assert_eq!(state.destroyed(), 1);
        assert_eq!(pool.num_active(), 0);
    }

    #[test]
    fn activation_failure_on_reused_instance_is_swallowed() {
        let (pool, state) = pool_with(
            PoolConfig::new()
                .with_max_total(2)
                .with_block_when_exhausted(false),
        );
        pool.add_object().unwrap();
        state.activate_failures.store(1, Ordering::SeqCst);

        // the idle instance fails activation and is replaced by a fresh one
        let b = pool.borrow().unwrap();
        assert_eq!(*b, 1);
        assert_eq!(state.destroyed(), 1);
    }

    #[test]
    fn return_validation_failure_destroys() {
        let (pool, state) =
            pool_with(PoolConfig::new().with_max_total(1).with_test_on_return(true));
        let b = pool.borrow().unwrap();
        state.validate_failures.store(1, Ordering::SeqCst);
        drop(b);
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(state.destroyed(), 1);
    }

    #[test]
    fn maintenance_refills_to_min_idle() {
        let (pool, _) = pool_with(
            PoolConfig::new()
                .with_max_total(10)
                .with_min_idle(2)
                .with_time_between_eviction_runs(Duration::from_millis(30)),
        );
        assert_eq!(pool.num_idle(), 0);
        thread::sleep(Duration::from_millis(150));
        assert_eq!(pool.num_idle(), 2);
    }

    #[test]
    fn min_idle_is_capped_by_max_idle() {
        let (pool, _) = pool_with(
            PoolConfig::new()
                .with_max_total(10)
                .with_max_idle(1)
                .with_min_idle(5)
                .with_time_between_eviction_runs(Duration::from_millis(30)),
        );
        thread::sleep(Duration::from_millis(150));
        assert_eq!(pool.num_idle(), 1);
    }

    #[test]
    fn clear_drains_idle_instances() {
        let (pool, state) = pool_with(PoolConfig::new().with_max_total(3));
        for _ in 0..3 {
            pool.add_object().unwrap();
        }
        pool.clear();
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(state.destroyed(), 3);
    }

    #[test]
    fn idle_validation_destroys_unhealthy_instances() {
        let (pool, state) = pool_with(
            PoolConfig::new()
                .without_min_evictable_idle_time()
                .with_test_while_idle(true)
                .with_time_between_eviction_runs(Duration::from_millis(30)),
        );
        pool.add_object().unwrap();
        state.validate_failures.store(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(150));
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(state.destroyed(), 1);
        assert_eq!(pool.metrics().destroyed_by_evictor_count, 1);
    }

    #[test]
    fn counters_balance_at_quiescence() {
        let (pool, _) = pool_with(PoolConfig::new().with_max_total(4).with_max_idle(4));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..25 {
                    let guard = pool.borrow().unwrap();
                    assert!(*guard < 4);
                    thread::sleep(Duration::from_micros(200));
                    drop(guard);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(pool.num_active(), 0);
        assert!(pool.num_idle() <= 4);
        let metrics = pool.metrics();
        let live = pool.inner.all.len() as u64;
        assert_eq!(metrics.created_count - metrics.destroyed_count, live);
        assert_eq!(metrics.borrowed_count, metrics.returned_count);
        assert_eq!(metrics.borrowed_count, 8 * 25);
    }

    #[test]
    fn metrics_track_borrow_and_return() {
        let (pool, _) = pool_with(PoolConfig::new().with_max_total(2));
        let b = pool.borrow().unwrap();
        thread::sleep(Duration::from_millis(20));
        drop(b);

        let metrics = pool.metrics();
        assert_eq!(metrics.borrowed_count, 1);
        assert_eq!(metrics.returned_count, 1);
        assert_eq!(metrics.created_count, 1);
        assert!(metrics.mean_active_time >= Duration::from_millis(20));
    }
}
