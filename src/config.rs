//! Pool configuration options

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::eviction::{DefaultEvictionPolicy, EvictionPolicy};
use crate::factory::SwallowedExceptionListener;

/// Configuration for abandoned-instance detection.
///
/// An instance counts as abandoned when it has been checked out and neither
/// used nor returned for longer than `timeout`.
#[derive(Debug, Clone)]
pub struct AbandonedConfig {
    /// Scan for abandoned instances when a borrow finds the pool close to
    /// starvation.
    pub remove_on_borrow: bool,

    /// Scan for abandoned instances on every maintenance run.
    pub remove_on_maintenance: bool,

    /// How long a checked-out instance may go unused before it is reclaimed.
    pub timeout: Duration,
}

impl Default for AbandonedConfig {
    fn default() -> Self {
        Self {
            remove_on_borrow: false,
            remove_on_maintenance: false,
            timeout: Duration::from_secs(300),
        }
    }
}

impl AbandonedConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_remove_on_borrow(mut self, enabled: bool) -> Self {
        self.remove_on_borrow = enabled;
        self
    }

    pub fn with_remove_on_maintenance(mut self, enabled: bool) -> Self {
        self.remove_on_maintenance = enabled;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Configuration for pool behavior.
///
/// The configuration is consumed by value when the pool is built; later
/// changes to a caller's copy have no effect on a running pool.
///
/// # Examples
///
/// ```
/// use lendpool::PoolConfig;
/// use std::time::Duration;
///
/// let config = PoolConfig::<i32>::new()
///     .with_max_total(100)
///     .with_min_idle(2)
///     .with_max_wait(Duration::from_secs(30));
///
/// assert_eq!(config.max_total, Some(100));
/// assert_eq!(config.min_idle, 2);
/// ```
pub struct PoolConfig<T> {
    /// Cap on instances alive or being created; `None` is unlimited.
    pub max_total: Option<usize>,

    /// Cap on the idle deque size; excess instances are destroyed on return.
    /// `None` is unlimited.
    pub max_idle: Option<usize>,

    /// Maintenance refills the idle deque to this level.
    pub min_idle: usize,

    /// Whether a borrow waits when the pool is exhausted or fails at once.
    pub block_when_exhausted: bool,

    /// Default borrow wait; `None` waits forever.
    pub max_wait: Option<Duration>,

    /// Lend the most recently returned instance first (`true`) or cycle
    /// through instances in return order (`false`).
    pub lifo: bool,

    /// Validate freshly created instances before lending them.
    pub test_on_create: bool,

    /// Validate every instance before lending it.
    pub test_on_borrow: bool,

    /// Validate instances when they are returned.
    pub test_on_return: bool,

    /// Validate idle instances during maintenance runs.
    pub test_while_idle: bool,

    /// Interval between maintenance runs; `None` disables maintenance.
    pub time_between_eviction_runs: Option<Duration>,

    /// Instances examined per maintenance run; a negative value `-k` tests
    /// `ceil(idle / k)` per run.
    pub num_tests_per_eviction_run: i32,

    /// Idle time past which an instance is always evicted; `None` disables.
    pub min_evictable_idle_time: Option<Duration>,

    /// Idle time past which an instance is evicted while more than
    /// `min_idle` instances are idle; `None` disables.
    pub soft_min_evictable_idle_time: Option<Duration>,

    /// Predicate applied to eviction candidates.
    pub eviction_policy: Arc<dyn EvictionPolicy<T>>,

    /// Sink for swallowed factory errors; `None` logs at `warn` level.
    pub swallowed_exception_listener: Option<Arc<dyn SwallowedExceptionListener>>,

    /// Abandoned-instance detection; `None` disables it.
    pub abandoned: Option<AbandonedConfig>,
}

impl<T> Default for PoolConfig<T> {
    fn default() -> Self {
        Self {
            max_total: None,
            max_idle: Some(8),
            min_idle: 0,
            block_when_exhausted: true,
            max_wait: None,
            lifo: true,
            test_on_create: false,
            test_on_borrow: false,
            test_on_return: false,
            test_while_idle: false,
            time_between_eviction_runs: None,
            num_tests_per_eviction_run: 3,
            min_evictable_idle_time: Some(Duration::from_secs(30 * 60)),
            soft_min_evictable_idle_time: None,
            eviction_policy: Arc::new(DefaultEvictionPolicy),
            swallowed_exception_listener: None,
            abandoned: None,
        }
    }
}

impl<T> Clone for PoolConfig<T> {
    fn clone(&self) -> Self {
        Self {
            max_total: self.max_total,
            max_idle: self.max_idle,
            min_idle: self.min_idle,
            block_when_exhausted: self.block_when_exhausted,
            max_wait: self.max_wait,
            lifo: self.lifo,
            test_on_create: self.test_on_create,
            test_on_borrow: self.test_on_borrow,
            test_on_return: self.test_on_return,
            test_while_idle: self.test_while_idle,
            time_between_eviction_runs: self.time_between_eviction_runs,
            num_tests_per_eviction_run: self.num_tests_per_eviction_run,
            min_evictable_idle_time: self.min_evictable_idle_time,
            soft_min_evictable_idle_time: self.soft_min_evictable_idle_time,
            eviction_policy: Arc::clone(&self.eviction_policy),
            swallowed_exception_listener: self.swallowed_exception_listener.clone(),
            abandoned: self.abandoned.clone(),
        }
    }
}

impl<T> fmt::Debug for PoolConfig<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("max_total", &self.max_total)
            .field("max_idle", &self.max_idle)
            .field("min_idle", &self.min_idle)
            .field("block_when_exhausted", &self.block_when_exhausted)
            .field("max_wait", &self.max_wait)
            .field("lifo", &self.lifo)
            .field("test_on_create", &self.test_on_create)
            .field("test_on_borrow", &self.test_on_borrow)
            .field("test_on_return", &self.test_on_return)
            .field("test_while_idle", &self.test_while_idle)
            .field(
                "time_between_eviction_runs",
                &self.time_between_eviction_runs,
            )
            .field(
                "num_tests_per_eviction_run",
                &self.num_tests_per_eviction_run,
            )
            .field("min_evictable_idle_time", &self.min_evictable_idle_time)
            .field(
                "soft_min_evictable_idle_time",
                &self.soft_min_evictable_idle_time,
            )
            .field("abandoned", &self.abandoned)
            .finish_non_exhaustive()
    }
}

impl<T> PoolConfig<T> {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the number of live instances.
    pub fn with_max_total(mut self, count: usize) -> Self {
        self.max_total = Some(count);
        self
    }

    /// Cap the idle deque size.
    pub fn with_max_idle(mut self, count: usize) -> Self {
        self.max_idle = Some(count);
        self
    }

    /// Keep at least this many idle instances during maintenance. Values
    /// above `max_idle` are effectively capped by it.
    pub fn with_min_idle(mut self, count: usize) -> Self {
        self.min_idle = count;
        self
    }

    /// Choose between waiting and failing fast when exhausted.
    pub fn with_block_when_exhausted(mut self, block: bool) -> Self {
        self.block_when_exhausted = block;
        self
    }

    /// Bound the default borrow wait.
    pub fn with_max_wait(mut self, wait: Duration) -> Self {
        self.max_wait = Some(wait);
        self
    }

    /// Switch between LIFO and FIFO reuse of idle instances.
    pub fn with_lifo(mut self, lifo: bool) -> Self {
        self.lifo = lifo;
        self
    }

    pub fn with_test_on_create(mut self, test: bool) -> Self {
        self.test_on_create = test;
        self
    }

    pub fn with_test_on_borrow(mut self, test: bool) -> Self {
        self.test_on_borrow = test;
        self
    }

    pub fn with_test_on_return(mut self, test: bool) -> Self {
        self.test_on_return = test;
        self
    }

    pub fn with_test_while_idle(mut self, test: bool) -> Self {
        self.test_while_idle = test;
        self
    }

    /// Run maintenance every `interval`.
    pub fn with_time_between_eviction_runs(mut self, interval: Duration) -> Self {
        self.time_between_eviction_runs = Some(interval);
        self
    }

    pub fn with_num_tests_per_eviction_run(mut self, count: i32) -> Self {
        self.num_tests_per_eviction_run = count;
        self
    }

    /// Evict instances idle for longer than `timeout` unconditionally.
    pub fn with_min_evictable_idle_time(mut self, timeout: Duration) -> Self {
        self.min_evictable_idle_time = Some(timeout);
        self
    }

    /// Disable the unconditional idle-time eviction threshold.
    pub fn without_min_evictable_idle_time(mut self) -> Self {
        self.min_evictable_idle_time = None;
        self
    }

    /// Evict instances idle for longer than `timeout` while the pool holds a
    /// surplus over `min_idle`.
    pub fn with_soft_min_evictable_idle_time(mut self, timeout: Duration) -> Self {
        self.soft_min_evictable_idle_time = Some(timeout);
        self
    }

    /// Replace the eviction predicate.
    pub fn with_eviction_policy(mut self, policy: Arc<dyn EvictionPolicy<T>>) -> Self {
        self.eviction_policy = policy;
        self
    }

    /// Install a sink for swallowed factory errors.
    pub fn with_swallowed_exception_listener(
        mut self,
        listener: Arc<dyn SwallowedExceptionListener>,
    ) -> Self {
        self.swallowed_exception_listener = Some(listener);
        self
    }

    /// Enable abandoned-instance detection.
    pub fn with_abandoned(mut self, abandoned: AbandonedConfig) -> Self {
        self.abandoned = Some(abandoned);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let config = PoolConfig::<i32>::new()
            .with_max_total(4)
            .with_max_idle(2)
            .with_min_idle(1)
            .with_lifo(false)
            .with_test_on_borrow(true)
            .with_time_between_eviction_runs(Duration::from_millis(250))
            .with_abandoned(
                AbandonedConfig::new()
                    .with_remove_on_maintenance(true)
                    .with_timeout(Duration::from_secs(5)),
            );

        assert_eq!(config.max_total, Some(4));
        assert_eq!(config.max_idle, Some(2));
        assert_eq!(config.min_idle, 1);
        assert!(!config.lifo);
        assert!(config.test_on_borrow);
        assert_eq!(
            config.time_between_eviction_runs,
            Some(Duration::from_millis(250))
        );
        let abandoned = config.abandoned.unwrap();
        assert!(abandoned.remove_on_maintenance);
        assert!(!abandoned.remove_on_borrow);
        assert_eq!(abandoned.timeout, Duration::from_secs(5));
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = PoolConfig::<i32>::default();
        assert_eq!(config.max_total, None);
        assert_eq!(config.max_idle, Some(8));
        assert_eq!(config.min_idle, 0);
        assert!(config.block_when_exhausted);
        assert_eq!(config.max_wait, None);
        assert!(config.lifo);
        assert_eq!(config.num_tests_per_eviction_run, 3);
        assert_eq!(
            config.min_evictable_idle_time,
            Some(Duration::from_secs(1800))
        );
        assert_eq!(config.soft_min_evictable_idle_time, None);
        assert!(config.abandoned.is_none());
    }
}
