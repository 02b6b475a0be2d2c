//! Eviction policy deciding which idle instances to drop

use std::time::Duration;

use crate::object::PooledObject;

/// Thresholds handed to an [`EvictionPolicy`] on each test.
///
/// Disabled timeouts are encoded as [`Duration::MAX`] so the comparisons
/// short-circuit naturally.
///
/// # Examples
///
/// ```
/// use lendpool::EvictionConfig;
/// use std::time::Duration;
///
/// let config = EvictionConfig::new(Some(Duration::from_secs(1800)), None, 2);
/// assert_eq!(config.idle_evict_time(), Duration::from_secs(1800));
/// assert_eq!(config.idle_soft_evict_time(), Duration::MAX);
/// assert_eq!(config.min_idle(), 2);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct EvictionConfig {
    idle_evict_time: Duration,
    idle_soft_evict_time: Duration,
    min_idle: usize,
}

impl EvictionConfig {
    pub fn new(
        idle_evict_time: Option<Duration>,
        idle_soft_evict_time: Option<Duration>,
        min_idle: usize,
    ) -> Self {
        Self {
            idle_evict_time: idle_evict_time.unwrap_or(Duration::MAX),
            idle_soft_evict_time: idle_soft_evict_time.unwrap_or(Duration::MAX),
            min_idle,
        }
    }

    /// Idle time past which an instance is evicted unconditionally.
    pub fn idle_evict_time(&self) -> Duration {
        self.idle_evict_time
    }

    /// Idle time past which an instance is evicted while the pool holds more
    /// than [`min_idle`](Self::min_idle) idle instances.
    pub fn idle_soft_evict_time(&self) -> Duration {
        self.idle_soft_evict_time
    }

    pub fn min_idle(&self) -> usize {
        self.min_idle
    }
}

/// Pure predicate deciding whether an idle instance should be evicted.
///
/// Implementations must be stateless with respect to individual calls and
/// thread-safe; the maintenance task may test many candidates per tick.
pub trait EvictionPolicy<T>: Send + Sync {
    fn evict(&self, config: &EvictionConfig, under_test: &PooledObject<T>, idle_count: usize)
        -> bool;
}

/// Default policy: evict when the candidate has been idle longer than the
/// hard timeout, or longer than the soft timeout while the pool holds a
/// surplus of idle instances.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEvictionPolicy;

impl<T> EvictionPolicy<T> for DefaultEvictionPolicy {
    fn evict(
        &self,
        config: &EvictionConfig,
        under_test: &PooledObject<T>,
        idle_count: usize,
    ) -> bool {
        let idle = under_test.idle_duration();
        (idle_count > config.min_idle() && idle > config.idle_soft_evict_time())
            || idle > config.idle_evict_time()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn idle_for(d: Duration) -> PooledObject<&'static str> {
        let p = PooledObject::new(1, "conn");
        thread::sleep(d);
        p
    }

    #[test]
    fn disabled_timeouts_never_evict() {
        let config = EvictionConfig::new(None, None, 0);
        let p = idle_for(Duration::from_millis(10));
        assert!(!DefaultEvictionPolicy.evict(&config, &p, 100));
    }

    #[test]
    fn hard_timeout_evicts_regardless_of_idle_count() {
        let config = EvictionConfig::new(Some(Duration::from_millis(5)), None, 10);
        let p = idle_for(Duration::from_millis(20));
        assert!(DefaultEvictionPolicy.evict(&config, &p, 0));
    }

    #[test]
    fn soft_timeout_needs_surplus() {
        let config = EvictionConfig::new(None, Some(Duration::from_millis(5)), 2);
        let p = idle_for(Duration::from_millis(20));
        assert!(!DefaultEvictionPolicy.evict(&config, &p, 2));
        assert!(DefaultEvictionPolicy.evict(&config, &p, 3));
    }

    #[test]
    fn fresh_instance_survives() {
        let config = EvictionConfig::new(
            Some(Duration::from_secs(3600)),
            Some(Duration::from_secs(1800)),
            0,
        );
        let p = PooledObject::new(1, "conn");
        assert!(!DefaultEvictionPolicy.evict(&config, &p, 5));
    }
}
