//! Statistics collection and export for pools

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

/// Number of recent samples kept for the mean timing figures.
const TIMING_CACHE_SIZE: usize = 100;

/// Point-in-time statistics snapshot for a pool.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Total successful borrows over the pool lifetime.
    pub borrowed_count: u64,

    /// Total returns over the pool lifetime.
    pub returned_count: u64,

    /// Total instances created.
    pub created_count: u64,

    /// Total instances destroyed, for any reason.
    pub destroyed_count: u64,

    /// Instances destroyed by the maintenance task.
    pub destroyed_by_evictor_count: u64,

    /// Instances destroyed because borrow-time validation failed.
    pub destroyed_by_borrow_validation_count: u64,

    /// Instances currently lent out.
    pub num_active: usize,

    /// Instances currently idle.
    pub num_idle: usize,

    /// Threads currently blocked waiting to borrow.
    pub num_waiters: usize,

    /// Mean checked-out time over the recent returns.
    pub mean_active_time: Duration,

    /// Mean idle time of recently borrowed instances.
    pub mean_idle_time: Duration,

    /// Mean time recent borrowers spent blocked.
    pub mean_borrow_wait_time: Duration,

    /// Longest time any borrower spent blocked.
    pub max_borrow_wait_time: Duration,
}

impl PoolMetrics {
    /// Export metrics as a flat string map.
    pub fn export(&self) -> HashMap<String, String> {
        let mut metrics = HashMap::new();
        metrics.insert("borrowed_count".to_string(), self.borrowed_count.to_string());
        metrics.insert("returned_count".to_string(), self.returned_count.to_string());
        metrics.insert("created_count".to_string(), self.created_count.to_string());
        metrics.insert("destroyed_count".to_string(), self.destroyed_count.to_string());
        metrics.insert(
            "destroyed_by_evictor_count".to_string(),
            self.destroyed_by_evictor_count.to_string(),
        );
        metrics.insert(
            "destroyed_by_borrow_validation_count".to_string(),
            self.destroyed_by_borrow_validation_count.to_string(),
        );
        metrics.insert("num_active".to_string(), self.num_active.to_string());
        metrics.insert("num_idle".to_string(), self.num_idle.to_string());
        metrics.insert("num_waiters".to_string(), self.num_waiters.to_string());
        metrics.insert(
            "mean_active_time_ms".to_string(),
            self.mean_active_time.as_millis().to_string(),
        );
        metrics.insert(
            "mean_idle_time_ms".to_string(),
            self.mean_idle_time.as_millis().to_string(),
        );
        metrics.insert(
            "mean_borrow_wait_time_ms".to_string(),
            self.mean_borrow_wait_time.as_millis().to_string(),
        );
        metrics.insert(
            "max_borrow_wait_time_ms".to_string(),
            self.max_borrow_wait_time.as_millis().to_string(),
        );
        metrics
    }
}

/// Metrics exporter for Prometheus format
pub struct MetricsExporter;

impl MetricsExporter {
    /// Export metrics in Prometheus exposition format.
    pub fn export_prometheus(
        metrics: &PoolMetrics,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> String {
        let mut output = String::new();
        let labels = Self::format_labels(pool_name, tags);

        // Gauge metrics
        output.push_str("# HELP lendpool_instances_active Instances currently lent out\n");
        output.push_str("# TYPE lendpool_instances_active gauge\n");
        output.push_str(&format!(
            "lendpool_instances_active{{{}}} {}\n",
            labels, metrics.num_active
        ));

        output.push_str("# HELP lendpool_instances_idle Instances currently idle\n");
        output.push_str("# TYPE lendpool_instances_idle gauge\n");
        output.push_str(&format!(
            "lendpool_instances_idle{{{}}} {}\n",
            labels, metrics.num_idle
        ));

        output.push_str("# HELP lendpool_take_waiters Threads blocked waiting to borrow\n");
        output.push_str("# TYPE lendpool_take_waiters gauge\n");
        output.push_str(&format!(
            "lendpool_take_waiters{{{}}} {}\n",
            labels, metrics.num_waiters
        ));

        // Counter metrics
        output.push_str("# HELP lendpool_borrowed_total Total successful borrows\n");
        output.push_str("# TYPE lendpool_borrowed_total counter\n");
        output.push_str(&format!(
            "lendpool_borrowed_total{{{}}} {}\n",
            labels, metrics.borrowed_count
        ));

        output.push_str("# HELP lendpool_returned_total Total returns\n");
        output.push_str("# TYPE lendpool_returned_total counter\n");
        output.push_str(&format!(
            "lendpool_returned_total{{{}}} {}\n",
            labels, metrics.returned_count
        ));

        output.push_str("# HELP lendpool_created_total Total instances created\n");
        output.push_str("# TYPE lendpool_created_total counter\n");
        output.push_str(&format!(
            "lendpool_created_total{{{}}} {}\n",
            labels, metrics.created_count
        ));

        output.push_str("# HELP lendpool_destroyed_total Total instances destroyed\n");
        output.push_str("# TYPE lendpool_destroyed_total counter\n");
        output.push_str(&format!(
            "lendpool_destroyed_total{{{}}} {}\n",
            labels, metrics.destroyed_count
        ));

        output.push_str(
            "# HELP lendpool_destroyed_by_evictor_total Instances destroyed by maintenance\n",
        );
        output.push_str("# TYPE lendpool_destroyed_by_evictor_total counter\n");
        output.push_str(&format!(
            "lendpool_destroyed_by_evictor_total{{{}}} {}\n",
            labels, metrics.destroyed_by_evictor_count
        ));

        output.push_str(
            "# HELP lendpool_destroyed_by_borrow_validation_total Instances failing borrow-time validation\n",
        );
        output.push_str("# TYPE lendpool_destroyed_by_borrow_validation_total counter\n");
        output.push_str(&format!(
            "lendpool_destroyed_by_borrow_validation_total{{{}}} {}\n",
            labels, metrics.destroyed_by_borrow_validation_count
        ));

        output.push_str("# HELP lendpool_borrow_wait_seconds_max Longest borrow wait\n");
        output.push_str("# TYPE lendpool_borrow_wait_seconds_max gauge\n");
        output.push_str(&format!(
            "lendpool_borrow_wait_seconds_max{{{}}} {:.3}\n",
            labels,
            metrics.max_borrow_wait_time.as_secs_f64()
        ));

        output
    }

    fn format_labels(pool_name: &str, tags: Option<&HashMap<String, String>>) -> String {
        let mut labels = vec![format!("pool=\"{}\"", pool_name)];

        if let Some(tags) = tags {
            for (key, value) in tags {
                labels.push(format!("{}=\"{}\"", key, value));
            }
        }

        labels.join(",")
    }
}

/// Internal statistics tracker.
pub(crate) struct StatsTracker {
    borrowed: AtomicU64,
    returned: AtomicU64,
    created: AtomicU64,
    destroyed: AtomicU64,
    destroyed_by_evictor: AtomicU64,
    destroyed_by_borrow_validation: AtomicU64,
    active_times: Mutex<VecDeque<Duration>>,
    idle_times: Mutex<VecDeque<Duration>>,
    wait_times: Mutex<VecDeque<Duration>>,
    max_borrow_wait: Mutex<Duration>,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self {
            borrowed: AtomicU64::new(0),
            returned: AtomicU64::new(0),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            destroyed_by_evictor: AtomicU64::new(0),
            destroyed_by_borrow_validation: AtomicU64::new(0),
            active_times: Mutex::new(VecDeque::with_capacity(TIMING_CACHE_SIZE)),
            idle_times: Mutex::new(VecDeque::with_capacity(TIMING_CACHE_SIZE)),
            wait_times: Mutex::new(VecDeque::with_capacity(TIMING_CACHE_SIZE)),
            max_borrow_wait: Mutex::new(Duration::ZERO),
        }
    }

    fn push_sample(cache: &Mutex<VecDeque<Duration>>, sample: Duration) {
        let mut cache = cache.lock();
        if cache.len() == TIMING_CACHE_SIZE {
            cache.pop_front();
        }
        cache.push_back(sample);
    }

    fn mean(cache: &Mutex<VecDeque<Duration>>) -> Duration {
        let cache = cache.lock();
        if cache.is_empty() {
            return Duration::ZERO;
        }
        cache.iter().sum::<Duration>() / cache.len() as u32
    }

    pub fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_destroyed(&self) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_destroyed_by_evictor(&self) {
        self.destroyed_by_evictor.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_destroyed_by_borrow_validation(&self) {
        self.destroyed_by_borrow_validation
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_borrow(&self, idle_time: Duration, wait_time: Duration) {
        self.borrowed.fetch_add(1, Ordering::Relaxed);
        Self::push_sample(&self.idle_times, idle_time);
        Self::push_sample(&self.wait_times, wait_time);
        let mut max = self.max_borrow_wait.lock();
        if wait_time > *max {
            *max = wait_time;
        }
    }

    pub fn record_return(&self, active_time: Duration) {
        self.returned.fetch_add(1, Ordering::Relaxed);
        Self::push_sample(&self.active_times, active_time);
    }

    pub fn destroyed_by_borrow_validation_count(&self) -> u64 {
        self.destroyed_by_borrow_validation.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, num_active: usize, num_idle: usize, num_waiters: usize) -> PoolMetrics {
        PoolMetrics {
            borrowed_count: self.borrowed.load(Ordering::Relaxed),
            returned_count: self.returned.load(Ordering::Relaxed),
            created_count: self.created.load(Ordering::Relaxed),
            destroyed_count: self.destroyed.load(Ordering::Relaxed),
            destroyed_by_evictor_count: self.destroyed_by_evictor.load(Ordering::Relaxed),
            destroyed_by_borrow_validation_count: self
                .destroyed_by_borrow_validation
                .load(Ordering::Relaxed),
            num_active,
            num_idle,
            num_waiters,
            mean_active_time: Self::mean(&self.active_times),
            mean_idle_time: Self::mean(&self.idle_times),
            mean_borrow_wait_time: Self::mean(&self.wait_times),
            max_borrow_wait_time: *self.max_borrow_wait.lock(),
        }
    }
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new()
    }
}
