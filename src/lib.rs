//! # lendpool
//!
//! Thread-safe, generic in-process object pool for expensive-to-construct
//! instances such as database connections, network sessions or large
//! buffers.
//!
//! ## Features
//!
//! - Borrow/return protocol with RAII guards and FIFO waiter fairness
//! - Per-instance lifecycle state machine that keeps borrowers, maintenance
//!   and validation from stepping on each other
//! - Capacity limits for live and idle instances
//! - Pluggable factory for create/destroy/validate/activate/passivate
//! - Background eviction of stale idle instances on a shared timer thread
//! - Idle validation and refill to a configured minimum
//! - Detection and reclaim of abandoned (leaked) instances
//! - Lifetime statistics with Prometheus export
//!
//! ## Quick Start
//!
//! ```rust
//! use lendpool::{FactoryError, Pool, PoolConfig, PooledObjectFactory};
//!
//! struct BufferFactory;
//!
//! impl PooledObjectFactory<Vec<u8>> for BufferFactory {
//!     fn make(&self) -> Result<Vec<u8>, FactoryError> {
//!         Ok(Vec::with_capacity(4096))
//!     }
//! }
//!
//! let pool = Pool::new(BufferFactory, PoolConfig::default().with_max_total(8));
//! {
//!     let buffer = pool.borrow().unwrap();
//!     assert_eq!(buffer.capacity(), 4096);
//!     // returned to the pool when `buffer` goes out of scope
//! }
//! assert_eq!(pool.num_idle(), 1);
//! ```

mod config;
mod deque;
mod errors;
mod eviction;
mod factory;
mod metrics;
mod object;
mod pool;
mod timer;

pub use config::{AbandonedConfig, PoolConfig};
pub use errors::{FactoryError, PoolError, PoolResult};
pub use eviction::{DefaultEvictionPolicy, EvictionConfig, EvictionPolicy};
pub use factory::{PooledObjectFactory, SwallowedExceptionListener};
pub use metrics::{MetricsExporter, PoolMetrics};
pub use object::{PooledObject, PooledState};
pub use pool::{Pool, Pooled};
