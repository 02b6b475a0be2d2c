//! Factory contract consumed by the pool

use crate::errors::FactoryError;
use crate::object::PooledObject;

/// Lifecycle callbacks for instances managed by a [`Pool`](crate::Pool).
///
/// Implementations must be thread-safe; the pool guarantees that at most one
/// factory method is active on a given instance at a time, and never invokes
/// a factory method while holding an internal lock.
///
/// # Examples
///
/// ```
/// use lendpool::{FactoryError, PooledObjectFactory};
///
/// struct BufferFactory;
///
/// impl PooledObjectFactory<Vec<u8>> for BufferFactory {
///     fn make(&self) -> Result<Vec<u8>, FactoryError> {
///         Ok(Vec::with_capacity(4096))
///     }
/// }
/// ```
pub trait PooledObjectFactory<T>: Send + Sync {
    /// Creates a fresh instance. Called with no pool locks held.
    fn make(&self) -> Result<T, FactoryError>;

    /// Disposes an instance that is leaving the pool. Errors are swallowed
    /// and reported through the [`SwallowedExceptionListener`].
    fn destroy(&self, _obj: &PooledObject<T>) -> Result<(), FactoryError> {
        Ok(())
    }

    /// Checks an instance for continued validity. Returning `false` marks the
    /// instance for destruction. Must not panic.
    fn validate(&self, _obj: &PooledObject<T>) -> bool {
        true
    }

    /// Re-initializes an instance before it is lent out. An error causes the
    /// instance to be destroyed.
    fn activate(&self, _obj: &PooledObject<T>) -> Result<(), FactoryError> {
        Ok(())
    }

    /// Resets an instance when it is returned. An error causes the instance
    /// to be destroyed.
    fn passivate(&self, _obj: &PooledObject<T>) -> Result<(), FactoryError> {
        Ok(())
    }
}

/// Sink for errors the pool swallows rather than propagates, such as
/// `destroy` or `passivate` failures. The default sink logs at `warn` level.
pub trait SwallowedExceptionListener: Send + Sync {
    fn on_swallowed(&self, error: &(dyn std::error::Error + 'static));
}
