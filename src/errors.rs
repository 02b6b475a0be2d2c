//! Error types for the object pool

use std::time::Duration;

use thiserror::Error;

/// Error type produced by user-supplied factory callbacks.
pub type FactoryError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("pool is closed")]
    Closed,

    #[error("pool exhausted - no instance available")]
    Exhausted,

    #[error("timed out after {0:?} waiting for an idle instance")]
    Timeout(Duration),

    #[error("factory failed to create an instance")]
    CreateFailed(#[source] FactoryError),

    #[error("unable to activate freshly created instance")]
    UnableToActivate(#[source] FactoryError),

    #[error("unable to validate freshly created instance")]
    UnableToValidate,

    #[error("factory failed to passivate instance")]
    PassivateFailed(#[source] FactoryError),

    #[error("instance is not part of this pool")]
    NotOwned,

    #[error("instance has already been returned to this pool or is invalid")]
    AlreadyReturned,
}

pub type PoolResult<T> = Result<T, PoolError>;
