//! Error types.

use std::time::Duration;

use thiserror::Error;

/// A boxed error, as returned by batch work targets.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Why a [Context](crate::Context) is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    /// The context was explicitly cancelled.
    #[error("context canceled")]
    Cancelled,
    /// The context's deadline has passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Errors returned by [Limiter::acquire](crate::Limiter::acquire).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The context was already done, or became done while waiting.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// A wait bounded by the context deadline elapsed, but the context itself was not yet done.
    #[error("timeout in acquire (context deadline exceeded)")]
    AcquireTimeout,

    /// A non-blocking limiter had no capacity available.
    #[error("rate limit exceeded")]
    RateExceeded,

    /// The wait for a token would outlast the context deadline, so it was not attempted.
    #[error("rate: wait of {wait:?} would exceed context deadline")]
    WouldExceedDeadline {
        /// How long the token would have taken to become available.
        wait: Duration,
    },
}

impl Error {
    /// Whether this error was caused by the context being cancelled or expiring.
    pub fn is_context(&self) -> bool {
        matches!(self, Error::Context(_))
    }
}
