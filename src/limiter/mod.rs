use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;

use crate::{Context, Error};

pub use balance::BalanceCheckingLimiter;
pub use infinite::{infinite_limiter, InfiniteLimiter};
pub use permit::Permit;
pub use rate::{FailFastLimiter, RateLimiter};
pub use semaphore::SemaphoreLimiter;
pub use time::{TimeLimiter, TimerHandle};

mod balance;
mod infinite;
mod permit;
mod rate;
mod semaphore;
mod time;

/// Controls how much work may proceed, either concurrently or over time.
///
/// Acquire the right to do some work, and release it once the work is finished. Every successful
/// [acquire](Limiter::acquire) must be matched by exactly one [release](Limiter::release). A
/// [Permit] does this automatically.
///
/// Implementations are shared by many concurrent callers and need no external locking.
#[async_trait]
pub trait Limiter: Debug + Send + Sync {
    /// Acquire the right to do some work.
    ///
    /// Fails immediately if `ctx` is already done. Otherwise, may wait for capacity until `ctx` is
    /// cancelled or its deadline passes.
    async fn acquire(&self, ctx: &Context) -> Result<(), Error>;

    /// Return a previously acquired right to do work.
    ///
    /// A no-op for limiters based purely on the passage of time.
    fn release(&self);
}

#[async_trait]
impl<L> Limiter for Arc<L>
where
    L: Limiter + ?Sized,
{
    async fn acquire(&self, ctx: &Context) -> Result<(), Error> {
        (**self).acquire(ctx).await
    }

    fn release(&self) {
        (**self).release()
    }
}
