use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{trace, warn};

use crate::{Context, Error, Limiter};

/// Limits the number of concurrent jobs to a fixed maximum.
///
/// Waiters are not served in any particular order.
#[derive(Debug)]
pub struct SemaphoreLimiter {
    semaphore: Semaphore,
    max_concurrency: usize,

    /// Best-effort
    in_flight: AtomicUsize,
}

impl SemaphoreLimiter {
    /// Create a limiter allowing up to `max_concurrency` jobs at once.
    ///
    /// A limit of zero never grants anything, so every acquire waits until its context is done.
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            semaphore: Semaphore::new(max_concurrency),
            max_concurrency,
            in_flight: AtomicUsize::new(0),
        }
    }

    /// The maximum number of concurrent jobs.
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// The number of jobs which could start right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// The number of jobs in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Limiter for SemaphoreLimiter {
    /// Wait for a free slot, until `ctx` is cancelled or its deadline passes.
    async fn acquire(&self, ctx: &Context) -> Result<(), Error> {
        ctx.check()?;

        match ctx.bounded(self.semaphore.acquire()).await {
            Ok(Ok(permit)) => {
                // Given back in `release()`.
                permit.forget();
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Ok(Err(_)) => {
                panic!("we own the semaphore, we shouldn't have closed it")
            }
            Err(err) => {
                trace!(error = %err, "semaphore acquire failed");
                Err(err)
            }
        }
    }

    fn release(&self) {
        let released = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));

        match released {
            Ok(_) => self.semaphore.add_permits(1),
            Err(_) => warn!("semaphore limiter released without a matching acquire, ignoring"),
        }
    }
}
