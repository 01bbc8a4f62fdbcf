use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use tracing::error;

use crate::{Context, Error, Limiter};

/// A wrapper which audits that acquires and releases are balanced.
///
/// Keeps count of outstanding acquires. Releasing more than was acquired means the limiter can no
/// longer be trusted, so it panics rather than carry on.
#[derive(Debug)]
pub struct BalanceCheckingLimiter {
    inner: Box<dyn Limiter>,
    balance: AtomicI64,
}

impl BalanceCheckingLimiter {
    #[allow(missing_docs)]
    pub fn new(limiter: impl Limiter + 'static) -> Self {
        Self {
            inner: Box::new(limiter),
            balance: AtomicI64::new(0),
        }
    }

    /// Successful acquires minus releases.
    pub fn balance(&self) -> i64 {
        self.balance.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Limiter for BalanceCheckingLimiter {
    /// Only counts successful acquires.
    async fn acquire(&self, ctx: &Context) -> Result<(), Error> {
        self.inner.acquire(ctx).await?;

        self.balance.fetch_add(1, Ordering::SeqCst);

        Ok(())
    }

    /// # Panics
    ///
    /// If this release has no matching acquire.
    fn release(&self) {
        self.inner.release();

        let balance = self.balance.fetch_sub(1, Ordering::SeqCst) - 1;
        if balance < 0 {
            error!(balance, "limiter released more often than acquired");
            panic!("limiter over-released: balance {balance} < 0");
        }
    }
}
