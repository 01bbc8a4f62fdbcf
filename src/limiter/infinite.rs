use std::sync::{Arc, OnceLock};

use async_trait::async_trait;

use crate::{Context, Error, Limiter};

/// Never limits anything.
///
/// Stateless, so a single instance can be shared freely. See [infinite_limiter].
#[derive(Debug, Default, Clone, Copy)]
pub struct InfiniteLimiter;

/// The shared [InfiniteLimiter], used wherever no other limiter is given.
pub fn infinite_limiter() -> Arc<dyn Limiter> {
    static SHARED: OnceLock<Arc<dyn Limiter>> = OnceLock::new();

    SHARED.get_or_init(|| Arc::new(InfiniteLimiter)).clone()
}

#[async_trait]
impl Limiter for InfiniteLimiter {
    /// Succeeds unless `ctx` is already done.
    async fn acquire(&self, ctx: &Context) -> Result<(), Error> {
        ctx.check()
    }

    fn release(&self) {}
}
