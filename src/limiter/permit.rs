use std::sync::Arc;

use crate::{Context, Error, Limiter};

/// The right to do some work, acquired from a [Limiter].
///
/// Released back to the limiter when dropped, exactly once, however the work ends.
#[derive(Debug)]
pub struct Permit {
    limiter: Arc<dyn Limiter>,
}

impl Permit {
    /// Acquire from `limiter`, waiting as long as it would.
    pub async fn acquire(limiter: Arc<dyn Limiter>, ctx: &Context) -> Result<Self, Error> {
        limiter.acquire(ctx).await?;

        Ok(Self { limiter })
    }
}

impl Drop for Permit {
    /// Releases the permit back to the limiter.
    fn drop(&mut self) {
        self.limiter.release();
    }
}
