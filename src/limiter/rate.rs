use async_trait::async_trait;
use conv::ValueFrom;

use crate::{bucket::TokenBucket, Context, Error, Limiter};

/// Limits the rate of jobs using a token bucket, waiting for a token when none is available.
///
/// Tokens replenish with the passage of time, so [release](Limiter::release) does nothing.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: TokenBucket,
}

impl RateLimiter {
    /// Allow `events_per_second` on average, with bursts of up to `burst` at once.
    ///
    /// Negative rates are clipped to zero. With a zero rate, only the initial `burst` is ever
    /// granted.
    pub fn new(events_per_second: f64, burst: u32) -> Self {
        let events_per_second = if events_per_second > 0.0 {
            events_per_second
        } else {
            0.0
        };

        Self {
            bucket: TokenBucket::new(events_per_second, burst),
        }
    }

    /// Tokens added per second.
    pub fn rate(&self) -> f64 {
        self.bucket.rate()
    }

    /// The maximum number of tokens available at once.
    pub fn burst(&self) -> u32 {
        self.bucket.burst()
    }
}

#[async_trait]
impl Limiter for RateLimiter {
    /// Wait for a token.
    ///
    /// Fails without waiting if a token can't become available before the context deadline.
    async fn acquire(&self, ctx: &Context) -> Result<(), Error> {
        self.bucket.take(ctx).await
    }

    fn release(&self) {}
}

/// Allows a number of jobs per second, rejecting any more immediately instead of waiting.
///
/// All the capacity is allocated to the burst, refilling at one token per second. This allows all
/// of a second's acquires to happen at once rather than being spread across the second.
#[derive(Debug)]
pub struct FailFastLimiter {
    bucket: TokenBucket,
}

impl FailFastLimiter {
    /// Allow up to `acquires_per_second` immediate acquires.
    ///
    /// Negative values are clipped to zero, which rejects everything.
    pub fn new(acquires_per_second: i32) -> Self {
        let burst = u32::value_from(acquires_per_second).unwrap_or(0);
        let rate = f64::from(burst).min(1.0);

        Self {
            bucket: TokenBucket::new(rate, burst),
        }
    }

    /// Tokens added per second.
    pub fn rate(&self) -> f64 {
        self.bucket.rate()
    }

    /// The number of immediate acquires allowed.
    pub fn burst(&self) -> u32 {
        self.bucket.burst()
    }
}

#[async_trait]
impl Limiter for FailFastLimiter {
    /// Take a token if one is available right now, otherwise fail with [Error::RateExceeded].
    ///
    /// Never waits.
    async fn acquire(&self, ctx: &Context) -> Result<(), Error> {
        ctx.check()?;

        if self.bucket.try_take() {
            Ok(())
        } else {
            Err(Error::RateExceeded)
        }
    }

    fn release(&self) {}
}
