//! Token bucket.
//!
//! Holds up to `burst` tokens, refilled continuously at `rate` tokens per second. The bucket starts
//! full.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{sleep, Instant};

use crate::{Context, Error};

#[derive(Debug)]
pub(crate) struct TokenBucket {
    /// Tokens per second.
    rate: f64,
    burst: u32,

    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    tokens: f64,
    /// When `tokens` was last brought up to date.
    last: Instant,
}

/// The outcome of trying to take a token.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Reservation {
    /// A token was taken. It may be used once `Duration` has elapsed.
    Ready(Duration),
    /// No token was taken. A token would be available after `Some(Duration)`, or never.
    Refused(Option<Duration>),
}

impl TokenBucket {
    pub(crate) fn new(rate: f64, burst: u32) -> Self {
        assert!(!rate.is_nan(), "rate must be a number");
        let rate = rate.max(0.0);

        Self {
            rate,
            burst,
            state: Mutex::new(State {
                tokens: f64::from(burst),
                last: Instant::now(),
            }),
        }
    }

    pub(crate) fn rate(&self) -> f64 {
        self.rate
    }

    pub(crate) fn burst(&self) -> u32 {
        self.burst
    }

    /// Take a token if one is available right now.
    pub(crate) fn try_take(&self) -> bool {
        matches!(
            self.reserve(Instant::now(), Some(Duration::ZERO)),
            Reservation::Ready(_)
        )
    }

    /// Take a token, waiting for it to become available.
    ///
    /// Fails without waiting if the token can't become available before the context deadline. A
    /// token reserved by a wait which is then cancelled is returned to the bucket.
    pub(crate) async fn take(&self, ctx: &Context) -> Result<(), Error> {
        ctx.check()?;

        match self.reserve(Instant::now(), ctx.remaining()) {
            Reservation::Ready(Duration::ZERO) => Ok(()),
            Reservation::Ready(wait) => {
                tokio::select! {
                    _ = sleep(wait) => Ok(()),
                    err = ctx.done() => {
                        self.put_back();
                        Err(err.into())
                    }
                }
            }
            Reservation::Refused(Some(wait)) => Err(Error::WouldExceedDeadline { wait }),
            Reservation::Refused(None) => Err(Error::RateExceeded),
        }
    }

    /// Take a token unless it would take longer than `max_wait` to become available.
    fn reserve(&self, now: Instant, max_wait: Option<Duration>) -> Reservation {
        if self.rate.is_infinite() {
            return Reservation::Ready(Duration::ZERO);
        }
        if self.burst == 0 {
            return Reservation::Refused(None);
        }

        let mut state = self.state.lock();

        let tokens = self.advance(&state, now) - 1.0;

        let wait = if tokens >= 0.0 {
            Some(Duration::ZERO)
        } else {
            // A zero rate overflows to infinity, which is never satisfiable.
            Duration::try_from_secs_f64(-tokens / self.rate).ok()
        };

        match (wait, max_wait) {
            (Some(wait), Some(max_wait)) if wait > max_wait => Reservation::Refused(Some(wait)),
            (Some(wait), _) => {
                state.tokens = tokens;
                state.last = now;
                Reservation::Ready(wait)
            }
            (None, _) => Reservation::Refused(None),
        }
    }

    /// The number of tokens available at `now`, capped at the burst size.
    fn advance(&self, state: &State, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(state.last);
        let refill = elapsed.as_secs_f64() * self.rate;

        (state.tokens + refill).min(f64::from(self.burst))
    }

    /// Return a reserved token which was never used.
    fn put_back(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();

        state.tokens = (self.advance(&state, now) + 1.0).min(f64::from(self.burst));
        state.last = now;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::{self, Instant};

    use super::*;
    use crate::assert_elapsed;

    #[tokio::test(start_paused = true)]
    async fn starts_full() {
        let bucket = TokenBucket::new(1.0, 3);

        assert!(bucket.try_take());
        assert!(bucket.try_take());
        assert!(bucket.try_take());
        assert!(!bucket.try_take());
    }

    #[tokio::test(start_paused = true)]
    async fn refills_over_time_up_to_burst() {
        let bucket = TokenBucket::new(2.0, 2);
        assert!(bucket.try_take());
        assert!(bucket.try_take());
        assert!(!bucket.try_take());

        time::advance(Duration::from_millis(500)).await;
        assert!(bucket.try_take());
        assert!(!bucket.try_take());

        time::advance(Duration::from_secs(10)).await;
        assert!(bucket.try_take());
        assert!(bucket.try_take());
        assert!(!bucket.try_take(), "refill should be capped at burst");
    }

    #[tokio::test(start_paused = true)]
    async fn zero_rate_never_refills() {
        let bucket = TokenBucket::new(0.0, 1);
        assert!(bucket.try_take());

        time::advance(Duration::from_secs(3600)).await;
        assert!(!bucket.try_take());

        let err = bucket.take(&Context::background()).await.unwrap_err();
        assert_eq!(err, Error::RateExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn take_waits_for_refill() {
        let bucket = TokenBucket::new(10.0, 1);
        let ctx = Context::background();

        bucket.take(&ctx).await.unwrap();

        let start = Instant::now();
        bucket.take(&ctx).await.unwrap();
        assert_elapsed!(start, Duration::from_millis(100), Duration::from_millis(2));
    }

    #[tokio::test(start_paused = true)]
    async fn take_refuses_wait_beyond_deadline() {
        let bucket = TokenBucket::new(1.0, 1);
        let ctx = Context::background().with_timeout(Duration::from_millis(100));

        bucket.take(&ctx).await.unwrap();

        let start = Instant::now();
        let err = bucket.take(&ctx).await.unwrap_err();

        assert!(matches!(err, Error::WouldExceedDeadline { .. }), "{err:?}");
        assert_eq!(start.elapsed(), Duration::ZERO, "should not have waited");
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_take_returns_token() {
        let bucket = TokenBucket::new(1.0, 1);
        let ctx = Context::background();
        bucket.take(&ctx).await.unwrap();

        let waiting = ctx.child();
        let canceller = waiting.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let err = bucket.take(&waiting).await.unwrap_err();
        assert!(err.is_context());

        // The cancelled reservation shouldn't delay the next one.
        let start = Instant::now();
        bucket.take(&ctx).await.unwrap();
        assert_elapsed!(start, Duration::from_millis(900), Duration::from_millis(2));
    }
}
