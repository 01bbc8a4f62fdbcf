//! Retrying work which fails transiently, with exponential backoff.

use std::{fmt::Display, future::Future, time::Duration};

use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

use crate::{Context, ContextError};

pub use backoff::Backoff;
pub use config::{
    RetryConfig, DEFAULT_FACTOR, DEFAULT_JITTER, DEFAULT_MAX_WAIT, DEFAULT_MIN_WAIT, MIN_FACTOR,
    MIN_WAIT_DURATION,
};
pub use evaluator::{AllOf, AlwaysRetry, AnyOf, NoRetry, RetryCount, RetryEvaluator};

mod backoff;
mod config;
mod evaluator;

/// Executes work, retrying failures with exponential backoff.
///
/// Holds only immutable backoff parameters, so one handler can be shared by any number of
/// concurrent executions. Cheaply copyable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryHandler {
    backoff: Backoff,
}

/// Why [RetryHandler::execute] gave up.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The context was done before the work could be attempted.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// The work failed with an error which shouldn't be retried.
    #[error(transparent)]
    Target(E),

    /// The deadline had passed by the time the work failed.
    #[error("context deadline exceeded: {source}")]
    DeadlineExceeded {
        /// The last error from the work.
        source: E,
    },

    /// The context became done while waiting to retry.
    #[error("{last}: {cause}")]
    Interrupted {
        /// Why the context is done.
        #[source]
        cause: ContextError,
        /// The last error from the work.
        last: E,
    },
}

impl RetryHandler {
    /// Create a handler with the given backoff policy.
    ///
    /// `min` and `max` are raised to at least [MIN_WAIT_DURATION], then swapped if `min > max`.
    /// `factor` is raised to at least [MIN_FACTOR].
    pub fn new(min: Duration, max: Duration, factor: f64, jitter: bool) -> Self {
        Self {
            backoff: Backoff::new(min, max, factor, jitter),
        }
    }

    /// Create a handler from configuration, normalised as in [new](Self::new).
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.min_wait_duration(),
            config.max_wait_duration(),
            config.factor,
            config.jitter,
        )
    }

    /// The backoff policy.
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Run `target`, retrying on every error until it succeeds or `ctx` is done.
    ///
    /// Without a deadline or cancellation, this retries forever.
    pub async fn execute<T, E, F, Fut>(&self, ctx: &Context, target: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.execute_with(ctx, target, AlwaysRetry).await
    }

    /// Run `target`, retrying errors `evaluator` considers transient, until it succeeds or `ctx` is
    /// done.
    ///
    /// The first error `evaluator` rejects is returned as [RetryError::Target]. For a fixed number
    /// of retries, use [RetryCount], possibly combined with other evaluators using [AllOf].
    pub async fn execute_with<T, E, F, Fut, R>(
        &self,
        ctx: &Context,
        mut target: F,
        mut evaluator: R,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        R: RetryEvaluator<E>,
    {
        // The first retry is attempt 0.
        let mut attempt: u32 = 0;

        loop {
            if let Some(err) = ctx.err() {
                return Err(err.into());
            }

            let err = match target(ctx.clone()).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempts = attempt + 1, "succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !evaluator.should_retry(&err) {
                debug!(error = %err, "not retrying");
                return Err(RetryError::Target(err));
            }

            let remaining = ctx.remaining();
            if remaining == Some(Duration::ZERO) {
                return Err(RetryError::DeadlineExceeded { source: err });
            }

            let delay = self.backoff.for_attempt(attempt);
            let wait = remaining.map_or(delay, |remaining| delay.min(remaining));

            debug!(attempt, ?wait, error = %err, "retrying after backoff");

            tokio::select! {
                biased;

                cause = ctx.done() => {
                    return Err(RetryError::Interrupted { cause, last: err });
                }
                _ = sleep(wait) => {
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }
}

impl Default for RetryHandler {
    /// Built from [RetryConfig::default].
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl<E> RetryError<E> {
    /// The last error from the work, if it was attempted.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::Context(_) => None,
            RetryError::Target(err)
            | RetryError::DeadlineExceeded { source: err }
            | RetryError::Interrupted { last: err, .. } => Some(err),
        }
    }

    /// Take the last error from the work, if it was attempted.
    pub fn into_last_error(self) -> Option<E> {
        match self {
            RetryError::Context(_) => None,
            RetryError::Target(err)
            | RetryError::DeadlineExceeded { source: err }
            | RetryError::Interrupted { last: err, .. } => Some(err),
        }
    }

    /// Whether retrying stopped because the deadline passed.
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(
            self,
            RetryError::Context(ContextError::DeadlineExceeded)
                | RetryError::DeadlineExceeded { .. }
                | RetryError::Interrupted {
                    cause: ContextError::DeadlineExceeded,
                    ..
                }
        )
    }

    /// Whether retrying stopped because the context was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            RetryError::Context(ContextError::Cancelled)
                | RetryError::Interrupted {
                    cause: ContextError::Cancelled,
                    ..
                }
        )
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use tokio::time::{self, Instant};

    use crate::assert_elapsed;

    use super::*;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn normalises_parameters() {
        let handler = RetryHandler::new(ms(25), ms(8000), 2.0, false);
        assert_eq!(handler.backoff().min(), ms(25));
        assert_eq!(handler.backoff().max(), ms(8000));

        let handler = RetryHandler::new(ms(3), ms(8000), 2.0, false);
        assert_eq!(handler.backoff().min(), MIN_WAIT_DURATION);

        let handler = RetryHandler::new(ms(50), ms(25), 2.0, false);
        assert_eq!(handler.backoff().min(), ms(25));
        assert_eq!(handler.backoff().max(), ms(50));

        let handler = RetryHandler::new(ms(50), ms(25), 0.5, false);
        assert_eq!(handler.backoff().factor(), MIN_FACTOR);
    }

    #[test]
    fn from_config() {
        let handler = RetryHandler::from_config(&RetryConfig {
            min_wait: 25,
            max_wait: 3,
            factor: 0.8,
            jitter: true,
        });

        assert_eq!(handler.backoff().min(), MIN_WAIT_DURATION);
        assert_eq!(handler.backoff().max(), ms(25));
        assert_eq!(handler.backoff().factor(), MIN_FACTOR);
        assert!(handler.backoff().jitter());
    }

    #[tokio::test(start_paused = true)]
    async fn just_works() {
        let handler = RetryHandler::new(MIN_WAIT_DURATION, ms(5000), 2.0, false);
        let ctx = Context::background().with_timeout(Duration::from_secs(5));

        let result = handler
            .execute(&ctx, |_| async { Ok::<_, io::Error>("success") })
            .await
            .unwrap();

        assert_eq!(result, "success");
    }

    #[tokio::test(start_paused = true)]
    async fn eventually_works() {
        let handler = RetryHandler::new(MIN_WAIT_DURATION, ms(5000), 2.0, false);
        let ctx = Context::background();
        let attempts = &AtomicUsize::new(0);

        let result = handler
            .execute(&ctx, |_| async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(io::Error::other("temporarily failing"))
                } else {
                    Ok("success")
                }
            })
            .await
            .unwrap();

        assert_eq!(result, "success");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn never_works_until_deadline() {
        let handler = RetryHandler::new(MIN_WAIT_DURATION, ms(5000), 2.0, false);
        let ctx = Context::background().with_timeout(Duration::from_secs(5));

        let start = Instant::now();
        let err = handler
            .execute(&ctx, |_| async {
                time::sleep(ms(200)).await;
                Err::<(), _>(io::Error::other("this just isn't going to work"))
            })
            .await
            .unwrap_err();

        assert_elapsed!(start, Duration::from_secs(5), ms(10));
        assert!(err.is_deadline_exceeded(), "{err:?}");
        assert_eq!(
            err.last_error().map(ToString::to_string).as_deref(),
            Some("this just isn't going to work")
        );
        assert!(err.to_string().contains("context deadline exceeded"), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn fails_after_deadline_passed() {
        let handler = RetryHandler::new(ms(10), ms(100), 2.0, false);
        let ctx = Context::background().with_timeout(ms(100));

        let err = handler
            .execute(&ctx, |_| async {
                time::sleep(ms(150)).await;
                Err::<(), _>(io::Error::other("slow"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RetryError::DeadlineExceeded { .. }), "{err:?}");
        assert_eq!(err.to_string(), "context deadline exceeded: slow");
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_while_waiting() {
        let handler = RetryHandler::new(MIN_WAIT_DURATION, ms(5000), 2.0, false);
        let ctx = Context::background().with_timeout(Duration::from_secs(5));

        let canceller = ctx.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let err = handler
            .execute(&ctx, |_| async {
                time::sleep(ms(200)).await;
                Err::<(), _>(io::Error::other("waiting to be cancelled"))
            })
            .await
            .unwrap_err();

        assert!(err.is_cancelled(), "{err:?}");
        assert_eq!(err.to_string(), "waiting to be cancelled: context canceled");
    }

    #[tokio::test]
    async fn done_context_never_attempts() {
        let handler = RetryHandler::default();
        let ctx = Context::background();
        ctx.cancel();

        let attempts = &AtomicUsize::new(0);
        let err = handler
            .execute(&ctx, |_| async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok::<_, io::Error>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RetryError::Context(ContextError::Cancelled)));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_evaluator_says_so() {
        let handler = RetryHandler::default();
        let attempts = &AtomicUsize::new(0);

        let err = handler
            .execute_with(
                &Context::background(),
                |_| async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(io::Error::other("nope"))
                },
                RetryCount::new(2),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RetryError::Target(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn no_retry_returns_first_error() {
        let handler = RetryHandler::default();

        let err = handler
            .execute_with(
                &Context::background(),
                |_| async { Err::<(), _>(io::Error::from(io::ErrorKind::PermissionDenied)) },
                NoRetry,
            )
            .await
            .unwrap_err();

        assert_eq!(
            err.into_last_error().map(|e| e.kind()),
            Some(io::ErrorKind::PermissionDenied)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn waits_grow_exponentially() {
        let handler = RetryHandler::new(ms(100), ms(1000), 2.0, false);
        let attempts = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let start = Instant::now();
        handler
            .execute(&Context::background(), |_| {
                let attempts = attempts.clone();
                async move {
                    let mut attempts = attempts.lock();
                    attempts.push(start.elapsed());
                    if attempts.len() < 5 {
                        Err(io::Error::other("again"))
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();

        let attempts = attempts.lock();
        let expected = [0, 100, 300, 700, 1500];
        assert_eq!(attempts.len(), expected.len());
        for (&actual, expected) in attempts.iter().zip(expected.map(ms)) {
            assert!(
                actual + ms(5) >= expected && actual <= expected + ms(5),
                "actual = {actual:?}, expected = {expected:?}"
            );
        }
    }

    #[tokio::test]
    async fn shared_between_concurrent_executions() {
        let handler = RetryHandler::new(MIN_WAIT_DURATION, ms(20), 2.0, true);

        let handles: Vec<_> = (0..16)
            .map(|i| {
                tokio::spawn(async move {
                    let attempts = &AtomicUsize::new(0);
                    handler
                        .execute(&Context::background(), |_| async move {
                            if attempts.fetch_add(1, Ordering::SeqCst) < i % 4 {
                                Err(io::Error::other("not yet"))
                            } else {
                                Ok(i)
                            }
                        })
                        .await
                        .unwrap()
                })
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), i);
        }
    }
}
