//! Cancellation and deadlines for blocking operations.

use std::{future::Future, time::Duration};

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::{ContextError, Error};

/// Carries a cancellation signal and an optional deadline to every operation which may block.
///
/// Cheaply cloneable. Clones share the same cancellation state.
///
/// Derived contexts ([child](Self::child), [with_timeout](Self::with_timeout),
/// [with_deadline](Self::with_deadline)) are cancelled when their parent is, but cancelling a
/// child never affects the parent.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context which is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context which is done when `token` is cancelled.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// A child context with the same deadline, which can be cancelled independently.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// A child context which expires after `timeout`, or at the parent's deadline if sooner.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// A child context which expires at `deadline`, or at the parent's deadline if sooner.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) => parent.min(deadline),
            None => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Cancel this context and every context derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline. `None` means unbounded.
    ///
    /// Saturates at zero once the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Why the context is done, or `None` if it isn't. Never blocks.
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            Some(ContextError::Cancelled)
        } else if self.deadline.is_some_and(|deadline| deadline <= Instant::now()) {
            Some(ContextError::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Whether the context has been cancelled or has expired.
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves once the context is cancelled or its deadline passes.
    ///
    /// Never resolves for a background context.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.token.cancelled() => ContextError::Cancelled,
                _ = sleep_until(deadline) => ContextError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                ContextError::Cancelled
            }
        }
    }

    /// Resolves once the context is cancelled, ignoring the deadline.
    pub(crate) async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Fails immediately if the context is already done.
    pub(crate) fn check(&self) -> Result<(), Error> {
        match self.err() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Race `fut` against cancellation and a wait bounded by the deadline.
    ///
    /// Cancellation wins ties, so a cancelled caller never takes capacity freed at the same time.
    ///
    /// When the bounded wait elapses first, the context is re-checked so an expired context is
    /// reported as such. Otherwise the result is [Error::AcquireTimeout]. The two can coincide, so
    /// the classification is best-effort.
    pub(crate) async fn bounded<F: Future>(&self, fut: F) -> Result<F::Output, Error> {
        let wait_limit = self.deadline;

        tokio::select! {
            biased;

            _ = self.cancelled() => Err(ContextError::Cancelled.into()),

            output = fut => Ok(output),

            _ = sleep_until(wait_limit.unwrap_or_else(Instant::now)), if wait_limit.is_some() => {
                match self.err() {
                    Some(err) => Err(err.into()),
                    None => Err(Error::AcquireTimeout),
                }
            }
        }
    }
}
