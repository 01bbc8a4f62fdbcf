//! Deciding whether a failure is worth retrying.

use conv::ValueFrom;

/// Decides whether an error is transient, and so worth retrying.
///
/// Implemented for any `FnMut(&E) -> bool`.
pub trait RetryEvaluator<E: ?Sized>: Send {
    /// Whether to retry after `err`.
    fn should_retry(&mut self, err: &E) -> bool;
}

impl<E, F> RetryEvaluator<E> for F
where
    E: ?Sized,
    F: FnMut(&E) -> bool + Send,
{
    fn should_retry(&mut self, err: &E) -> bool {
        self(err)
    }
}

/// Never retry.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

/// Always retry.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRetry;

/// Retry `n` times, then stop.
///
/// Keeps count, so use a new one for each [execute](super::RetryHandler::execute_with).
///
/// Prefer a context deadline where possible. It expresses how long you are willing to wait, where
/// a retry count is fairly arbitrary.
#[derive(Debug, Clone)]
pub struct RetryCount {
    remaining: u32,
}

/// Retry only if every evaluator agrees. Any one of them can veto.
pub struct AllOf<E: ?Sized> {
    evaluators: Vec<Box<dyn RetryEvaluator<E>>>,
}

/// Retry if any evaluator says to.
pub struct AnyOf<E: ?Sized> {
    evaluators: Vec<Box<dyn RetryEvaluator<E>>>,
}

impl<E: ?Sized> RetryEvaluator<E> for NoRetry {
    fn should_retry(&mut self, _err: &E) -> bool {
        false
    }
}

impl<E: ?Sized> RetryEvaluator<E> for AlwaysRetry {
    fn should_retry(&mut self, _err: &E) -> bool {
        true
    }
}

impl RetryCount {
    /// Allow `n` retries. Negative values mean none.
    pub fn new(n: i32) -> Self {
        Self {
            remaining: u32::value_from(n).unwrap_or(0),
        }
    }

    /// Retries left.
    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}

impl<E: ?Sized> RetryEvaluator<E> for RetryCount {
    fn should_retry(&mut self, _err: &E) -> bool {
        match self.remaining.checked_sub(1) {
            Some(remaining) => {
                self.remaining = remaining;
                true
            }
            None => false,
        }
    }
}

impl<E: ?Sized> AllOf<E> {
    #[allow(missing_docs)]
    pub fn new(evaluators: Vec<Box<dyn RetryEvaluator<E>>>) -> Self {
        Self { evaluators }
    }
}

impl<E: ?Sized> RetryEvaluator<E> for AllOf<E> {
    /// Stops at the first veto, so later evaluators aren't consulted.
    fn should_retry(&mut self, err: &E) -> bool {
        self.evaluators.iter_mut().all(|e| e.should_retry(err))
    }
}

impl<E: ?Sized> AnyOf<E> {
    #[allow(missing_docs)]
    pub fn new(evaluators: Vec<Box<dyn RetryEvaluator<E>>>) -> Self {
        Self { evaluators }
    }
}

impl<E: ?Sized> RetryEvaluator<E> for AnyOf<E> {
    /// Stops at the first evaluator in favour.
    fn should_retry(&mut self, err: &E) -> bool {
        self.evaluators.iter_mut().any(|e| e.should_retry(err))
    }
}
