//! Fan-out/fan-in execution of independent work.
//!
//! A [BatchRequest] runs every [WorkRequest] as its own task, gated by a shared [Limiter], and
//! gathers one [WorkResult] per request into a [BatchResponse]. Failures, including panics, are
//! confined to the result of the work which caused them.

use std::{
    any::Any,
    collections::HashMap,
    fmt,
    future::Future,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use futures::{future::BoxFuture, FutureExt};
use thiserror::Error;
use tokio::task::AbortHandle;
use tracing::{trace, warn};

use crate::{infinite_limiter, BoxError, Context, Error, Limiter, Permit};

type Target<T> = Box<dyn FnOnce(Context) -> BoxFuture<'static, Result<T, BoxError>> + Send>;

/// One unit of work in a [BatchRequest].
pub struct WorkRequest<T> {
    correlation_id: String,
    target: Target<T>,
}

/// Why a [WorkRequest] failed.
#[derive(Debug, Error)]
pub enum WorkError {
    /// The limiter refused the work, so it never ran.
    #[error(transparent)]
    Acquire(#[from] Error),

    /// The work returned an error.
    #[error(transparent)]
    Target(BoxError),

    /// The work panicked.
    #[error("target panic: {message}")]
    Panic {
        #[allow(missing_docs)]
        message: String,
        /// Present when the panic payload was itself an error.
        #[source]
        source: Option<BoxError>,
    },

    /// The task running the work was aborted, e.g. because the runtime shut down.
    #[error("work aborted before completing")]
    Aborted,
}

/// The outcome of a [WorkRequest].
#[derive(Debug)]
pub struct WorkResult<T> {
    /// From the [WorkRequest].
    pub correlation_id: String,
    /// The value returned by the work, or why there isn't one.
    pub result: Result<T, WorkError>,
}

/// The results of a [BatchRequest], one per [WorkRequest].
#[derive(Debug)]
pub struct BatchResponse<T> {
    /// From the [BatchRequest].
    pub correlation_id: String,
    /// Keyed by [WorkResult::correlation_id].
    pub results: HashMap<String, WorkResult<T>>,
}

/// Work to be executed as a parallel batch.
///
/// ```
/// # tokio_test::block_on(async {
/// use std::sync::Arc;
///
/// use admission::{BatchRequest, BoxError, Context, SemaphoreLimiter, WorkRequest};
///
/// let response = BatchRequest::new("batch-1")
///     .with_limiter(Arc::new(SemaphoreLimiter::new(2)))
///     .with_work_request(WorkRequest::new("a", |_ctx| async { Ok::<_, BoxError>(1) }))
///     .with_work_request(WorkRequest::new("b", |_ctx| async { Err::<i32, BoxError>("nope".into()) }))
///     .execute(&Context::background())
///     .await;
///
/// assert_eq!(response.results.len(), 2);
/// assert_eq!(*response.get("a").unwrap().result.as_ref().unwrap(), 1);
/// assert!(response.get("b").unwrap().result.is_err());
/// # });
/// ```
pub struct BatchRequest<T> {
    correlation_id: String,
    limiter: Option<Arc<dyn Limiter>>,
    work_requests: Vec<WorkRequest<T>>,
}

impl<T> WorkRequest<T> {
    /// Work identified by `correlation_id`, which should be unique within its batch.
    pub fn new<F, Fut>(correlation_id: impl Into<String>, target: F) -> Self
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        Self {
            correlation_id: correlation_id.into(),
            target: Box::new(move |ctx| target(ctx).boxed()),
        }
    }

    #[allow(missing_docs)]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl<T> fmt::Debug for WorkRequest<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkRequest")
            .field("correlation_id", &self.correlation_id)
            .finish_non_exhaustive()
    }
}

impl<T> BatchRequest<T>
where
    T: Send + 'static,
{
    /// An empty batch, without a limiter.
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            limiter: None,
            work_requests: Vec::new(),
        }
    }

    /// Gate every piece of work with `limiter`. Without one, nothing is limited.
    pub fn with_limiter(mut self, limiter: Arc<dyn Limiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Add some work.
    ///
    /// Correlation IDs should be unique. If not, only the result of the last work with a given ID
    /// will be kept.
    pub fn with_work_request(mut self, request: WorkRequest<T>) -> Self {
        if self
            .work_requests
            .iter()
            .any(|existing| existing.correlation_id == request.correlation_id)
        {
            warn!(
                batch = %self.correlation_id,
                correlation_id = %request.correlation_id,
                "duplicate correlation ID in batch, earlier result will be overwritten"
            );
        }

        self.work_requests.push(request);
        self
    }

    /// The number of work requests.
    pub fn len(&self) -> usize {
        self.work_requests.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.work_requests.is_empty()
    }

    /// Run all the work in parallel, waiting for every piece to finish.
    ///
    /// Never fails as a whole. Each piece of work succeeds or fails independently, and has exactly
    /// one entry in the response.
    ///
    /// Must be called within a tokio runtime. If the returned future is dropped before it
    /// completes, work still in progress is aborted and its permits are released.
    ///
    /// # Panics
    ///
    /// Re-raises a panic from a task outside of the work itself, such as a
    /// [BalanceCheckingLimiter](crate::BalanceCheckingLimiter) detecting an over-release.
    pub async fn execute(self, ctx: &Context) -> BatchResponse<T> {
        let limiter = self.limiter.unwrap_or_else(infinite_limiter);

        let tasks: Vec<_> = self
            .work_requests
            .into_iter()
            .map(|request| {
                let correlation_id = request.correlation_id.clone();
                let task = tokio::spawn(run(request, limiter.clone(), ctx.clone()));
                (correlation_id, task)
            })
            .collect();

        let _abort = AbortOnDrop(tasks.iter().map(|(_, task)| task.abort_handle()).collect());

        // Wait for everything before assembling the response.
        let mut completed = Vec::with_capacity(tasks.len());
        for (correlation_id, task) in tasks {
            let result = match task.await {
                Ok(result) => result,
                Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
                Err(_) => WorkResult {
                    correlation_id,
                    result: Err(WorkError::Aborted),
                },
            };
            completed.push(result);
        }

        BatchResponse {
            correlation_id: self.correlation_id,
            results: completed
                .into_iter()
                .map(|result| (result.correlation_id.clone(), result))
                .collect(),
        }
    }
}

/// Aborts tasks which are still running when dropped.
struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

impl<T> fmt::Debug for BatchRequest<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchRequest")
            .field("correlation_id", &self.correlation_id)
            .field("limiter", &self.limiter)
            .field("work_requests", &self.work_requests)
            .finish()
    }
}

impl<T> BatchResponse<T> {
    /// The result for the work with `correlation_id`.
    pub fn get(&self, correlation_id: &str) -> Option<&WorkResult<T>> {
        self.results.get(correlation_id)
    }

    /// The number of results.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Results of work which succeeded.
    pub fn successes(&self) -> impl Iterator<Item = (&str, &T)> {
        self.results
            .iter()
            .filter_map(|(id, work)| work.result.as_ref().ok().map(|value| (id.as_str(), value)))
    }

    /// Errors from work which failed.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &WorkError)> {
        self.results
            .iter()
            .filter_map(|(id, work)| work.result.as_ref().err().map(|err| (id.as_str(), err)))
    }
}

impl<T> IntoIterator for BatchResponse<T> {
    type Item = (String, WorkResult<T>);
    type IntoIter = std::collections::hash_map::IntoIter<String, WorkResult<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}

/// Run one piece of work to completion under the limiter.
async fn run<T>(request: WorkRequest<T>, limiter: Arc<dyn Limiter>, ctx: Context) -> WorkResult<T> {
    let WorkRequest {
        correlation_id,
        target,
    } = request;

    let permit = match Permit::acquire(limiter, &ctx).await {
        Ok(permit) => permit,
        Err(err) => {
            trace!(%correlation_id, error = %err, "work not started");
            return WorkResult {
                correlation_id,
                result: Err(WorkError::Acquire(err)),
            };
        }
    };

    // Calling the target happens inside the boundary too.
    let outcome = AssertUnwindSafe(async move { target(ctx).await })
        .catch_unwind()
        .await;

    drop(permit);

    let result = match outcome {
        Ok(result) => result.map_err(WorkError::Target),
        Err(panic) => {
            let err = panic_to_error(panic);
            warn!(%correlation_id, error = %err, "work panicked");
            Err(err)
        }
    };

    WorkResult {
        correlation_id,
        result,
    }
}

fn panic_to_error(panic: Box<dyn Any + Send>) -> WorkError {
    let panic = match panic.downcast::<BoxError>() {
        Ok(err) => {
            return WorkError::Panic {
                message: err.to_string(),
                source: Some(*err),
            }
        }
        Err(panic) => panic,
    };

    let message = if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    };

    WorkError::Panic {
        message,
        source: None,
    }
}
