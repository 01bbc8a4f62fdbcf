//! Admission control for async work.
//!
//! - [Limiter]s decide whether, and when, work may start: by concurrency, by rate, or on a timer.
//! - A [RetryHandler] re-runs failing work with exponential backoff, until a [Context] is done.
//! - A [BatchRequest] fans work out across tasks under a shared limiter, then gathers the
//!   results.
//!
//! Every blocking operation takes a [Context], which carries cancellation and an optional
//! deadline down the call chain.

#![deny(missing_docs)]

#[cfg(doctest)]
use doc_comment::doctest;
#[cfg(doctest)]
doctest!("../README.md");

mod batch;
mod bucket;
mod context;
mod error;
mod limiter;
pub mod retry;

pub use batch::{BatchRequest, BatchResponse, WorkError, WorkRequest, WorkResult};
pub use context::Context;
pub use error::{BoxError, ContextError, Error};
pub use limiter::{
    infinite_limiter, BalanceCheckingLimiter, FailFastLimiter, InfiniteLimiter, Limiter, Permit,
    RateLimiter, SemaphoreLimiter, TimeLimiter, TimerHandle,
};
pub use retry::{RetryConfig, RetryError, RetryHandler};
