use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{sync::oneshot, task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Context, Error, Limiter};

/// Allows one job per interval, driven by a periodic timer.
///
/// Each tick of the timer lets a single waiting acquirer through. Ticks with nobody waiting are
/// lost, so unlike a token bucket this is truly periodic rather than approximately so.
///
/// The timer runs on a background task which lives until its [TimerHandle] is shut down. The
/// interval can be changed at any time with [set_rate](TimeLimiter::set_rate).
///
/// Cheaply cloneable.
#[derive(Debug, Clone)]
pub struct TimeLimiter {
    shared: Arc<Shared>,
}

/// Owns the background timer task of a [TimeLimiter].
///
/// The task runs until [shutdown](TimerHandle::shutdown) is called, or the shutdown token it was
/// created with is cancelled. Dropping the handle does neither.
#[must_use = "the timer task runs until it is shut down"]
#[derive(Debug)]
pub struct TimerHandle {
    done: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Debug)]
struct Shared {
    /// Nanoseconds.
    interval: AtomicU64,

    waiters: Mutex<VecDeque<oneshot::Sender<()>>>,
}

impl TimeLimiter {
    /// Shorter intervals are raised to this, so the timer can't spin.
    pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

    /// Start a limiter allowing one acquire every `interval`.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(interval: Duration) -> (Self, TimerHandle) {
        Self::with_shutdown(interval, CancellationToken::new())
    }

    /// Start a limiter whose timer stops when `done` is cancelled.
    ///
    /// Must be called within a tokio runtime.
    pub fn with_shutdown(interval: Duration, done: CancellationToken) -> (Self, TimerHandle) {
        let shared = Arc::new(Shared {
            interval: AtomicU64::new(as_nanos(interval)),
            waiters: Mutex::new(VecDeque::new()),
        });

        let task = tokio::spawn(run_timer(shared.clone(), done.clone()));

        (Self { shared }, TimerHandle { done, task })
    }

    /// Change the interval.
    ///
    /// The current tick is unaffected. The new interval applies from the next tick onwards.
    pub fn set_rate(&self, interval: Duration) {
        self.shared
            .interval
            .store(as_nanos(interval), Ordering::Release);
    }

    /// The current interval.
    pub fn rate(&self) -> Duration {
        self.shared.interval()
    }
}

#[async_trait]
impl Limiter for TimeLimiter {
    /// Wait for the next tick, until `ctx` is cancelled or its deadline passes.
    async fn acquire(&self, ctx: &Context) -> Result<(), Error> {
        ctx.check()?;

        let (tx, mut rx) = oneshot::channel();
        self.shared.waiters.lock().push_back(tx);

        match ctx.bounded(&mut rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                panic!("we own the waiter queue, it shouldn't have been dropped")
            }
            Err(err) => {
                rx.close();
                let ticked = rx.try_recv().is_ok();

                self.shared.remove_abandoned();
                if ticked {
                    // Delivered just as the context finished. Not ours to use up.
                    self.shared.release_one();
                }

                Err(err)
            }
        }
    }

    /// Does nothing. The slot is freed by the timer.
    fn release(&self) {}
}

impl TimerHandle {
    /// Stop the timer task.
    ///
    /// Acquirers still waiting will only be freed by their context.
    pub fn shutdown(&self) {
        self.done.cancel();
    }

    /// Stop the timer task and wait for it to finish.
    pub async fn join(self) {
        self.shutdown();

        // The task never panics, and is only aborted when the runtime shuts down.
        let _ = self.task.await;
    }
}

impl Shared {
    fn interval(&self) -> Duration {
        Duration::from_nanos(self.interval.load(Ordering::Acquire))
    }

    /// Let the longest-waiting live acquirer through, if there is one.
    fn release_one(&self) {
        let mut waiters = self.waiters.lock();
        while let Some(waiter) = waiters.pop_front() {
            match waiter.send(()) {
                Ok(()) => return,
                Err(_) => {
                    // The acquirer gave up. Try the next.
                }
            }
        }
    }

    /// Drop waiters which have given up.
    fn remove_abandoned(&self) {
        self.waiters.lock().retain(|waiter| !waiter.is_closed());
    }

    #[cfg(test)]
    fn waiting(&self) -> usize {
        self.waiters.lock().len()
    }
}

async fn run_timer(shared: Arc<Shared>, done: CancellationToken) {
    debug!(interval = ?shared.interval(), "time limiter started");

    loop {
        // Re-read on every tick to pick up `set_rate()`.
        let interval = shared.interval();

        tokio::select! {
            _ = done.cancelled() => break,
            _ = sleep(interval) => shared.release_one(),
        }
    }

    debug!("time limiter stopped");
}

fn as_nanos(interval: Duration) -> u64 {
    let interval = interval.max(TimeLimiter::MIN_INTERVAL);

    u64::try_from(interval.as_nanos()).unwrap_or(u64::MAX)
}
