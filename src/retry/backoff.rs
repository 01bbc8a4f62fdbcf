use std::time::Duration;

use rand::Rng;

use super::config::{MIN_FACTOR, MIN_WAIT_DURATION};

/// Exponential backoff parameters.
///
/// Always valid: `MIN_WAIT_DURATION <= min <= max` and `factor >= MIN_FACTOR`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    factor: f64,
    jitter: bool,
}

impl Backoff {
    /// Normalises the parameters into a valid range.
    ///
    /// `min` and `max` are raised to at least [MIN_WAIT_DURATION], then swapped if `min > max`.
    /// `factor` is raised to at least [MIN_FACTOR].
    pub fn new(min: Duration, max: Duration, factor: f64, jitter: bool) -> Self {
        let min = min.max(MIN_WAIT_DURATION);
        let max = max.max(MIN_WAIT_DURATION);
        let (min, max) = if min > max { (max, min) } else { (min, max) };

        // Also catches NaN.
        let factor = if factor >= MIN_FACTOR {
            factor
        } else {
            MIN_FACTOR
        };

        Self {
            min,
            max,
            factor,
            jitter,
        }
    }

    #[allow(missing_docs)]
    pub fn min(&self) -> Duration {
        self.min
    }

    #[allow(missing_docs)]
    pub fn max(&self) -> Duration {
        self.max
    }

    #[allow(missing_docs)]
    pub fn factor(&self) -> f64 {
        self.factor
    }

    #[allow(missing_docs)]
    pub fn jitter(&self) -> bool {
        self.jitter
    }

    /// The wait before retry number `attempt`, counting from zero.
    ///
    /// Grows by `factor` per attempt, within `[min, max]`. With jitter, a random duration between
    /// `min` and the grown value is used instead.
    pub fn for_attempt(&self, attempt: u32) -> Duration {
        if self.min >= self.max {
            return self.max;
        }

        let min = self.min.as_secs_f64();
        let mut wait = min * self.factor.powf(f64::from(attempt));

        if self.jitter {
            wait = rand::thread_rng().gen_range(0.0..1.0) * (wait - min) + min;
        }

        match Duration::try_from_secs_f64(wait) {
            Ok(wait) => wait.clamp(self.min, self.max),
            // Overflowed
            Err(_) => self.max,
        }
    }
}
