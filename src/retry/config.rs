use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The shortest wait allowed between retries.
pub const MIN_WAIT_DURATION: Duration = Duration::from_millis(5);

/// The smallest exponential growth factor allowed between retries.
pub const MIN_FACTOR: f64 = 1.0;

/// Default [RetryConfig::min_wait], in milliseconds.
pub const DEFAULT_MIN_WAIT: u64 = 50;

/// Default [RetryConfig::max_wait], in milliseconds.
pub const DEFAULT_MAX_WAIT: u64 = 5000;

/// Default [RetryConfig::factor].
pub const DEFAULT_FACTOR: f64 = 2.0;

/// Default [RetryConfig::jitter].
pub const DEFAULT_JITTER: bool = true;

/// Backoff settings for a [RetryHandler](super::RetryHandler), as loaded from configuration.
///
/// Keys are camelCase (`minWait`, `maxWait`, `factor`, `jitter`). Missing keys take their
/// defaults. Values are normalised when the handler is built, not here.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Wait before the first retry, in milliseconds.
    pub min_wait: u64,
    /// Longest wait between retries, in milliseconds.
    pub max_wait: u64,
    /// Growth of the wait per retry.
    pub factor: f64,
    /// Randomise each wait between `min_wait` and its exponential value.
    pub jitter: bool,
}

impl RetryConfig {
    /// `min_wait` as a [Duration].
    pub fn min_wait_duration(&self) -> Duration {
        Duration::from_millis(self.min_wait)
    }

    /// `max_wait` as a [Duration].
    pub fn max_wait_duration(&self) -> Duration {
        Duration::from_millis(self.max_wait)
    }
}

impl Default for RetryConfig {
    /// 50ms to 5s, doubling each time, with jitter.
    fn default() -> Self {
        Self {
            min_wait: DEFAULT_MIN_WAIT,
            max_wait: DEFAULT_MAX_WAIT,
            factor: DEFAULT_FACTOR,
            jitter: DEFAULT_JITTER,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RetryConfig::default();

        assert_eq!(config.min_wait_duration(), Duration::from_millis(50));
        assert_eq!(config.max_wait_duration(), Duration::from_secs(5));
        assert_eq!(config.factor, DEFAULT_FACTOR);
        assert!(config.jitter);
    }

    #[test]
    fn deserialises_camel_case() {
        let config: RetryConfig = serde_json::from_str(
            r#"{ "minWait": 25, "maxWait": 8000, "factor": 1.5, "jitter": false }"#,
        )
        .unwrap();

        assert_eq!(
            config,
            RetryConfig {
                min_wait: 25,
                max_wait: 8000,
                factor: 1.5,
                jitter: false,
            }
        );
    }

    #[test]
    fn missing_keys_take_defaults() {
        let config: RetryConfig = serde_json::from_str(r#"{ "maxWait": 100 }"#).unwrap();

        assert_eq!(
            config,
            RetryConfig {
                max_wait: 100,
                ..RetryConfig::default()
            }
        );
    }
}
