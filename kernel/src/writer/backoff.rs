// Bounded Exponential Backoff
//
// Retries transient transport failures in place. The caller blocks while
// a message is retried, so a retried message is never overtaken by later
// messages for the same partition.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::log::TransportError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(with = "humantime_serde")]
    pub init_backoff: Duration,

    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Multiplier applied after each failed attempt.
    pub base: f64,

    /// Total attempts including the first one.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            base: 3.0,
            max_attempts: 5,
        }
    }
}

#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    next: Duration,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            config: config.clone(),
            next: config.init_backoff,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next.min(self.config.max_backoff);
        self.next = Duration::try_from_secs_f64(self.next.as_secs_f64() * self.config.base.max(1.0))
            .unwrap_or(self.config.max_backoff)
            .min(self.config.max_backoff);
        delay
    }

    /// Run `task` until it succeeds, fails with a non-retryable error, or
    /// the attempt budget is spent. The last error is returned.
    pub fn retry_transient<T, F>(&mut self, task_name: &str, mut task: F) -> Result<T, TransportError>
    where
        F: FnMut() -> Result<T, TransportError>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match task() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.next_delay();
                    warn!(
                        e=%e,
                        task_name,
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        "transient failure, retrying"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> BackoffConfig {
        BackoffConfig {
            init_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            base: 2.0,
            max_attempts: 3,
        }
    }

    fn transient() -> TransportError {
        TransportError::Transient {
            topic: "t".into(),
            partition: 0,
            reason: "busy".into(),
        }
    }

    #[test]
    fn delays_grow_and_cap() {
        let mut backoff = Backoff::new(&BackoffConfig {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            base: 3.0,
            max_attempts: 5,
        });

        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(300));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn transient_errors_are_retried_until_success() {
        let mut failures = 2;
        let out = Backoff::new(&fast())
            .retry_transient("append", || {
                if failures > 0 {
                    failures -= 1;
                    Err(transient())
                } else {
                    Ok(7)
                }
            })
            .unwrap();
        assert_eq!(out, 7);
    }

    #[test]
    fn budget_is_bounded() {
        let mut calls = 0;
        let err = Backoff::new(&fast())
            .retry_transient::<(), _>("append", || {
                calls += 1;
                Err(transient())
            })
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(calls, 3);
    }

    #[test]
    fn fatal_errors_are_not_retried() {
        let mut calls = 0;
        Backoff::new(&fast())
            .retry_transient::<(), _>("append", || {
                calls += 1;
                Err(TransportError::UnknownTopic("t".into()))
            })
            .unwrap_err();
        assert_eq!(calls, 1);
    }
}
