// shardstream-core/src/storage/retry.rs

//! Retry policy for shard downloads.
//!
//! Exponential backoff with optional jitter. Callers classify each failure
//! as retryable or fatal through `RetryResult`.

use std::thread;
use std::time::Duration;

use rand::Rng;

use crate::config::DownloadConfig;

/// Backoff policy for shard downloads.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Re-attempts after the first download.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Stretch each delay by a random factor of up to 25%.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&DownloadConfig::default())
    }
}

impl From<&DownloadConfig> for RetryConfig {
    fn from(download: &DownloadConfig) -> Self {
        Self {
            max_retries: download.max_retries,
            initial_delay: Duration::from_millis(download.retry_delay_ms),
            max_delay: Duration::from_millis(download.max_retry_delay_ms),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Fails on the first transient error.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Sleep before re-attempting after failed attempt `attempt` (0-indexed).
    /// Zero once the budget is spent.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt >= self.max_retries {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = (self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent))
            .min(self.max_delay.as_secs_f64());
        let stretch = if self.jitter {
            1.0 + rand::thread_rng().gen::<f64>() * 0.25
        } else {
            1.0
        };
        Duration::from_secs_f64(secs * stretch)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Outcome of one attempt, as classified by the caller.
#[derive(Debug)]
pub enum RetryResult<T, E> {
    Ok(T),
    /// Transient failure; try again if the budget allows.
    Retry(E),
    Fail(E),
}

/// Runs `operation` until it succeeds, fails fatally, or retries run out.
///
/// The operation receives the 0-indexed attempt number. The calling thread
/// sleeps between attempts.
pub fn retry<T, E, F>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut(u32) -> RetryResult<T, E>,
{
    let mut attempt = 0;

    loop {
        match operation(attempt) {
            RetryResult::Ok(value) => return Ok(value),
            RetryResult::Fail(error) => return Err(error),
            RetryResult::Retry(error) => {
                if !config.should_retry(attempt) {
                    return Err(error);
                }

                let delay = config.delay_for_attempt(attempt);
                thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    #[test]
    fn test_default_follows_download_config() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.initial_delay, Duration::from_millis(100));
        assert_eq!(config.max_delay, Duration::from_secs(10));
        assert!(config.jitter);
    }

    #[test]
    fn test_no_retry() {
        let config = RetryConfig::no_retry();
        assert_eq!(config.max_retries, 0);
        assert!(!config.should_retry(0));
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let mut config = RetryConfig {
            max_retries: 6,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            jitter: false,
        };
        let delays: Vec<u64> = (0..7)
            .map(|a| config.delay_for_attempt(a).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500, 500, 0]);

        config.jitter = true;
        for _ in 0..20 {
            let delay = config.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(250));
        }
    }

    #[test]
    fn test_from_download_config() {
        let download = DownloadConfig {
            max_retries: 3,
            retry_delay_ms: 200,
            max_retry_delay_ms: 5000,
        };

        let retry_config = RetryConfig::from(&download);
        assert_eq!(retry_config.max_retries, 3);
        assert_eq!(retry_config.initial_delay, Duration::from_millis(200));
        assert_eq!(retry_config.max_delay, Duration::from_millis(5000));
    }

    #[test]
    fn test_retry_fail_stops_immediately() {
        let mut calls = 0;
        let result = retry(&fast_config(5), |_| {
            calls += 1;
            RetryResult::Fail::<i32, _>("fatal error")
        });
        assert_eq!(result, Err("fatal error"));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_retry_eventual_success() {
        let result = retry(&fast_config(5), |attempt| {
            if attempt < 2 {
                RetryResult::Retry("not yet")
            } else {
                RetryResult::Ok(attempt)
            }
        });
        assert_eq!(result, Ok(2));
    }

    #[test]
    fn test_retry_exhausted() {
        let mut calls = 0;
        let result = retry(&fast_config(2), |_| {
            calls += 1;
            RetryResult::Retry::<i32, _>("always fails")
        });

        assert_eq!(result, Err("always fails"));
        // initial attempt + 2 retries
        assert_eq!(calls, 3);
    }
}
