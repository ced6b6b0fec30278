use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{RankError, RetryError};

/// Bounded retry for flaky external handles (publish target, app server).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Result<Self, RankError> {
        if max_attempts == 0 {
            return Err(RankError::Configuration("retry.max_attempts must be at least 1".to_string()));
        }
        Ok(Self { max_attempts, interval })
    }

    pub fn from_config(config: &RetryConfig) -> Result<Self, RankError> {
        Self::new(config.max_attempts, Duration::from_millis(config.interval_ms))
    }

    /// Runs `op` until it succeeds, the classifier calls an error fatal, or
    /// `max_attempts` is used up. Sleeps `interval` between attempts.
    pub async fn run<T, E, F, Fut, R>(&self, label: &str, mut op: F, is_retryable: R) -> Result<T, RetryError<E>>
    where
        E: std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}", label, attempt);
                    }
                    return Ok(value);
                }
                Err(error) if !is_retryable(&error) => {
                    warn!("{}: unrecoverable error on attempt {}: {}", label, attempt, error);
                    return Err(RetryError::Fatal { attempt, error });
                }
                Err(error) if attempt >= self.max_attempts => {
                    warn!("{}: giving up after {} attempts: {}", label, attempt, error);
                    return Err(RetryError::Exhausted { attempts: attempt, last: error });
                }
                Err(error) => {
                    debug!("{}: attempt {} failed ({}), retrying", label, attempt, error);
                    attempt += 1;
                    tokio::time::sleep(self.interval).await;
                }
            }
        }
    }
}
