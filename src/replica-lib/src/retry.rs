use async_trait::async_trait;
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ReplicaError, ReplicaResult};

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

pub type SleeperRef = Arc<dyn Sleeper>;

pub fn default_sleeper() -> SleeperRef {
    Arc::new(TokioSleeper)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 1000,
            multiplier: 1.5,
            max_backoff_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (1-based: the wait after the first failure is attempt 1).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let base = self.initial_backoff_ms as f64 * self.multiplier.powi(exp);
        let capped = base.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    pub async fn run<T, F, Fut>(&self, op_name: &str, sleeper: &dyn Sleeper, mut op: F) -> ReplicaResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ReplicaResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    if attempt >= max_attempts {
                        error!(
                            "{}: too many failed attempts ({}), last error: {}",
                            op_name, attempt, e
                        );
                        return Err(e);
                    }
                    let wait = self.delay_for_attempt(attempt);
                    info!(
                        "{}: error \"{}\" occurred, trying again in {:.1} seconds",
                        op_name,
                        e,
                        wait.as_secs_f64()
                    );
                    sleeper.sleep(wait).await;
                }
            }
        }
    }
}

/// Wraps a future with a timeout, mapping expiry to `ReplicaError::Timeout`.
pub async fn with_timeout<T, Fut>(op_name: &str, timeout: Duration, fut: Fut) -> ReplicaResult<T>
where
    Fut: Future<Output = ReplicaResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ReplicaError::Timeout(format!(
            "{} did not complete within {:?}",
            op_name, timeout
        ))),
    }
}
