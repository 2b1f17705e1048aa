//! Retry on optimistic concurrency conflicts
//!
//! The remote store rejects writes carrying a stale resource version. Every
//! mutation is therefore written as "read, mutate, write" and restarted from
//! the read when the write conflicts.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::error::Result;

/// Bounded exponential backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        }
    }
}

/// Runs `op` until it succeeds, fails with a non-conflict error or the
/// attempts are exhausted
///
/// # Arguments
/// * `policy` - Attempt count and backoff bounds
/// * `op` - One full read-modify-write cycle
pub async fn retry_on_conflict<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    let mut delay = policy.initial_delay;

    loop {
        attempt += 1;

        match op().await {
            Err(e) if e.is_conflict() && attempt < policy.attempts => {
                debug!(
                    "Conflict on attempt {}/{}, retrying in {:?}: {}",
                    attempt, policy.attempts, delay, e
                );
                tokio::time::sleep(delay).await;

                // Exponential backoff with cap
                delay = (delay * 2).min(policy.max_delay);
            }
            result => return result,
        }
    }
}
