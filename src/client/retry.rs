//! Rate-limit retry and poll-until-ready helpers.

use crate::error::ProvisionError;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Wait used when a 429 carries no usable `Retry-After`.
    pub default_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            default_delay: Duration::from_secs(30),
        }
    }
}

/// Result of one attempt.
#[derive(Debug)]
pub enum Attempt<T> {
    Done(T),
    /// HTTP 429 with the parsed `Retry-After`, if present.
    Throttled(Option<Duration>),
}

pub async fn with_rate_limit_retry<T, F, Fut>(
    policy: &RetryPolicy,
    path: &str,
    mut attempt: F,
) -> Result<T, ProvisionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Attempt<T>, ProvisionError>>,
{
    for n in 1..=policy.max_attempts {
        match attempt().await? {
            Attempt::Done(value) => return Ok(value),
            Attempt::Throttled(after) => {
                let delay = after.unwrap_or(policy.default_delay);
                warn!(path, attempt = n, delay_secs = delay.as_secs(), "rate limited");
                if n < policy.max_attempts {
                    sleep(delay).await;
                }
            }
        }
    }
    Err(ProvisionError::RateLimitExceeded {
        path: path.to_string(),
        attempts: policy.max_attempts,
    })
}

/// `Retry-After` in delta-seconds form.
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value?.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[derive(Clone, Debug)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug)]
pub enum Poll<T> {
    Ready(T),
    /// Not there yet; the string is the last observed status.
    Pending(String),
}

/// Probe until ready or the policy's timeout elapses. Probe errors abort immediately.
pub async fn wait_until<T, F, Fut>(policy: &PollPolicy, what: &str, mut probe: F) -> Result<T, ProvisionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Poll<T>, ProvisionError>>,
{
    let deadline = Instant::now() + policy.timeout;
    loop {
        match probe().await? {
            Poll::Ready(value) => return Ok(value),
            Poll::Pending(status) => {
                debug!(what, status = %status, "waiting");
            }
        }
        if Instant::now() + policy.interval > deadline {
            return Err(ProvisionError::Timeout {
                what: what.to_string(),
                secs: policy.timeout.as_secs(),
            });
        }
        sleep(policy.interval).await;
    }
}
