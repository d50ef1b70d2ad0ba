//! Bounded polling.
//!
//! Every wait in a bring-up is a [`poll_until`] over a [`RetryPolicy`]. The
//! [`Clock`] is injectable so tests run without sleeping.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::OrchestratorResult;

/// How often and how many times to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay between polls.
    pub interval: Duration,
    /// Polls before giving up.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Pod readiness after a join: 10 s apart, 90 times.
    pub const PODS: Self = Self::new(Duration::from_secs(10), 90);

    /// Final `kube-system` convergence: 5 s apart, 180 times.
    pub const CONVERGENCE: Self = Self::new(Duration::from_secs(5), 180);

    /// etcd membership: 5 s apart, 5 times.
    pub const QUORUM: Self = Self::new(Duration::from_secs(5), 5);

    /// Create a policy.
    #[must_use]
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }
}

/// Sleeps between polls.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Wait for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// [`Clock`] backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// [`Clock`] that returns immediately and counts sleeps.
#[derive(Debug, Default)]
pub struct InstantClock {
    sleeps: AtomicU32,
}

impl InstantClock {
    /// Create a clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sleeps requested so far.
    #[must_use]
    pub fn sleeps(&self) -> u32 {
        self.sleeps.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Clock for InstantClock {
    async fn sleep(&self, _duration: Duration) {
        self.sleeps.fetch_add(1, Ordering::Relaxed);
    }
}

/// Result of one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll<T> {
    /// The condition holds.
    Ready(T),
    /// Not yet; the state observed is kept for the timeout report.
    Pending(T),
}

/// Result of a whole wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The condition held on attempt `attempts`.
    Ready {
        /// Final observation.
        value: T,
        /// Polls made.
        attempts: u32,
    },
    /// Every attempt was pending.
    Exhausted {
        /// Last observation.
        last: T,
        /// Polls made.
        attempts: u32,
    },
}

/// Poll `check` until it is ready or the policy is exhausted.
///
/// The clock sleeps between polls, never after the last one. Errors from
/// `check` end the wait immediately.
pub async fn poll_until<T, F, Fut>(
    policy: RetryPolicy,
    clock: &dyn Clock,
    what: &str,
    mut check: F,
) -> OrchestratorResult<Outcome<T>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = OrchestratorResult<Poll<T>>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match check(attempt).await? {
            Poll::Ready(value) => {
                debug!(what, attempt, "condition met");
                return Ok(Outcome::Ready {
                    value,
                    attempts: attempt,
                });
            }
            Poll::Pending(last) if attempt >= attempts => {
                debug!(what, attempt, "giving up");
                return Ok(Outcome::Exhausted {
                    last,
                    attempts: attempt,
                });
            }
            Poll::Pending(_) => {
                debug!(what, attempt, max_attempts = attempts, "not ready, retrying");
                clock.sleep(policy.interval).await;
                attempt += 1;
            }
        }
    }
}
