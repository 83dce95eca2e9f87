//! Retry policy — bounded attempts with fixed, linear, or exponential waits.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// How long to wait after the `n`-th failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitTime {
    /// Same wait after every failure.
    Fixed(Duration),
    /// `min + step * (n - 1)`, capped at `max`.
    Linear {
        min: Duration,
        step: Duration,
        max: Duration,
    },
    /// `min * 2^(n - 1)` capped at `max`, with up to 50% downward jitter,
    /// never below `min`.
    Exponential { min: Duration, max: Duration },
}

impl WaitTime {
    /// Wait after the `attempt`-th failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let n = attempt.max(1);
        match self {
            Self::Fixed(d) => *d,
            Self::Linear { min, step, max } => {
                let grown = step.saturating_mul(n - 1).saturating_add(*min);
                grown.min(*max)
            }
            Self::Exponential { min, max } => {
                let capped = exponential_cap(*min, *max, n);
                let half = capped / 2;
                let jitter_ms = half.as_millis() as u64;
                let jitter = if jitter_ms == 0 {
                    Duration::ZERO
                } else {
                    Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
                };
                (half + jitter).max(*min).min(*max)
            }
        }
    }
}

fn exponential_cap(min: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow((attempt - 1).min(31));
    min.saturating_mul(factor).min(max)
}

/// Bounded retry policy used when (re)establishing subscriptions.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub wait: WaitTime,
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    /// Exponential backoff between 10ms and 5s, at most 30 attempts.
    fn default() -> Self {
        Self {
            wait: WaitTime::Exponential {
                min: Duration::from_millis(10),
                max: Duration::from_millis(5_000),
            },
            max_attempts: 30,
        }
    }
}

/// The final error of an operation that ran out of attempts.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub last: E,
}

impl RetryPolicy {
    pub fn new(wait: WaitTime, max_attempts: u32) -> Self {
        Self { wait, max_attempts }
    }

    /// Returns the delay before the next attempt after `failures` failures,
    /// or `None` once the attempt budget is spent.
    pub fn next_delay(&self, failures: u32) -> Option<Duration> {
        if failures >= self.max_attempts {
            return None;
        }
        Some(self.wait.delay(failures))
    }

    /// Run `op` until it succeeds or the budget is exhausted.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn retry<T, E, F, Fut>(&self, task: &str, mut op: F) -> Result<T, Exhausted<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) => match self.next_delay(attempt) {
                    Some(delay) => {
                        tracing::debug!(
                            task,
                            attempt,
                            wait_ms = delay.as_millis() as u64,
                            error = %e,
                            "attempt failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        tracing::warn!(task, attempt, error = %e, "giving up after final attempt");
                        return Err(Exhausted { attempts: attempt, last: e });
                    }
                },
            }
        }
    }
}
