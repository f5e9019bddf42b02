//! Bounded retries with a fixed backoff.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

#[derive(Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error. Holds the last one.
    Exhausted { attempts: u32, last: E },
    /// A non-retryable error ended the loop.
    Aborted(E),
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Aborted(err) => err,
        }
    }
}

/// Retry policy: up to `attempts` tries, sleeping `backoff` between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retry {
    attempts: u32,
    backoff: Duration,
}

impl Retry {
    pub const fn new(attempts: u32, backoff: Duration) -> Self {
        Self { attempts, backoff }
    }

    /// Ten attempts one second apart, for optimistic-concurrency conflicts.
    pub const fn conflicts() -> Self {
        Self::new(10, Duration::from_secs(1))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Run `op` until it succeeds, fails with an error `retryable` rejects,
    /// or the attempts run out.
    pub async fn run<T, E, F, Fut, C>(&self, mut op: F, retryable: C) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if !retryable(&err) => return Err(RetryError::Aborted(err)),
                Err(err) if attempt >= self.attempts => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
                Err(_) => {
                    debug!(attempt, backoff = ?self.backoff, "retrying");
                    tokio::time::sleep(self.backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}
