use std::{fmt::Display, future::Future, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Time unit the backoff is measured in.
pub const BACKOFF_DELAY: Duration = Duration::from_secs(1);

/// Exponential backoff: up to `retries + 1` attempts, waiting `base_delay`
/// before the first retry and doubling the wait after every further failure.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay: Duration,
}

#[derive(Debug)]
pub enum RetryError<E> {
    Exhausted { attempts: u32, last: E },
    Cancelled,
}

impl RetryPolicy {
    pub fn new(retries: u32) -> Self {
        Self {
            retries,
            base_delay: BACKOFF_DELAY,
        }
    }

    /// The waits between consecutive attempts, `1, 2, 4, ...` time units.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let base = self.base_delay;
        (0..self.retries).map(move |n| base.saturating_mul(2_u32.saturating_pow(n)))
    }

    /// Runs `op` until it succeeds or the budget is used up. `op` receives the
    /// 1-based attempt number. Cancellation interrupts both a pending attempt
    /// and the backoff sleep.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut delays = self.delays();
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            attempt += 1;
            let err = tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                res = op(attempt) => match res {
                    Ok(v) => return Ok(v),
                    Err(e) => e,
                },
            };

            let delay = match delays.next() {
                Some(delay) => delay,
                None => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: err,
                    })
                }
            };

            debug!(attempt, error = %err, "retrying after {:?}", delay);
            tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
