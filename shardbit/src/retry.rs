use core::future::Future;
use std::time::Duration;

/// Outcome of one submission of outstanding work.
pub enum Submission<S> {
    /// Everything handed in was consumed.
    Consumed,
    /// Some of the work came back and must be re-submitted.
    Unprocessed(S),
}

/// Terminal state of a retried submission loop.
pub struct RetryOutcome<S, E> {
    /// Work still unprocessed after exhausting retries, `None` when fully consumed.
    pub leftover: Option<S>,
    /// Total submissions made (1 initial + up to `max_retries` retries).
    pub attempts: usize,
    /// Last transport error seen, if any submission failed outright.
    pub last_error: Option<E>,
}

/// Delay before retry number `attempt` (0-based): `delay_increment * 2^attempt`.
pub fn backoff_delay(delay_increment: Duration, attempt: usize) -> Duration {
    delay_increment * 2u32.saturating_pow(attempt as u32)
}

/// Submits `work` and re-submits whatever comes back unprocessed, sleeping
/// `backoff_delay(delay_increment, n)` before retry `n`, up to `max_retries`
/// retries. A transport error re-submits the same work under the same
/// schedule. Never loops indefinitely: after exhaustion the remaining work
/// is handed back in the outcome instead of being dropped or re-thrown.
pub async fn retry_with_backoff<S, F, Fut, E>(
    max_retries: usize,
    delay_increment: Duration,
    work: S,
    mut submit: F,
) -> RetryOutcome<S, E>
where
    S: Clone,
    F: FnMut(S) -> Fut,
    Fut: Future<Output = Result<Submission<S>, E>>,
{
    let mut pending = work;
    let mut attempts = 0usize;
    let mut last_error = None;
    loop {
        attempts += 1;
        match submit(pending.clone()).await {
            Ok(Submission::Consumed) => {
                return RetryOutcome { leftover: None, attempts, last_error };
            }
            Ok(Submission::Unprocessed(rest)) => {
                pending = rest;
            }
            Err(e) => {
                last_error = Some(e);
            }
        }
        if attempts > max_retries {
            return RetryOutcome { leftover: Some(pending), attempts, last_error };
        }
        tokio::time::sleep(backoff_delay(delay_increment, attempts - 1)).await;
    }
}
