//! Bounded polling.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep_until};

/// Why [`poll_until`] gave up.
#[derive(Debug, PartialEq, Eq)]
pub enum PollError<E> {
    /// The condition did not hold within the timeout.
    TimedOut,
    /// The check itself failed; polling stopped immediately.
    Failed(E),
}

/// Run `check` now and then every `interval` until it yields a value, fails,
/// or `timeout` has elapsed.
///
/// `check` returns `Ok(None)` while the condition does not hold yet. A final
/// check runs at the deadline, so a result that becomes available exactly at
/// the timeout is still observed.
pub async fn poll_until<T, E, F, Fut>(
    interval: Duration,
    timeout: Duration,
    mut check: F,
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        match check().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) => return Err(PollError::Failed(e)),
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(PollError::TimedOut);
        }
        sleep_until((now + interval).min(deadline)).await;
    }
}
