//! Bounded polling.
//!
//! A probe is called until it returns `Ok`, at most `attempts` times with
//! `interval` between calls. Running out of attempts is reported as
//! [`WaitError::Timeout`], which callers can tell apart from the probe's
//! own failure mode: the probe's last error is attached for context but the
//! wait did not itself fail the underlying operation.

use std::fmt::Display;
use std::time::Duration;

use futures::Future;

#[derive(Debug, thiserror::Error)]
pub enum WaitError<E: Display> {
    #[error("condition not reached after {attempts} attempts with {interval:?} interval, last error: {last_error}")]
    Timeout {
        attempts: u32,
        interval: Duration,
        last_error: E,
    },
}

/// Calls `probe` up to `attempts` times, sleeping `interval` between the calls,
/// and returns the first successful result.
pub async fn wait_until<T, E, F, Fut>(
    attempts: u32,
    interval: Duration,
    mut probe: F,
) -> Result<T, WaitError<E>>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match probe().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= attempts => {
                return Err(WaitError::Timeout {
                    attempts,
                    interval,
                    last_error: e,
                })
            }
            Err(e) => {
                tracing::debug!("wait attempt {attempt}/{attempts} not yet satisfied: {e}");
            }
        }
        tokio::time::sleep(interval).await;
    }
}
