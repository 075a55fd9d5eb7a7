use std::fmt::{Debug, Display};
use std::time::Duration;

use futures::Future;
use rand::Rng;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_BASE_BACKOFF_SECONDS: f64 = 0.1;
pub const DEFAULT_MAX_BACKOFF_SECONDS: f64 = 3.0;

/// Relative amount of random spread applied on top of the computed backoff,
/// so that many timelines failing at once do not retry in lockstep.
pub const DEFAULT_BACKOFF_JITTER: f64 = 0.25;

/// Sleeps before the `n`-th retry of an operation. `n == 0` does not sleep.
///
/// Returns early if `cancel` fires; callers check the token afterwards.
pub async fn exponential_backoff(
    n: u32,
    base_increment: f64,
    max_seconds: f64,
    cancel: &CancellationToken,
) {
    let backoff_duration_seconds = jittered(
        exponential_backoff_duration_seconds(n, base_increment, max_seconds),
        DEFAULT_BACKOFF_JITTER,
        &mut rand::thread_rng(),
    )
    .min(max_seconds);
    if backoff_duration_seconds > 0.0 {
        tracing::info!(
            "Backoff: waiting {backoff_duration_seconds} seconds before processing with the task",
        );
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs_f64(backoff_duration_seconds)) => {}
            _ = cancel.cancelled() => {}
        }
    }
}

pub fn exponential_backoff_duration_seconds(n: u32, base_increment: f64, max_seconds: f64) -> f64 {
    if n == 0 {
        0.0
    } else {
        (1.0 + base_increment).powf(f64::from(n)).min(max_seconds)
    }
}

/// Spreads `seconds` uniformly over `[seconds * (1 - jitter), seconds * (1 + jitter)]`.
pub fn jittered(seconds: f64, jitter: f64, rng: &mut impl Rng) -> f64 {
    if seconds <= 0.0 || jitter <= 0.0 {
        return seconds.max(0.0);
    }
    let spread = seconds * jitter;
    rng.gen_range((seconds - spread)..=(seconds + spread))
}

/// Retries passed operation until one of the following conditions are met:
/// - encountered error is considered as permanent (non-retryable),
/// - retries have been exhausted,
/// - `cancel` has been triggered, in which case `None` is returned.
///
/// `is_permanent` closure should be used to provide distinction between permanent/non-permanent errors.
/// When attempts cross `warn_threshold` function starts to emit log warnings.
/// `description` argument is added to log messages. Its value should identify the `op` is doing
pub async fn retry<T, O, F, E>(
    mut op: O,
    is_permanent: impl Fn(&E) -> bool,
    warn_threshold: u32,
    max_retries: u32,
    description: &str,
    cancel: &CancellationToken,
) -> Option<Result<T, E>>
where
    // Not std::error::Error because anyhow::Error doesnt implement it.
    E: Display + Debug,
    O: FnMut() -> F,
    F: Future<Output = Result<T, E>>,
{
    let mut attempts = 0;
    loop {
        if cancel.is_cancelled() {
            return None;
        }

        let result = op().await;
        match &result {
            Ok(_) => {
                if attempts > 0 {
                    tracing::info!("{description} succeeded after {attempts} retries");
                }
                return Some(result);
            }
            Err(e) if is_permanent(e) => {
                return Some(result);
            }
            Err(err) if attempts < warn_threshold => {
                tracing::info!("{description} failed, will retry (attempt {attempts}): {err:#}");
            }
            Err(err) if attempts < max_retries => {
                tracing::warn!("{description} failed, will retry (attempt {attempts}): {err:#}");
            }
            Err(err) => {
                tracing::warn!(
                    "{description} still failed after {attempts} retries, giving up: {err:?}"
                );
                return Some(result);
            }
        }
        attempts += 1;
        exponential_backoff(
            attempts,
            DEFAULT_BASE_BACKOFF_SECONDS,
            DEFAULT_MAX_BACKOFF_SECONDS,
            cancel,
        )
        .await;
    }
}
