use std::time;

use tokio_util::sync::CancellationToken;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
/// Doubling retry delay, saturating at a cap.
pub struct BackoffPolicy {
    /// The delay before the first retry, and the value restored after a success.
    initial_interval: time::Duration,
    /// The maximum possible delay between retries.
    maximum_interval: time::Duration,
}

impl BackoffPolicy {
    pub fn new(initial_interval: time::Duration, maximum_interval: time::Duration) -> Self {
        Self {
            initial_interval,
            maximum_interval,
        }
    }

    pub fn initial(&self) -> time::Duration {
        self.initial_interval
    }

    /// The delay following `current`: twice as long, never above the cap.
    pub fn next(&self, current: time::Duration) -> time::Duration {
        next_backoff(current, self.maximum_interval)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_interval: time::Duration::from_millis(200),
            maximum_interval: time::Duration::from_secs(5),
        }
    }
}

pub fn next_backoff(current: time::Duration, max: time::Duration) -> time::Duration {
    std::cmp::min(current.saturating_mul(2), max)
}

/// Sleep for `duration` unless cancelled first.
///
/// Returns `true` when the full duration elapsed, `false` on cancellation.
/// A zero duration always returns `true`.
pub async fn sleep_with_cancel(duration: time::Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return true;
    }
    if cancel.is_cancelled() {
        return false;
    }

    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
