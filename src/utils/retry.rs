//! Retry utilities: backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for PR1 connect retries.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: `max_times` (0 = no retry)
/// - Jitter enabled
pub fn connection_backoff(max_times: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(max_times)
        .with_jitter()
}
