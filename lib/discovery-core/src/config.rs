//! Watcher configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings of one discovery watcher
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Retries after a failed attempt to (re)establish the watch.
    /// Negative retries forever, 0 gives up on the first failure.
    pub retries_after_watch_failed: i64,
    /// Delay after the first failed attempt
    pub initial_backoff: Duration,
    /// Upper bound of the doubling delay
    pub max_backoff: Duration,
    /// Buffered batches per subscriber
    pub subscriber_capacity: usize,
    /// How long a batch may wait for room in a full subscriber channel
    pub send_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            retries_after_watch_failed: -1,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            subscriber_capacity: 10,
            send_timeout: Duration::from_secs(60),
        }
    }
}

/// Retry state for one burst of failed watch attempts
#[derive(Debug)]
pub(crate) struct Backoff {
    retries_left: i64,
    delay: Option<Duration>,
    initial: Duration,
    max: Duration,
}

impl Backoff {
    pub(crate) fn new(config: &DiscoveryConfig) -> Self {
        Self {
            retries_left: config.retries_after_watch_failed,
            delay: None,
            initial: config.initial_backoff,
            max: config.max_backoff,
        }
    }

    /// Record a failed attempt. Returns the delay before the next attempt, or
    /// `None` once the retry budget is spent.
    pub(crate) fn on_failure(&mut self) -> Option<Duration> {
        if self.retries_left == 0 {
            return None;
        }
        if self.retries_left > 0 {
            self.retries_left -= 1;
        }

        let next = match self.delay {
            None => self.initial,
            Some(delay) => delay.saturating_mul(2),
        }
        .min(self.max);

        self.delay = Some(next);
        Some(next)
    }

    /// Retries left, negative when unbounded
    pub(crate) fn retries_left(&self) -> i64 {
        self.retries_left
    }
}
