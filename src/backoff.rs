use std::time::Duration;

use crate::config::BackoffConfig;

/// Capped exponential backoff: `initial`, `2 * initial`, ... up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Delay before the next attempt.  Each call doubles the following one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

impl From<BackoffConfig> for Backoff {
    fn from(cfg: BackoffConfig) -> Self {
        Backoff::new(cfg.initial(), cfg.max())
    }
}
