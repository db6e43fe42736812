use rand::Rng;
use std::time::Duration;

const INITIAL_DELAY: Duration = Duration::from_millis(250);
const MAX_DELAY: Duration = Duration::from_secs(10);

/// Exponential backoff with jitter for loops that retry forever
/// (registration, follower subscription, leader push).
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    initial: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self::with_bounds(INITIAL_DELAY, MAX_DELAY)
    }

    pub fn with_bounds(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            initial,
            max,
        }
    }

    /// Delay before the next attempt: the current step plus up to 25% jitter.
    /// Each call doubles the step up to the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        let jitter_ms = (base.as_millis() as u64) / 4;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };

        self.current = (self.current * 2).min(self.max);
        base + Duration::from_millis(jitter)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
