use std::time::Duration;

/// Doubling reconnect delay clamped to `[min, max]`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    /// Returns the delay to sleep now and doubles the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let doubled = if self.current.is_zero() {
            Duration::from_millis(1)
        } else {
            self.current.saturating_mul(2)
        };
        self.current = doubled.clamp(self.min, self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}
