use std::time::Duration;

use rand::Rng;

/// Source of randomness for jittered schedules and trace sampling.
pub trait RandomSource: Send + Sync {
    /// Uniform value in `[0, 1)`.
    fn next_f64(&self) -> f64;

    /// Uniform duration in `[min, max]` at millisecond resolution.
    fn duration_between(&self, min: Duration, max: Duration) -> Duration;
}

/// Thread-local RNG from the `rand` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_f64(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }

    fn duration_between(&self, min: Duration, max: Duration) -> Duration {
        let lo = min.as_millis() as u64;
        let hi = max.as_millis() as u64;
        if hi <= lo {
            return min;
        }
        Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
    }
}

/// Deterministic stub: always returns the same value and the same delay.
#[derive(Debug, Clone, Copy)]
pub struct FixedRandom {
    pub value: f64,
    pub delay: Duration,
}

impl FixedRandom {
    pub fn new(value: f64, delay: Duration) -> Self {
        Self { value, delay }
    }
}

impl RandomSource for FixedRandom {
    fn next_f64(&self) -> f64 {
        self.value
    }

    fn duration_between(&self, min: Duration, max: Duration) -> Duration {
        self.delay.clamp(min, max.max(min))
    }
}
