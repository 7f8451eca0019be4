use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::random::RandomSource;

/// Why a completed unit was kept as a full trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreReason {
    Error,
    Slow,
    Sampled,
    Partial,
}

/// Outcome of the sampling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Store(StoreReason),
    SummaryOnly,
}

/// Decides which completed units become full traces.
///
/// Errors and slow units are always stored. Everything else is stored with
/// probability `sampling_rate`, capped at `max_per_second` (0 = no cap).
pub struct SamplingPolicy {
    slow_threshold: Duration,
    sampling_rate: f64,
    limiter: RateLimiter,
    random: Arc<dyn RandomSource>,
}

impl std::fmt::Debug for SamplingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SamplingPolicy")
            .field("slow_threshold", &self.slow_threshold)
            .field("sampling_rate", &self.sampling_rate)
            .field("max_per_second", &self.limiter.max_per_second)
            .finish()
    }
}

impl SamplingPolicy {
    pub fn new(
        slow_threshold: Duration,
        sampling_rate: f64,
        max_per_second: u32,
        random: Arc<dyn RandomSource>,
    ) -> Self {
        Self {
            slow_threshold,
            sampling_rate: sampling_rate.clamp(0.0, 1.0),
            limiter: RateLimiter::new(max_per_second),
            random,
        }
    }

    pub fn decide(&self, duration: Duration, error: bool, now_ms: u64) -> Decision {
        if error {
            return Decision::Store(StoreReason::Error);
        }
        if duration >= self.slow_threshold {
            return Decision::Store(StoreReason::Slow);
        }
        if self.sampling_rate <= 0.0 {
            return Decision::SummaryOnly;
        }
        if self.sampling_rate < 1.0 && self.random.next_f64() >= self.sampling_rate {
            return Decision::SummaryOnly;
        }
        if !self.limiter.try_acquire(now_ms) {
            return Decision::SummaryOnly;
        }
        Decision::Store(StoreReason::Sampled)
    }
}

/// Fixed one-second window counter.
#[derive(Debug)]
struct RateLimiter {
    max_per_second: u32,
    window: Mutex<(u64, u32)>,
}

impl RateLimiter {
    fn new(max_per_second: u32) -> Self {
        Self {
            max_per_second,
            window: Mutex::new((0, 0)),
        }
    }

    fn try_acquire(&self, now_ms: u64) -> bool {
        if self.max_per_second == 0 {
            return true;
        }

        let second = now_ms / 1_000;
        let mut window = self.window.lock();
        if window.0 != second {
            *window = (second, 0);
        }
        if window.1 >= self.max_per_second {
            return false;
        }
        window.1 += 1;
        true
    }
}
