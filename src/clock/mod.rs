use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall clock used for capture timestamps, rollup windows, and phase alignment.
///
/// Elapsed durations of in-flight units use `Instant` instead; this clock only
/// answers "what time is it on the wall".
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;
}

/// Clock backed by `SystemTime::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64
    }
}

/// Manually driven clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Delay from `now_ms` until the smallest multiple of `interval` that is `>= now_ms`.
///
/// Returns zero when `now_ms` already sits on a boundary.
pub fn delay_to_next_boundary(now_ms: u64, interval: Duration) -> Duration {
    let interval_ms = interval.as_millis() as u64;
    if interval_ms == 0 {
        return Duration::ZERO;
    }
    let rem = now_ms % interval_ms;
    if rem == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(interval_ms - rem)
    }
}

/// Start of the window of width `interval` that contains `time_ms`.
pub fn window_start(time_ms: u64, interval: Duration) -> u64 {
    let interval_ms = (interval.as_millis() as u64).max(1);
    time_ms - time_ms % interval_ms
}

/// Round `time_ms` to the nearest multiple of `interval`.
pub fn round_to_interval(time_ms: u64, interval: Duration) -> u64 {
    let interval_ms = (interval.as_millis() as u64).max(1);
    (time_ms + interval_ms / 2) / interval_ms * interval_ms
}
