use serde::Serialize;

/// Number of histogram buckets.
pub const NUM_BUCKETS: usize = 10;

/// Histogram bucket boundaries in nanoseconds.
/// 10 buckets: <1us, 1us-10us, 10us-100us, 100us-1ms, 1ms-10ms,
/// 10ms-100ms, 100ms-1s, 1s-10s, 10s-100s, 100s+.
const BOUNDARIES: [u64; 9] = [
    1_000,           // 1 microsecond
    10_000,          // 10 microseconds
    100_000,         // 100 microseconds
    1_000_000,       // 1 millisecond
    10_000_000,      // 10 milliseconds
    100_000_000,     // 100 milliseconds
    1_000_000_000,   // 1 second
    10_000_000_000,  // 10 seconds
    100_000_000_000, // 100 seconds
];

/// Duration histogram that keeps exact values while they are few.
///
/// Up to `max_raw` durations are kept verbatim; bucket counts are always
/// maintained so the raw list can be dropped once the limit is exceeded.
#[derive(Debug, Clone)]
pub struct LazyHistogram {
    max_raw: usize,
    raw: Option<Vec<u64>>,
    buckets: [u64; NUM_BUCKETS],
}

impl LazyHistogram {
    pub fn new(max_raw: usize) -> Self {
        Self {
            max_raw,
            raw: Some(Vec::new()),
            buckets: [0; NUM_BUCKETS],
        }
    }

    /// Records a duration in nanoseconds.
    pub fn record(&mut self, value_ns: u64) {
        self.buckets[bucket_index(value_ns)] += 1;

        if let Some(raw) = &mut self.raw {
            if raw.len() < self.max_raw {
                raw.push(value_ns);
            } else {
                self.raw = None;
            }
        }
    }

    /// Raw durations, or `None` once the histogram has switched to buckets.
    pub fn raw(&self) -> Option<&[u64]> {
        self.raw.as_deref()
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let raw_nanos = self.raw.as_ref().map(|raw| {
            let mut sorted = raw.clone();
            sorted.sort_unstable();
            sorted
        });

        HistogramSnapshot {
            raw_nanos,
            buckets: self.buckets,
        }
    }
}

/// Point-in-time view of a [`LazyHistogram`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistogramSnapshot {
    /// Sorted raw durations while under the raw limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_nanos: Option<Vec<u64>>,
    pub buckets: [u64; NUM_BUCKETS],
}

/// Returns the bucket index for a given value in nanoseconds.
fn bucket_index(value_ns: u64) -> usize {
    BOUNDARIES
        .iter()
        .position(|&boundary| value_ns < boundary)
        .unwrap_or(NUM_BUCKETS - 1)
}

/// Returns the upper bounds for each bucket in nanoseconds.
/// The last bucket is unbounded (+inf, represented as 0).
pub fn bucket_boundaries() -> [u64; NUM_BUCKETS] {
    let mut bounds = [0; NUM_BUCKETS];
    bounds[..BOUNDARIES.len()].copy_from_slice(&BOUNDARIES);
    bounds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_index_at_boundaries() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(999), 0);
        assert_eq!(bucket_index(1_000), 1);
        assert_eq!(bucket_index(1_000_000), 4);
        assert_eq!(bucket_index(99_999_999_999), 8);
        assert_eq!(bucket_index(100_000_000_000), 9);
        assert_eq!(bucket_index(u64::MAX), 9);
    }

    #[test]
    fn test_keeps_raw_values_under_limit() {
        let mut h = LazyHistogram::new(4);
        h.record(10_000_000);
        h.record(5_000_000);

        let snap = h.snapshot();
        assert_eq!(snap.raw_nanos, Some(vec![5_000_000, 10_000_000]));
        assert_eq!(snap.buckets[4], 1); // 1ms-10ms
        assert_eq!(snap.buckets[5], 1); // 10ms-100ms
    }

    #[test]
    fn test_switches_to_buckets_past_limit() {
        let mut h = LazyHistogram::new(2);
        h.record(500);
        h.record(5_000);
        assert!(h.raw().is_some());

        h.record(50_000);
        assert!(h.raw().is_none());

        let snap = h.snapshot();
        assert!(snap.raw_nanos.is_none());
        assert_eq!(snap.buckets.iter().sum::<u64>(), 3);
    }

    #[test]
    fn test_bucket_boundaries_length() {
        let b = bucket_boundaries();
        assert_eq!(b[0], 1_000);
        assert_eq!(b[8], 100_000_000_000);
        assert_eq!(b[9], 0); // +inf
    }
}
