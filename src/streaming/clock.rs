// ABOUTME: Monotonic stream clock
// ABOUTME: Provides stable microsecond timestamps for presentation position reporting

use std::time::Instant;

/// Clock for stream timestamps
///
/// Monotonic, starting when the clock was created. All timestamps are in
/// microseconds from this start point.
#[derive(Debug, Clone, Copy)]
pub struct StreamClock {
    start: Instant,
}

impl StreamClock {
    /// Create a new clock starting now
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Current clock time in microseconds
    #[inline]
    pub fn now_micros(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}

impl Default for StreamClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn test_clock_monotonic() {
        let clock = StreamClock::new();
        let t1 = clock.now_micros();
        sleep(Duration::from_millis(10));
        let t2 = clock.now_micros();

        assert!(t2 > t1, "Clock should be monotonically increasing");
        assert!(t2 - t1 >= 10_000, "At least 10ms should have passed");
    }

    #[test]
    fn test_copies_share_start() {
        let clock = StreamClock::new();
        let copy = clock;
        sleep(Duration::from_millis(2));
        let a = clock.now_micros();
        let b = copy.now_micros();
        assert!(b >= a && b - a < 1_000_000);
    }
}
